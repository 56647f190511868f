//! Per-query DNS sessions

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::DNSClass;

use super::processor::{is_a_question, question_domain};
use crate::rules::{DnsQueryView, MatchState};

/// Where a query came from, and so where its answer goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsClient {
    /// A datagram received on the UDP listener
    Udp(SocketAddr),
    /// A packet captured on the virtual interface
    ///
    /// The answer is wrapped into a packet from `server` to `client`.
    Packet {
        client: SocketAddrV4,
        server: SocketAddrV4,
    },
}

impl fmt::Display for DnsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(addr) => write!(f, "udp:{addr}"),
            Self::Packet { client, .. } => write!(f, "tun:{client}"),
        }
    }
}

/// Why a message could not become a session
///
/// Each maps to the response code the front end answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionReject {
    /// Zero or several questions
    QuestionCount(usize),
    /// Opcode other than QUERY
    NotQuery,
}

impl SessionReject {
    /// Response code to answer the client with
    #[must_use]
    pub fn response_code(self) -> ResponseCode {
        match self {
            Self::QuestionCount(_) => ResponseCode::FormErr,
            Self::NotQuery => ResponseCode::NotImp,
        }
    }
}

/// One intercepted query and everything learned about it
#[derive(Debug, Clone)]
pub struct DnsSession {
    request: Message,
    raw: Bytes,
    client: DnsClient,
    domain: String,
    routable: bool,
    /// Progress of the two-phase rule match
    pub state: MatchState,
    pub fake_ip: Option<Ipv4Addr>,
    pub real_ip: Option<Ipv4Addr>,
    pub country: Option<String>,
    created_at: Instant,
    /// When the fake binding is released
    pub expires_at: Option<Instant>,
}

impl DnsSession {
    /// Build a session for a decoded query
    ///
    /// `raw` is the original wire form, forwarded verbatim upstream.
    ///
    /// # Errors
    ///
    /// Returns `SessionReject` unless `request` is a QUERY with exactly one
    /// question. Response messages must be filtered out by the caller.
    pub fn new(request: Message, raw: Bytes, client: DnsClient, now: Instant) -> Result<Self, SessionReject> {
        if request.op_code() != OpCode::Query {
            return Err(SessionReject::NotQuery);
        }
        let count = request.queries().len();
        if count != 1 {
            return Err(SessionReject::QuestionCount(count));
        }
        debug_assert_eq!(request.message_type(), MessageType::Query);

        let question = &request.queries()[0];
        let domain = question_domain(question);
        let routable = question.query_class() == DNSClass::IN && !domain.is_empty();

        Ok(Self {
            request,
            raw,
            client,
            domain,
            routable,
            state: MatchState::NotStarted,
            fake_ip: None,
            real_ip: None,
            country: None,
            created_at: now,
            expires_at: None,
        })
    }

    /// Transaction id
    #[must_use]
    pub fn id(&self) -> u16 {
        self.request.id()
    }

    /// The decoded request
    #[must_use]
    pub fn request(&self) -> &Message {
        &self.request
    }

    /// The request as received
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// The single question
    #[must_use]
    pub fn question(&self) -> &Query {
        &self.request.queries()[0]
    }

    /// Queried name, lowercase without the root dot
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether the question is for an A record
    #[must_use]
    pub fn is_a_query(&self) -> bool {
        is_a_question(self.question())
    }

    /// Whether rules apply at all
    ///
    /// Non-IN classes and the root name are always forwarded as real.
    #[must_use]
    pub fn is_routable(&self) -> bool {
        self.routable
    }

    /// Reply destination
    #[must_use]
    pub fn client(&self) -> DnsClient {
        self.client
    }

    /// When the query arrived
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// What the rules may look at
    #[must_use]
    pub fn view(&self) -> DnsQueryView<'_> {
        DnsQueryView {
            domain: &self.domain,
            real_ip: self.real_ip,
            country: self.country.as_deref(),
        }
    }
}
