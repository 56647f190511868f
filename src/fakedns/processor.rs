//! DNS message helpers
//!
//! Thin wrappers around `hickory-proto` used by the interceptor to decode
//! queries and answers and to synthesize responses.

use std::net::Ipv4Addr;
use std::time::Duration;

use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};

use super::error::{DnsError, DnsResult};

/// Decode a wire-format message
pub fn parse_message(bytes: &[u8]) -> DnsResult<Message> {
    Message::from_vec(bytes).map_err(|e| DnsError::Malformed(e.to_string()))
}

/// Encode a message to wire format
pub fn encode_message(message: &Message) -> DnsResult<Vec<u8>> {
    message.to_vec().map_err(|e| DnsError::Encode(e.to_string()))
}

/// Lowercase name of a question without the root dot
pub fn question_domain(query: &Query) -> String {
    query.name().to_ascii().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether two questions ask the same thing
pub fn same_question(a: &Query, b: &Query) -> bool {
    a.query_type() == b.query_type()
        && a.query_class() == b.query_class()
        && question_domain(a) == question_domain(b)
}

/// First A record in the answer section
pub fn first_a_record(message: &Message) -> Option<Ipv4Addr> {
    message.answers().iter().find_map(|record| match record.data() {
        Some(RData::A(a)) => Some(a.0),
        _ => None,
    })
}

/// Response header mirroring `request`
fn response_to(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    let mut header = Header::response_from_request(request.header());
    header.set_message_type(MessageType::Response);
    header.set_recursion_available(true);
    header.set_authoritative(false);
    header.set_response_code(code);
    response.set_header(header);

    for q in request.queries() {
        response.add_query(q.clone());
    }
    response
}

/// Build an A response carrying `ip` for the single question of `request`
pub fn build_fake_response(request: &Message, ip: Ipv4Addr, ttl: Duration) -> Message {
    let mut response = response_to(request, ResponseCode::NoError);
    if let Some(question) = request.queries().first() {
        let ttl = u32::try_from(ttl.as_secs()).unwrap_or(u32::MAX);
        let record = Record::from_rdata(question.name().clone(), ttl, RData::A(A(ip)));
        response.add_answer(record);
    }
    response
}

/// Build an empty NOERROR response
///
/// Sent for non-A questions of a faked domain so the client falls back to
/// IPv4.
pub fn build_empty_response(request: &Message) -> Message {
    response_to(request, ResponseCode::NoError)
}

/// Build an error response (FORMERR, NOTIMP, SERVFAIL)
pub fn build_error_response(request: &Message, code: ResponseCode) -> Message {
    let mut response = response_to(request, code);
    if code == ResponseCode::NotImp {
        response.set_recursion_available(false);
    }
    response
}

/// Whether `message` is a standard single-class query we can route
pub fn is_standard_query(message: &Message) -> bool {
    message.message_type() == MessageType::Query && message.op_code() == OpCode::Query
}

/// Whether the question asks for an IPv4 address
pub fn is_a_question(query: &Query) -> bool {
    query.query_type() == RecordType::A
}
