//! Stream transport driver
//!
//! [`StreamTransport`] turns a [`BoxedStream`] into a [`RawTransport`]. The
//! stream lives on a spawned driver task. Reads and writes are requested
//! through two command channels and completed concurrently, so a pending read
//! never blocks a write in the other direction.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    AsyncStream, BoxedStream, Dialer, RawTransport, ReadKind, TransportError, TransportEvent, TransportSink,
};

/// Initial read buffer reservation
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
enum WriteCommand {
    Data(Bytes),
    Shutdown,
}

enum Source {
    Accepted(BoxedStream),
    Dial {
        dialer: Arc<dyn Dialer>,
        connect_timeout: Duration,
    },
}

/// Why a read loop stopped
enum ReadEnd {
    Eof,
    Failed(String),
}

/// Transport over an async byte stream
pub struct StreamTransport {
    source: Option<Source>,
    reads: Option<mpsc::UnboundedSender<ReadKind>>,
    writes: Option<mpsc::UnboundedSender<WriteCommand>>,
    cancel: CancellationToken,
}

impl StreamTransport {
    /// Wrap an accepted stream; start it with [`attach`](RawTransport::attach)
    pub fn accepted(stream: impl AsyncStream + 'static) -> Self {
        Self::with_source(Source::Accepted(Box::new(stream)))
    }

    /// Dial through `dialer`; start it with [`connect`](RawTransport::connect)
    #[must_use]
    pub fn dialing(dialer: Arc<dyn Dialer>, connect_timeout: Duration) -> Self {
        Self::with_source(Source::Dial {
            dialer,
            connect_timeout,
        })
    }

    fn with_source(source: Source) -> Self {
        Self {
            source: Some(source),
            reads: None,
            writes: None,
            cancel: CancellationToken::new(),
        }
    }

    fn start<F>(&mut self, open: F, sink: TransportSink)
    where
        F: std::future::Future<Output = Result<BoxedStream, TransportError>> + Send + 'static,
    {
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        self.reads = Some(read_tx);
        self.writes = Some(write_tx);
        tokio::spawn(drive(open, sink, read_rx, write_rx, self.cancel.clone()));
    }
}

impl RawTransport for StreamTransport {
    fn connect(&mut self, host: &str, port: u16, sink: TransportSink) -> Result<(), TransportError> {
        match self.source.take() {
            Some(Source::Dial {
                dialer,
                connect_timeout,
            }) => {
                let host = host.to_string();
                let open = async move {
                    let target = format!("{host}:{port}");
                    timeout(connect_timeout, dialer.dial(&host, port))
                        .await
                        .map_err(|_| TransportError::Timeout {
                            target,
                            timeout_secs: connect_timeout.as_secs(),
                        })?
                };
                self.start(open, sink);
                Ok(())
            }
            Some(other) => {
                self.source = Some(other);
                Err(TransportError::WrongMode("connect an accepted stream"))
            }
            None => Err(TransportError::AlreadyStarted),
        }
    }

    fn attach(&mut self, sink: TransportSink) -> Result<(), TransportError> {
        match self.source.take() {
            Some(Source::Accepted(stream)) => {
                self.start(async move { Ok(stream) }, sink);
                Ok(())
            }
            Some(other) => {
                self.source = Some(other);
                Err(TransportError::WrongMode("attach a dialing transport"))
            }
            None => Err(TransportError::AlreadyStarted),
        }
    }

    fn is_started(&self) -> bool {
        self.reads.is_some()
    }

    fn read(&mut self, kind: ReadKind) {
        if let Some(reads) = &self.reads {
            let _ = reads.send(kind);
        }
    }

    fn write(&mut self, data: Bytes) {
        if let Some(writes) = &self.writes {
            let _ = writes.send(WriteCommand::Data(data));
        }
    }

    fn disconnect(&mut self) {
        if let Some(writes) = &self.writes {
            let _ = writes.send(WriteCommand::Shutdown);
        }
    }

    fn force_disconnect(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match &self.source {
            Some(Source::Accepted(_)) => "accepted",
            Some(Source::Dial { .. }) => "dialing",
            None => "started",
        };
        f.debug_struct("StreamTransport")
            .field("mode", &mode)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

async fn drive<F>(
    open: F,
    sink: TransportSink,
    mut reads: mpsc::UnboundedReceiver<ReadKind>,
    mut writes: mpsc::UnboundedReceiver<WriteCommand>,
    cancel: CancellationToken,
) where
    F: std::future::Future<Output = Result<BoxedStream, TransportError>>,
{
    let opened = tokio::select! {
        () = cancel.cancelled() => Err(None),
        result = open => result.map_err(|e| Some(e.to_string())),
    };
    let stream = match opened {
        Ok(stream) => stream,
        Err(error) => {
            debug!(id = sink.id(), error = error.as_deref().unwrap_or("cancelled"), "Transport failed to open");
            sink.send(TransportEvent::Disconnected { error });
            return;
        }
    };
    sink.send(TransportEvent::Connected);

    let (mut rd, mut wr) = tokio::io::split(stream);

    let reader = async {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        while let Some(kind) = reads.recv().await {
            match read_frame(&mut rd, &mut buf, &kind).await {
                Ok(data) => {
                    sink.send(TransportEvent::Read(data));
                }
                Err(ReadEnd::Eof) => return None,
                Err(ReadEnd::Failed(e)) => return Some(e),
            }
        }
        None
    };

    let writer = async {
        while let Some(command) = writes.recv().await {
            match command {
                WriteCommand::Data(data) => {
                    if let Err(e) = wr.write_all(&data).await {
                        return Some(e.to_string());
                    }
                    sink.send(TransportEvent::Wrote);
                }
                WriteCommand::Shutdown => {
                    let _ = wr.shutdown().await;
                    return None;
                }
            }
        }
        None
    };

    let error = tokio::select! {
        () = cancel.cancelled() => None,
        e = reader => e,
        e = writer => e,
    };

    trace!(id = sink.id(), error = ?error, "Transport closed");
    sink.send(TransportEvent::Disconnected { error });
}

async fn read_frame<R>(rd: &mut R, buf: &mut BytesMut, kind: &ReadKind) -> Result<Bytes, ReadEnd>
where
    R: AsyncRead + Unpin,
{
    match kind {
        ReadKind::Any => {
            if buf.is_empty() {
                fill(rd, buf).await?;
            }
            Ok(buf.split().freeze())
        }
        ReadKind::Exactly(n) => {
            while buf.len() < *n {
                fill(rd, buf).await?;
            }
            Ok(buf.split_to(*n).freeze())
        }
        ReadKind::Until { pattern, max } => loop {
            if let Some(pos) = find(buf, pattern) {
                return Ok(buf.split_to(pos + pattern.len()).freeze());
            }
            if buf.len() >= *max {
                return Err(ReadEnd::Failed(
                    TransportError::DelimiterNotFound { max: *max }.to_string(),
                ));
            }
            fill(rd, buf).await?;
        },
    }
}

async fn fill<R>(rd: &mut R, buf: &mut BytesMut) -> Result<(), ReadEnd>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(READ_CHUNK);
    match rd.read_buf(buf).await {
        Ok(0) => Err(ReadEnd::Eof),
        Ok(_) => Ok(()),
        Err(e) => Err(ReadEnd::Failed(e.to_string())),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
