//! Per-connection request handling.
//!
//! A connection moves through
//! `AwaitRequestLine → AwaitHeaders → AccessCheck → Routed → Streaming → Closed`
//! and may leave early from any of them. Whatever happens, the handler ends in
//! [`ConnectionHandler::finalize`], which flushes what is buffered and closes
//! the socket. `finalize` consumes the handler, so it runs exactly once.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::io::{
    split, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader, ReadHalf, WriteHalf,
};
use tracing::{debug, trace, warn};

use crate::access::Rejection;
use crate::error::Result;
use crate::http::{self, Request, Route, Status};
use crate::render::{render_page, render_rows_only};
use crate::server::ServerContext;
use crate::writer::BufferedWriter;

/// Longest request or header line read in one piece.
const MAX_LINE_BYTES: u64 = 2048;

/// Header lines consumed before the request is processed regardless.
const MAX_HEADER_LINES: usize = 64;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the request line.
    AwaitRequestLine,
    /// Discarding header lines.
    AwaitHeaders,
    /// Running access control.
    AccessCheck,
    /// A status has been chosen.
    Routed(Status),
    /// Writing a response body.
    Streaming,
    /// Finalized.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitRequestLine => write!(f, "await-request-line"),
            Self::AwaitHeaders => write!(f, "await-headers"),
            Self::AccessCheck => write!(f, "access-check"),
            Self::Routed(status) => write!(f, "routed({})", status.code()),
            Self::Streaming => write!(f, "streaming"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No usable request line; closed without a response.
    NoRequest,
    /// Turned away by access control.
    Rejected(Rejection),
    /// Served a route.
    Served(Route),
    /// Processing failed; the error was logged.
    Failed,
    /// The configured connection deadline passed.
    TimedOut,
}

/// State machine for one client connection.
#[derive(Debug)]
pub struct ConnectionHandler<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufferedWriter<WriteHalf<S>>,
    peer: Option<SocketAddr>,
    ctx: Rc<ServerContext>,
    state: ConnectionState,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted stream.
    pub fn new(stream: S, peer: Option<SocketAddr>, ctx: Rc<ServerContext>) -> Self {
        let (read_half, write_half) = split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: BufferedWriter::new(write_half, ctx.flush_threshold()),
            peer,
            ctx,
            state: ConnectionState::AwaitRequestLine,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle the connection to completion.
    ///
    /// Never fails: errors are logged here and the connection is closed.
    pub async fn run(mut self) -> Outcome {
        let result = match self.ctx.idle_timeout() {
            Some(limit) => tokio::time::timeout(limit, self.process())
                .await
                .unwrap_or(Ok(Outcome::TimedOut)),
            None => self.process().await,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) if err.is_disconnect() => {
                debug!(peer = ?self.peer, state = %self.state, "Client went away: {err}");
                Outcome::Failed
            }
            Err(err) => {
                warn!(peer = ?self.peer, state = %self.state, "Connection failed: {err}");
                Outcome::Failed
            }
        };
        if outcome == Outcome::TimedOut {
            debug!(peer = ?self.peer, state = %self.state, "Connection deadline passed");
        }

        self.finalize().await;
        outcome
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(peer = ?self.peer, "{} -> {}", self.state, next);
        self.state = next;
    }

    /// Read one raw line. Header bytes are never decoded.
    async fn read_line(&mut self, line: &mut Vec<u8>) -> io::Result<usize> {
        line.clear();
        (&mut self.reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', line)
            .await
    }

    async fn process(&mut self) -> Result<Outcome> {
        let mut line = Vec::new();
        if self.read_line(&mut line).await? == 0 {
            return Ok(Outcome::NoRequest);
        }
        let request = std::str::from_utf8(&line)
            .ok()
            .and_then(|text| Request::parse(text, self.peer));
        let Some(request) = request else {
            debug!(peer = ?self.peer, "Ignoring malformed request line");
            return Ok(Outcome::NoRequest);
        };

        self.transition(ConnectionState::AwaitHeaders);
        for _ in 0..MAX_HEADER_LINES {
            if self.read_line(&mut line).await? == 0 || line.iter().all(u8::is_ascii_whitespace) {
                break;
            }
        }

        self.transition(ConnectionState::AccessCheck);
        let verdict = self.ctx.access().borrow_mut().check(&request);

        match verdict {
            Err(rejection) => {
                let status = rejection.status();
                self.transition(ConnectionState::Routed(status));
                debug!(
                    peer = ?self.peer,
                    method = %request.method,
                    path = %request.path,
                    "Rejected with {status}"
                );
                self.writer.write(status.empty_response()).await?;
                self.writer.flush().await?;
                Ok(Outcome::Rejected(rejection))
            }
            Ok(route) => {
                self.transition(ConnectionState::Routed(Status::Ok));
                self.serve(route).await?;
                debug!(peer = ?self.peer, path = %request.path, "Served");
                Ok(Outcome::Served(route))
            }
        }
    }

    async fn serve(&mut self, route: Route) -> Result<()> {
        let head = http::ok_head(route.content_type());
        match route {
            Route::Status => {
                let version = self.ctx.log().current_version();
                self.transition(ConnectionState::Streaming);
                self.writer.write(head).await?;
                self.writer.write(version.to_string()).await?;
            }
            Route::TableRows => {
                // Snapshot first so a storage failure closes the connection
                // before a 200 goes out.
                let snapshot = self.ctx.log().snapshot()?;
                self.transition(ConnectionState::Streaming);
                self.writer.write(head).await?;
                render_rows_only(&mut self.writer, snapshot.content()).await?;
            }
            Route::Page => {
                let version = self.ctx.log().current_version();
                self.transition(ConnectionState::Streaming);
                self.writer.write(head).await?;
                render_page(&mut self.writer, self.ctx.assets(), self.ctx.log(), version).await?;
            }
        }
        Ok(())
    }

    async fn finalize(mut self) {
        self.transition(ConnectionState::Closed);
        let limit = self.ctx.idle_timeout();
        let close = self.writer.close();
        let closed = match limit {
            Some(limit) => tokio::time::timeout(limit, close)
                .await
                .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
            None => close.await,
        };
        if let Err(err) = closed {
            debug!(peer = ?self.peer, "Error while closing connection: {err}");
        }
    }
}
