//! One intercepted connection.
//!
//! # Data Flow
//! ```text
//! client leg ──read──▶ HttpRequestParser ──complete request──▶ server leg
//!                                              │ (write, then)
//!                                              ├─▶ HttpResponseParser::new_request_arrived
//!                                              └─▶ PendingPairs
//! server leg ──read──▶ HttpResponseParser ──complete response─▶ client leg
//!                                              │ (write, then)
//!                                              └─▶ PendingPairs::complete → RecordWriter
//! ```
//!
//! Bytes are only written to a leg once a whole message has been parsed.
//! The session ends when no action is interested any more, which happens
//! once one side has reached end of stream and everything parsed from the
//! other side has been delivered.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use thiserror::Error;

use crate::config::RecorderConfig;
use crate::event::{Action, Direction, Outcome, PollResult, Poller};
use crate::http::{HttpRequestParser, HttpResponseParser, ParseError};
use crate::net::{ConnectionId, DestinationResolver};
use crate::record::{PairingError, PendingPairs, RecordError, RecordWriter};

/// Errors that end a session. None of them affect other sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not determine original destination: {0}")]
    Destination(#[source] io::Error),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unparseable HTTP stream: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Record(#[from] RecordError),
}

impl SessionError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Destination(_) => "destination",
            SessionError::Connect { .. } => "connect",
            SessionError::Io(_) => "io",
            SessionError::Parse(_) => "parse",
            SessionError::Pairing(_) => "pairing",
            SessionError::Record(_) => "record",
        }
    }
}

/// One side of the proxied connection.
#[derive(Debug)]
struct Leg {
    stream: TcpStream,
    eof: bool,
}

impl Leg {
    fn new(stream: TcpStream) -> Self {
        Self { stream, eof: false }
    }

    /// Read whatever is available. An empty slice means end of stream.
    fn read<'a>(&mut self, buf: &'a mut [u8]) -> io::Result<&'a [u8]> {
        let n = loop {
            match self.stream.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            self.eof = true;
        }
        Ok(&buf[..n])
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }
}

/// Everything the four actions share.
struct SessionState {
    id: ConnectionId,
    client: Leg,
    server: Leg,
    requests: HttpRequestParser,
    responses: HttpResponseParser,
    pending: PendingPairs,
    writer: RecordWriter,
    buf: Vec<u8>,
}

impl SessionState {
    fn read_server(&mut self) -> Result<Outcome, SessionError> {
        let data = self.server.read(&mut self.buf)?;
        if data.is_empty() {
            tracing::debug!(connection_id = %self.id, "Server closed its side");
            self.responses.eof();
        } else {
            self.responses.parse(data)?;
        }
        Ok(Outcome::Continue)
    }

    fn read_client(&mut self) -> Result<Outcome, SessionError> {
        let data = self.client.read(&mut self.buf)?;
        if data.is_empty() {
            tracing::debug!(connection_id = %self.id, "Client closed its side");
        } else {
            self.requests.parse(data)?;
        }
        Ok(Outcome::Continue)
    }

    fn forward_request(&mut self) -> Result<Outcome, SessionError> {
        let Some(request) = self.requests.pop() else {
            return Ok(Outcome::Continue);
        };

        self.server.write(request.as_bytes())?;
        self.responses.new_request_arrived(&request);

        tracing::debug!(
            connection_id = %self.id,
            method = request.method(),
            target = request.target(),
            "Request forwarded"
        );
        self.pending.request_forwarded(request);
        Ok(Outcome::Continue)
    }

    fn forward_response(&mut self) -> Result<Outcome, SessionError> {
        let Some(response) = self.responses.pop() else {
            return Ok(Outcome::Continue);
        };

        self.client.write(response.as_bytes())?;

        if response.is_informational() {
            tracing::trace!(connection_id = %self.id, status = response.status(), "Interim response forwarded");
            return Ok(Outcome::Continue);
        }

        let record = self.pending.complete(&response)?;
        let path = self.writer.write(&record)?;

        tracing::debug!(
            connection_id = %self.id,
            status = response.status(),
            path = %path.display(),
            "Pair recorded"
        );
        Ok(Outcome::Continue)
    }
}

/// A connected pair of legs and its per-connection multiplexer.
pub struct Session {
    state: SessionState,
    poller: Poller<SessionState, SessionError>,
    poll_timeout: Duration,
}

impl Session {
    /// Resolve where `client` was headed and connect there.
    pub fn open(
        client: TcpStream,
        resolver: &dyn DestinationResolver,
        config: &RecorderConfig,
        writer: RecordWriter,
        id: ConnectionId,
    ) -> Result<Self, SessionError> {
        let destination = resolver
            .resolve(&client)
            .map_err(SessionError::Destination)?;

        tracing::info!(
            connection_id = %id,
            client = %client.peer_addr()?,
            destination = %destination,
            "Connection intended for destination"
        );

        let server = TcpStream::connect_timeout(&destination, config.timeouts.connect())
            .map_err(|source| SessionError::Connect {
                addr: destination,
                source,
            })?;

        let state = SessionState {
            id,
            client: Leg::new(client),
            server: Leg::new(server),
            requests: HttpRequestParser::new(),
            responses: HttpResponseParser::new(),
            pending: PendingPairs::new(destination),
            writer,
            buf: vec![0; config.session.read_buffer_bytes],
        };

        Ok(Self {
            poller: Self::actions(&state),
            state,
            poll_timeout: config.timeouts.poll(),
        })
    }

    fn actions(state: &SessionState) -> Poller<SessionState, SessionError> {
        let client_fd = state.client.stream.as_raw_fd();
        let server_fd = state.server.stream.as_raw_fd();

        let mut poller: Poller<SessionState, SessionError> = Poller::new();

        // Keep reading the server while the client is there, or while a
        // forwarded request is still owed its response.
        poller.add_action(Action::new(
            server_fd,
            Direction::In,
            SessionState::read_server,
            |s: &SessionState| !s.server.eof && (!s.client.eof || !s.pending.is_empty()),
        ));
        poller.add_action(Action::new(
            client_fd,
            Direction::In,
            SessionState::read_client,
            |s: &SessionState| !s.client.eof && !s.server.eof,
        ));
        poller.add_action(Action::new(
            server_fd,
            Direction::Out,
            SessionState::forward_request,
            |s: &SessionState| !s.requests.is_empty(),
        ));
        poller.add_action(Action::new(
            client_fd,
            Direction::Out,
            SessionState::forward_response,
            |s: &SessionState| !s.responses.is_empty(),
        ));

        poller
    }

    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    pub fn destination(&self) -> SocketAddr {
        self.state.pending.destination()
    }

    /// Ferry messages until both directions are finished.
    pub fn run(mut self) -> Result<(), SessionError> {
        loop {
            match self.poller.poll(&mut self.state, Some(self.poll_timeout))? {
                PollResult::Exit(_) => break,
                PollResult::Timeout => {
                    tracing::trace!(connection_id = %self.state.id, "Session poll timed out");
                }
                PollResult::Success => {}
            }
        }

        if !self.state.pending.is_empty() {
            tracing::debug!(
                connection_id = %self.state.id,
                unanswered = self.state.pending.len(),
                "Session ended with unanswered requests"
            );
        }
        tracing::debug!(connection_id = %self.state.id, "Session finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::FixedDestination;
    use std::net::TcpListener;
    use std::thread;

    /// Serves one connection: reads one request head and sends `reply`.
    fn one_shot_server(reply: &'static [u8]) -> SocketAddr {
        delayed_server(reply, Duration::ZERO)
    }

    /// Like `one_shot_server`, but waits `delay` before replying.
    fn delayed_server(reply: &'static [u8], delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    return;
                }
                seen.extend_from_slice(&buf[..n]);
            }
            thread::sleep(delay);
            stream.write_all(reply).unwrap();
        });
        addr
    }

    /// Returns (proxy side of the client connection, test side).
    fn client_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let outside = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (inside, _) = listener.accept().unwrap();
        (inside, outside)
    }

    /// Open and run a session on its own thread, as the proxy does.
    fn run_session(
        inside: TcpStream,
        upstream: SocketAddr,
        writer: RecordWriter,
    ) -> thread::JoinHandle<Result<(), SessionError>> {
        thread::spawn(move || {
            let session = Session::open(
                inside,
                &FixedDestination(upstream),
                &RecorderConfig::default(),
                writer,
                ConnectionId::new(),
            )?;
            assert_eq!(session.destination(), upstream);
            session.run()
        })
    }

    #[test]
    fn single_exchange_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
        let (inside, mut outside) = client_pair();
        let handle = run_session(inside, upstream, RecordWriter::new(dir.path()));

        outside.write_all(b"GET /a HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();
        let mut response = vec![0u8; 40];
        outside.read_exact(&mut response).unwrap();
        assert!(response.ends_with(b"\r\n\r\nhi"));
        drop(outside);

        handle.join().unwrap().unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let record = crate::record::read_record(&files[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(record.request.unwrap().first_line, b"GET /a HTTP/1.1");
        assert_eq!(record.port, u32::from(upstream.port()));
    }

    #[test]
    fn half_closed_client_still_gets_its_response() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = delayed_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi",
            Duration::from_millis(200),
        );
        let (inside, mut outside) = client_pair();
        let handle = run_session(inside, upstream, RecordWriter::new(dir.path()));

        outside.write_all(b"GET /a HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();
        outside.shutdown(std::net::Shutdown::Write).unwrap();

        // The session closes the client once the owed response is delivered.
        let mut received = Vec::new();
        outside.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");

        handle.join().unwrap().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn unreachable_destination_fails_to_open() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let (inside, _outside) = client_pair();

        let err = Session::open(
            inside,
            &FixedDestination(closed),
            &RecorderConfig::default(),
            RecordWriter::new("."),
            ConnectionId::new(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), "connect");
    }

    #[test]
    fn error_kinds_are_distinct() {
        let io = SessionError::Io(io::Error::other("x"));
        let orphan = SessionError::Pairing(PairingError::OrphanResponse {
            first_line: String::new(),
        });
        assert_eq!(io.kind(), "io");
        assert_eq!(orphan.kind(), "pairing");
    }
}
