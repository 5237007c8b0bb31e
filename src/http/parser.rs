//! Incremental HTTP/1.x request and response parsers.
//!
//! Bytes are fed in as they arrive; fully received messages come out of a
//! FIFO queue. Heads are tokenized with `httparse`, bodies are delimited by
//! `Transfer-Encoding: chunked`, `Content-Length`, or (responses only) the
//! end of the stream.

use std::collections::VecDeque;

use httparse::Status;
use thiserror::Error;

use crate::http::message::{HttpHeader, HttpMessage, HttpRequest, HttpResponse};

const MAX_HEADERS: usize = 128;

/// Errors that make a byte stream unparseable.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed message head: {0}")]
    Head(#[from] httparse::Error),

    #[error("invalid Content-Length header")]
    ContentLength,

    #[error("invalid chunk size line")]
    ChunkSize,

    #[error("missing CRLF after chunk data")]
    ChunkFraming,
}

enum Framing {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

/// Tracks where the body of the current message ends. Offsets are absolute
/// positions in the assembler buffer.
#[derive(Debug)]
enum Body {
    Until(usize),
    Chunked { cursor: usize, phase: ChunkPhase },
    UntilClose,
}

impl Body {
    fn start(head_len: usize, framing: Framing) -> Result<Self, ParseError> {
        Ok(match framing {
            Framing::Empty => Body::Until(head_len),
            Framing::Length(n) => Body::Until(head_len.checked_add(n).ok_or(ParseError::ContentLength)?),
            Framing::Chunked => Body::Chunked {
                cursor: head_len,
                phase: ChunkPhase::Size,
            },
            Framing::UntilClose => Body::UntilClose,
        })
    }

    /// End offset of the message, once `buf` holds all of it.
    fn end(&mut self, buf: &[u8]) -> Result<Option<usize>, ParseError> {
        match self {
            Body::Until(end) => Ok((buf.len() >= *end).then_some(*end)),
            Body::UntilClose => Ok(None),
            Body::Chunked { cursor, phase } => loop {
                match *phase {
                    ChunkPhase::Size => match httparse::parse_chunk_size(&buf[*cursor..]) {
                        Ok(Status::Complete((used, size))) => {
                            *cursor += used;
                            *phase = if size == 0 {
                                ChunkPhase::Trailers
                            } else {
                                ChunkPhase::Data(size)
                            };
                        }
                        Ok(Status::Partial) => return Ok(None),
                        Err(_) => return Err(ParseError::ChunkSize),
                    },
                    ChunkPhase::Data(remaining) => {
                        let available = (buf.len() - *cursor) as u64;
                        let take = available.min(remaining);
                        *cursor += take as usize;
                        if take < remaining {
                            *phase = ChunkPhase::Data(remaining - take);
                            return Ok(None);
                        }
                        *phase = ChunkPhase::DataEnd;
                    }
                    ChunkPhase::DataEnd => {
                        if buf.len() < *cursor + 2 {
                            return Ok(None);
                        }
                        if &buf[*cursor..*cursor + 2] != b"\r\n" {
                            return Err(ParseError::ChunkFraming);
                        }
                        *cursor += 2;
                        *phase = ChunkPhase::Size;
                    }
                    ChunkPhase::Trailers => {
                        let Some(pos) = find_crlf(&buf[*cursor..]) else {
                            return Ok(None);
                        };
                        *cursor += pos + 2;
                        // An empty line ends the trailer section.
                        if pos == 0 {
                            return Ok(Some(*cursor));
                        }
                    }
                }
            },
        }
    }
}

struct Head<K> {
    line: K,
    len: usize,
    first_line: String,
    headers: Vec<HttpHeader>,
}

impl<K> Head<K> {
    fn into_message(self, raw: Vec<u8>) -> (K, HttpMessage) {
        (self.line, HttpMessage::new(raw, self.first_line, self.headers, self.len))
    }
}

struct RequestLine {
    method: String,
    target: String,
    version: u8,
}

struct StatusLine {
    status: u16,
    reason: String,
}

/// Buffers bytes and cuts complete messages off the front.
struct Assembler<K> {
    buffer: Vec<u8>,
    current: Option<(Head<K>, Body)>,
}

impl<K> Default for Assembler<K> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            current: None,
        }
    }
}

impl<K> Assembler<K> {
    fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next<F>(&mut self, begin: F) -> Result<Option<(Head<K>, Vec<u8>)>, ParseError>
    where
        F: FnOnce(&[u8]) -> Result<Option<(Head<K>, Body)>, ParseError>,
    {
        if self.current.is_none() {
            match begin(&self.buffer)? {
                Some(started) => self.current = Some(started),
                None => return Ok(None),
            }
        }

        let end = match self.current.as_mut() {
            Some((_, body)) => body.end(&self.buffer)?,
            None => None,
        };
        let Some(end) = end else {
            return Ok(None);
        };

        let raw: Vec<u8> = self.buffer.drain(..end).collect();
        Ok(self.current.take().map(|(head, _)| (head, raw)))
    }

    /// The stream ended: a read-until-close message is now complete.
    fn close(&mut self) -> Option<(Head<K>, Vec<u8>)> {
        if !matches!(self.current, Some((_, Body::UntilClose))) {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        self.current.take().map(|(head, _)| (head, raw))
    }

    fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn first_line(buf: &[u8]) -> String {
    let start = buf
        .iter()
        .position(|&b| b != b'\r' && b != b'\n')
        .unwrap_or(buf.len());
    let rest = &buf[start..];
    let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    let line = &rest[..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

fn owned_headers(headers: &[httparse::Header<'_>]) -> Vec<HttpHeader> {
    headers
        .iter()
        .map(|h| HttpHeader {
            name: h.name.to_string(),
            value: h.value.to_vec(),
        })
        .collect()
}

/// Framing announced by the headers, if any.
fn declared_framing(headers: &[HttpHeader]) -> Result<Option<Framing>, ParseError> {
    let chunked = headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
        .any(|h| {
            String::from_utf8_lossy(&h.value)
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        });
    if chunked {
        return Ok(Some(Framing::Chunked));
    }

    let mut length: Option<usize> = None;
    for header in headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("content-length"))
    {
        let value = std::str::from_utf8(&header.value)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or(ParseError::ContentLength)?;
        match length {
            Some(previous) if previous != value => return Err(ParseError::ContentLength),
            _ => length = Some(value),
        }
    }

    Ok(length.map(Framing::Length))
}

fn parse_request_head(buf: &[u8]) -> Result<Option<(Head<RequestLine>, Body)>, ParseError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut storage);
    let len = match req.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return Ok(None),
    };

    let line = RequestLine {
        method: req.method.unwrap_or_default().to_string(),
        target: req.path.unwrap_or_default().to_string(),
        version: req.version.unwrap_or(1),
    };
    let headers = owned_headers(req.headers);

    // Requests without declared framing have no body.
    let framing = declared_framing(&headers)?.unwrap_or(Framing::Empty);
    let body = Body::start(len, framing)?;

    Ok(Some((
        Head {
            line,
            len,
            first_line: first_line(buf),
            headers,
        },
        body,
    )))
}

fn parse_response_head(
    buf: &[u8],
    requests: &mut VecDeque<String>,
) -> Result<Option<(Head<StatusLine>, Body)>, ParseError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut storage);
    let len = match res.parse(buf)? {
        Status::Complete(len) => len,
        Status::Partial => return Ok(None),
    };

    let status = res.code.unwrap_or_default();
    let line = StatusLine {
        status,
        reason: res.reason.unwrap_or_default().to_string(),
    };
    let headers = owned_headers(res.headers);

    // Interim responses precede the real answer and do not use up a request.
    let informational = (100..200).contains(&status) && status != 101;
    let method = if informational {
        None
    } else {
        requests.pop_front()
    };
    let method_is = |name: &str| {
        method
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case(name))
    };

    let framing = if informational || status == 204 || status == 304 || method_is("HEAD") {
        Framing::Empty
    } else if status == 101 || (method_is("CONNECT") && (200..300).contains(&status)) {
        Framing::UntilClose
    } else {
        declared_framing(&headers)?.unwrap_or(Framing::UntilClose)
    };
    let body = Body::start(len, framing)?;

    Ok(Some((
        Head {
            line,
            len,
            first_line: first_line(buf),
            headers,
        },
        body,
    )))
}

/// Parses a client's byte stream into requests.
#[derive(Default)]
pub struct HttpRequestParser {
    assembler: Assembler<RequestLine>,
    complete: VecDeque<HttpRequest>,
}

impl HttpRequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.assembler.feed(data);
        while let Some((head, raw)) = self.assembler.next(parse_request_head)? {
            let (line, message) = head.into_message(raw);
            self.complete.push_back(HttpRequest {
                method: line.method,
                target: line.target,
                version: line.version,
                message,
            });
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.complete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.complete.len()
    }

    /// Oldest complete request.
    pub fn front(&self) -> Option<&HttpRequest> {
        self.complete.front()
    }

    pub fn pop(&mut self) -> Option<HttpRequest> {
        self.complete.pop_front()
    }

    /// Bytes received but not yet part of a complete request.
    pub fn buffered(&self) -> usize {
        self.assembler.buffered()
    }
}

/// Parses a server's byte stream into responses.
///
/// Body framing of a response depends on the request it answers, so every
/// forwarded request must be announced with [`new_request_arrived`].
///
/// [`new_request_arrived`]: HttpResponseParser::new_request_arrived
#[derive(Default)]
pub struct HttpResponseParser {
    assembler: Assembler<StatusLine>,
    complete: VecDeque<HttpResponse>,
    requests: VecDeque<String>,
}

impl HttpResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_request_arrived(&mut self, request: &HttpRequest) {
        self.requests.push_back(request.method().to_string());
    }

    pub fn parse(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.assembler.feed(data);
        loop {
            let requests = &mut self.requests;
            match self
                .assembler
                .next(|buf| parse_response_head(buf, requests))?
            {
                Some((head, raw)) => self.push(head, raw),
                None => return Ok(()),
            }
        }
    }

    /// The server closed its side of the stream.
    pub fn eof(&mut self) {
        if let Some((head, raw)) = self.assembler.close() {
            self.push(head, raw);
        } else if self.assembler.buffered() > 0 {
            tracing::debug!(
                bytes = self.assembler.buffered(),
                "Discarding incomplete response at end of stream"
            );
        }
    }

    fn push(&mut self, head: Head<StatusLine>, raw: Vec<u8>) {
        let (line, message) = head.into_message(raw);
        self.complete.push_back(HttpResponse {
            status: line.status,
            reason: line.reason,
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.complete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.complete.len()
    }

    pub fn front(&self) -> Option<&HttpResponse> {
        self.complete.front()
    }

    pub fn pop(&mut self) -> Option<HttpResponse> {
        self.complete.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(wire: &[u8]) -> HttpRequest {
        let mut parser = HttpRequestParser::new();
        parser.parse(wire).unwrap();
        parser.pop().unwrap()
    }

    #[test]
    fn request_fed_byte_by_byte() {
        let wire = b"GET /a?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut parser = HttpRequestParser::new();
        for byte in wire.iter() {
            assert!(parser.is_empty());
            parser.parse(std::slice::from_ref(byte)).unwrap();
        }

        let req = parser.pop().unwrap();
        assert_eq!(req.method(), "GET");
        assert_eq!(req.target(), "/a?x=1");
        assert_eq!(req.message().first_line(), "GET /a?x=1 HTTP/1.1");
        assert_eq!(req.message().header("host"), Some(&b"example.com"[..]));
        assert_eq!(req.as_bytes(), &wire[..]);
        assert!(parser.is_empty());
    }

    #[test]
    fn request_body_waits_for_content_length() {
        let mut parser = HttpRequestParser::new();
        parser
            .parse(b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel")
            .unwrap();
        assert!(parser.is_empty());

        parser.parse(b"lo").unwrap();
        let req = parser.pop().unwrap();
        assert_eq!(req.message().body(), b"hello");
    }

    #[test]
    fn pipelined_requests_queue_in_order() {
        let mut parser = HttpRequestParser::new();
        parser
            .parse(b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\nGET /c")
            .unwrap();

        assert_eq!(parser.len(), 2);
        assert_eq!(parser.pop().unwrap().target(), "/a");
        assert_eq!(parser.pop().unwrap().target(), "/b");
        assert_eq!(parser.buffered(), 6);
    }

    #[test]
    fn chunked_request_keeps_wire_framing() {
        let wire = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2;ext=1\r\nde\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let req = request(wire);
        assert_eq!(req.as_bytes(), &wire[..]);
        assert!(req.message().body().starts_with(b"3\r\nabc"));
    }

    #[test]
    fn conflicting_content_length_is_rejected() {
        let mut parser = HttpRequestParser::new();
        let err = parser
            .parse(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n")
            .unwrap_err();
        assert!(matches!(err, ParseError::ContentLength));
    }

    #[test]
    fn garbage_head_is_rejected() {
        let mut parser = HttpRequestParser::new();
        assert!(parser.parse(b"\x00\x01 not http\r\n\r\n").is_err());
    }

    #[test]
    fn response_with_content_length() {
        let mut parser = HttpResponseParser::new();
        parser.new_request_arrived(&request(b"GET / HTTP/1.1\r\n\r\n"));
        parser
            .parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();

        let res = parser.pop().unwrap();
        assert_eq!(res.status(), 200);
        assert_eq!(res.reason(), "OK");
        assert_eq!(res.message().body(), b"ok");
    }

    #[test]
    fn head_response_has_no_body() {
        let mut parser = HttpResponseParser::new();
        parser.new_request_arrived(&request(b"HEAD /big HTTP/1.1\r\n\r\n"));
        parser
            .parse(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n")
            .unwrap();

        let res = parser.pop().unwrap();
        assert!(res.message().body().is_empty());
    }

    #[test]
    fn interim_response_does_not_consume_request() {
        let mut parser = HttpResponseParser::new();
        parser.new_request_arrived(&request(b"HEAD / HTTP/1.1\r\n\r\n"));
        parser
            .parse(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\n")
            .unwrap();

        assert_eq!(parser.len(), 2);
        assert!(parser.pop().unwrap().is_informational());
        // Still matched against the HEAD request, so no body is expected.
        let final_response = parser.pop().unwrap();
        assert_eq!(final_response.status(), 200);
        assert!(final_response.message().body().is_empty());
    }

    #[test]
    fn chunked_response_completes_after_trailers() {
        let mut parser = HttpResponseParser::new();
        parser.new_request_arrived(&request(b"GET / HTTP/1.1\r\n\r\n"));
        parser
            .parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n0\r\n")
            .unwrap();
        assert!(parser.is_empty());

        parser.parse(b"\r\n").unwrap();
        let res = parser.pop().unwrap();
        assert_eq!(res.message().body(), b"4\r\nwiki\r\n0\r\n\r\n");
    }

    #[test]
    fn bad_chunk_framing_is_rejected() {
        let mut parser = HttpResponseParser::new();
        parser.new_request_arrived(&request(b"GET / HTTP/1.1\r\n\r\n"));
        let err = parser
            .parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nabXX")
            .unwrap_err();
        assert!(matches!(err, ParseError::ChunkFraming));
    }

    #[test]
    fn unframed_response_completes_at_eof() {
        let mut parser = HttpResponseParser::new();
        parser.new_request_arrived(&request(b"GET / HTTP/1.1\r\n\r\n"));
        parser.parse(b"HTTP/1.0 200 OK\r\n\r\nstream").unwrap();
        parser.parse(b"ing").unwrap();
        assert!(parser.is_empty());

        parser.eof();
        let res = parser.pop().unwrap();
        assert_eq!(res.message().body(), b"streaming");
    }

    #[test]
    fn no_content_response_is_complete_after_head() {
        let mut parser = HttpResponseParser::new();
        parser.new_request_arrived(&request(b"DELETE /x HTTP/1.1\r\n\r\n"));
        parser.parse(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        assert_eq!(parser.pop().unwrap().status(), 204);
    }
}
