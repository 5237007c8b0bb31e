//! Parsed HTTP messages.
//!
//! A message keeps its exact wire bytes so it can be forwarded unmodified;
//! the structured fields are views decoded once at parse time.

use crate::record::schema;

/// A header as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: Vec<u8>,
}

/// One complete HTTP/1.x message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    raw: Vec<u8>,
    first_line: String,
    headers: Vec<HttpHeader>,
    body_offset: usize,
}

impl HttpMessage {
    pub(crate) fn new(raw: Vec<u8>, first_line: String, headers: Vec<HttpHeader>, body_offset: usize) -> Self {
        Self {
            raw,
            first_line,
            headers,
            body_offset,
        }
    }

    /// Wire bytes of the whole message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn first_line(&self) -> &str {
        &self.first_line
    }

    pub fn headers(&self) -> &[HttpHeader] {
        &self.headers
    }

    /// First header matching `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    pub fn body(&self) -> &[u8] {
        &self.raw[self.body_offset..]
    }

    pub fn to_record(&self) -> schema::HttpMessage {
        schema::HttpMessage {
            first_line: self.first_line.as_bytes().to_vec(),
            header: self
                .headers
                .iter()
                .map(|h| schema::HttpHeader {
                    key: h.name.as_bytes().to_vec(),
                    value: h.value.clone(),
                })
                .collect(),
            body: self.body().to_vec(),
        }
    }
}

/// A complete request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: u8,
    pub(crate) message: HttpMessage,
}

impl HttpRequest {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target (path and query, or absolute URL).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Minor HTTP version (`1` for HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case("HEAD")
    }

    pub fn message(&self) -> &HttpMessage {
        &self.message
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.message.as_bytes()
    }

    pub fn to_record(&self) -> schema::HttpMessage {
        self.message.to_record()
    }
}

/// A complete response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub(crate) status: u16,
    pub(crate) reason: String,
    pub(crate) message: HttpMessage,
}

impl HttpResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Interim 1xx response that does not answer the request by itself.
    ///
    /// 101 Switching Protocols is final.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn message(&self) -> &HttpMessage {
        &self.message
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.message.as_bytes()
    }

    pub fn to_record(&self) -> schema::HttpMessage {
        self.message.to_record()
    }
}
