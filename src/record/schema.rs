//! Protobuf schema of a recorded request/response pair.
//!
//! Messages are derived with `prost` directly; there is no `.proto` build step.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct HttpHeader {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct HttpMessage {
    /// Request line or status line, without the trailing CRLF.
    #[prost(bytes = "vec", tag = "1")]
    pub first_line: Vec<u8>,
    #[prost(message, repeated, tag = "2")]
    pub header: Vec<HttpHeader>,
    /// Body exactly as it crossed the wire (chunk framing included).
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

/// One file on disk.
#[derive(Clone, PartialEq, Message)]
pub struct RequestResponse {
    /// Original destination address of the connection.
    #[prost(string, tag = "1")]
    pub ip: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(string, tag = "3")]
    pub scheme: String,
    #[prost(message, optional, tag = "4")]
    pub request: Option<HttpMessage>,
    #[prost(message, optional, tag = "5")]
    pub response: Option<HttpMessage>,
}

impl RequestResponse {
    /// Both halves are present.
    pub fn is_complete(&self) -> bool {
        self.request.is_some() && self.response.is_some()
    }
}

impl HttpMessage {
    /// Header value by case-insensitive name.
    pub fn header_value(&self, name: &str) -> Option<&[u8]> {
        self.header
            .iter()
            .find(|h| h.key.eq_ignore_ascii_case(name.as_bytes()))
            .map(|h| h.value.as_slice())
    }
}
