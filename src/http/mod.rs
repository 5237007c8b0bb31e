//! HTTP/1.x message layer.
//!
//! # Data Flow
//! ```text
//! raw bytes from a leg
//!     → parser.rs (httparse head + body framing)
//!     → message.rs (HttpRequest / HttpResponse, exact wire bytes kept)
//!     → FIFO queue drained by the proxy session
//! ```

pub mod message;
pub mod parser;

pub use message::{HttpHeader, HttpMessage, HttpRequest, HttpResponse};
pub use parser::{HttpRequestParser, HttpResponseParser, ParseError};
