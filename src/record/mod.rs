//! Recording of request/response pairs.
//!
//! # Data Flow
//! ```text
//! forwarded request → PendingPairs (FIFO)
//! final response    → PendingPairs::complete → RequestResponse
//!                   → RecordWriter::write → <output_dir>/<random u64>
//! ```
//!
//! # Design Decisions
//! - A response with no pending request is an error; nothing is written
//! - Interim 1xx responses are never offered for pairing
//! - Files are created only after the record has been encoded

pub mod pairing;
pub mod schema;
pub mod writer;

pub use pairing::{PairingError, PendingPairs};
pub use schema::RequestResponse;
pub use writer::{read_record, RecordError, RecordWriter, DEFAULT_FILE_MODE};
