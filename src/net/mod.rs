//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Redirected TCP connection
//!     → listener.rs (accept loop, session limit)
//!     → connection.rs (session id, live-session tracking)
//!     → original_dest.rs (where the client meant to go)
//!     → Hand off to proxy::Session
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each session tracked for graceful shutdown
//! - Destination resolution is a trait so tests can bypass NAT

pub mod connection;
pub mod listener;
pub mod original_dest;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use original_dest::{DestinationResolver, FixedDestination, OriginalDestination};
