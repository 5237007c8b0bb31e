//! Event loop subsystem.
//!
//! # Data Flow
//! ```text
//! poller.rs      actions over fds → poll(2) → callbacks
//! signal.rs      blocked SignalMask → SignalFd → DeliveredSignal
//! child.rs       ChildProcess state via waitid(2)
//! privilege.rs   effective ids dropped around each wait
//! event_loop.rs  ties the above together: signals and children become
//!                readiness events with a single exit decision
//! ```

pub mod child;
pub mod event_loop;
pub mod poller;
pub mod privilege;
pub mod signal;

pub use child::{ChildError, ChildExit, ChildProcess};
pub use event_loop::{EventLoop, EventLoopError, ExitPolicy};
pub use poller::{Action, Direction, Outcome, PollResult, Poller};
