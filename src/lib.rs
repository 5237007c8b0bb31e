//! Transparent HTTP recording proxy and signal-aware process supervision.

pub mod config;
pub mod event;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod record;

pub use config::schema::RecorderConfig;
pub use event::EventLoop;
pub use lifecycle::Shutdown;
pub use proxy::RecordingProxy;
