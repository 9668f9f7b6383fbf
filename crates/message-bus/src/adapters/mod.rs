//! Adapters: concrete transports and sinks.

pub mod error_subscriber;
pub mod memory_broker;
pub mod tcp;
pub mod trace;

pub use error_subscriber::{CollectingErrorSubscriber, LoggingErrorSubscriber, NullErrorSubscriber};
pub use memory_broker::InMemoryBroker;
pub use tcp::TcpTransport;
pub use trace::TracingMessageTrace;
