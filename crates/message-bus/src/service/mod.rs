//! Service layer: the components applications hold.

pub mod bus;
pub mod correlator;
pub mod dispatcher;
pub mod publisher;

pub use bus::MessageBus;
pub use correlator::{sweep_task, PendingRpcTable, PendingStats, RpcPublisher};
pub use dispatcher::{DispatcherStats, Subscriber};
pub use publisher::{PublishOptions, Publisher};
