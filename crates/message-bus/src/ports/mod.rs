//! Ports: the traits at the edges of the bus.

pub mod inbound;
pub mod outbound;

pub use inbound::{FnHandler, MessageHandler};
pub use outbound::{
    Delivery, ErrorContext, ErrorStage, ErrorSubscriber, ExceptionFilter, InputBinding, InputLink,
    Link, MessageTrace, OutputLink, Transport, TransportKind,
};
