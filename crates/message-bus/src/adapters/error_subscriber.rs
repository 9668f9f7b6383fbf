//! Error subscribers shipped with the bus.

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::domain::BusError;
use crate::ports::{ErrorContext, ErrorSubscriber};

/// Discards every error.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullErrorSubscriber;

impl ErrorSubscriber for NullErrorSubscriber {
    fn on_error(&self, _error: &BusError, _context: &ErrorContext) {}
}

/// Logs dispatcher errors through `tracing`. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorSubscriber;

impl ErrorSubscriber for LoggingErrorSubscriber {
    fn on_error(&self, error: &BusError, context: &ErrorContext) {
        let correlation_id = context.correlation_id.map(|c| c.to_string());
        if error.is_channel_fatal() {
            error!(
                consumer_tag = %context.consumer_tag,
                stage = %context.stage,
                action = ?context.action,
                correlation_id = ?correlation_id,
                error = %error,
                "Subscriber channel failed"
            );
        } else {
            warn!(
                consumer_tag = %context.consumer_tag,
                stage = %context.stage,
                action = ?context.action,
                correlation_id = ?correlation_id,
                error = %error,
                "Message processing failed"
            );
        }
    }
}

/// Keeps every reported error. Handy for tests and diagnostics.
#[derive(Debug, Default)]
pub struct CollectingErrorSubscriber {
    errors: Mutex<Vec<(BusError, ErrorContext)>>,
}

impl CollectingErrorSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn errors(&self) -> Vec<(BusError, ErrorContext)> {
        self.errors.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }
}

impl ErrorSubscriber for CollectingErrorSubscriber {
    fn on_error(&self, error: &BusError, context: &ErrorContext) {
        self.errors.lock().push((error.clone(), context.clone()));
    }
}
