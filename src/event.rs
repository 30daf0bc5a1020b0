use crate::error::ProcessingError;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle notifications emitted by the core.
///
/// Events are observational only: no component changes behavior based on
/// whether a listener is attached.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    RouteStarted { route_id: String },
    RouteStopped { route_id: String },
    ExchangeSent { exchange_id: Uuid },
    ExchangeCompleted { exchange_id: Uuid },
    ExchangeFailed { exchange_id: Uuid, error: ProcessingError },
    RedeliveryAttempted { exchange_id: Uuid, attempt: u32 },
    RedeliveryExhausted { exchange_id: Uuid, attempts: u32 },
    SagaCompleted { action_id: Uuid },
    SagaCompensated { action_id: Uuid },
}

pub trait EventNotifier: Send + Sync {
    fn notify(&self, event: &ExchangeEvent);
}

pub type SharedEventNotifier = Arc<dyn EventNotifier>;

/// Forwards every event to the `log` facade.
pub struct LogNotifier;

impl EventNotifier for LogNotifier {
    fn notify(&self, event: &ExchangeEvent) {
        match event {
            ExchangeEvent::ExchangeFailed { exchange_id, error } => {
                log::warn!("exchange {} failed: {}", exchange_id, error);
            }
            ExchangeEvent::RedeliveryExhausted {
                exchange_id,
                attempts,
            } => {
                log::warn!(
                    "exchange {} exhausted redelivery after {} attempts",
                    exchange_id,
                    attempts
                );
            }
            other => log::debug!("{:?}", other),
        }
    }
}

/// Emits through an optional notifier; absence is a no-op.
pub(crate) fn emit(notifier: &Option<SharedEventNotifier>, event: ExchangeEvent) {
    if let Some(notifier) = notifier {
        notifier.notify(&event);
    }
}
