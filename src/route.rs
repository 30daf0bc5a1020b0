use crate::error::ProcessingError;
use crate::event::{ExchangeEvent, SharedEventNotifier, emit};
use crate::exchange::Exchange;
use crate::processor::{SharedProcessor, dispatch};
use std::sync::atomic::{AtomicBool, Ordering};

/// A named entry point into a processor graph.
///
/// The route owns the boundary semantics: an exchange that comes back with
/// an exception is surfaced as an `Err`, while one whose failure was handled
/// downstream (dead-lettered, continued) is a successful, possibly degraded,
/// result.
pub struct Route {
    id: String,
    entry: SharedProcessor,
    notifier: Option<SharedEventNotifier>,
    started: AtomicBool,
}

impl Route {
    pub fn new(id: impl Into<String>, entry: SharedProcessor) -> Self {
        Self {
            id: id.into(),
            entry,
            notifier: None,
            started: AtomicBool::new(false),
        }
    }

    pub fn notifier(mut self, notifier: SharedEventNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            log::info!("route '{}' started", self.id);
            emit(&self.notifier, ExchangeEvent::RouteStarted {
                route_id: self.id.clone(),
            });
        }
    }

    pub fn stop(&self) {
        if self.started.swap(false, Ordering::SeqCst) {
            log::info!("route '{}' stopped", self.id);
            emit(&self.notifier, ExchangeEvent::RouteStopped {
                route_id: self.id.clone(),
            });
        }
    }

    /// Runs the exchange through the route and returns the outcome.
    pub async fn send(&self, mut exchange: Exchange) -> Result<Exchange, ProcessingError> {
        if !self.is_started() {
            return Err(ProcessingError::processing(format!(
                "route '{}' is not started",
                self.id
            )));
        }
        emit(&self.notifier, ExchangeEvent::ExchangeSent {
            exchange_id: *exchange.id(),
        });
        dispatch(self.entry.as_ref(), &mut exchange).await;
        match exchange.exception() {
            Some(error) => {
                let error = error.clone();
                emit(&self.notifier, ExchangeEvent::ExchangeFailed {
                    exchange_id: *exchange.id(),
                    error: error.clone(),
                });
                Err(error)
            }
            None => {
                emit(&self.notifier, ExchangeEvent::ExchangeCompleted {
                    exchange_id: *exchange.id(),
                });
                Ok(exchange)
            }
        }
    }
}
