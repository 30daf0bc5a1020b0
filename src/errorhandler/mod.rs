use crate::error::{ErrorKind, ProcessingError};
use crate::event::{ExchangeEvent, SharedEventNotifier, emit};
use crate::exchange::{Exchange, names};
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Immutable redelivery configuration.
///
/// The logging fields control verbosity only; correctness semantics live in
/// the counters and delays.
#[derive(Debug, Clone)]
pub struct RedeliveryPolicy {
    pub maximum_redeliveries: u32,
    pub redelivery_delay: Duration,
    /// Multiplies the delay per attempt when greater than 1.0.
    pub backoff_multiplier: f64,
    pub maximum_redelivery_delay: Duration,
    pub use_collision_avoidance: bool,
    /// Jitter amplitude as a fraction of the computed delay, 0.0..=1.0.
    pub collision_avoidance_factor: f64,
    pub log_retry_attempted: bool,
    pub retry_attempted_log_level: log::Level,
    pub retries_exhausted_log_level: log::Level,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_secs(1),
            backoff_multiplier: 1.0,
            maximum_redelivery_delay: Duration::from_secs(60),
            use_collision_avoidance: false,
            collision_avoidance_factor: 0.15,
            log_retry_attempted: true,
            retry_attempted_log_level: log::Level::Debug,
            retries_exhausted_log_level: log::Level::Error,
        }
    }
}

impl RedeliveryPolicy {
    pub fn with_maximum_redeliveries(maximum: u32) -> Self {
        Self {
            maximum_redeliveries: maximum,
            ..Self::default()
        }
    }

    pub fn maximum_redeliveries(mut self, maximum: u32) -> Self {
        self.maximum_redeliveries = maximum;
        self
    }

    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn collision_avoidance(mut self, factor: f64) -> Self {
        self.use_collision_avoidance = true;
        self.collision_avoidance_factor = factor;
        self
    }

    /// Delay before retry attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.redelivery_delay.as_millis() as f64;
        if self.backoff_multiplier > 1.0 && attempt > 1 {
            delay *= self.backoff_multiplier.powi(attempt as i32 - 1);
        }
        let cap = self.maximum_redelivery_delay.as_millis() as f64;
        if delay > cap {
            delay = cap;
        }
        if self.use_collision_avoidance && delay > 0.0 {
            let factor = self.collision_avoidance_factor.clamp(0.0, 1.0);
            let jitter = rand::thread_rng().gen_range(-factor..=factor);
            delay *= 1.0 + jitter;
        }
        Duration::from_millis(delay.max(0.0) as u64)
    }
}

/// Per-error-kind override of the handler's route-level behavior.
///
/// The first registered policy whose kind set contains a failure's kind wins;
/// anything it leaves unset falls back to the handler defaults.
pub struct OnException {
    kinds: Vec<ErrorKind>,
    policy: Option<RedeliveryPolicy>,
    handled: Option<bool>,
    continued: bool,
    handler: Option<SharedProcessor>,
    use_original_message: bool,
}

impl OnException {
    pub fn new(kinds: Vec<ErrorKind>) -> Self {
        Self {
            kinds,
            policy: None,
            handled: None,
            continued: false,
            handler: None,
            use_original_message: false,
        }
    }

    pub fn policy(mut self, policy: RedeliveryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn maximum_redeliveries(mut self, maximum: u32) -> Self {
        let policy = self
            .policy
            .take()
            .unwrap_or_default()
            .maximum_redeliveries(maximum);
        self.policy = Some(policy);
        self
    }

    /// `handled=true` clears the exception once exhausted, so the caller
    /// sees success; the route stops.
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = Some(handled);
        self
    }

    /// `continued=true` clears the exception and lets the route carry on
    /// from the failure point.
    pub fn continued(mut self, continued: bool) -> Self {
        self.continued = continued;
        self
    }

    pub fn handler(mut self, handler: SharedProcessor) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn use_original_message(mut self, use_original: bool) -> Self {
        self.use_original_message = use_original;
        self
    }
}

/// Wraps a processor with retry-then-redirect failure handling.
///
/// Per delivery attempt: a failure matching the applicable policy is retried
/// up to the policy's maximum, with a scheduled (never thread-blocking)
/// delay between attempts; once exhausted, the exchange is routed to the
/// failure destination and the configured disposition decides what the
/// caller sees. Rollback failures skip redelivery entirely.
///
/// With `handle_fault`, a fault message present after the inner processor
/// returns is converted into an exception and the fault message is removed;
/// exception and fault are never both visible downstream.
pub struct RedeliveryErrorHandler {
    inner: SharedProcessor,
    policy: RedeliveryPolicy,
    dead_letter: Option<SharedProcessor>,
    on_exception: Vec<OnException>,
    on_redelivery: Option<Arc<dyn Fn(&mut Exchange) + Send + Sync>>,
    handled: bool,
    use_original_message: bool,
    handle_fault: bool,
    notifier: Option<SharedEventNotifier>,
}

impl RedeliveryErrorHandler {
    /// Default error handler: no failure destination, failures propagate to
    /// the caller once redelivery is exhausted.
    pub fn new(inner: SharedProcessor, policy: RedeliveryPolicy) -> Self {
        Self {
            inner,
            policy,
            dead_letter: None,
            on_exception: Vec::new(),
            on_redelivery: None,
            handled: false,
            use_original_message: false,
            handle_fault: false,
            notifier: None,
        }
    }

    /// Dead letter channel: exhausted failures are routed to `dead_letter`
    /// and marked handled, so the caller sees a normal (degraded) result.
    pub fn dead_letter_channel(
        inner: SharedProcessor,
        policy: RedeliveryPolicy,
        dead_letter: SharedProcessor,
    ) -> Self {
        let mut handler = Self::new(inner, policy);
        handler.dead_letter = Some(dead_letter);
        handler.handled = true;
        handler
    }

    pub fn on_exception(mut self, on_exception: OnException) -> Self {
        self.on_exception.push(on_exception);
        self
    }

    /// Hook invoked before each retry attempt; it may mutate the exchange.
    pub fn on_redelivery(mut self, hook: impl Fn(&mut Exchange) + Send + Sync + 'static) -> Self {
        self.on_redelivery = Some(Arc::new(hook));
        self
    }

    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    /// Send the failure destination the message as it entered this handler,
    /// not as mutated by failed attempts.
    pub fn use_original_message(mut self, use_original: bool) -> Self {
        self.use_original_message = use_original;
        self
    }

    pub fn handle_fault(mut self, handle_fault: bool) -> Self {
        self.handle_fault = handle_fault;
        self
    }

    pub fn notifier(mut self, notifier: SharedEventNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn matching_policy(&self, kind: ErrorKind) -> Option<&OnException> {
        self.on_exception.iter().find(|p| p.kinds.contains(&kind))
    }

    fn needs_snapshot(&self) -> bool {
        self.use_original_message || self.on_exception.iter().any(|p| p.use_original_message)
    }
}

#[async_trait]
impl Processor for RedeliveryErrorHandler {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let original = self.needs_snapshot().then(|| exchange.in_message().clone());
        let mut attempt: u32 = 0;

        loop {
            dispatch(self.inner.as_ref(), exchange).await;

            if self.handle_fault && !exchange.is_failed() {
                if let Some(fault) = exchange.take_fault() {
                    let detail = fault
                        .body()
                        .as_text()
                        .map(|t| t.into_owned())
                        .unwrap_or_else(|| "fault".to_string());
                    exchange.set_exception(ProcessingError::processing(detail));
                }
            }

            if !exchange.is_failed() {
                return Ok(());
            }

            let Some(error) = exchange.exception().cloned() else {
                return Ok(());
            };
            if error.is_rollback() || exchange.is_rollback_only() {
                log::debug!(
                    "exchange {} rolled back, skipping redelivery",
                    exchange.id()
                );
                return Ok(());
            }

            let matched = self.matching_policy(error.kind());
            let policy = matched
                .and_then(|m| m.policy.as_ref())
                .unwrap_or(&self.policy);

            if attempt < policy.maximum_redeliveries {
                attempt += 1;
                exchange.set_property(names::REDELIVERY_COUNTER, attempt);
                exchange.set_property(names::REDELIVERY_MAX_COUNTER, policy.maximum_redeliveries);
                exchange.set_property(names::REDELIVERED, true);
                exchange
                    .in_message_mut()
                    .set_header(names::REDELIVERY_COUNTER, attempt as i64);
                exchange.in_message_mut().set_header(names::REDELIVERED, true);

                if policy.log_retry_attempted {
                    log::log!(
                        policy.retry_attempted_log_level,
                        "redelivery attempt {}/{} for exchange {}: {}",
                        attempt,
                        policy.maximum_redeliveries,
                        exchange.id(),
                        error
                    );
                }
                emit(&self.notifier, ExchangeEvent::RedeliveryAttempted {
                    exchange_id: *exchange.id(),
                    attempt,
                });

                exchange.clear_exception();
                if let Some(hook) = &self.on_redelivery {
                    hook(exchange);
                }
                let delay = policy.delay_for(attempt);
                if !delay.is_zero() {
                    // Scheduled, not blocking: the task yields and resumes on
                    // whatever worker picks it up after the delay.
                    tokio::time::sleep(delay).await;
                }
                continue;
            }

            // Exhausted (or the failure kind allows no redelivery at all).
            log::log!(
                policy.retries_exhausted_log_level,
                "redelivery exhausted after {} attempts for exchange {}: {}",
                attempt,
                exchange.id(),
                error
            );
            emit(&self.notifier, ExchangeEvent::RedeliveryExhausted {
                exchange_id: *exchange.id(),
                attempts: attempt,
            });

            let use_original = self.use_original_message
                || matched.map(|m| m.use_original_message).unwrap_or(false);
            if use_original {
                if let Some(snapshot) = &original {
                    exchange.take_out();
                    exchange.set_in(snapshot.clone());
                }
            }
            exchange.set_property(names::EXCEPTION_CAUGHT, error.clone());

            let destination = matched
                .and_then(|m| m.handler.clone())
                .or_else(|| self.dead_letter.clone());
            if let Some(destination) = destination {
                dispatch(destination.as_ref(), exchange).await;
            }

            let continued = matched.map(|m| m.continued).unwrap_or(false);
            let handled = matched.and_then(|m| m.handled).unwrap_or(self.handled);
            if continued {
                exchange.clear_exception();
                exchange.set_property(names::FAILURE_HANDLED, true);
            } else if handled {
                exchange.clear_exception();
                exchange.set_property(names::FAILURE_HANDLED, true);
                exchange.set_property(names::ROUTE_STOP, true);
            }
            return Ok(());
        }
    }

    fn name(&self) -> &str {
        "error-handler"
    }
}
