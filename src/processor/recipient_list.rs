use crate::aggregate::{SharedAggregationStrategy, UseLatest};
use crate::error::ProcessingError;
use crate::exchange::{Exchange, names};
use crate::pool::TaskExecutor;
use crate::processor::multicast::{Branch, FanOutConfig, run_branches};
use crate::processor::Processor;
use crate::registry::Registry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Computes the recipient names for one exchange.
pub type RecipientExpression = Arc<dyn Fn(&Exchange) -> Vec<String> + Send + Sync>;

/// Expression reading a comma-separated recipient list from a header.
pub fn recipients_from_header(name: impl Into<String>) -> RecipientExpression {
    let name = name.into();
    Arc::new(move |exchange| {
        exchange
            .message()
            .header_text(&name)
            .map(|value| {
                value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    })
}

/// A multicast whose destination list is computed per exchange and resolved
/// through the registry. An unresolvable recipient fails the whole exchange
/// before anything is dispatched.
pub struct RecipientList {
    expression: RecipientExpression,
    registry: Arc<Registry>,
    strategy: SharedAggregationStrategy,
    parallel: bool,
    executor: Option<Arc<TaskExecutor>>,
    stop_on_exception: bool,
    timeout: Option<Duration>,
    share_unit_of_work: bool,
}

impl RecipientList {
    pub fn new(expression: RecipientExpression, registry: Arc<Registry>) -> Self {
        Self {
            expression,
            registry,
            strategy: Arc::new(UseLatest),
            parallel: false,
            executor: None,
            stop_on_exception: false,
            timeout: None,
            share_unit_of_work: false,
        }
    }

    pub fn strategy(mut self, strategy: SharedAggregationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn executor(mut self, executor: Arc<TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn share_unit_of_work(mut self, share: bool) -> Self {
        self.share_unit_of_work = share;
        self
    }
}

#[async_trait]
impl Processor for RecipientList {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let recipients = (self.expression)(exchange);
        if recipients.is_empty() {
            return Ok(());
        }
        let mut destinations = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let destination = self
                .registry
                .processor(recipient)
                .map_err(|e| ProcessingError::validation(e.to_string()))?;
            destinations.push(destination);
        }

        let total = destinations.len();
        let branches = destinations
            .into_iter()
            .enumerate()
            .map(|(index, destination)| {
                let mut copy = exchange.copy();
                copy.set_property(names::MULTICAST_INDEX, index);
                copy.set_property(names::MULTICAST_COMPLETE, index == total - 1);
                Branch {
                    index,
                    exchange: copy,
                    destination,
                }
            })
            .collect();

        let config = FanOutConfig {
            parallel: self.parallel,
            stop_on_exception: self.stop_on_exception,
            timeout: self.timeout,
            executor: self.executor.clone(),
            strategy: self.strategy.clone(),
        };
        let result = run_branches(branches, &config).await;

        if let Some(aggregated) = result.aggregated {
            exchange.absorb(aggregated);
        }
        if let Some(rejected) = result.rejection {
            if !exchange.is_failed() {
                exchange.set_exception(rejected);
            }
        }
        if self.stop_on_exception || self.share_unit_of_work {
            if let Some(failure) = result.first_failure {
                if !exchange.is_failed() {
                    exchange.set_exception(failure);
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "recipient-list"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::BodyConcat;
    use crate::error::ErrorKind;
    use crate::processor::{dispatch, processor};

    fn registry_with_markers() -> Arc<Registry> {
        let registry = Registry::new();
        for marker in ["a", "b", "c"] {
            registry
                .register_processor(
                    marker,
                    processor(marker, move |exchange| {
                        exchange.message_mut().set_body(marker);
                        Ok(())
                    }),
                )
                .unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn routes_to_header_selected_recipients_in_order() {
        let list = RecipientList::new(
            recipients_from_header("recipients"),
            registry_with_markers(),
        )
        .strategy(Arc::new(BodyConcat::new()));

        let mut exchange = Exchange::with_body("original");
        exchange.in_message_mut().set_header("recipients", "c, a");
        dispatch(&list, &mut exchange).await;
        assert_eq!(exchange.message().body().as_text().unwrap(), "ca");
    }

    #[tokio::test]
    async fn unknown_recipient_fails_before_dispatch() {
        let list = RecipientList::new(
            recipients_from_header("recipients"),
            registry_with_markers(),
        );
        let mut exchange = Exchange::with_body("original");
        exchange
            .in_message_mut()
            .set_header("recipients", "a,unknown");
        dispatch(&list, &mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(exchange.exception().unwrap().kind(), ErrorKind::Validation);
        // Nothing ran, the body is untouched.
        assert_eq!(exchange.message().body().as_text().unwrap(), "original");
    }

    #[tokio::test]
    async fn no_recipients_is_a_pass_through() {
        let list = RecipientList::new(
            recipients_from_header("recipients"),
            registry_with_markers(),
        );
        let mut exchange = Exchange::with_body("original");
        dispatch(&list, &mut exchange).await;
        assert!(!exchange.is_failed());
        assert_eq!(exchange.message().body().as_text().unwrap(), "original");
    }
}
