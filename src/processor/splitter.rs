use crate::aggregate::SharedAggregationStrategy;
use crate::error::ProcessingError;
use crate::exchange::{Body, Exchange, names};
use crate::pool::TaskExecutor;
use crate::processor::multicast::{Branch, FanOutConfig, run_branches};
use crate::processor::{Processor, SharedProcessor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Derives the sub-bodies a splitter fans out.
pub trait SplitExpression: Send + Sync {
    fn split(&self, exchange: &Exchange) -> Result<Vec<Body>, ProcessingError>;
}

/// Splits the current body, read as text, on a fixed token.
pub struct TokenSplit {
    token: String,
}

impl TokenSplit {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl SplitExpression for TokenSplit {
    fn split(&self, exchange: &Exchange) -> Result<Vec<Body>, ProcessingError> {
        let text = exchange.message().body().as_text().ok_or_else(|| {
            ProcessingError::validation("token split requires a text-readable body")
        })?;
        Ok(text
            .split(self.token.as_str())
            .map(|part| Body::Text(part.to_string()))
            .collect())
    }
}

impl<F> SplitExpression for F
where
    F: Fn(&Exchange) -> Result<Vec<Body>, ProcessingError> + Send + Sync,
{
    fn split(&self, exchange: &Exchange) -> Result<Vec<Body>, ProcessingError> {
        self(exchange)
    }
}

/// Splits one exchange into N sub-exchanges, each an independent copy
/// carrying one sub-body plus the split index/size/complete properties, and
/// delivers them to the wrapped destination through the fan-out engine.
///
/// Without an aggregation strategy the original exchange continues unchanged
/// (failures still propagate per the configured flags); with one, the
/// aggregated result replaces the original's message state.
pub struct Splitter {
    expression: Arc<dyn SplitExpression>,
    destination: SharedProcessor,
    strategy: Option<SharedAggregationStrategy>,
    parallel: bool,
    executor: Option<Arc<TaskExecutor>>,
    stop_on_exception: bool,
    timeout: Option<Duration>,
    share_unit_of_work: bool,
}

impl Splitter {
    pub fn new(expression: impl SplitExpression + 'static, destination: SharedProcessor) -> Self {
        Self {
            expression: Arc::new(expression),
            destination,
            strategy: None,
            parallel: false,
            executor: None,
            stop_on_exception: false,
            timeout: None,
            share_unit_of_work: false,
        }
    }

    pub fn strategy(mut self, strategy: SharedAggregationStrategy) -> Self {
        self.strategy = Some(strategy);
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
impl Processor for Splitter {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let parts = self.expression.split(exchange)?;
        let total = parts.len();
        let branches = parts
            .into_iter()
            .enumerate()
            .map(|(index, body)| {
                let mut sub = exchange.copy();
                sub.promote_out();
                sub.in_message_mut().set_body(body);
                sub.set_property(names::SPLIT_INDEX, index);
                sub.set_property(names::SPLIT_SIZE, total);
                sub.set_property(names::SPLIT_COMPLETE, index == total - 1);
                Branch {
                    index,
                    exchange: sub,
                    destination: self.destination.clone(),
                }
            })
            .collect();

        let config = FanOutConfig {
            parallel: self.parallel,
            stop_on_exception: self.stop_on_exception,
            timeout: self.timeout,
            executor: self.executor.clone(),
            strategy: self
                .strategy
                .clone()
                .unwrap_or_else(|| Arc::new(crate::aggregate::UseLatest)),
        };
        let result = run_branches(branches, &config).await;

        if self.strategy.is_some() {
            if let Some(aggregated) = result.aggregated {
                exchange.absorb(aggregated);
            }
        }
        exchange.set_property(names::SPLIT_SIZE, total);
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
        "splitter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::BodyConcat;
    use crate::error::ErrorKind;
    use crate::processor::{dispatch, processor};
    use std::sync::Mutex;

    #[tokio::test]
    async fn split_and_aggregate_round_trip() {
        let splitter = Splitter::new(
            TokenSplit::new(","),
            processor("identity", |_| Ok(())),
        )
        .strategy(Arc::new(BodyConcat::new()));

        let mut exchange = Exchange::with_body("A,B,C");
        dispatch(&splitter, &mut exchange).await;

        assert_eq!(exchange.message().body().as_text().unwrap(), "ABC");
        assert_eq!(exchange.property::<usize>(names::SPLIT_SIZE), Some(&3));
        assert!(!exchange.is_failed());
    }

    #[tokio::test]
    async fn sub_exchanges_carry_split_properties_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = {
            let seen = seen.clone();
            processor("record", move |exchange| {
                seen.lock().unwrap().push((
                    *exchange.property::<usize>(names::SPLIT_INDEX).unwrap(),
                    *exchange.property::<usize>(names::SPLIT_SIZE).unwrap(),
                    *exchange.property::<bool>(names::SPLIT_COMPLETE).unwrap(),
                    exchange.message().body().as_text().unwrap().into_owned(),
                ));
                Ok(())
            })
        };
        let splitter = Splitter::new(TokenSplit::new(","), record);
        let mut exchange = Exchange::with_body("x,y");
        dispatch(&splitter, &mut exchange).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (0, 2, false, "x".to_string()),
                (1, 2, true, "y".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn original_body_is_kept_without_a_strategy() {
        let splitter = Splitter::new(TokenSplit::new(","), processor("identity", |_| Ok(())));
        let mut exchange = Exchange::with_body("A,B");
        dispatch(&splitter, &mut exchange).await;
        assert_eq!(exchange.message().body().as_text().unwrap(), "A,B");
        assert_eq!(exchange.property::<usize>(names::SPLIT_SIZE), Some(&2));
    }

    #[tokio::test]
    async fn unsplittable_body_fails_the_exchange() {
        let splitter = Splitter::new(TokenSplit::new(","), processor("identity", |_| Ok(())));
        let mut exchange = Exchange::new();
        dispatch(&splitter, &mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(exchange.exception().unwrap().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn stop_on_exception_halts_remaining_parts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = {
            let seen = seen.clone();
            processor("record", move |exchange: &mut Exchange| {
                let part = exchange.message().body().as_text().unwrap().into_owned();
                seen.lock().unwrap().push(part.clone());
                if part == "bad" {
                    return Err(ProcessingError::processing("poison part"));
                }
                Ok(())
            })
        };
        let splitter = Splitter::new(TokenSplit::new(","), record).stop_on_exception(true);
        let mut exchange = Exchange::with_body("ok,bad,never");
        dispatch(&splitter, &mut exchange).await;
        assert!(exchange.is_failed());
        assert_eq!(*seen.lock().unwrap(), vec!["ok", "bad"]);
    }

    #[tokio::test]
    async fn closure_expressions_split_too() {
        let halves = |exchange: &Exchange| {
            let text = exchange
                .message()
                .body()
                .as_text()
                .ok_or_else(|| ProcessingError::validation("no body"))?
                .into_owned();
            let middle = text.len() / 2;
            Ok(vec![
                Body::Text(text[..middle].to_string()),
                Body::Text(text[middle..].to_string()),
            ])
        };
        let splitter = Splitter::new(halves, processor("identity", |_| Ok(())))
            .strategy(Arc::new(BodyConcat::separated_by("|")));
        let mut exchange = Exchange::with_body("abcd");
        dispatch(&splitter, &mut exchange).await;
        assert_eq!(exchange.message().body().as_text().unwrap(), "ab|cd");
    }
}
