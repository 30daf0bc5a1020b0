use crate::error::ProcessingError;
use crate::exchange::Exchange;
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;

/// Runs an ordered list of processors, each step's output feeding the next
/// step's input.
///
/// After every step the exchange is checked: an exception, a fault, or the
/// route-stop property terminates the pipeline strictly before the next
/// processor runs. Otherwise the step's `out` message is promoted to the next
/// step's `in`. Continuation happens on whatever task resumed the previous
/// step's future, so evaluation is re-entrant by construction.
pub struct Pipeline {
    name: String,
    processors: Vec<SharedProcessor>,
}

impl Pipeline {
    pub fn new(processors: Vec<SharedProcessor>) -> Self {
        Self {
            name: "pipeline".to_string(),
            processors,
        }
    }

    pub fn named(name: impl Into<String>, processors: Vec<SharedProcessor>) -> Self {
        Self {
            name: name.into(),
            processors,
        }
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        for (step, processor) in self.processors.iter().enumerate() {
            if step > 0 {
                exchange.promote_out();
            }
            dispatch(processor.as_ref(), exchange).await;
            if exchange.is_failed() || exchange.has_fault() || exchange.is_route_stopped() {
                log::debug!(
                    "pipeline '{}' stopped at step {} for exchange {}",
                    self.name,
                    step,
                    exchange.id()
                );
                break;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
