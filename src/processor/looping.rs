use crate::error::ProcessingError;
use crate::exchange::{Exchange, names};
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;

/// Runs a processor a fixed number of times.
///
/// Copy mode hands each iteration a fresh copy of the exchange as it entered
/// the loop, so iterations cannot observe each other; non-copy mode chains
/// the same exchange through every iteration. Either way a failed or
/// stopped iteration ends the loop.
pub struct Loop {
    inner: SharedProcessor,
    count: usize,
    copy: bool,
}

impl Loop {
    pub fn new(inner: SharedProcessor, count: usize) -> Self {
        Self {
            inner,
            count,
            copy: false,
        }
    }

    pub fn copy(mut self, copy: bool) -> Self {
        self.copy = copy;
        self
    }
}

#[async_trait]
impl Processor for Loop {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        exchange.set_property(names::LOOP_SIZE, self.count);
        let snapshot = self.copy.then(|| exchange.clone());
        for index in 0..self.count {
            if let Some(snapshot) = &snapshot {
                let mut iteration = snapshot.copy();
                iteration.set_property(names::LOOP_INDEX, index);
                dispatch(self.inner.as_ref(), &mut iteration).await;
                if let Some(error) = iteration.clear_exception() {
                    exchange.set_exception(error);
                    break;
                }
            } else {
                exchange.set_property(names::LOOP_INDEX, index);
                dispatch(self.inner.as_ref(), exchange).await;
                if exchange.is_failed() || exchange.is_route_stopped() {
                    break;
                }
                exchange.promote_out();
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "loop"
    }
}
