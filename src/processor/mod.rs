pub mod choice;
pub mod looping;
pub mod multicast;
pub mod pipeline;
pub mod recipient_list;
pub mod splitter;
pub mod wiretap;

use crate::error::ProcessingError;
use crate::exchange::Exchange;
use async_trait::async_trait;
use std::sync::Arc;

pub type SharedProcessor = Arc<dyn Processor>;

/// The uniform processing contract every routing node implements.
///
/// Composites (pipelines, multicasts, balancers, error handlers) are
/// themselves processors, so routing graphs compose recursively. The returned
/// future resolves exactly once, which is the completion callback of this
/// engine; it may resume on any runtime thread after a suspension point, so
/// implementations must not assume a single owning thread across `.await`.
///
/// A processor reports failure through `Err`; it never leaves a half-set
/// exception behind *and* returns `Err` for the same failure. Failures only
/// cross a composition boundary via [`dispatch`], which pins them onto the
/// exchange so that the exactly-once completion contract holds for the
/// caller.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError>;

    fn name(&self) -> &str {
        "processor"
    }
}

/// Runs a processor over an exchange, converting failure into exchange state.
///
/// This is the single boundary at which errors stop being `Result`s and
/// become routing state: after `dispatch` returns, the outcome is readable
/// from the exchange (`is_failed`, fault, out message) and nothing has been
/// thrown past the caller.
pub async fn dispatch(processor: &dyn Processor, exchange: &mut Exchange) {
    if let Err(error) = processor.process(exchange).await {
        log::debug!(
            "processor '{}' failed exchange {}: {}",
            processor.name(),
            exchange.id(),
            error
        );
        if error.is_rollback() {
            exchange.set_rollback_only(true);
        }
        exchange.set_exception(error);
    }
}

/// Adapts a closure into a [`Processor`].
///
/// The closure runs on the caller's task and completes synchronously, which
/// is the blocking-processor adaptation of the async contract.
pub struct FnProcessor<F> {
    name: String,
    func: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), ProcessingError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Processor for FnProcessor<F>
where
    F: Fn(&mut Exchange) -> Result<(), ProcessingError> + Send + Sync,
{
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        (self.func)(exchange)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shorthand for wrapping a closure processor in an `Arc`.
pub fn processor<F>(name: impl Into<String>, func: F) -> SharedProcessor
where
    F: Fn(&mut Exchange) -> Result<(), ProcessingError> + Send + Sync + 'static,
{
    Arc::new(FnProcessor::new(name, func))
}
