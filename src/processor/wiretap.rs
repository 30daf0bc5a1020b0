use crate::error::ProcessingError;
use crate::exchange::{Exchange, ExchangePattern};
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;

/// Sends an independent copy of the exchange to a tap destination and
/// continues immediately; the tap runs detached and its outcome, success or
/// failure, never reaches the original exchange.
pub struct WireTap {
    destination: SharedProcessor,
}

impl WireTap {
    pub fn new(destination: SharedProcessor) -> Self {
        Self { destination }
    }
}

#[async_trait]
impl Processor for WireTap {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let mut copy = exchange.copy();
        // The tap is one-way; no reply flows back.
        copy.set_pattern(ExchangePattern::InOnly);
        let destination = self.destination.clone();
        tokio::spawn(async move {
            dispatch(destination.as_ref(), &mut copy).await;
            if let Some(error) = copy.exception() {
                log::debug!("wire tap for exchange {} failed: {}", copy.id(), error);
            }
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "wire-tap"
    }
}
