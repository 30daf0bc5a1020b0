use crate::error::ProcessingError;
use crate::exchange::Exchange;
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;
use std::sync::Arc;

/// A routing predicate evaluated against the exchange's current state.
pub type Predicate = Arc<dyn Fn(&Exchange) -> bool + Send + Sync>;

/// Predicate matching a header read as text against an expected value.
pub fn header_equals(name: impl Into<String>, expected: impl Into<String>) -> Predicate {
    let name = name.into();
    let expected = expected.into();
    Arc::new(move |exchange| {
        exchange
            .message()
            .header_text(&name)
            .map(|value| value == expected.as_str())
            .unwrap_or(false)
    })
}

/// Predicate matching the current body read as text.
pub fn body_equals(expected: impl Into<String>) -> Predicate {
    let expected = expected.into();
    Arc::new(move |exchange| {
        exchange
            .message()
            .body()
            .as_text()
            .map(|value| value == expected.as_str())
            .unwrap_or(false)
    })
}

/// Content-based router: the first arm whose predicate matches receives the
/// exchange, exactly once; no other arm runs. When no arm matches, the
/// `otherwise` destination runs if present, else the exchange passes through
/// untouched.
pub struct Choice {
    arms: Vec<(Predicate, SharedProcessor)>,
    otherwise: Option<SharedProcessor>,
}

impl Choice {
    pub fn new() -> Self {
        Self {
            arms: Vec::new(),
            otherwise: None,
        }
    }

    pub fn when(mut self, predicate: Predicate, destination: SharedProcessor) -> Self {
        self.arms.push((predicate, destination));
        self
    }

    pub fn otherwise(mut self, destination: SharedProcessor) -> Self {
        self.otherwise = Some(destination);
        self
    }
}

impl Default for Choice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for Choice {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        for (predicate, destination) in &self.arms {
            if predicate(exchange) {
                dispatch(destination.as_ref(), exchange).await;
                return Ok(());
            }
        }
        if let Some(otherwise) = &self.otherwise {
            dispatch(otherwise.as_ref(), exchange).await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "choice"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>) -> SharedProcessor {
        processor("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn matching_header_reaches_true_branch_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        let choice = Choice::new()
            .when(header_equals("foo", "bar"), counting(hits.clone()))
            .otherwise(counting(misses.clone()));

        let mut exchange = Exchange::with_body("payload");
        exchange.in_message_mut().set_header("foo", "bar");
        dispatch(&choice, &mut exchange).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(misses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unmatched_exchange_falls_to_otherwise() {
        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        let choice = Choice::new()
            .when(header_equals("foo", "bar"), counting(hits.clone()))
            .otherwise(counting(misses.clone()));

        let mut exchange = Exchange::with_body("payload");
        exchange.in_message_mut().set_header("foo", "other");
        dispatch(&choice, &mut exchange).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(misses.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_matching_arm_wins() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let choice = Choice::new()
            .when(body_equals("x"), counting(first.clone()))
            .when(body_equals("x"), counting(second.clone()));

        let mut exchange = Exchange::with_body("x");
        dispatch(&choice, &mut exchange).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_match_and_no_otherwise_passes_through() {
        let choice = Choice::new().when(header_equals("foo", "bar"), counting(Arc::new(AtomicUsize::new(0))));
        let mut exchange = Exchange::with_body("payload");
        dispatch(&choice, &mut exchange).await;
        assert!(!exchange.is_failed());
        assert_eq!(exchange.message().body().as_text().unwrap(), "payload");
    }
}
