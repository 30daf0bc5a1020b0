use crate::error::ProcessingError;
use crate::exchange::{Exchange, names};
use crate::processor::{Processor, SharedProcessor, dispatch};
use async_trait::async_trait;
use dashmap::DashSet;
use fnv::FnvBuildHasher;
use std::sync::Arc;

/// Storage for already-seen message keys.
///
/// `add` is the atomic claim: it returns false when the key was already
/// present, which is what makes eager duplicate detection race-free.
#[async_trait]
pub trait IdempotentRepository: Send + Sync {
    /// Claims the key. Returns false when it was already present.
    async fn add(&self, key: &str) -> Result<bool, ProcessingError>;

    async fn contains(&self, key: &str) -> Result<bool, ProcessingError>;

    /// Releases a key that was claimed but whose processing failed.
    async fn remove(&self, key: &str) -> Result<bool, ProcessingError>;

    /// Confirms a claimed key after successful processing. In-memory
    /// repositories have nothing to do here; transactional ones commit.
    async fn confirm(&self, _key: &str) -> Result<(), ProcessingError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), ProcessingError>;
}

/// In-process repository backed by a concurrent set.
pub struct MemoryIdempotentRepository {
    keys: DashSet<String, FnvBuildHasher>,
}

impl MemoryIdempotentRepository {
    pub fn new() -> Self {
        Self {
            keys: DashSet::with_hasher(FnvBuildHasher::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for MemoryIdempotentRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotentRepository for MemoryIdempotentRepository {
    async fn add(&self, key: &str) -> Result<bool, ProcessingError> {
        Ok(self.keys.insert(key.to_owned()))
    }

    async fn contains(&self, key: &str) -> Result<bool, ProcessingError> {
        Ok(self.keys.contains(key))
    }

    async fn remove(&self, key: &str) -> Result<bool, ProcessingError> {
        Ok(self.keys.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), ProcessingError> {
        self.keys.clear();
        Ok(())
    }
}

/// Derives the deduplication key from an exchange.
pub trait KeyExpression: Send + Sync {
    fn key(&self, exchange: &Exchange) -> Result<String, ProcessingError>;
}

impl<F> KeyExpression for F
where
    F: Fn(&Exchange) -> Result<String, ProcessingError> + Send + Sync,
{
    fn key(&self, exchange: &Exchange) -> Result<String, ProcessingError> {
        self(exchange)
    }
}

/// Reads the deduplication key from a message header.
pub fn key_from_header(name: impl Into<String>) -> impl KeyExpression {
    let name = name.into();
    move |exchange: &Exchange| {
        exchange
            .message()
            .header_text(&name)
            .map(|key| key.into_owned())
            .ok_or_else(|| {
                ProcessingError::validation(format!("missing idempotency header '{}'", name))
            })
    }
}

/// Filters out exchanges whose key has been seen before.
///
/// In eager mode (the default) the key is claimed before the wrapped
/// processor runs and released again when it fails, so a concurrent
/// duplicate is blocked for the whole processing window. In non-eager mode
/// the key is only recorded after success, trading that window for never
/// holding keys of failed exchanges.
pub struct IdempotentConsumer {
    repository: Arc<dyn IdempotentRepository>,
    expression: Box<dyn KeyExpression>,
    inner: SharedProcessor,
    eager: bool,
    remove_on_failure: bool,
    skip_duplicate: bool,
}

impl IdempotentConsumer {
    pub fn new(
        repository: Arc<dyn IdempotentRepository>,
        expression: impl KeyExpression + 'static,
        inner: SharedProcessor,
    ) -> Self {
        Self {
            repository,
            expression: Box::new(expression),
            inner,
            eager: true,
            remove_on_failure: true,
            skip_duplicate: true,
        }
    }

    pub fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn remove_on_failure(mut self, remove: bool) -> Self {
        self.remove_on_failure = remove;
        self
    }

    /// When disabled, duplicates still run the wrapped processor; they are
    /// only marked with the duplicate property.
    pub fn skip_duplicate(mut self, skip: bool) -> Self {
        self.skip_duplicate = skip;
        self
    }
}

#[async_trait]
impl Processor for IdempotentConsumer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), ProcessingError> {
        let key = self.expression.key(exchange)?;

        let duplicate = if self.eager {
            !self.repository.add(&key).await?
        } else {
            self.repository.contains(&key).await?
        };

        if duplicate {
            log::debug!("exchange {} is a duplicate of key '{}'", exchange.id(), key);
            exchange.set_property(names::DUPLICATE_MESSAGE, true);
            if self.skip_duplicate {
                return Ok(());
            }
        }

        dispatch(self.inner.as_ref(), exchange).await;

        if exchange.is_failed() {
            if !duplicate && self.eager && self.remove_on_failure {
                self.repository.remove(&key).await?;
            }
        } else if !duplicate {
            if !self.eager {
                self.repository.add(&key).await?;
            }
            self.repository.confirm(&key).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "idempotent-consumer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::processor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(counter: Arc<AtomicUsize>) -> SharedProcessor {
        processor("work", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn keyed_exchange(key: &str) -> Exchange {
        let mut exchange = Exchange::with_body("payload");
        exchange.message_mut().set_header("messageId", key);
        exchange
    }

    #[tokio::test]
    async fn duplicate_keys_skip_the_wrapped_processor() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let consumer = IdempotentConsumer::new(
            Arc::new(MemoryIdempotentRepository::new()),
            key_from_header("messageId"),
            counting(invocations.clone()),
        );

        for _ in 0..3 {
            let mut exchange = keyed_exchange("order-1");
            dispatch(&consumer, &mut exchange).await;
            assert!(!exchange.is_failed());
        }
        let mut other = keyed_exchange("order-2");
        dispatch(&consumer, &mut other).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn duplicates_are_marked_on_the_exchange() {
        let consumer = IdempotentConsumer::new(
            Arc::new(MemoryIdempotentRepository::new()),
            key_from_header("messageId"),
            processor("work", |_| Ok(())),
        );

        let mut first = keyed_exchange("order-1");
        dispatch(&consumer, &mut first).await;
        assert!(first.property::<bool>(names::DUPLICATE_MESSAGE).is_none());

        let mut second = keyed_exchange("order-1");
        dispatch(&consumer, &mut second).await;
        assert_eq!(second.property::<bool>(names::DUPLICATE_MESSAGE), Some(&true));
    }

    #[tokio::test]
    async fn eager_failure_releases_the_key() {
        let repository = Arc::new(MemoryIdempotentRepository::new());
        let invocations = Arc::new(AtomicUsize::new(0));
        let attempts = invocations.clone();
        let consumer = IdempotentConsumer::new(
            repository.clone(),
            key_from_header("messageId"),
            processor("flaky", move |_| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProcessingError::processing("first attempt fails"))
                } else {
                    Ok(())
                }
            }),
        );

        let mut first = keyed_exchange("order-1");
        dispatch(&consumer, &mut first).await;
        assert!(first.is_failed());
        assert!(repository.is_empty());

        // Key was released, so the retry is not treated as a duplicate.
        let mut retry = keyed_exchange("order-1");
        dispatch(&consumer, &mut retry).await;
        assert!(!retry.is_failed());
        assert_eq!(repository.len(), 1);
    }

    #[tokio::test]
    async fn non_eager_records_only_successes() {
        let repository = Arc::new(MemoryIdempotentRepository::new());
        let consumer = IdempotentConsumer::new(
            repository.clone(),
            key_from_header("messageId"),
            processor("failing", |_| Err(ProcessingError::processing("boom"))),
        )
        .eager(false);

        let mut exchange = keyed_exchange("order-1");
        dispatch(&consumer, &mut exchange).await;
        assert!(exchange.is_failed());
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn skip_duplicate_disabled_still_processes() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let consumer = IdempotentConsumer::new(
            Arc::new(MemoryIdempotentRepository::new()),
            key_from_header("messageId"),
            counting(invocations.clone()),
        )
        .skip_duplicate(false);

        for _ in 0..2 {
            let mut exchange = keyed_exchange("order-1");
            dispatch(&consumer, &mut exchange).await;
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_key_header_fails_validation() {
        let consumer = IdempotentConsumer::new(
            Arc::new(MemoryIdempotentRepository::new()),
            key_from_header("messageId"),
            processor("work", |_| Ok(())),
        );
        let mut exchange = Exchange::with_body("payload");
        dispatch(&consumer, &mut exchange).await;
        assert_eq!(
            exchange.exception().unwrap().kind(),
            crate::error::ErrorKind::Validation
        );
    }
}
