use crate::aggregate::SharedAggregationStrategy;
use crate::processor::SharedProcessor;
use dashmap::{DashMap, Entry};
use thiserror::Error;

/// Errors raised by registry lookups and registrations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No processor registered under '{name}'.")]
    MissingProcessor { name: String },

    #[error("A processor is already registered under '{name}'.")]
    ConflictingProcessor { name: String },

    #[error("No aggregation strategy registered under '{name}'.")]
    MissingStrategy { name: String },

    #[error("An aggregation strategy is already registered under '{name}'.")]
    ConflictingStrategy { name: String },
}

impl RegistryError {
    #[inline]
    pub(crate) fn missing_processor(name: impl Into<String>) -> Self {
        Self::MissingProcessor { name: name.into() }
    }

    #[inline]
    pub(crate) fn conflicting_processor(name: impl Into<String>) -> Self {
        Self::ConflictingProcessor { name: name.into() }
    }

    #[inline]
    pub(crate) fn missing_strategy(name: impl Into<String>) -> Self {
        Self::MissingStrategy { name: name.into() }
    }

    #[inline]
    pub(crate) fn conflicting_strategy(name: impl Into<String>) -> Self {
        Self::ConflictingStrategy { name: name.into() }
    }
}

/// Thread-safe, name-based lookup for externally supplied processors and
/// aggregation strategies.
///
/// The core never parses route configuration; whatever builds the route
/// graph registers its named pieces here and components like the recipient
/// list resolve them read-only at run time.
pub struct Registry {
    processors: DashMap<String, SharedProcessor, fnv::FnvBuildHasher>,
    strategies: DashMap<String, SharedAggregationStrategy, fnv::FnvBuildHasher>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            processors: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
            strategies: DashMap::with_hasher(fnv::FnvBuildHasher::default()),
        }
    }

    pub fn register_processor(
        &self,
        name: impl Into<String>,
        processor: SharedProcessor,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        match self.processors.entry(name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::conflicting_processor(name)),
            Entry::Vacant(entry) => {
                entry.insert(processor);
                Ok(())
            }
        }
    }

    pub fn processor(&self, name: &str) -> Result<SharedProcessor, RegistryError> {
        match self.processors.get(name) {
            None => Err(RegistryError::missing_processor(name)),
            Some(processor) => Ok(processor.value().clone()),
        }
    }

    pub fn register_strategy(
        &self,
        name: impl Into<String>,
        strategy: SharedAggregationStrategy,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        match self.strategies.entry(name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::conflicting_strategy(name)),
            Entry::Vacant(entry) => {
                entry.insert(strategy);
                Ok(())
            }
        }
    }

    pub fn strategy(&self, name: &str) -> Result<SharedAggregationStrategy, RegistryError> {
        match self.strategies.get(name) {
            None => Err(RegistryError::missing_strategy(name)),
            Some(strategy) => Ok(strategy.value().clone()),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
