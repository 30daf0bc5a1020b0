pub mod message;

use crate::error::ProcessingError;
use fnv::FnvBuildHasher;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use uuid::Uuid;

pub use message::{Body, Message};

/// Well-known exchange property names.
///
/// The spellings are kept compatible with the conventional `Camel*` names so
/// that aggregation strategies and downstream consumers written against them
/// keep working.
pub mod names {
    pub const SPLIT_INDEX: &str = "CamelSplitIndex";
    pub const SPLIT_SIZE: &str = "CamelSplitSize";
    pub const SPLIT_COMPLETE: &str = "CamelSplitComplete";
    pub const MULTICAST_INDEX: &str = "CamelMulticastIndex";
    pub const MULTICAST_COMPLETE: &str = "CamelMulticastComplete";
    pub const REDELIVERY_COUNTER: &str = "CamelRedeliveryCounter";
    pub const REDELIVERY_MAX_COUNTER: &str = "CamelRedeliveryMaxCounter";
    pub const REDELIVERED: &str = "CamelRedelivered";
    pub const ROUTE_STOP: &str = "CamelRouteStop";
    pub const FAILURE_HANDLED: &str = "CamelFailureHandled";
    pub const EXCEPTION_CAUGHT: &str = "CamelExceptionCaught";
    pub const CORRELATION_ID: &str = "CamelCorrelationId";
    pub const SAGA_ACTION_ID: &str = "CamelSagaActionId";
    pub const LOOP_INDEX: &str = "CamelLoopIndex";
    pub const LOOP_SIZE: &str = "CamelLoopSize";
    pub const DUPLICATE_MESSAGE: &str = "CamelDuplicateMessage";
}

/// Whether the party that created an exchange expects a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// One-way, no reply expected.
    #[default]
    InOnly,
    /// Request/reply.
    InOut,
    /// One-way, but faults flow back to the caller.
    RobustInOnly,
}

/// Exchange-scoped bookkeeping, distinct from message headers.
///
/// String-keyed any-map with typed read access. Values are stored behind
/// `Arc` so copying an exchange is cheap and copies never share mutable
/// state: overwriting a property replaces the `Arc`, it never mutates the
/// shared value in place.
#[derive(Clone, Default)]
pub struct Properties {
    values: HashMap<String, Arc<dyn Any + Send + Sync>, FnvBuildHasher>,
}

impl Properties {
    pub fn new() -> Self {
        Self {
            values: HashMap::with_hasher(FnvBuildHasher::default()),
        }
    }

    pub fn set<V>(&mut self, name: impl Into<String>, value: V)
    where
        V: Send + Sync + 'static,
    {
        self.values.insert(name.into(), Arc::new(value));
    }

    /// Typed read; `None` when the property is absent or holds another type.
    pub fn get<V: 'static>(&self, name: &str) -> Option<&V> {
        self.values.get(name).and_then(|v| v.downcast_ref::<V>())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.values.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Debug for Properties {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// The unit of work flowing through a processor graph.
///
/// An exchange is exclusively owned by whichever processor currently holds
/// it; ownership transfers at each `process` call boundary (in Rust that rule
/// is the `&mut` borrow). Copies made by fan-out constructs are fully
/// independent exchanges that only meet the original again through explicit
/// aggregation.
///
/// Message resolution always prefers `out` over `in`: a processor that sets
/// an out message has produced the exchange's current result. A fault or an
/// exception marks the exchange failed for routing purposes and stops
/// pipeline continuation until a handler clears it.
#[derive(Clone, Debug)]
pub struct Exchange {
    id: Uuid,
    pattern: ExchangePattern,
    in_message: Message,
    out_message: Option<Message>,
    fault_message: Option<Message>,
    exception: Option<ProcessingError>,
    rollback_only: bool,
    properties: Properties,
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern: ExchangePattern::default(),
            in_message: Message::new(),
            out_message: None,
            fault_message: None,
            exception: None,
            rollback_only: false,
            properties: Properties::new(),
        }
    }

    /// Convenience constructor used throughout tests and simple producers.
    pub fn with_body(body: impl Into<Body>) -> Self {
        let mut exchange = Self::new();
        exchange.in_message = Message::with_body(body);
        exchange
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    pub fn set_in(&mut self, message: Message) {
        self.in_message = message;
    }

    pub fn out(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    pub fn out_mut(&mut self) -> &mut Message {
        self.out_message.get_or_insert_with(Message::new)
    }

    pub fn set_out(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn has_out(&self) -> bool {
        self.out_message.is_some()
    }

    pub fn take_out(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    pub fn fault(&self) -> Option<&Message> {
        self.fault_message.as_ref()
    }

    pub fn set_fault(&mut self, message: Message) {
        self.fault_message = Some(message);
    }

    pub fn take_fault(&mut self) -> Option<Message> {
        self.fault_message.take()
    }

    pub fn has_fault(&self) -> bool {
        self.fault_message.is_some()
    }

    /// The current message: `out` when a processor produced one, else `in`.
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        self.out_message.as_mut().unwrap_or(&mut self.in_message)
    }

    /// Moves `out` into `in` for the next pipeline step, clearing `out` so a
    /// single result is never consumed twice.
    pub fn promote_out(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    pub fn exception(&self) -> Option<&ProcessingError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, error: ProcessingError) {
        self.exception = Some(error);
    }

    pub fn clear_exception(&mut self) -> Option<ProcessingError> {
        self.exception.take()
    }

    /// Failed for routing purposes: an exception is present.
    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// Marks a deliberate negative outcome, distinct from a technical
    /// failure. Rollback skips redelivery.
    pub fn set_rollback_only(&mut self, rollback: bool) {
        self.rollback_only = rollback;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn properties_mut(&mut self) -> &mut Properties {
        &mut self.properties
    }

    pub fn set_property<V>(&mut self, name: impl Into<String>, value: V)
    where
        V: Send + Sync + 'static,
    {
        self.properties.set(name, value);
    }

    pub fn property<V: 'static>(&self, name: &str) -> Option<&V> {
        self.properties.get(name)
    }

    /// True once a handler asked the route to stop continuing this exchange.
    pub fn is_route_stopped(&self) -> bool {
        self.property::<bool>(names::ROUTE_STOP).copied().unwrap_or(false)
    }

    /// Independent copy with a fresh id, used by fan-out constructs.
    ///
    /// The copy records the source exchange id under `CamelCorrelationId`
    /// unless a correlation id is already present (a copy of a copy keeps the
    /// root correlation).
    pub fn copy(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4();
        if !copy.properties.contains(names::CORRELATION_ID) {
            copy.properties.set(names::CORRELATION_ID, self.id);
        }
        copy
    }

    /// Replaces this exchange's result state with another exchange's,
    /// keeping this exchange's identity. Used when an aggregated fan-out
    /// result becomes the continuation of the original exchange.
    pub fn absorb(&mut self, other: Exchange) {
        self.in_message = other.in_message;
        self.out_message = other.out_message;
        self.fault_message = other.fault_message;
        self.exception = other.exception;
        self.rollback_only = self.rollback_only || other.rollback_only;
        for (name, value) in other.properties.values {
            self.properties.values.insert(name, value);
        }
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_resolution_prefers_out() {
        let mut exchange = Exchange::with_body("in");
        assert_eq!(exchange.message().body().as_text().unwrap(), "in");
        exchange.set_out(Message::with_body("out"));
        assert_eq!(exchange.message().body().as_text().unwrap(), "out");
        exchange.promote_out();
        assert!(!exchange.has_out());
        assert_eq!(exchange.in_message().body().as_text().unwrap(), "out");
    }

    #[test]
    fn copy_is_independent_and_correlated() {
        let mut original = Exchange::with_body("payload");
        original.set_property("shared", 1usize);
        let mut copy = original.copy();
        copy.set_property("shared", 2usize);
        copy.in_message_mut().set_body("changed");

        assert_ne!(original.id(), copy.id());
        assert_eq!(original.property::<usize>("shared"), Some(&1));
        assert_eq!(copy.property::<usize>("shared"), Some(&2));
        assert_eq!(original.message().body().as_text().unwrap(), "payload");
        assert_eq!(
            copy.property::<Uuid>(names::CORRELATION_ID),
            Some(original.id())
        );

        // A copy of a copy keeps the root correlation id.
        let second = copy.copy();
        assert_eq!(
            second.property::<Uuid>(names::CORRELATION_ID),
            Some(original.id())
        );
    }

    #[test]
    fn typed_properties() {
        let mut exchange = Exchange::new();
        exchange.set_property(names::SPLIT_SIZE, 3usize);
        assert_eq!(exchange.property::<usize>(names::SPLIT_SIZE), Some(&3));
        assert!(exchange.property::<String>(names::SPLIT_SIZE).is_none());
        assert!(exchange.property::<usize>("missing").is_none());
    }

    #[test]
    fn failure_state() {
        let mut exchange = Exchange::new();
        assert!(!exchange.is_failed());
        exchange.set_exception(ProcessingError::processing("boom"));
        assert!(exchange.is_failed());
        let taken = exchange.clear_exception().unwrap();
        assert_eq!(taken.message(), "boom");
        assert!(!exchange.is_failed());
    }

    #[test]
    fn absorb_keeps_identity_and_merges_properties() {
        let mut original = Exchange::with_body("original");
        let original_id = *original.id();
        original.set_property("kept", true);

        let mut result = Exchange::with_body("aggregated");
        result.set_property(names::SPLIT_SIZE, 3usize);
        original.absorb(result);

        assert_eq!(original.id(), &original_id);
        assert_eq!(original.message().body().as_text().unwrap(), "aggregated");
        assert_eq!(original.property::<bool>("kept"), Some(&true));
        assert_eq!(original.property::<usize>(names::SPLIT_SIZE), Some(&3));
    }
}
