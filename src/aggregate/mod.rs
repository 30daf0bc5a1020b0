use crate::exchange::{Body, Exchange};
use std::sync::Arc;
use std::time::Duration;

pub type SharedAggregationStrategy = Arc<dyn AggregationStrategy>;

/// Merges branch results back into one exchange.
///
/// `aggregate` is called once per arriving branch; `old` is `None` on the
/// first call, which seeds the accumulator (`aggregate(None, x)` must equal
/// `x` up to accumulator bookkeeping). The engine serializes `aggregate` and
/// `timeout` calls, so implementations never see concurrent invocations and
/// can keep plain state inside the accumulator exchange.
///
/// `timeout` is invoked instead of `aggregate` for a branch that failed to
/// arrive within the fan-out timeout. The default implementation leaves the
/// accumulator untouched; timeout-aware strategies override it.
pub trait AggregationStrategy: Send + Sync {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Exchange;

    fn timeout(
        &self,
        old: Option<Exchange>,
        index: usize,
        total: usize,
        timeout: Duration,
    ) -> Option<Exchange> {
        let _ = (index, total, timeout);
        old
    }
}

/// The default strategy: the last branch result wins outright.
pub struct UseLatest;

impl AggregationStrategy for UseLatest {
    fn aggregate(&self, _old: Option<Exchange>, new: Exchange) -> Exchange {
        new
    }
}

/// Concatenates branch bodies read as text, in aggregation call order,
/// joined by an optional separator. Branches without a text body are
/// skipped.
pub struct BodyConcat {
    separator: Option<String>,
}

impl BodyConcat {
    pub fn new() -> Self {
        Self { separator: None }
    }

    pub fn separated_by(separator: impl Into<String>) -> Self {
        Self {
            separator: Some(separator.into()),
        }
    }
}

impl Default for BodyConcat {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationStrategy for BodyConcat {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Exchange {
        let mut acc = match old {
            None => return new,
            Some(acc) => acc,
        };
        let addition = new.message().body().as_text().map(|t| t.into_owned());
        if let Some(addition) = addition {
            let mut text = acc
                .message()
                .body()
                .as_text()
                .map(|t| t.into_owned())
                .unwrap_or_default();
            if let Some(separator) = &self.separator {
                if !text.is_empty() {
                    text.push_str(separator);
                }
            }
            text.push_str(&addition);
            acc.message_mut().set_body(text);
        }
        acc
    }
}

/// Collects branch bodies into a JSON array body, in aggregation call
/// order. Non-text, non-JSON bodies are collected as nulls.
pub struct GroupedBodies;

impl AggregationStrategy for GroupedBodies {
    fn aggregate(&self, old: Option<Exchange>, new: Exchange) -> Exchange {
        let value = match new.message().body() {
            Body::Json(v) => v.clone(),
            other => other
                .as_text()
                .map(|t| serde_json::Value::String(t.into_owned()))
                .unwrap_or(serde_json::Value::Null),
        };
        match old {
            None => {
                let mut acc = new;
                acc.message_mut().set_body(serde_json::json!([value]));
                acc
            }
            Some(mut acc) => {
                let mut group = match acc.message().body() {
                    Body::Json(serde_json::Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                };
                group.push(value);
                acc.message_mut().set_body(serde_json::Value::Array(group));
                acc
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_is_identity() {
        let seed = Exchange::with_body("X");
        let id = *seed.id();
        let out = UseLatest.aggregate(None, seed);
        assert_eq!(out.id(), &id);
        assert_eq!(out.message().body().as_text().unwrap(), "X");

        let seed = Exchange::with_body("X");
        let out = BodyConcat::new().aggregate(None, seed);
        assert_eq!(out.message().body().as_text().unwrap(), "X");
    }

    #[test]
    fn body_concat_appends_in_call_order() {
        let strategy = BodyConcat::new();
        let mut acc = None;
        for part in ["A", "B", "C"] {
            acc = Some(strategy.aggregate(acc, Exchange::with_body(part)));
        }
        assert_eq!(acc.unwrap().message().body().as_text().unwrap(), "ABC");
    }

    #[test]
    fn body_concat_with_separator() {
        let strategy = BodyConcat::separated_by("+");
        let mut acc = None;
        for part in ["A", "B"] {
            acc = Some(strategy.aggregate(acc, Exchange::with_body(part)));
        }
        assert_eq!(acc.unwrap().message().body().as_text().unwrap(), "A+B");
    }

    #[test]
    fn grouped_bodies_builds_an_array() {
        let strategy = GroupedBodies;
        let mut acc = None;
        for part in ["A", "B"] {
            acc = Some(strategy.aggregate(acc, Exchange::with_body(part)));
        }
        let acc = acc.unwrap();
        match acc.message().body() {
            Body::Json(v) => assert_eq!(v, &serde_json::json!(["A", "B"])),
            other => panic!("expected json body, got {:?}", other),
        }
    }

    #[test]
    fn default_timeout_keeps_the_accumulator() {
        let acc = Exchange::with_body("partial");
        let kept = UseLatest
            .timeout(Some(acc), 1, 3, Duration::from_millis(500))
            .unwrap();
        assert_eq!(kept.message().body().as_text().unwrap(), "partial");
    }
}
