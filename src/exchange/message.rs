use fnv::FnvBuildHasher;
use std::any::Any;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use uuid::Uuid;

/// A message payload or header value.
///
/// `Body` is a closed variant set rather than a generic parameter so that
/// exchanges of different routes can flow through the same processor graph.
/// Reads are lazily converting: a `Bytes` body read through [`Body::as_text`]
/// is decoded on access, a `Json` body is rendered, and so on. Application
/// payloads that none of the structured variants fit ride in `Value`; such
/// specialized payloads degrade to their converted representation once a
/// processor that only understands the base forms rewrites the body, which is
/// accepted information loss, not a defect.
#[derive(Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Value(Arc<dyn Any + Send + Sync>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Reads the body as text, converting where a faithful conversion exists.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Body::Empty => None,
            Body::Text(s) => Some(Cow::Borrowed(s)),
            Body::Bytes(b) => String::from_utf8(b.clone()).ok().map(Cow::Owned),
            Body::Json(v) => match v {
                serde_json::Value::String(s) => Some(Cow::Borrowed(s)),
                other => Some(Cow::Owned(other.to_string())),
            },
            Body::Value(_) => None,
        }
    }

    /// Reads the body as raw bytes, converting where possible.
    pub fn as_bytes(&self) -> Option<Cow<'_, [u8]>> {
        match self {
            Body::Empty => None,
            Body::Text(s) => Some(Cow::Borrowed(s.as_bytes())),
            Body::Bytes(b) => Some(Cow::Borrowed(b)),
            Body::Json(v) => Some(Cow::Owned(v.to_string().into_bytes())),
            Body::Value(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Body::Text(s) => s.trim().parse().ok(),
            Body::Json(v) => v.as_i64(),
            _ => None,
        }
    }

    /// Downcasts a `Value` body to a concrete application type.
    pub fn as_value<T: Send + Sync + 'static>(&self) -> Option<&T> {
        match self {
            Body::Value(v) => v.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl Debug for Body {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => write!(f, "Empty"),
            Body::Text(s) => write!(f, "Text({:?})", s),
            Body::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Body::Json(v) => write!(f, "Json({})", v),
            Body::Value(_) => write!(f, "Value(..)"),
        }
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Body::Text(value.to_string())
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Body::Text(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(value: Vec<u8>) -> Self {
        Body::Bytes(value)
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Body::Json(value)
    }
}

impl From<i64> for Body {
    fn from(value: i64) -> Self {
        Body::Json(serde_json::Value::from(value))
    }
}

impl From<bool> for Body {
    fn from(value: bool) -> Self {
        Body::Json(serde_json::Value::from(value))
    }
}

/// One in/out/fault facet of an exchange.
///
/// A message owns its body and an unordered header map. Header lookup is
/// case-sensitive; case policy is a concern of whoever writes the headers,
/// not of this store.
#[derive(Clone, Debug)]
pub struct Message {
    id: Uuid,
    headers: HashMap<String, Body, FnvBuildHasher>,
    body: Body,
}

impl Message {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: HashMap::with_hasher(FnvBuildHasher::default()),
            body: Body::Empty,
        }
    }

    pub fn with_body(body: impl Into<Body>) -> Self {
        let mut message = Self::new();
        message.body = body.into();
        message
    }

    pub fn id(&self) -> &Uuid {
        &self.id
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }

    pub fn header(&self, name: &str) -> Option<&Body> {
        self.headers.get(name)
    }

    /// Header read as text, applying the body conversion rules.
    pub fn header_text(&self, name: &str) -> Option<Cow<'_, str>> {
        self.headers.get(name).and_then(Body::as_text)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Body>) {
        self.headers.insert(name.into(), value.into());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<Body> {
        self.headers.remove(name)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &Body)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Structural copy carrying a fresh message id.
    pub fn copy(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_conversions_are_lazy_reads() {
        let body = Body::Bytes(b"hello".to_vec());
        assert_eq!(body.as_text().unwrap(), "hello");
        assert_eq!(Body::Text("42".into()).as_i64(), Some(42));
        assert_eq!(Body::Json(serde_json::json!(7)).as_i64(), Some(7));
        assert!(Body::Empty.as_text().is_none());
    }

    #[test]
    fn value_bodies_downcast() {
        #[derive(Debug, PartialEq)]
        struct Order(u32);
        let body = Body::Value(Arc::new(Order(9)));
        assert_eq!(body.as_value::<Order>(), Some(&Order(9)));
        assert!(body.as_value::<String>().is_none());
        assert!(body.as_text().is_none());
    }

    #[test]
    fn copy_gets_new_id_and_independent_headers() {
        let mut message = Message::with_body("payload");
        message.set_header("foo", "bar");
        let mut copy = message.copy();
        copy.set_header("foo", "baz");
        assert_ne!(message.id(), copy.id());
        assert_eq!(message.header_text("foo").unwrap(), "bar");
        assert_eq!(copy.header_text("foo").unwrap(), "baz");
    }
}
