//! Producer-side values.
//!
//! A `Node` is what the writer walks. Besides plain structured data it can
//! hold work that is not finished yet: a `Producer` that may ask to be
//! retried later, a future, or a stream of items.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::Stream;
use trellis_core::ClientReference;

/// Result of one attempt to produce a value.
pub enum Produce {
    /// The value is available now.
    Ready(Node),
    /// Not ready. Retry once the future completes.
    Suspend(BoxFuture<'static, ()>),
    /// Production failed. Errors the nearest enclosing deferred chunk.
    Fail(anyhow::Error),
}

impl Produce {
    pub fn suspend<F>(wake: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Produce::Suspend(Box::pin(wake))
    }

    pub fn fail(error: impl Into<anyhow::Error>) -> Self {
        Produce::Fail(error.into())
    }
}

/// Something that computes a value, possibly over several attempts.
pub trait Producer: Send {
    fn produce(&mut self) -> Produce;
}

impl<F> Producer for F
where
    F: FnMut() -> Produce + Send,
{
    fn produce(&mut self) -> Produce {
        self()
    }
}

pub enum Node {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    List(Vec<Node>),
    Map(BTreeMap<String, Node>),
    Lazy(Box<dyn Producer>),
    Future(BoxFuture<'static, anyhow::Result<Node>>),
    /// Each item becomes a part row; the end of the stream settles the chunk.
    Stream(BoxStream<'static, anyhow::Result<Node>>),
    Client(ClientReference),
}

impl Node {
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(text.into())
    }

    pub fn list(items: impl IntoIterator<Item = Node>) -> Self {
        Node::List(items.into_iter().collect())
    }

    pub fn map<K: Into<String>>(fields: impl IntoIterator<Item = (K, Node)>) -> Self {
        Node::Map(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn lazy(producer: impl Producer + 'static) -> Self {
        Node::Lazy(Box::new(producer))
    }

    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Node>> + Send + 'static,
    {
        Node::Future(Box::pin(future))
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = anyhow::Result<Node>> + Send + 'static,
    {
        Node::Stream(Box::pin(stream))
    }

    pub fn client(module: impl Into<String>, export: impl Into<String>) -> Self {
        Node::Client(ClientReference::new(module, export))
    }
}

impl From<&str> for Node {
    fn from(value: &str) -> Self {
        Node::Text(value.to_string())
    }
}

impl From<String> for Node {
    fn from(value: String) -> Self {
        Node::Text(value)
    }
}

impl From<bool> for Node {
    fn from(value: bool) -> Self {
        Node::Bool(value)
    }
}

impl From<i64> for Node {
    fn from(value: i64) -> Self {
        Node::Number(value.into())
    }
}

impl From<u64> for Node {
    fn from(value: u64) -> Self {
        Node::Number(value.into())
    }
}

impl From<f64> for Node {
    /// Non-finite numbers have no JSON form and become null.
    fn from(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(Node::Number)
            .unwrap_or(Node::Null)
    }
}

impl From<Vec<Node>> for Node {
    fn from(value: Vec<Node>) -> Self {
        Node::List(value)
    }
}

impl From<ClientReference> for Node {
    fn from(value: ClientReference) -> Self {
        Node::Client(value)
    }
}

impl From<serde_json::Value> for Node {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(b),
            Value::Number(n) => Node::Number(n),
            Value::String(s) => Node::Text(s),
            Value::Array(items) => Node::List(items.into_iter().map(Node::from).collect()),
            Value::Object(fields) => {
                Node::Map(fields.into_iter().map(|(k, v)| (k, Node::from(v))).collect())
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Null => f.write_str("Null"),
            Node::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Node::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Node::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Node::List(items) => f.debug_tuple("List").field(items).finish(),
            Node::Map(fields) => f.debug_tuple("Map").field(fields).finish(),
            Node::Lazy(_) => f.write_str("Lazy(..)"),
            Node::Future(_) => f.write_str("Future(..)"),
            Node::Stream(_) => f.write_str("Stream(..)"),
            Node::Client(r) => f.debug_tuple("Client").field(r).finish(),
        }
    }
}
