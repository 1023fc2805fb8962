//! Render request: the actor that owns all writer-side state.
//!
//! Exactly one task runs `Request::run`. It walks the root, hands deferred
//! work to spawned tasks, and reacts to the events those tasks send back.
//! Spawned tasks never touch request state; they only send events.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use trellis_core::wire::{self, encode_row, ErrorPayload, RowTag};
use trellis_core::{ChunkId, ClientManifest, ClientReference, ROOT_ID};

use super::node::{Node, Produce, Producer};
use super::{RenderOptions, REDACTED_MESSAGE};

pub(crate) enum Event {
    /// A suspended producer's wake future completed.
    Ping(ChunkId),
    /// A deferred future finished, or a spawned task panicked.
    Settled(ChunkId, anyhow::Result<Node>),
    /// A stream yielded an item.
    Item(ChunkId, anyhow::Result<Node>),
    /// A stream ended.
    End(ChunkId),
    Abort(String),
}

/// A chunk that has been promised but not yet settled.
enum Task {
    Suspended {
        producer: Box<dyn Producer>,
        waker: JoinHandle<()>,
    },
    Running(JoinHandle<()>),
}

impl Task {
    fn cancel(self) {
        match self {
            Task::Suspended { waker, .. } => waker.abort(),
            Task::Running(handle) => handle.abort(),
        }
    }
}

pub(crate) struct Request {
    manifest: ClientManifest,
    options: RenderOptions,
    next_id: ChunkId,
    tasks: HashMap<ChunkId, Task>,
    /// Module rows already written, so each export is sent once.
    modules: HashMap<ClientReference, ChunkId>,
    /// Module rows written by the walk in progress. Flushed only if the
    /// walk succeeds.
    staged: Vec<Bytes>,
    rows: mpsc::UnboundedSender<Bytes>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl Request {
    pub(crate) fn new(
        manifest: ClientManifest,
        options: RenderOptions,
        rows: mpsc::UnboundedSender<Bytes>,
        events_tx: mpsc::UnboundedSender<Event>,
        events_rx: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            manifest,
            options,
            next_id: ROOT_ID + 1,
            tasks: HashMap::new(),
            modules: HashMap::new(),
            staged: Vec::new(),
            rows,
            events_tx,
            events_rx,
        }
    }

    /// Render the root, then serve events until nothing is pending.
    /// Dropping `self` closes the row channel, which ends the stream.
    pub(crate) async fn run(mut self, root: Node) {
        match self.encode_chunk(root) {
            Ok(value) => self.emit(ROOT_ID, RowTag::Model, &value),
            Err(error) => self.fail(ROOT_ID, error),
        }

        while !self.tasks.is_empty() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.handle(event);
        }

        tracing::debug!(chunks = self.next_id, "render complete");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Ping(id) => match self.tasks.remove(&id) {
                Some(Task::Suspended { producer, .. }) => self.attempt(id, producer),
                Some(other) => {
                    self.tasks.insert(id, other);
                }
                None => {}
            },

            Event::Settled(id, result) => {
                if self.tasks.remove(&id).is_none() {
                    return;
                }
                match result.and_then(|node| self.encode_chunk(node)) {
                    Ok(value) => self.emit(id, RowTag::Model, &value),
                    Err(error) => self.fail(id, error),
                }
            }

            Event::Item(id, result) => {
                if !matches!(self.tasks.get(&id), Some(Task::Running(_))) {
                    return;
                }
                match result.and_then(|node| self.encode_chunk(node)) {
                    Ok(value) => self.emit(id, RowTag::Part, &value),
                    Err(error) => {
                        if let Some(task) = self.tasks.remove(&id) {
                            task.cancel();
                        }
                        self.fail(id, error);
                    }
                }
            }

            Event::End(id) => {
                if self.tasks.remove(&id).is_some() {
                    self.emit(id, RowTag::Model, &Value::Array(Vec::new()));
                }
            }

            Event::Abort(reason) => self.abort(&reason),
        }
    }

    /// Retry a suspended producer under its existing id.
    fn attempt(&mut self, id: ChunkId, mut producer: Box<dyn Producer>) {
        tracing::debug!(id, "retrying suspended chunk");
        match produce(producer.as_mut()) {
            Produce::Ready(node) => match self.encode_chunk(node) {
                Ok(value) => self.emit(id, RowTag::Model, &value),
                Err(error) => self.fail(id, error),
            },
            Produce::Suspend(wake) => self.suspend(id, producer, wake),
            Produce::Fail(error) => self.fail(id, error),
        }
    }

    fn suspend(
        &mut self,
        id: ChunkId,
        producer: Box<dyn Producer>,
        wake: futures::future::BoxFuture<'static, ()>,
    ) {
        let events = self.events_tx.clone();
        let waker = tokio::spawn(async move {
            let event = match AssertUnwindSafe(wake).catch_unwind().await {
                Ok(()) => Event::Ping(id),
                Err(panic) => Event::Settled(id, Err(panic_error(panic))),
            };
            let _ = events.send(event);
        });
        self.tasks.insert(id, Task::Suspended { producer, waker });
    }

    /// Encode the value of one chunk. If the walk fails, everything it
    /// started is cancelled and its module rows are discarded, so no row
    /// is ever written for an id that nothing references.
    fn encode_chunk(&mut self, node: Node) -> anyhow::Result<Value> {
        let mark = self.next_id;
        let result = self.encode(node);
        let staged = std::mem::take(&mut self.staged);

        match &result {
            Ok(_) => {
                for row in staged {
                    self.send(row);
                }
            }
            Err(_) => {
                let orphaned: Vec<ChunkId> =
                    self.tasks.keys().copied().filter(|id| *id >= mark).collect();
                if !orphaned.is_empty() {
                    tracing::debug!(orphaned = ?orphaned, "cancelling work of a failed walk");
                }
                for id in orphaned {
                    if let Some(task) = self.tasks.remove(&id) {
                        task.cancel();
                    }
                }
                self.modules.retain(|_, id| *id < mark);
            }
        }
        result
    }

    /// Turn a node into a payload value. Deferred parts are replaced by
    /// references to freshly allocated chunks.
    fn encode(&mut self, node: Node) -> anyhow::Result<Value> {
        Ok(match node {
            Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(b),
            Node::Number(n) => Value::Number(n),
            Node::Text(text) => Value::String(wire::escape_text(&text).into_owned()),
            Node::List(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.encode(item))
                    .collect::<anyhow::Result<_>>()?,
            ),
            Node::Map(fields) => {
                let mut out = Map::new();
                for (key, value) in fields {
                    out.insert(key, self.encode(value)?);
                }
                Value::Object(out)
            }

            Node::Lazy(mut producer) => match produce(producer.as_mut()) {
                Produce::Ready(node) => self.encode(node)?,
                Produce::Suspend(wake) => {
                    let id = self.allocate();
                    tracing::debug!(id, "subtree suspended");
                    self.suspend(id, producer, wake);
                    Value::String(wire::reference(id))
                }
                Produce::Fail(error) => return Err(error),
            },

            Node::Future(future) => {
                let id = self.allocate();
                let events = self.events_tx.clone();
                let handle = tokio::spawn(async move {
                    let result = AssertUnwindSafe(future)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(panic_error(panic)));
                    let _ = events.send(Event::Settled(id, result));
                });
                self.tasks.insert(id, Task::Running(handle));
                Value::String(wire::reference(id))
            }

            Node::Stream(mut stream) => {
                let id = self.allocate();
                let events = self.events_tx.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        let item = match AssertUnwindSafe(stream.next()).catch_unwind().await {
                            Ok(Some(item)) => item,
                            Ok(None) => break,
                            Err(panic) => Err(panic_error(panic)),
                        };
                        let failed = item.is_err();
                        if events.send(Event::Item(id, item)).is_err() || failed {
                            return;
                        }
                    }
                    let _ = events.send(Event::End(id));
                });
                self.tasks.insert(id, Task::Running(handle));
                Value::String(wire::reference(id))
            }

            Node::Client(reference) => {
                Value::String(wire::module_reference(self.module(reference)?))
            }
        })
    }

    fn module(&mut self, reference: ClientReference) -> anyhow::Result<ChunkId> {
        if let Some(id) = self.modules.get(&reference) {
            return Ok(*id);
        }

        let metadata = self.manifest.resolve(&reference).ok_or_else(|| {
            anyhow::anyhow!(
                "could not find client module {:?} export {:?} in the manifest",
                reference.module,
                reference.export
            )
        })?;
        let payload = serde_json::to_value(metadata)?;

        let id = self.allocate();
        self.staged.push(encode_row(id, RowTag::Module, &payload));
        self.modules.insert(reference, id);
        Ok(id)
    }

    fn fail(&mut self, id: ChunkId, error: anyhow::Error) {
        let message = format!("{error:#}");
        let digest = digest(&message);
        tracing::warn!(id, digest = %digest, error = %message, "chunk production failed");

        let payload = if self.options.redact_errors {
            ErrorPayload {
                digest,
                message: REDACTED_MESSAGE.to_string(),
                stack: None,
            }
        } else {
            ErrorPayload {
                digest,
                message,
                stack: Some(format!("{error:?}")),
            }
        };
        self.emit(id, RowTag::Error, &payload.to_value());
        self.options.report(&error, &[id]);
    }

    /// Settle every pending chunk with `reason` and cancel its work.
    fn abort(&mut self, reason: &str) {
        let mut ids: Vec<ChunkId> = self.tasks.keys().copied().collect();
        ids.sort_unstable();
        tracing::info!(pending = ids.len(), reason, "render aborted");

        let payload = ErrorPayload {
            digest: digest(reason),
            message: reason.to_string(),
            stack: None,
        }
        .to_value();

        for id in &ids {
            if let Some(task) = self.tasks.remove(id) {
                task.cancel();
            }
            self.emit(*id, RowTag::Error, &payload);
        }

        if !ids.is_empty() {
            self.options
                .report(&anyhow::Error::msg(reason.to_string()), &ids);
        }
    }

    fn allocate(&mut self) -> ChunkId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn emit(&self, id: ChunkId, tag: RowTag, payload: &Value) {
        tracing::trace!(id, tag = ?tag, "row emitted");
        self.send(encode_row(id, tag, payload));
    }

    fn send(&self, row: Bytes) {
        if self.rows.send(row).is_err() {
            tracing::debug!("row receiver dropped");
        }
    }
}

/// Run one production attempt. A panic counts as a failed attempt.
fn produce(producer: &mut dyn Producer) -> Produce {
    std::panic::catch_unwind(AssertUnwindSafe(|| producer.produce()))
        .unwrap_or_else(|panic| Produce::Fail(panic_error(panic)))
}

fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    anyhow::anyhow!("producer panicked: {detail}")
}

/// Stable short hash of an error message.
fn digest(message: &str) -> String {
    hex::encode(&blake3::hash(message.as_bytes()).as_bytes()[..8])
}
