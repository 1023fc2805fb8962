//! Chunk state machine: one record per identifier, plus its listeners.
//!
//! A chunk moves Pending → Resolved or Pending → Errored exactly once.
//! Later transitions are ignored and reported as `false`. Listeners fire
//! exactly once: on the transition, or immediately when they subscribe to
//! a chunk that has already settled.

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::Model;
use crate::module::ModuleMetadata;
use crate::wire::{ChunkId, ErrorPayload, WireError};

/// Message attached to chunks still pending when the stream ends.
pub const CLOSED_EARLY_MESSAGE: &str = "stream closed early";

/// Final value of a chunk.
#[derive(Debug, Clone)]
pub enum Resolved {
    Model(Arc<Model>),
    Module(Arc<ModuleMetadata>),
}

/// Why a chunk failed. Displays as its message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ChunkError {
    pub message: String,
    pub digest: Option<String>,
    pub stack: Option<String>,
}

impl ChunkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            digest: None,
            stack: None,
        }
    }

    pub fn closed_early() -> Self {
        Self::new(CLOSED_EARLY_MESSAGE)
    }

    pub fn malformed(cause: &WireError) -> Self {
        Self::new(format!("malformed stream: {cause}"))
    }
}

impl From<ErrorPayload> for ChunkError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            message: payload.message,
            digest: Some(payload.digest),
            stack: payload.stack,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChunkState {
    Pending,
    Resolved(Resolved),
    Errored(ChunkError),
}

impl ChunkState {
    pub fn is_pending(&self) -> bool {
        matches!(self, ChunkState::Pending)
    }
}

/// What a listener receives.
pub type Outcome<'a> = Result<&'a Resolved, &'a ChunkError>;

pub type Listener = Box<dyn for<'a> FnOnce(Outcome<'a>) + Send>;

/// Handle returned by `listen`/`subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub id: ChunkId,
    key: u64,
}

struct ChunkRecord {
    state: ChunkState,
    /// Streamed parts received while pending.
    parts: Vec<Model>,
    listeners: Vec<(u64, Listener)>,
}

impl ChunkRecord {
    fn pending() -> Self {
        Self {
            state: ChunkState::Pending,
            parts: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

/// Arena of chunk records addressed by id. Owned by exactly one reader.
#[derive(Default)]
pub struct ChunkTable {
    chunks: HashMap<ChunkId, ChunkRecord>,
    next_listener: u64,
}

impl ChunkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the record for `id`.
    pub fn create(&mut self, id: ChunkId) -> &ChunkState {
        &self.chunks.entry(id).or_insert_with(ChunkRecord::pending).state
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.contains_key(&id)
    }

    pub fn state(&self, id: ChunkId) -> Option<&ChunkState> {
        self.chunks.get(&id).map(|r| &r.state)
    }

    pub fn parts(&self, id: ChunkId) -> &[Model] {
        self.chunks.get(&id).map(|r| r.parts.as_slice()).unwrap_or(&[])
    }

    /// Add a streamed part. Ignored once the chunk has settled.
    pub fn append(&mut self, id: ChunkId, part: Model) -> bool {
        let record = self.chunks.entry(id).or_insert_with(ChunkRecord::pending);
        if !record.state.is_pending() {
            tracing::debug!(id, "part for settled chunk ignored");
            return false;
        }
        record.parts.push(part);
        true
    }

    pub fn take_parts(&mut self, id: ChunkId) -> Vec<Model> {
        self.chunks
            .get_mut(&id)
            .map(|r| std::mem::take(&mut r.parts))
            .unwrap_or_default()
    }

    pub fn resolve(&mut self, id: ChunkId, value: Resolved) -> bool {
        self.settle(id, ChunkState::Resolved(value))
    }

    pub fn reject(&mut self, id: ChunkId, error: ChunkError) -> bool {
        self.settle(id, ChunkState::Errored(error))
    }

    fn settle(&mut self, id: ChunkId, state: ChunkState) -> bool {
        let record = self.chunks.entry(id).or_insert_with(ChunkRecord::pending);
        if !record.state.is_pending() {
            tracing::debug!(id, "chunk already settled, transition ignored");
            return false;
        }

        let listeners = std::mem::take(&mut record.listeners);
        record.parts.clear();
        record.state = state;

        for (_, listener) in listeners {
            match &record.state {
                ChunkState::Resolved(value) => listener(Ok(value)),
                ChunkState::Errored(error) => listener(Err(error)),
                ChunkState::Pending => {}
            }
        }
        true
    }

    /// Register a listener. Fires immediately if the chunk has settled.
    pub fn listen(&mut self, id: ChunkId, listener: Listener) -> Subscription {
        let key = self.next_listener;
        self.next_listener += 1;

        let record = self.chunks.entry(id).or_insert_with(ChunkRecord::pending);
        match &record.state {
            ChunkState::Pending => record.listeners.push((key, listener)),
            ChunkState::Resolved(value) => listener(Ok(value)),
            ChunkState::Errored(error) => listener(Err(error)),
        }
        Subscription { id, key }
    }

    pub fn subscribe<R, E>(&mut self, id: ChunkId, on_resolve: R, on_reject: E) -> Subscription
    where
        R: FnOnce(&Resolved) + Send + 'static,
        E: FnOnce(&ChunkError) + Send + 'static,
    {
        self.listen(
            id,
            Box::new(move |outcome: Outcome<'_>| match outcome {
                Ok(value) => on_resolve(value),
                Err(error) => on_reject(error),
            }),
        )
    }

    /// Returns false if the listener already fired or was removed.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let Some(record) = self.chunks.get_mut(&subscription.id) else {
            return false;
        };
        let before = record.listeners.len();
        record.listeners.retain(|(key, _)| *key != subscription.key);
        record.listeners.len() != before
    }

    /// Reject every pending chunk with `error`. Returns the affected ids.
    pub fn reject_pending(&mut self, error: &ChunkError) -> Vec<ChunkId> {
        let ids = self.pending_ids();
        for id in &ids {
            self.reject(*id, error.clone());
        }
        ids
    }

    pub fn pending_ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self
            .chunks
            .iter()
            .filter(|(_, r)| r.state.is_pending())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Every known id, ascending.
    pub fn ids(&self) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = self.chunks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
