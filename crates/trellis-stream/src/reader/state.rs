//! Synchronous reader core: row decoding plus the chunk table.
//!
//! Nothing here performs I/O. Callers hand over bytes (or whole rows) and
//! read the graph back; a read that hits an unfinished chunk returns
//! `ReadError::Suspended` naming what to wait for.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use trellis_core::wire::{ErrorPayload, WireError};
use trellis_core::{
    ChunkError, ChunkId, ChunkState, ChunkTable, Model, ModuleMetadata, Resolved, Row, RowDecoder,
    RowTag, ROOT_ID,
};

use super::{ReadError, Suspension};
use crate::bridge::{self, Settlement};

#[derive(Default)]
pub struct ResponseState {
    decoder: RowDecoder,
    chunks: ChunkTable,
    /// Set once the stream has ended, cleanly or not. Chunks that are
    /// still unknown at that point can never arrive.
    terminal: Option<ChunkError>,
}

impl ResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    /// Feed raw bytes. Any fragmentation is fine.
    pub fn process_bytes(&mut self, bytes: &[u8]) {
        if self.terminal.is_some() {
            tracing::debug!(len = bytes.len(), "bytes after end of stream ignored");
            return;
        }
        self.decoder.push(bytes);
        loop {
            match self.decoder.next_row() {
                Ok(Some(row)) => self.process_row(row),
                Ok(None) => break,
                Err(e) => {
                    self.fail(&e);
                    break;
                }
            }
        }
    }

    /// Apply one decoded row.
    pub fn process_row(&mut self, row: Row) {
        if self.terminal.is_some() {
            return;
        }
        if let Err(e) = self.apply(row) {
            self.fail(&e);
        }
    }

    fn apply(&mut self, row: Row) -> Result<(), WireError> {
        let Row { id, tag, payload } = row;
        tracing::trace!(id, tag = ?tag, "row received");

        match tag {
            RowTag::Model => {
                let mut model = Model::from_wire(payload)?;
                let parts = self.chunks.take_parts(id);
                if !parts.is_empty() {
                    let Model::List(rest) = model else {
                        return Err(WireError::InvalidPayload(
                            id,
                            "a streamed chunk must close with a list".to_string(),
                        ));
                    };
                    model = Model::List(parts.into_iter().chain(rest).collect());
                }
                self.mention(&model);
                self.chunks.resolve(id, Resolved::Model(Arc::new(model)));
            }
            RowTag::Part => {
                let part = Model::from_wire(payload)?;
                self.mention(&part);
                self.chunks.append(id, part);
            }
            RowTag::Module => {
                let metadata: ModuleMetadata = serde_json::from_value(payload)
                    .map_err(|e| WireError::InvalidPayload(id, e.to_string()))?;
                self.chunks.resolve(id, Resolved::Module(Arc::new(metadata)));
            }
            RowTag::Error => {
                let error: ErrorPayload = serde_json::from_value(payload)
                    .map_err(|e| WireError::InvalidPayload(id, e.to_string()))?;
                tracing::debug!(id, digest = %error.digest, "chunk errored");
                self.chunks.reject(id, ChunkError::from(error));
            }
        }
        Ok(())
    }

    /// A reference implies the target chunk exists.
    fn mention(&mut self, model: &Model) {
        for id in model.references() {
            self.chunks.create(id);
        }
    }

    /// The byte source is exhausted.
    pub fn close(&mut self) {
        if self.terminal.is_some() {
            return;
        }
        if let Err(e) = self.decoder.finish() {
            self.fail(&e);
            return;
        }
        let error = ChunkError::closed_early();
        let rejected = self.chunks.reject_pending(&error);
        if !rejected.is_empty() {
            tracing::warn!(pending = ?rejected, "stream closed with chunks still pending");
        }
        self.terminal = Some(error);
    }

    /// End the stream with `error` for everything still outstanding.
    pub fn abandon(&mut self, error: ChunkError) {
        if self.terminal.is_some() {
            return;
        }
        let rejected = self.chunks.reject_pending(&error);
        tracing::warn!(error = %error, pending = ?rejected, "stream abandoned");
        self.terminal = Some(error);
    }

    fn fail(&mut self, cause: &WireError) {
        tracing::warn!(error = %cause, "malformed stream");
        self.abandon(ChunkError::malformed(cause));
    }

    pub fn is_closed(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn pending_ids(&self) -> Vec<ChunkId> {
        self.chunks.pending_ids()
    }

    pub fn chunks(&self) -> &ChunkTable {
        &self.chunks
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    fn resolved(&self, id: ChunkId) -> Result<&Resolved, ReadError> {
        match self.chunks.state(id) {
            Some(ChunkState::Resolved(value)) => Ok(value),
            Some(ChunkState::Errored(error)) => Err(ReadError::Chunk(error.clone())),
            Some(ChunkState::Pending) | None => match &self.terminal {
                Some(error) => Err(ReadError::Chunk(error.clone())),
                None => Err(ReadError::Suspended(Suspension::Chunk(id))),
            },
        }
    }

    /// The value of one chunk, without following a top-level reference.
    /// Repeated reads return the same allocation.
    pub fn read_chunk(&self, id: ChunkId) -> Result<&Arc<Model>, ReadError> {
        match self.resolved(id)? {
            Resolved::Model(model) => Ok(model),
            Resolved::Module(_) => Err(ReadError::NotAValue(id)),
        }
    }

    pub fn read_module_metadata(&self, id: ChunkId) -> Result<&Arc<ModuleMetadata>, ReadError> {
        match self.resolved(id)? {
            Resolved::Module(metadata) => Ok(metadata),
            Resolved::Model(_) => Err(ReadError::NotAModule(id)),
        }
    }

    /// Follow a chain of references from `id` to a non-reference value.
    fn follow(&self, mut id: ChunkId) -> Result<&Model, ReadError> {
        let mut seen = HashSet::from([id]);
        loop {
            let model = self.read_chunk(id)?.as_ref();
            match model {
                Model::Ref(next) => {
                    if !seen.insert(*next) {
                        return Err(ReadError::Cycle(*next));
                    }
                    id = *next;
                }
                _ => return Ok(model),
            }
        }
    }

    pub fn read_root(&self) -> Result<&Model, ReadError> {
        self.follow(ROOT_ID)
    }

    /// Look through a reference. Anything else, module bindings included,
    /// is returned as is.
    pub fn read<'a>(&'a self, value: &'a Model) -> Result<&'a Model, ReadError> {
        match value {
            Model::Ref(id) => self.follow(*id),
            other => Ok(other),
        }
    }

    /// Items of a streamed chunk: those received so far while it is
    /// pending, or the whole list once it has resolved.
    pub fn read_parts(&self, id: ChunkId) -> Result<&[Model], ReadError> {
        match self.chunks.state(id) {
            Some(ChunkState::Pending) => Ok(self.chunks.parts(id)),
            _ => match self.follow(id)? {
                Model::List(items) => Ok(items),
                _ => Err(ReadError::NotAList(id)),
            },
        }
    }

    /// Deep-read `value` into plain JSON. Text comes out unescaped and
    /// modules come out as their metadata.
    pub fn materialize(&self, value: &Model) -> Result<Value, ReadError> {
        let mut path = Vec::new();
        self.materialize_in(value, &mut path)
    }

    pub fn materialize_root(&self) -> Result<Value, ReadError> {
        self.materialize(&Model::Ref(ROOT_ID))
    }

    fn materialize_in(&self, value: &Model, path: &mut Vec<ChunkId>) -> Result<Value, ReadError> {
        Ok(match value {
            Model::Null => Value::Null,
            Model::Bool(b) => Value::Bool(*b),
            Model::Number(n) => Value::Number(n.clone()),
            Model::Text(s) => Value::String(s.clone()),
            Model::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.materialize_in(item, path))
                    .collect::<Result<_, _>>()?,
            ),
            Model::Map(fields) => {
                let mut out = serde_json::Map::new();
                for (key, field) in fields {
                    out.insert(key.clone(), self.materialize_in(field, path)?);
                }
                Value::Object(out)
            }
            Model::Ref(id) => {
                if path.contains(id) {
                    return Err(ReadError::Cycle(*id));
                }
                let target = self.read_chunk(*id)?.clone();
                path.push(*id);
                let out = self.materialize_in(&target, path);
                path.pop();
                out?
            }
            Model::Module(id) => {
                let metadata = self.read_module_metadata(*id)?;
                serde_json::json!({
                    "id": metadata.id,
                    "chunks": metadata.chunks,
                    "name": metadata.name,
                })
            }
        })
    }

    // ── Waiting ───────────────────────────────────────────────────────────────

    /// Awaitable for the next terminal transition of `id`. If the stream
    /// has already ended, a chunk that never arrived settles with the
    /// stream's terminal error.
    pub fn settlement(&mut self, id: ChunkId) -> Settlement {
        if let Some(error) = &self.terminal {
            if self.chunks.state(id).map_or(true, ChunkState::is_pending) {
                self.chunks.reject(id, error.clone());
            }
        }
        bridge::settlement(&mut self.chunks, id)
    }

    /// Drop a settlement that will no longer be awaited. Returns false if
    /// its listener had already fired.
    pub fn release(&mut self, settlement: Settlement) -> bool {
        self.chunks.unsubscribe(settlement.subscription())
    }
}
