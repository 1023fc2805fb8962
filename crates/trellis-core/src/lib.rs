//! trellis-core: wire format, reader-side values, client-module types,
//! the chunk state machine, and configuration.
//! The writer and reader in trellis-stream both build on this crate.

pub mod chunk;
pub mod config;
pub mod model;
pub mod module;
pub mod wire;

pub use chunk::{ChunkError, ChunkState, ChunkTable, Resolved, Subscription};
pub use model::Model;
pub use module::{ClientManifest, ClientReference, ModuleMetadata};
pub use wire::{ChunkId, Row, RowDecoder, RowTag, WireError, ROOT_ID};
