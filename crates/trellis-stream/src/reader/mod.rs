//! Reader: rebuilds the value graph from a row stream.
//!
//! `ResponseState` is the synchronous core. `Response` owns a byte source
//! and a module loader on top of it and knows how to wait: when a read
//! suspends, `settle` pumps the source (or loads the module) until the
//! named dependency is ready, and `wait_for` retries the read.

mod state;

use std::collections::HashMap;
use std::fmt;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncReadExt};

use trellis_core::config::ReaderConfig;
use trellis_core::{ChunkError, ChunkId, Model, ModuleMetadata};

pub use state::ResponseState;

// ── Errors ────────────────────────────────────────────────────────────────────

/// What a read is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suspension {
    /// The chunk has not settled yet.
    Chunk(ChunkId),
    /// The module row has arrived but the host has not loaded it.
    Module(ChunkId),
}

impl fmt::Display for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suspension::Chunk(id) => write!(f, "chunk {id}"),
            Suspension::Module(id) => write!(f, "module {id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("{0} is not ready")]
    Suspended(Suspension),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("failed to load module {id}: {message}")]
    Load { id: ChunkId, message: String },
    #[error("chunk {0} holds a module, not a value")]
    NotAValue(ChunkId),
    #[error("chunk {0} holds a value, not a module")]
    NotAModule(ChunkId),
    #[error("chunk {0} is not a list")]
    NotAList(ChunkId),
    #[error("reference cycle through chunk {0}")]
    Cycle(ChunkId),
    #[error("failed to read stream: {0}")]
    Io(#[from] std::io::Error),
}

impl ReadError {
    pub fn is_suspended(&self) -> bool {
        matches!(self, ReadError::Suspended(_))
    }
}

// ── Module loading ────────────────────────────────────────────────────────────

/// Host hook that turns module metadata into a loaded module.
pub trait ModuleLoader {
    type Module: Send;

    fn load(&self, metadata: &ModuleMetadata) -> BoxFuture<'static, anyhow::Result<Self::Module>>;
}

/// Loader for streams that carry no modules. Every load fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModules;

impl ModuleLoader for NoModules {
    type Module = ();

    fn load(&self, metadata: &ModuleMetadata) -> BoxFuture<'static, anyhow::Result<()>> {
        let id = metadata.id.clone();
        Box::pin(async move { Err(anyhow::anyhow!("no module loader configured for {id:?}")) })
    }
}

// ── Response ──────────────────────────────────────────────────────────────────

pub struct Response<R, L: ModuleLoader> {
    source: R,
    loader: L,
    state: ResponseState,
    modules: HashMap<ChunkId, L::Module>,
    buf: Vec<u8>,
    eof: bool,
}

/// Start reading `source` with default settings.
pub fn open<R, L>(source: R, loader: L) -> Response<R, L>
where
    R: AsyncRead + Unpin,
    L: ModuleLoader,
{
    Response::with_config(source, loader, &ReaderConfig::default())
}

impl<R, L> Response<R, L>
where
    R: AsyncRead + Unpin,
    L: ModuleLoader,
{
    pub fn with_config(source: R, loader: L, config: &ReaderConfig) -> Self {
        Self {
            source,
            loader,
            state: ResponseState::new(),
            modules: HashMap::new(),
            buf: vec![0; config.read_buffer_bytes.max(1)],
            eof: false,
        }
    }

    pub fn state(&self) -> &ResponseState {
        &self.state
    }

    pub fn read_root(&self) -> Result<&Model, ReadError> {
        self.state.read_root()
    }

    pub fn read<'a>(&'a self, value: &'a Model) -> Result<&'a Model, ReadError> {
        self.state.read(value)
    }

    pub fn read_parts(&self, id: ChunkId) -> Result<&[Model], ReadError> {
        self.state.read_parts(id)
    }

    pub fn materialize(&self, value: &Model) -> Result<serde_json::Value, ReadError> {
        self.state.materialize(value)
    }

    pub fn materialize_root(&self) -> Result<serde_json::Value, ReadError> {
        self.state.materialize_root()
    }

    /// The loaded module behind `value`, a `Model::Module` binding or a
    /// reference to one. Suspends until `settle` has loaded it.
    pub fn read_module(&self, value: &Model) -> Result<&L::Module, ReadError> {
        let id = match self.state.read(value)? {
            Model::Module(id) => *id,
            _ => return Err(ReadError::NotAModule(module_site(value))),
        };
        if let Some(module) = self.modules.get(&id) {
            return Ok(module);
        }
        self.state.read_module_metadata(id)?;
        Err(ReadError::Suspended(Suspension::Module(id)))
    }

    /// Read once from the source and ingest what arrived. Returns false
    /// once the source is exhausted.
    pub async fn pump(&mut self) -> Result<bool, ReadError> {
        if self.eof {
            return Ok(false);
        }
        match self.source.read(&mut self.buf).await {
            Ok(0) => {
                tracing::debug!("byte source exhausted");
                self.eof = true;
                self.state.close();
                Ok(false)
            }
            Ok(n) => {
                self.state.process_bytes(&self.buf[..n]);
                Ok(true)
            }
            Err(e) => {
                self.eof = true;
                self.state
                    .abandon(ChunkError::new(format!("failed to read stream: {e}")));
                Err(ReadError::Io(e))
            }
        }
    }

    /// Make progress on whatever `suspension` names.
    pub async fn settle(&mut self, suspension: Suspension) -> Result<(), ReadError> {
        match suspension {
            Suspension::Chunk(id) => self.settle_chunk(id).await,
            Suspension::Module(id) => self.load_module(id).await,
        }
    }

    async fn settle_chunk(&mut self, id: ChunkId) -> Result<(), ReadError> {
        let mut settled = self.state.settlement(id);
        while !settled.is_settled() {
            match self.pump().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    self.state.release(settled);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Load a module through the host loader. A failure is returned to
    /// the caller and not cached, so the next read tries again.
    async fn load_module(&mut self, id: ChunkId) -> Result<(), ReadError> {
        if self.modules.contains_key(&id) {
            return Ok(());
        }
        let metadata = loop {
            match self.state.read_module_metadata(id) {
                Ok(metadata) => break metadata.clone(),
                Err(ReadError::Suspended(Suspension::Chunk(pending))) => {
                    self.settle_chunk(pending).await?
                }
                Err(e) => return Err(e),
            }
        };

        tracing::debug!(id, module = %metadata.id, "loading module");
        match self.loader.load(&metadata).await {
            Ok(module) => {
                self.modules.insert(id, module);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(id, module = %metadata.id, error = %e, "module load failed");
                Err(ReadError::Load {
                    id,
                    message: format!("{e:#}"),
                })
            }
        }
    }

    /// Run `read` until it stops suspending, settling whatever it waits on.
    pub async fn wait_for<T, F>(&mut self, mut read: F) -> Result<T, ReadError>
    where
        F: FnMut(&Self) -> Result<T, ReadError>,
    {
        loop {
            match read(&*self) {
                Err(ReadError::Suspended(suspension)) => self.settle(suspension).await?,
                other => return other,
            }
        }
    }

    /// Ingest the whole source.
    pub async fn run_to_end(&mut self) -> Result<(), ReadError> {
        while self.pump().await? {}
        Ok(())
    }
}

/// Best id to report when a non-module value is read as a module.
fn module_site(value: &Model) -> ChunkId {
    match value {
        Model::Ref(id) | Model::Module(id) => *id,
        _ => trellis_core::ROOT_ID,
    }
}
