//! Writer: turns a partially-computed `Node` graph into a row stream.
//!
//! `render` spawns one request actor on the current tokio runtime and
//! returns a `RenderStream`. Rows are queued as soon as they are ready;
//! `pipe` copies them to any `AsyncWrite` and shuts it down once every
//! promised chunk has settled.

mod node;
mod request;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use trellis_core::config::WriterConfig;
use trellis_core::{ChunkId, ClientManifest};

pub use node::{Node, Produce, Producer};

use request::{Event, Request};

/// Sent instead of the real message when errors are redacted.
pub const REDACTED_MESSAGE: &str =
    "an error occurred while producing this value; details are redacted, see the digest";

/// Message used to abort a render whose destination went away.
pub const DESTINATION_CLOSED: &str = "destination closed";

pub type ErrorHook = Arc<dyn Fn(&anyhow::Error, &[ChunkId]) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RenderOptions {
    on_error: Option<ErrorHook>,
    redact_errors: bool,
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per distinct failure with the ids it settled.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&anyhow::Error, &[ChunkId]) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn redact_errors(mut self, redact: bool) -> Self {
        self.redact_errors = redact;
        self
    }

    fn report(&self, error: &anyhow::Error, ids: &[ChunkId]) {
        if let Some(hook) = &self.on_error {
            hook(error, ids);
        }
    }
}

impl From<&WriterConfig> for RenderOptions {
    fn from(config: &WriterConfig) -> Self {
        RenderOptions::new().redact_errors(config.redact_errors)
    }
}

impl fmt::Debug for RenderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderOptions")
            .field("on_error", &self.on_error.is_some())
            .field("redact_errors", &self.redact_errors)
            .finish()
    }
}

/// Start rendering `root`. Must be called from within a tokio runtime.
pub fn render(root: Node, manifest: ClientManifest, options: RenderOptions) -> RenderStream {
    let (rows_tx, rows_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let request = Request::new(manifest, options, rows_tx, events_tx.clone(), events_rx);
    tokio::spawn(request.run(root));

    RenderStream {
        rows: rows_rx,
        abort: AbortHandle { events: events_tx },
    }
}

/// Cancels a render. Cheap to clone; usable after the stream is piped.
#[derive(Clone)]
pub struct AbortHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl AbortHandle {
    /// Settle every pending chunk with `reason`. A no-op once the render
    /// has completed or was already aborted.
    pub fn abort(&self, reason: impl Into<String>) {
        let _ = self.events.send(Event::Abort(reason.into()));
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("closed", &self.events.is_closed())
            .finish()
    }
}

/// The encoded output of one render.
pub struct RenderStream {
    rows: mpsc::UnboundedReceiver<Bytes>,
    abort: AbortHandle,
}

impl RenderStream {
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn abort(&self, reason: impl Into<String>) {
        self.abort.abort(reason);
    }

    /// Next encoded row, or `None` once the render is complete.
    pub async fn next_row(&mut self) -> Option<Bytes> {
        self.rows.recv().await
    }

    /// Copy every row to `sink`, flushing after each, then shut it down.
    /// If the sink fails, the render is aborted.
    pub async fn pipe<W>(mut self, mut sink: W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(row) = self.rows.recv().await {
            let written = match sink.write_all(&row).await {
                Ok(()) => sink.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                tracing::warn!(error = %e, "destination failed, aborting render");
                self.abort.abort(DESTINATION_CLOSED);
                return Err(e);
            }
        }
        sink.shutdown().await
    }

    /// Wait for the render to complete and return the whole stream.
    pub async fn into_bytes(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(row) = self.rows.recv().await {
            out.extend_from_slice(&row);
        }
        out
    }
}
