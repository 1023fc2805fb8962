//! Trellis integration test harness.
//!
//! Every test renders a tree with the writer and reads it back with the
//! reader, either in memory or through an in-process duplex pipe. No
//! network or external processes are involved.
//!
//!   cargo test --test integration

mod deferred;
mod failures;
mod roundtrip;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::sync::watch;

use trellis_core::{ChunkId, ClientManifest, Model, ModuleMetadata, RowDecoder, RowTag, ROOT_ID};
use trellis_stream::{
    open, render, ModuleLoader, Node, Produce, RenderOptions, RenderStream, Response,
    ResponseState,
};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Render `root` to completion and return the raw stream.
pub async fn render_bytes(root: Node, manifest: ClientManifest, options: RenderOptions) -> Vec<u8> {
    render(root, manifest, options).into_bytes().await
}

/// Like `render_bytes`, but a render that never ends fails the test.
pub async fn render_within(
    limit: Duration,
    root: Node,
    manifest: ClientManifest,
    options: RenderOptions,
) -> Vec<u8> {
    tokio::time::timeout(limit, render_bytes(root, manifest, options))
        .await
        .expect("render did not complete")
}

/// Every row answers a reference, and every referenced chunk gets exactly
/// one terminal row.
pub fn assert_well_formed(bytes: &[u8]) {
    let rows = RowDecoder::new().feed(bytes).expect("stream should decode");
    let mut referenced = BTreeSet::from([ROOT_ID]);
    let mut terminal: BTreeMap<ChunkId, usize> = BTreeMap::new();
    for row in &rows {
        if matches!(row.tag, RowTag::Model | RowTag::Part) {
            let model = Model::from_wire(row.payload.clone()).expect("payload should parse");
            referenced.extend(model.references());
        }
        if row.tag != RowTag::Part {
            *terminal.entry(row.id).or_default() += 1;
        }
    }
    for row in &rows {
        assert!(referenced.contains(&row.id), "row {} is never referenced", row.id);
    }
    for id in &referenced {
        assert_eq!(terminal.get(id), Some(&1), "chunk {id} needs exactly one terminal row");
    }
}

/// Feed a complete stream into a fresh reader and close it.
pub fn read_all(bytes: &[u8]) -> ResponseState {
    let mut state = ResponseState::new();
    state.process_bytes(bytes);
    state.close();
    state
}

/// Pipe a live render into a reader through an in-process duplex.
pub fn connect<L: ModuleLoader>(stream: RenderStream, loader: L) -> Response<DuplexStream, L> {
    let (tx, rx) = tokio::io::duplex(256);
    tokio::spawn(stream.pipe(tx));
    open(rx, loader)
}

/// Split a stream into its rows, newline included.
pub fn split_rows(bytes: &[u8]) -> Vec<&[u8]> {
    bytes.split_inclusive(|b| *b == b'\n').collect()
}

// ── Gate, a latch tests open by hand ──────────────────────────────────────────

#[derive(Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.tx.subscribe();
        async move {
            let _ = rx.wait_for(|open| *open).await;
        }
    }
}

/// A subtree that suspends until `gate` opens, then yields `value`.
pub fn gated(gate: &Gate, value: &'static str) -> Node {
    let gate = gate.clone();
    Node::lazy(move || {
        if gate.is_open() {
            Produce::Ready(Node::text(value))
        } else {
            Produce::suspend(gate.wait())
        }
    })
}

// ── Recorders ─────────────────────────────────────────────────────────────────

/// Collects every `on_error` call.
#[derive(Clone, Default)]
pub struct ErrorLog {
    calls: Arc<Mutex<Vec<(String, Vec<ChunkId>)>>>,
}

impl ErrorLog {
    pub fn options(&self) -> RenderOptions {
        let calls = self.calls.clone();
        RenderOptions::new().on_error(move |error, ids| {
            calls.lock().unwrap().push((error.to_string(), ids.to_vec()));
        })
    }

    pub fn calls(&self) -> Vec<(String, Vec<ChunkId>)> {
        self.calls.lock().unwrap().clone()
    }
}

/// Loads a module as its export name and counts attempts. The first
/// `failures` attempts fail.
#[derive(Clone)]
pub struct CountingLoader {
    pub attempts: Arc<AtomicUsize>,
    pub failures: usize,
}

impl CountingLoader {
    pub fn new(failures: usize) -> Self {
        Self {
            attempts: Arc::new(AtomicUsize::new(0)),
            failures,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for CountingLoader {
    type Module = String;

    fn load(&self, metadata: &ModuleMetadata) -> BoxFuture<'static, anyhow::Result<String>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let failures = self.failures;
        let name = metadata.name.clone();
        Box::pin(async move {
            if attempt < failures {
                anyhow::bail!("module host unreachable");
            }
            Ok(name)
        })
    }
}

pub fn button_manifest() -> ClientManifest {
    let mut manifest = ClientManifest::new();
    manifest.insert(
        "ui/button.js",
        "Button",
        ModuleMetadata {
            id: "ui/button".to_string(),
            chunks: vec!["ui/button".to_string()],
            name: "Button".to_string(),
        },
    );
    manifest
}
