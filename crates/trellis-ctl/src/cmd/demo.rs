//! `demo`: render a built-in tree that exercises every node kind.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;

use trellis_core::config::TrellisConfig;
use trellis_core::{ClientManifest, ModuleMetadata};
use trellis_stream::{render, Node, Produce, RenderOptions};

pub async fn cmd_demo(abort_after_ms: Option<u64>, config: &TrellisConfig) -> Result<()> {
    let options = RenderOptions::from(&config.writer).on_error(|error, ids| {
        tracing::info!(ids = ?ids, error = %error, "demo chunk failed");
    });
    let stream = render(demo_tree(), demo_manifest(), options);

    if let Some(ms) = abort_after_ms {
        let handle = stream.abort_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            handle.abort(format!("aborted by trellis-ctl after {ms}ms"));
        });
    }

    stream
        .pipe(tokio::io::stdout())
        .await
        .context("failed to write stream to stdout")
}

fn demo_manifest() -> ClientManifest {
    let mut manifest = ClientManifest::new();
    manifest.insert(
        "widgets/counter.js",
        "Counter",
        ModuleMetadata {
            id: "widgets/counter".to_string(),
            chunks: vec!["vendor".to_string(), "widgets/counter".to_string()],
            name: "Counter".to_string(),
        },
    );
    manifest
}

fn demo_tree() -> Node {
    Node::map([
        ("title", Node::text("trellis demo")),
        ("price", Node::text("$5.00")),
        ("handle", Node::text("@trellis")),
        ("widget", Node::client("widgets/counter.js", "Counter")),
        ("summary", summary()),
        (
            "details",
            Node::future(async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Node::map([
                    ("weight", Node::from(1.25)),
                    ("tags", Node::list([Node::text("new"), Node::text("sale")])),
                ]))
            }),
        ),
        (
            "inventory",
            Node::future(async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Err(anyhow::anyhow!("inventory service unavailable"))
            }),
        ),
        (
            "reviews",
            Node::stream(futures::stream::iter(1..=3u64).then(|n| async move {
                tokio::time::sleep(Duration::from_millis(100 * n)).await;
                Ok::<_, anyhow::Error>(Node::map([
                    ("stars", Node::from(n + 2)),
                    ("text", Node::text(format!("review {n}"))),
                ]))
            })),
        ),
    ])
}

/// Suspends once on a timer, then produces its value.
fn summary() -> Node {
    let mut waited = false;
    Node::lazy(move || {
        if waited {
            Produce::Ready(Node::text("ready after one retry"))
        } else {
            waited = true;
            Produce::suspend(tokio::time::sleep(Duration::from_millis(50)))
        }
    })
}
