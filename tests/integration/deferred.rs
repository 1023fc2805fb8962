use serde_json::json;

use trellis_core::{ClientManifest, Model};
use trellis_stream::{render, Node, NoModules, Produce, ReadError, RenderOptions, Suspension};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Deferred subtrees
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_root_is_readable_before_deferred_subtree() {
    let gate = Gate::new();
    let root = Node::map([("fast", Node::text("x")), ("slow", gated(&gate, "y"))]);
    let stream = render(root, ClientManifest::new(), RenderOptions::new());
    let mut response = connect(stream, NoModules);

    let fast = response
        .wait_for(|r| Ok(r.read_root()?.get("fast").and_then(Model::as_str).map(str::to_string)))
        .await
        .unwrap();
    assert_eq!(fast.as_deref(), Some("x"));

    let root = response.read_root().unwrap();
    let slow = root.get("slow").unwrap();
    assert_eq!(slow, &Model::Ref(1));
    assert!(matches!(
        response.read(slow),
        Err(ReadError::Suspended(Suspension::Chunk(1)))
    ));

    gate.open();
    let value = response.wait_for(|r| r.materialize_root()).await.unwrap();
    assert_eq!(value, json!({"fast": "x", "slow": "y"}));
}

#[tokio::test]
async fn test_resuspending_producer_keeps_its_chunk() {
    let first = Gate::new();
    let second = Gate::new();
    let (a, b) = (first.clone(), second.clone());
    let root = Node::lazy(move || {
        if !a.is_open() {
            Produce::suspend(a.wait())
        } else if !b.is_open() {
            Produce::suspend(b.wait())
        } else {
            Produce::Ready(Node::text("finally"))
        }
    });

    let mut stream = render(root, ClientManifest::new(), RenderOptions::new());
    assert_eq!(&stream.next_row().await.unwrap()[..], b"0:J\"$1\"\n");
    first.open();
    second.open();
    assert_eq!(&stream.next_row().await.unwrap()[..], b"1:J\"finally\"\n");
    assert!(stream.next_row().await.is_none());
}

#[tokio::test]
async fn test_streamed_parts_are_visible_while_pending() {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    let root = Node::map([("feed", Node::stream(rx))]);
    let stream = render(root, ClientManifest::new(), RenderOptions::new());
    let mut response = connect(stream, NoModules);

    tx.unbounded_send(Ok(Node::text("a"))).unwrap();
    loop {
        let seen = matches!(response.read_parts(1), Ok(parts) if !parts.is_empty());
        if seen {
            break;
        }
        assert!(response.pump().await.unwrap(), "stream ended early");
    }
    assert!(matches!(
        response.state().read_chunk(1),
        Err(ReadError::Suspended(Suspension::Chunk(1)))
    ));

    tx.unbounded_send(Ok(Node::text("b"))).unwrap();
    drop(tx);
    let value = response.wait_for(|r| r.materialize_root()).await.unwrap();
    assert_eq!(value, json!({"feed": ["a", "b"]}));
    assert_eq!(response.read_parts(1).unwrap().len(), 2);
}

#[tokio::test]
async fn test_nested_deferred_chunks_resolve_transitively() {
    let gate = Gate::new();
    let inner = gated(&gate, "leaf");
    let root = Node::map([(
        "outer",
        Node::future(async move { Ok(Node::map([("inner", inner)])) }),
    )]);
    let stream = render(root, ClientManifest::new(), RenderOptions::new());
    let mut response = connect(stream, NoModules);

    let outer = response
        .wait_for(|r| {
            let root = r.read_root()?;
            let outer = r.read(root.get("outer").unwrap_or(&Model::Null))?;
            Ok(outer.get("inner").cloned())
        })
        .await
        .unwrap();
    assert!(matches!(outer, Some(Model::Ref(_))));

    gate.open();
    let value = response.wait_for(|r| r.materialize_root()).await.unwrap();
    assert_eq!(value, json!({"outer": {"inner": "leaf"}}));
}
