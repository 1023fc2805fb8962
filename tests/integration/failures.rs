use std::time::Duration;

use serde_json::json;

use trellis_core::{ClientManifest, Model};
use trellis_stream::{render, Node, NoModules, Produce, ReadError, RenderOptions};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Production errors, abort, and broken streams
// ══════════════════════════════════════════════════════════════════════════════

fn chunk_message(result: Result<&Model, ReadError>) -> String {
    match result {
        Err(ReadError::Chunk(e)) => e.message,
        other => panic!("expected a chunk error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failing_sibling_does_not_affect_the_other() {
    let log = ErrorLog::default();
    let root = Node::map([
        ("a", Node::future(async { Err(anyhow::anyhow!("boom")) })),
        ("b", Node::future(async { Ok(Node::text("fine")) })),
    ]);
    let mut response = connect(render(root, ClientManifest::new(), log.options()), NoModules);
    response.run_to_end().await.unwrap();

    let root = response.read_root().unwrap();
    match response.read(root.get("a").unwrap()) {
        Err(ReadError::Chunk(e)) => {
            assert_eq!(e.message, "boom");
            assert_eq!(e.digest.as_deref().map(str::len), Some(16));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(response.read(root.get("b").unwrap()).unwrap().as_str(), Some("fine"));
    assert_eq!(log.calls(), vec![("boom".to_string(), vec![1])]);
}

#[tokio::test]
async fn test_synchronous_failure_errors_the_root() {
    let root = Node::map([("bad", Node::lazy(|| Produce::fail(anyhow::anyhow!("cannot start"))))]);
    let state = read_all(&render_bytes(root, ClientManifest::new(), RenderOptions::new()).await);
    assert_eq!(chunk_message(state.read_root()), "cannot start");
}

#[tokio::test]
async fn test_abort_errors_every_pending_chunk_with_the_reason() {
    let log = ErrorLog::default();
    let never = Gate::new();
    let root = Node::map([
        ("done", Node::text("ok")),
        ("a", gated(&never, "unreachable")),
        ("b", Node::future(std::future::pending::<anyhow::Result<Node>>())),
    ]);
    let stream = render(root, ClientManifest::new(), log.options());
    let handle = stream.abort_handle();
    let mut response = connect(stream, NoModules);

    response.wait_for(|r| r.read_root().map(|_| ())).await.unwrap();
    handle.abort("for reasons");

    match response.wait_for(|r| r.materialize_root()).await {
        Err(ReadError::Chunk(e)) => assert_eq!(e.message, "for reasons"),
        other => panic!("unexpected {other:?}"),
    }
    response.run_to_end().await.unwrap();

    let root = response.read_root().unwrap();
    assert_eq!(root.get("done").and_then(Model::as_str), Some("ok"));
    for key in ["a", "b"] {
        assert_eq!(chunk_message(response.read(root.get(key).unwrap())), "for reasons");
    }
    assert_eq!(log.calls(), vec![("for reasons".to_string(), vec![1, 2])]);

    // Already finished.
    handle.abort("second time");
}

#[tokio::test]
async fn test_abort_reason_is_never_redacted() {
    let root = Node::future(std::future::pending::<anyhow::Result<Node>>());
    let stream = render(root, ClientManifest::new(), RenderOptions::new().redact_errors(true));
    stream.abort("shutting down");
    let state = read_all(&stream.into_bytes().await);
    assert_eq!(chunk_message(state.read_root()), "shutting down");
}

#[tokio::test]
async fn test_redacted_errors_keep_their_digest() {
    let failing = || Node::future(async { Err(anyhow::anyhow!("db password rejected")) });

    let plain = render_bytes(failing(), ClientManifest::new(), RenderOptions::new()).await;
    let plain = read_all(&plain);
    let redact = RenderOptions::new().redact_errors(true);
    let redacted = read_all(&render_bytes(failing(), ClientManifest::new(), redact).await);

    let (Err(ReadError::Chunk(plain)), Err(ReadError::Chunk(redacted))) =
        (plain.read_root(), redacted.read_root())
    else {
        panic!("both roots should be errored");
    };
    assert_eq!(plain.message, "db password rejected");
    assert_eq!(redacted.message, trellis_stream::writer::REDACTED_MESSAGE);
    assert!(redacted.stack.is_none());
    assert_eq!(plain.digest, redacted.digest);
}

#[tokio::test]
async fn test_premature_end_rejects_pending_chunks() {
    let source: &[u8] = b"0:J{\"ready\":1,\"later\":\"$1\"}\n";
    let mut response = trellis_stream::open(source, NoModules);

    match response.wait_for(|r| r.materialize_root()).await {
        Err(ReadError::Chunk(e)) => assert_eq!(e.message, "stream closed early"),
        other => panic!("unexpected {other:?}"),
    }
    let root = response.read_root().unwrap();
    assert_eq!(root.get("ready").and_then(Model::as_i64), Some(1));
    assert_eq!(chunk_message(response.read(&Model::Ref(9))), "stream closed early");
}

#[tokio::test]
async fn test_malformed_row_fails_everything_outstanding() {
    let source: &[u8] = b"0:J[\"$1\",\"$2\"]\n1:J\"fine\"\nnot a row\n2:J\"lost\"\n";
    let mut response = trellis_stream::open(source, NoModules);
    response.run_to_end().await.unwrap();

    let root = response.read_root().unwrap();
    assert_eq!(response.read(root.at(0).unwrap()).unwrap().as_str(), Some("fine"));
    let message = chunk_message(response.read(root.at(1).unwrap()));
    assert!(message.starts_with("malformed stream: "), "{message}");
    assert_eq!(
        response.materialize(root.at(0).unwrap()).unwrap(),
        json!("fine")
    );
}

// ══════════════════════════════════════════════════════════════════════════════
//  Failures partway through a walk
// ══════════════════════════════════════════════════════════════════════════════

fn never() -> Node {
    Node::future(std::future::pending::<anyhow::Result<Node>>())
}

fn fails_with(message: &'static str) -> Node {
    Node::lazy(move || Produce::Fail(anyhow::anyhow!(message)))
}

#[tokio::test]
async fn test_root_failure_after_starting_deferred_siblings() {
    let log = ErrorLog::default();
    let root = Node::map([
        ("a", never()),
        ("b", Node::future(async { Ok(Node::text("unreachable")) })),
        ("c", fails_with("walk broke")),
    ]);
    let bytes =
        render_within(Duration::from_secs(5), root, ClientManifest::new(), log.options()).await;
    assert_well_formed(&bytes);

    let state = read_all(&bytes);
    assert_eq!(chunk_message(state.read_root()), "walk broke");
    assert_eq!(state.chunks().ids(), vec![0]);
    assert_eq!(log.calls(), vec![("walk broke".to_string(), vec![0])]);
}

#[tokio::test]
async fn test_failure_inside_a_deferred_result() {
    let root = Node::map([
        (
            "outer",
            Node::future(async {
                Ok(Node::map([("x", never()), ("y", fails_with("inner boom"))]))
            }),
        ),
        ("ok", Node::text("still here")),
    ]);
    let bytes =
        render_within(Duration::from_secs(5), root, ClientManifest::new(), RenderOptions::new())
            .await;
    assert_well_formed(&bytes);

    let state = read_all(&bytes);
    let root = state.read_root().unwrap();
    assert_eq!(state.read(root.get("ok").unwrap()).unwrap().as_str(), Some("still here"));
    assert_eq!(chunk_message(state.read(root.get("outer").unwrap())), "inner boom");
    assert!(state.pending_ids().is_empty());
}

#[tokio::test]
async fn test_failure_inside_a_stream_item() {
    let items = futures::stream::iter(vec![
        Ok(Node::text("first")),
        Ok(Node::map([("x", never()), ("y", fails_with("item boom"))])),
        Ok(Node::text("never sent")),
    ]);
    let root = Node::map([("feed", Node::stream(items))]);
    let bytes =
        render_within(Duration::from_secs(5), root, ClientManifest::new(), RenderOptions::new())
            .await;
    assert_well_formed(&bytes);

    let state = read_all(&bytes);
    let root = state.read_root().unwrap();
    let feed = root.get("feed").unwrap();
    assert_eq!(chunk_message(state.read(feed)), "item boom");
}
