use serde_json::json;

use trellis_core::{ClientManifest, Model};
use trellis_stream::{Node, RenderOptions, ResponseState};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Round trips
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_plain_tree_round_trips() {
    let root = Node::from(json!({"a": 1, "b": [2, 3]}));
    let bytes = render_bytes(root, ClientManifest::new(), RenderOptions::new()).await;
    assert_eq!(bytes, b"0:J{\"a\":1,\"b\":[2,3]}\n");

    let state = read_all(&bytes);
    assert_eq!(state.materialize_root().unwrap(), json!({"a": 1, "b": [2, 3]}));
}

#[tokio::test]
async fn test_sentinel_lookalike_strings_survive() {
    let root = Node::map([
        ("a", Node::text("$1")),
        ("b", Node::text("@div")),
        ("c", Node::text("$$")),
        ("d", Node::text("plain $ inside")),
    ]);
    let bytes = render_bytes(root, ClientManifest::new(), RenderOptions::new()).await;
    let state = read_all(&bytes);
    assert_eq!(
        state.materialize_root().unwrap(),
        json!({"a": "$1", "b": "@div", "c": "$$", "d": "plain $ inside"})
    );
    let root = state.read_root().unwrap();
    assert_eq!(root.get("a"), Some(&Model::Text("$1".to_string())));
}

#[tokio::test]
async fn test_every_fragmentation_decodes_identically() {
    let root = Node::map([
        ("text", Node::text("line one\nline two")),
        ("later", Node::future(async { Ok(Node::list([Node::from(1i64), Node::from("$x")])) })),
    ]);
    let bytes = render_bytes(root, ClientManifest::new(), RenderOptions::new()).await;
    let expected = read_all(&bytes).materialize_root().unwrap();

    for split in 0..=bytes.len() {
        let mut state = ResponseState::new();
        state.process_bytes(&bytes[..split]);
        state.process_bytes(&bytes[split..]);
        state.close();
        assert_eq!(state.materialize_root().unwrap(), expected, "split at {split}");
    }

    let mut state = ResponseState::new();
    for byte in &bytes {
        state.process_bytes(std::slice::from_ref(byte));
    }
    state.close();
    assert_eq!(state.materialize_root().unwrap(), expected);
}

#[tokio::test]
async fn test_row_order_does_not_change_the_result() {
    let root = Node::map([
        (
            "x",
            Node::future(async {
                Ok(Node::map([("y", Node::future(async { Ok(Node::text("deep")) }))]))
            }),
        ),
        ("z", Node::future(async { Ok(Node::from(true)) })),
    ]);
    let bytes = render_bytes(root, ClientManifest::new(), RenderOptions::new()).await;
    let rows = split_rows(&bytes);
    assert!(rows.len() >= 4);

    let forward = read_all(&bytes).materialize_root().unwrap();
    let mut state = ResponseState::new();
    for row in rows.iter().rev() {
        state.process_bytes(row);
    }
    state.close();
    assert_eq!(state.materialize_root().unwrap(), forward);
    assert_eq!(forward, json!({"x": {"y": "deep"}, "z": true}));
}

#[tokio::test]
async fn test_reads_through_a_reference_are_pointer_equal() {
    let root = Node::map([("later", Node::future(async { Ok(Node::from(json!({"k": [1, 2]}))) }))]);
    let stream = trellis_stream::render(root, ClientManifest::new(), RenderOptions::new());
    let mut response = connect(stream, trellis_stream::NoModules);
    response.run_to_end().await.unwrap();

    let root = response.read_root().unwrap();
    let binding = root.get("later").unwrap();
    let first = response.read(binding).unwrap();
    let second = response.read(binding).unwrap();
    assert!(std::ptr::eq(first, second));
    assert_eq!(first.get("k").and_then(|k| k.at(1)).and_then(Model::as_i64), Some(2));
}
