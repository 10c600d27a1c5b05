//! Integration tests against a hand-driven peer speaking raw NDJSON

use acplink_core::error::codes;
use acplink_core::{Connection, ConnectionConfig, RpcError, Transport};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

struct RawPeer {
    lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn next(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("peer read timed out")
            .unwrap()
            .expect("connection closed the stream");
        serde_json::from_str(&line).unwrap()
    }
}

fn raw_pair(config: ConnectionConfig) -> (Connection, RawPeer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let conn = Connection::builder(Transport::from_streams(
        local_read,
        local_write,
        config.max_line_bytes,
    ))
    .config(config)
    .raw_method("echo", |_conn, params| async move { Ok(params.unwrap_or(Value::Null)) })
    .method("slow", |_conn, ms: u64| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ms)
    })
    .start();

    let peer = RawPeer {
        lines: BufReader::new(remote_read).lines(),
        writer: remote_write,
    };
    (conn, peer)
}

#[tokio::test]
async fn test_malformed_lines_are_skipped() {
    let (_conn, mut peer) = raw_pair(ConnectionConfig::default());

    peer.send("this is not json").await;
    peer.send("").await;
    peer.send(r#"{"jsonrpc":"2.0","id":"abc","method":"echo","params":[1,2]}"#)
        .await;

    let reply = peer.next().await;
    assert_eq!(reply["jsonrpc"], "2.0");
    assert_eq!(reply["id"], "abc");
    assert_eq!(reply["result"], json!([1, 2]));
    assert!(reply.get("error").is_none());
}

#[tokio::test]
async fn test_undecodable_request_with_id_gets_invalid_request() {
    let (conn, mut peer) = raw_pair(ConnectionConfig::default());

    peer.send(r#"{"jsonrpc":"2.0","id":9,"method":5}"#).await;
    let reply = peer.next().await;
    assert_eq!(reply["id"], 9);
    assert_eq!(reply["error"]["code"], codes::INVALID_REQUEST);
    assert!(reply.get("result").is_none());

    // The connection keeps serving afterwards.
    peer.send(r#"{"jsonrpc":"2.0","id":10,"method":"echo","params":"still here"}"#)
        .await;
    let reply = peer.next().await;
    assert_eq!(reply["id"], 10);
    assert_eq!(reply["result"], "still here");
    assert!(!conn.is_done());
}

#[tokio::test]
async fn test_outgoing_frames_are_single_lines() {
    let (conn, mut peer) = raw_pair(ConnectionConfig::default());

    conn.notify("session/update", json!({ "text": "line one\nline two" }))
        .unwrap();
    let frame = peer.next().await;
    assert_eq!(frame["method"], "session/update");
    assert_eq!(frame["params"]["text"], "line one\nline two");
    assert!(frame.get("id").is_none());

    let caller = conn.clone();
    let call = tokio::spawn(async move { caller.call::<_, Value>("fs/read", json!("a.txt")).await });
    let request = peer.next().await;
    assert_eq!(request["method"], "fs/read");
    let id = request["id"].clone();

    peer.send(&json!({ "jsonrpc": "2.0", "id": id, "result": "contents" }).to_string())
        .await;
    assert_eq!(call.await.unwrap().unwrap(), json!("contents"));
}

#[tokio::test]
async fn test_peer_error_response_surfaces_as_protocol_error() {
    let (conn, mut peer) = raw_pair(ConnectionConfig::default());

    let caller = conn.clone();
    let call = tokio::spawn(async move { caller.call::<_, Value>("fs/write", json!({})).await });
    let request = peer.next().await;

    peer.send(
        &json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": { "code": codes::FORBIDDEN, "message": "Forbidden", "data": "read-only" }
        })
        .to_string(),
    )
    .await;

    let err = call.await.unwrap().unwrap_err();
    let protocol = err.protocol_error().expect("protocol error");
    assert_eq!(protocol.code, codes::FORBIDDEN);
    assert_eq!(protocol.data, Some(json!("read-only")));
}

#[tokio::test]
async fn test_full_inbound_queue_answers_too_many_requests() {
    let config = ConnectionConfig {
        inbound_buffer: 1,
        ..ConnectionConfig::default()
    };
    let (_conn, mut peer) = raw_pair(config);

    for id in 0..5 {
        peer.send(&json!({ "jsonrpc": "2.0", "id": id, "method": "slow", "params": 200 }).to_string())
            .await;
    }

    let mut ok = 0;
    let mut rejected = 0;
    for _ in 0..5 {
        let reply = peer.next().await;
        if reply.get("result").is_some() {
            ok += 1;
        } else if reply["error"]["code"] == codes::TOO_MANY_REQUESTS {
            rejected += 1;
        }
    }
    assert_eq!(ok + rejected, 5);
    assert!(ok >= 1);
    assert!(rejected >= 1);
}

#[tokio::test]
async fn test_peer_eof_resolves_wait() {
    let (conn, peer) = raw_pair(ConnectionConfig::default());
    drop(peer);

    let waited = tokio::time::timeout(Duration::from_secs(5), conn.wait())
        .await
        .unwrap();
    let reason = match waited {
        Err(RpcError::Disconnected { reason }) => reason,
        other => panic!("expected a disconnect, got {:?}", other),
    };
    assert_eq!(conn.disconnect_reason(), Some(reason));
    assert!(conn.is_done());
    assert!(!conn.is_closed());
    let err = conn.call::<_, Value>("echo", json!(1)).await.unwrap_err();
    assert!(matches!(err, RpcError::Disconnected { .. } | RpcError::Transport { .. }));
    conn.close().await.ok();
}
