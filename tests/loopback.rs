//! End-to-end scenarios: two (or more) cores handshaking over the TCP
//! bridge, with components driving them through the middleware API.

mod common;

use common::{eventually, spawn_node};
use serde_json::json;
use tokio::sync::mpsc;

/// A mapped source delivers every message, in order, to the remote sink.
#[tokio::test]
async fn source_to_sink_in_order() {
    let receiver = spawn_node("receiver_cpt").await;
    let sender = spawn_node("sender_cpt").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sink = receiver
        .mw
        .sink("ep_sink")
        .description("example snk endpoint")
        .handler(move |msg| {
            let _ = tx.send(msg.body["value"].as_i64().unwrap_or(-1));
        })
        .register()
        .await
        .unwrap();

    let source = sender
        .mw
        .source("ep_source")
        .description("example src endpoint")
        .message_schema(json!({"type": "object"}))
        .register()
        .await
        .unwrap();

    let handle = source
        .map(&receiver.addr, r#"["ep_name = 'ep_sink'"]"#, "")
        .await
        .unwrap();
    assert!(handle >= 0, "map failed with {handle}");

    let total: i64 = 500;
    for v in 0..total {
        source
            .send_message(&json!({"value": v, "date": "today"}))
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    while received.len() < total as usize {
        match tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv()).await {
            Ok(Some(v)) => received.push(v),
            _ => break,
        }
    }
    assert_eq!(received.len(), total as usize);
    assert!(
        received.iter().copied().eq(0..total),
        "messages arrived out of order"
    );
}

/// Blocking request obtains the peer's terminal response and the
/// correlation entry is retired.
#[tokio::test]
async fn blocking_request_round_trip() {
    let server = spawn_node("ping_server").await;
    let client = spawn_node("ping_client").await;

    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel();
    let responder = server
        .mw
        .responder("ep_pong")
        .handler(move |msg| {
            let _ = resp_tx.send((msg.msg_id.clone(), msg.body.clone()));
        })
        .register()
        .await
        .unwrap();

    // Answer each request from a task of its own; the handler itself
    // must not block.
    let responder_clone = responder.clone();
    tokio::spawn(async move {
        while let Some((req_id, body)) = resp_rx.recv().await {
            assert_eq!(body, json!("ping"));
            responder_clone
                .send_last_response(&req_id, &json!("pong"))
                .await
                .unwrap();
        }
    });

    let requester = client.mw.requester("ep_ping").register().await.unwrap();
    assert!(requester.queuing(), "no handler means pull mode");
    let handle = requester
        .map(&server.addr, r#"["ep_name = 'ep_pong'"]"#, "")
        .await
        .unwrap();
    assert!(handle >= 0);

    let reply = requester
        .send_request_blocking(&json!("ping"))
        .await
        .unwrap()
        .expect("response should arrive");
    assert_eq!(reply.body, json!("pong"));
    assert_eq!(reply.status, commux::Status::RespLast);

    // Nothing left queued for that exchange.
    assert_eq!(requester.more_requests().await.unwrap(), 0);
}

/// A response stream of k parts plus the terminal part arrives in order.
#[tokio::test]
async fn response_stream_correlation() {
    let server = spawn_node("stream_server").await;
    let client = spawn_node("stream_client").await;

    let (req_tx, mut req_rx) = mpsc::unbounded_channel();
    let responder = server
        .mw
        .responder("ep_counter")
        .handler(move |msg| {
            let _ = req_tx.send(msg.msg_id.clone());
        })
        .register()
        .await
        .unwrap();

    let responder_clone = responder.clone();
    tokio::spawn(async move {
        while let Some(req_id) = req_rx.recv().await {
            for i in 0..3 {
                responder_clone
                    .send_response(&req_id, &json!({"part": i}))
                    .await
                    .unwrap();
            }
            responder_clone
                .send_last_response(&req_id, &json!({"part": 3}))
                .await
                .unwrap();
        }
    });

    let requester = client.mw.requester("ep_asker").register().await.unwrap();
    let handle = requester
        .map(&server.addr, r#"["ep_name = 'ep_counter'"]"#, "")
        .await
        .unwrap();
    assert!(handle >= 0);

    let req_id = requester.send_request(&json!("count")).await.unwrap();
    for expected in 0..4 {
        let part = requester
            .fetch_response(&req_id)
            .await
            .unwrap()
            .expect("response part");
        assert_eq!(part.body["part"], json!(expected));
        if expected == 3 {
            assert_eq!(part.status, commux::Status::RespLast);
        } else {
            assert_eq!(part.status, commux::Status::RespNext);
        }
    }
    assert_eq!(requester.more_responses(&req_id).await.unwrap(), 0);
}

/// Filters drop non-matching bodies silently.
#[tokio::test]
async fn filters_admit_only_matching_values() {
    let receiver = spawn_node("filter_receiver").await;
    let sender = spawn_node("filter_sender").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = receiver
        .mw
        .sink("ep_filtered")
        .handler(move |msg| {
            let _ = tx.send(msg.body["value"].as_i64().unwrap_or(i64::MIN));
        })
        .register()
        .await
        .unwrap();
    sink.add_filter("value > 10").await.unwrap();

    let source = sender.mw.source("ep_values").register().await.unwrap();
    let handle = source
        .map(&receiver.addr, r#"["ep_name = 'ep_filtered'"]"#, "")
        .await
        .unwrap();
    assert!(handle >= 0);

    for v in [1, 15, 100] {
        source.send_message(&json!({"value": v})).await.unwrap();
    }
    // A sentinel that passes the filter marks the end of the burst.
    source.send_message(&json!({"value": 9999})).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let v = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("sentinel should arrive")
            .expect("channel open");
        if v == 9999 {
            break;
        }
        seen.push(v);
    }
    assert_eq!(seen, vec![15, 100]);
}

/// unmap_all tears down every mapping and reports the count; unmapping
/// an unknown address is a harmless 0.
#[tokio::test]
async fn unmap_all_and_idempotence() {
    let a = spawn_node("peer_a").await;
    let b = spawn_node("peer_b").await;
    let c = spawn_node("peer_c").await;
    let sender = spawn_node("fanout_sender").await;

    for node in [&a, &b, &c] {
        let _sink = node
            .mw
            .sink("ep_fan_sink")
            .handler(|_| {})
            .register()
            .await
            .unwrap();
    }

    let source = sender.mw.source("ep_fan").register().await.unwrap();
    for node in [&a, &b, &c] {
        let handle = source
            .map(&node.addr, r#"["ep_name = 'ep_fan_sink'"]"#, "")
            .await
            .unwrap();
        assert!(handle >= 0);
    }
    let conns = source.connections().await.unwrap();
    assert_eq!(conns["all_mappings"].as_array().unwrap().len(), 3);

    // Unmapping an address that was never mapped: 0, no side effects.
    assert_eq!(source.unmap("203.0.113.1:9").await.unwrap(), 0);

    assert_eq!(source.unmap_all().await.unwrap(), 3);
    assert!(
        eventually(|| async {
            let conns = source.connections().await.unwrap();
            conns["all_mappings"].as_array().unwrap().is_empty()
        })
        .await,
        "mappings should drain after unmap_all"
    );
}

/// Mapping the same (endpoint, address, transport) triple twice
/// replaces the previous mapping.
#[tokio::test]
async fn double_map_replaces() {
    let receiver = spawn_node("dm_receiver").await;
    let sender = spawn_node("dm_sender").await;

    let _sink = receiver
        .mw
        .sink("ep_dm_sink")
        .handler(|_| {})
        .register()
        .await
        .unwrap();
    let source = sender.mw.source("ep_dm").register().await.unwrap();

    let first = source
        .map(&receiver.addr, r#"["ep_name = 'ep_dm_sink'"]"#, "")
        .await
        .unwrap();
    assert!(first >= 0);
    let second = source
        .map(&receiver.addr, r#"["ep_name = 'ep_dm_sink'"]"#, "")
        .await
        .unwrap();
    assert!(second >= 0);
    assert_ne!(first, second);

    let conns = source.connections().await.unwrap();
    let mappings = conns["all_mappings"].as_array().unwrap();
    assert_eq!(mappings.len(), 1, "re-map must replace, not accumulate");
    assert_eq!(mappings[0]["handle"], json!(second));
}

/// A MAP whose query matches nothing is refused and reported as a
/// transport-level failure to the caller.
#[tokio::test]
async fn map_query_with_no_match_fails() {
    let receiver = spawn_node("nm_receiver").await;
    let sender = spawn_node("nm_sender").await;

    let _sink = receiver
        .mw
        .sink("ep_real")
        .handler(|_| {})
        .register()
        .await
        .unwrap();
    let source = sender.mw.source("ep_probe").register().await.unwrap();

    let code = source
        .map(&receiver.addr, r#"["ep_name = 'ep_imaginary'"]"#, "")
        .await
        .unwrap();
    assert_eq!(code, -1);
    let conns = source.connections().await.unwrap();
    assert!(conns["all_mappings"].as_array().unwrap().is_empty());
}

/// Mapping to an address nobody listens on reports -1; mapping with an
/// unknown endpoint id reports -2.
#[tokio::test]
async fn map_error_codes() {
    let node = spawn_node("err_node").await;
    let source = node.mw.source("ep_err").register().await.unwrap();

    // Find a port that is very likely closed.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = probe.local_addr().unwrap().to_string();
    drop(probe);

    assert_eq!(source.map(&dead_addr, "", "").await.unwrap(), -1);
    assert_eq!(source.map("", "", "").await.unwrap(), -2);
    assert_eq!(source.divert("nope", "127.0.0.1:1", "other").await.unwrap(), -2);
}

/// The manifest lists registered endpoints and merges add_manifest data.
#[tokio::test]
async fn manifest_reflects_endpoints() {
    let node = spawn_node("manifest_cpt").await;
    let _ep = node
        .mw
        .source("ep_described")
        .description("a described endpoint")
        .register()
        .await
        .unwrap();
    node.mw
        .add_manifest(&json!({"location": "lab"}))
        .await
        .unwrap();

    assert!(
        eventually(|| async {
            let manifest = node.mw.get_manifest().await.unwrap();
            manifest.is_some_and(|m| {
                let v: serde_json::Value = serde_json::from_str(&m).unwrap();
                v["app_name"] == json!("manifest_cpt")
                    && v["location"] == json!("lab")
                    && v["endpoints"]
                        .as_array()
                        .is_some_and(|eps| eps.iter().any(|e| e["ep_name"] == json!("ep_described")))
            })
        })
        .await,
        "manifest should list the endpoint and merged data"
    );
}

/// Access sets drop peers whose authenticated subject is not admitted.
#[tokio::test]
async fn access_set_drops_unknown_subjects() {
    let receiver = spawn_node("acl_receiver").await;
    let sender = spawn_node("acl_sender").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = receiver
        .mw
        .sink("ep_guarded")
        .handler(move |msg| {
            let _ = tx.send(msg.body["value"].as_i64().unwrap_or(-1));
        })
        .register()
        .await
        .unwrap();
    // Only a subject nobody authenticates as.
    sink.set_access("somebody_else").await.unwrap();

    let source = sender.mw.source("ep_acl_src").register().await.unwrap();
    let handle = source
        .map(&receiver.addr, r#"["ep_name = 'ep_guarded'"]"#, "")
        .await
        .unwrap();
    assert!(handle >= 0);

    source.send_message(&json!({"value": 1})).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    // Admit the sender and verify delivery resumes.
    sink.set_access("acl_sender").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    source.send_message(&json!({"value": 2})).await.unwrap();

    let first = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("admitted message should arrive")
        .unwrap();
    assert_eq!(first, 2, "the denied message must not be delivered");
}

/// Orderly terminate: the core stops with exit code 0 semantics (its
/// loop ends and the channel closes).
#[tokio::test]
async fn terminate_stops_the_core() {
    let node = spawn_node("term_cpt").await;
    node.mw.terminate().await.unwrap();
    assert!(
        eventually(|| async { node.cancel.is_cancelled() }).await,
        "terminate should stop the core loop"
    );
}
