//! Stream endpoints: raw bytes through a byte-pipe, bypassing the JSON
//! router.

mod common;

use common::spawn_node;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

#[tokio::test]
async fn ten_thousand_bytes_in_order() {
    let receiver = spawn_node("stream_rx").await;
    let sender = spawn_node("stream_tx").await;

    let (bytes_tx, mut bytes_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();

    let _sink = receiver
        .mw
        .stream_sink("byte_sink")
        .handler(move |msg| {
            let command = msg.body.get("command").and_then(|v| v.as_i64());
            if command == Some(1) {
                let Some(path) = msg
                    .body
                    .get("pipe")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                else {
                    return;
                };
                let tx = bytes_tx.clone();
                let done = done_tx.clone();
                tokio::spawn(async move {
                    let mut pipe = commux::api::open_byte_pipe(&path).await.unwrap();
                    let mut buf = [0u8; 4096];
                    loop {
                        match pipe.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                let _ = tx.send(buf[..n].to_vec());
                            }
                        }
                    }
                    let _ = done.send(());
                });
            }
        })
        .register()
        .await
        .unwrap();

    let source = sender
        .mw
        .stream_source("byte_source")
        .register()
        .await
        .unwrap();
    let handle = source
        .map(&receiver.addr, r#"["ep_name = 'byte_sink'"]"#, "")
        .await
        .unwrap();
    assert!(handle >= 0);

    // 10 000 bytes of a recognisable rolling pattern, sent in ten slabs.
    let payload: String = (0..10_000)
        .map(|i| char::from(b'a' + (i % 26) as u8))
        .collect();
    source.start_stream().await.unwrap();
    for slab in payload.as_bytes().chunks(1_000) {
        source
            .send_stream(std::str::from_utf8(slab).unwrap())
            .await
            .unwrap();
    }
    source.stop_stream().await.unwrap();

    // The pipe closes after the last byte; wait for reader EOF.
    tokio::time::timeout(std::time::Duration::from_secs(10), done_rx.recv())
        .await
        .expect("pipe should close after stop_stream")
        .expect("reader task should finish");

    let mut received = Vec::new();
    while let Ok(chunk) = bytes_rx.try_recv() {
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received.len(), 10_000);
    assert_eq!(received, payload.as_bytes());
}
