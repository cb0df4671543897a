//! Router: inbound endpoint traffic.
//!
//! Operational messages route to the connection's local endpoint. Stream
//! sinks with an open byte-pipe get raw bytes; everything else passes the
//! endpoint's filter list and access set, then is either pushed to the
//! component (delivery frame) or queued for a later fetch, releasing any
//! parked fetch waiter. Request/response correlation lives here too: an
//! inbound REQ records its origin so responses can be routed back, and a
//! RESP_LAST retires the pending entry.

use bytes::Bytes;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{ReturnKind, encode_delivery};
use crate::error::{Error, Result};
use crate::message::{Message, Status, random_token};
use crate::observability;
use crate::predicate::matches_all;

use super::Core;
use super::state::{ConnKey, ConnState};

/// Chunk size for byte-pipe writes.
pub const STREAM_CHUNK_SIZE: usize = 500;

/// A local byte-pipe backing a stream endpoint: a Unix listener at a
/// random path the component connects to and reads raw bytes from.
#[derive(Debug)]
pub struct BytePipe {
    pub path: String,
    tx: mpsc::Sender<Bytes>,
    token: CancellationToken,
}

impl BytePipe {
    /// Binds a fresh pipe and starts its pump task.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket cannot be bound.
    pub fn open() -> Result<Self> {
        let path = std::env::temp_dir()
            .join(format!("commux-pipe-{}.sock", random_token(8)))
            .to_string_lossy()
            .into_owned();
        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::Transport(format!("byte pipe bind {path}: {e}")))?;
        let (tx, rx) = mpsc::channel::<Bytes>(256);
        let token = CancellationToken::new();
        tokio::spawn(pump(listener, rx, token.clone(), path.clone()));
        Ok(Self { path, tx, token })
    }

    /// Writes data into the pipe in fixed-size chunks; every chunk is
    /// written in full before the next starts.
    pub async fn write(&self, data: &[u8]) {
        for chunk in data.chunks(STREAM_CHUNK_SIZE) {
            if self.tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                warn!(path = %self.path, "byte pipe is gone");
                return;
            }
        }
        observability::record_stream_bytes(data.len() as u64);
    }

    /// Closes the pipe; the pump drains what it already accepted.
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for BytePipe {
    fn drop(&mut self) {
        self.token.cancel();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn pump(
    listener: UnixListener,
    mut rx: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    path: String,
) {
    let mut stream = tokio::select! {
        () = token.cancelled() => {
            let _ = std::fs::remove_file(&path);
            return;
        }
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(%path, error = %e, "byte pipe accept failed");
                return;
            }
        },
    };
    // Drain everything already accepted, even past a close: the sender
    // side dropping closes the channel and ends the loop.
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = stream.write_all(&chunk).await {
            warn!(%path, error = %e, "byte pipe write failed");
            break;
        }
    }
    let _ = stream.shutdown().await;
    let _ = std::fs::remove_file(&path);
}

/// What routing decided to do with an inbound message.
enum RouteAction {
    Drop,
    Push(Message),
    Queued,
    Release(String, Message),
}

impl Core {
    /// Handles a message on an operational (post-handshake) connection.
    pub(crate) async fn handle_operational_message(&mut self, key: &ConnKey, msg: Message) {
        let state = match self.conns.get(key) {
            Some(conn) => conn.state,
            None => return,
        };
        match msg.status {
            Status::Map if state == ConnState::Map => self.handle_map(key, msg).await,
            Status::MapAck if state == ConnState::MapAck => self.handle_map_ack(key, msg).await,
            Status::Unmap => self.handle_unmap(key, msg).await,
            Status::UnmapAck => self.handle_unmap_ack(key).await,
            Status::Msg | Status::Req | Status::RespNext | Status::RespLast
                if state == ConnState::ExtMsg =>
            {
                self.route_inbound(key, msg).await;
            }
            Status::Stream => self.handle_stream(key, &msg).await,
            Status::StreamCmd => self.handle_stream_cmd(key, msg).await,
            other => {
                debug!(?key, status = %other, ?state, "message dropped");
            }
        }
    }

    /// Routes MSG/REQ/RESP traffic to the connection's local endpoint.
    async fn route_inbound(&mut self, key: &ConnKey, mut msg: Message) {
        let (lep_id, subject) = match self.conns.get(key) {
            Some(conn) => (conn.lep.clone(), conn.peer_subject.clone()),
            None => return,
        };
        let Some(lep_id) = lep_id else {
            debug!(?key, "message on unmapped connection");
            return;
        };

        // Responses must correlate with a request we actually sent; a
        // RESP_NEXT arriving after RESP_LAST finds no entry and is dropped.
        if matches!(msg.status, Status::RespNext | Status::RespLast)
            && !self.pending_responses.contains_key(&msg.msg_id)
        {
            debug!(?key, msg_id = %msg.msg_id, "uncorrelated response dropped");
            return;
        }

        msg.ep_id = Some(lep_id.clone());
        msg.module = Some(key.0.clone());
        msg.conn = Some(key.1);

        let status = msg.status;
        let msg_id = msg.msg_id.clone();
        let action = {
            let Some(lep) = self.registry.get_mut(&lep_id) else {
                debug!(?key, %lep_id, "message for unknown endpoint");
                return;
            };

            if !matches_all(&lep.filters, &msg.body) {
                observability::record_filtered();
                RouteAction::Drop
            } else if !lep.access.is_empty()
                && !subject.as_deref().is_some_and(|s| lep.access.contains(s))
            {
                observability::record_access_denied();
                RouteAction::Drop
            } else if !lep.decl.queuing {
                RouteAction::Push(msg)
            } else {
                let queue = match status {
                    Status::Req => &mut lep.requests,
                    Status::RespNext | Status::RespLast => {
                        let req_id = msg.msg_id.clone();
                        lep.responses_for(&req_id)
                    }
                    _ => &mut lep.messages,
                };
                match queue.push(msg) {
                    Some((waiter, msg)) => RouteAction::Release(waiter, msg),
                    None => RouteAction::Queued,
                }
            }
        };

        if !matches!(action, RouteAction::Drop) {
            self.correlate(key, status, &msg_id);
            observability::record_routed(&status.to_string());
        }
        match action {
            RouteAction::Drop | RouteAction::Queued => {}
            RouteAction::Push(msg) => {
                self.deliver_to_component(&msg).await;
            }
            RouteAction::Release(waiter, msg) => {
                let payload = msg.to_string();
                self.reply_to_app(&waiter, ReturnKind::Msg, payload.as_bytes())
                    .await;
            }
        }
    }

    /// Updates the correlation tables for a routed message.
    fn correlate(&mut self, key: &ConnKey, status: Status, msg_id: &str) {
        match status {
            Status::Req => {
                self.request_origins
                    .insert(msg_id.to_string(), key.clone());
            }
            Status::RespLast => {
                self.pending_responses.remove(msg_id);
            }
            _ => {}
        }
    }

    /// Wraps a message in an `a`-tagged delivery frame for the component.
    pub(crate) async fn deliver_to_component(&self, msg: &Message) {
        let Some(ep_id) = msg.ep_id.as_deref() else {
            return;
        };
        let payload = msg.to_string();
        let frame = encode_delivery(ep_id, payload.as_bytes());
        self.send_to_app(&frame).await;
    }

    /// Inbound STREAM frame: raw bytes into the sink's byte-pipe,
    /// bypassing the JSON router.
    async fn handle_stream(&mut self, key: &ConnKey, msg: &Message) {
        let Some(lep_id) = self.conns.get(key).and_then(|c| c.lep.clone()) else {
            return;
        };
        let Some(lep) = self.registry.get(&lep_id) else {
            return;
        };
        if lep.decl.kind != super::EndpointKind::StreamSnk {
            debug!(?key, "STREAM for a non-sink endpoint");
            return;
        }
        let Some(data) = msg.body.get("stream").and_then(Value::as_str) else {
            return;
        };
        if let Some(pipe) = &lep.pipe {
            pipe.write(data.as_bytes()).await;
        }
    }

    /// Inbound STREAM_CMD: open (command 1) or close (command 0) the
    /// local byte-pipe, then tell the component where it lives.
    async fn handle_stream_cmd(&mut self, key: &ConnKey, msg: Message) {
        let Some(lep_id) = self.conns.get(key).and_then(|c| c.lep.clone()) else {
            return;
        };
        let command = msg.body.get("command").and_then(Value::as_i64).unwrap_or(-1);
        let notify = {
            let Some(lep) = self.registry.get_mut(&lep_id) else {
                return;
            };
            if !lep.decl.kind.is_stream() {
                debug!(?key, "STREAM_CMD for a non-stream endpoint");
                return;
            }
            match command {
                1 if lep.pipe.is_none() => match BytePipe::open() {
                    Ok(pipe) => {
                        let path = pipe.path.clone();
                        lep.pipe = Some(pipe);
                        Some(serde_json::json!({ "command": 1, "pipe": path }))
                    }
                    Err(e) => {
                        warn!(%lep_id, error = %e, "byte pipe open failed");
                        None
                    }
                },
                0 => {
                    if let Some(pipe) = lep.pipe.take() {
                        pipe.close();
                    }
                    Some(serde_json::json!({ "command": 0 }))
                }
                _ => None,
            }
        };
        if let Some(body) = notify {
            let mut out = Message::with_id(Status::StreamCmd, msg.msg_id, body);
            out.ep_id = Some(lep_id);
            self.deliver_to_component(&out).await;
        }
    }
}
