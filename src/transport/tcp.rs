//! TCP com module.
//!
//! Bridge transport between cores. Each connection splits into an owned
//! write half kept behind a mutex for on-demand sends, and a reader task
//! that forwards byte chunks into the core's event channel until EOF or
//! local close.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

use super::{ComEvent, ComModule, ConnId, READ_BUFFER_SIZE, unknown_conn};

/// TCP transport module.
#[derive(Clone)]
pub struct TcpModule {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    bridge: bool,
    events: mpsc::Sender<ComEvent>,
    writers: DashMap<ConnId, Arc<Mutex<OwnedWriteHalf>>>,
    tokens: DashMap<ConnId, CancellationToken>,
    next_conn: AtomicU64,
    shutdown: CancellationToken,
}

impl TcpModule {
    /// Creates the module feeding the given event channel.
    #[must_use]
    pub fn new(events: mpsc::Sender<ComEvent>) -> Self {
        Self::with_name("tcp", true, events)
    }

    /// Creates a named instance; `bridge` controls whether peers run the
    /// core handshake.
    #[must_use]
    pub fn with_name(name: &str, bridge: bool, events: mpsc::Sender<ComEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                bridge,
                events,
                writers: DashMap::new(),
                tokens: DashMap::new(),
                next_conn: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }
}

impl Inner {
    /// Installs the connection's writer; the reader must be spawned
    /// separately so an accept loop can announce the connection first
    /// (otherwise the peer's first bytes could outrun the Connected
    /// event).
    fn prepare(&self, stream: TcpStream) -> (ConnId, OwnedReadHalf, CancellationToken) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let token = self.shutdown.child_token();
        self.writers.insert(conn, Arc::new(Mutex::new(write_half)));
        self.tokens.insert(conn, token.clone());
        (conn, read_half, token)
    }

    fn spawn_reader(self: &Arc<Self>, conn: ConnId, reader: OwnedReadHalf, token: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.read_loop(conn, reader, token).await;
        });
    }

    async fn read_loop(
        self: Arc<Self>,
        conn: ConnId,
        mut reader: OwnedReadHalf,
        token: CancellationToken,
    ) {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let n = tokio::select! {
                () = token.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(module = %self.name, conn, error = %e, "read failed");
                        break;
                    }
                },
            };
            let event = ComEvent::Data {
                module: self.name.clone(),
                conn,
                bytes: Bytes::copy_from_slice(&buf[..n]),
            };
            if self.events.send(event).await.is_err() {
                break;
            }
        }
        self.writers.remove(&conn);
        self.tokens.remove(&conn);
        let _ = self
            .events
            .send(ComEvent::Disconnected {
                module: self.name.clone(),
                conn,
            })
            .await;
    }
}

#[async_trait::async_trait]
impl ComModule for TcpModule {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn is_bridge(&self) -> bool {
        self.inner.bridge
    }

    async fn connect(&self, address: &str) -> Result<ConnId> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            Error::Transport(format!("{}: connect {address}: {e}", self.inner.name))
        })?;
        let (conn, reader, token) = self.inner.prepare(stream);
        self.inner.spawn_reader(conn, reader, token);
        Ok(conn)
    }

    async fn send(&self, conn: ConnId, bytes: &[u8]) -> Result<()> {
        let writer = self
            .inner
            .writers
            .get(&conn)
            .map(|w| Arc::clone(w.value()))
            .ok_or_else(|| unknown_conn(&self.inner.name, conn))?;
        let mut writer = writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| Error::Transport(format!("{}: send on {conn}: {e}", self.inner.name)))
    }

    async fn close(&self, conn: ConnId) -> Result<()> {
        if let Some((_, writer)) = self.inner.writers.remove(&conn) {
            let _ = writer.lock().await.shutdown().await;
        }
        if let Some((_, token)) = self.inner.tokens.remove(&conn) {
            token.cancel();
        }
        Ok(())
    }

    async fn listen(&self, address: &str) -> Result<String> {
        let listener = TcpListener::bind(address).await.map_err(|e| {
            Error::Transport(format!("{}: bind {address}: {e}", self.inner.name))
        })?;
        let bound = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("{}: local addr: {e}", self.inner.name)))?
            .to_string();
        let inner = Arc::clone(&self.inner);
        let token = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let (conn, reader, conn_token) = inner.prepare(stream);
                        debug!(module = %inner.name, conn, %peer, "accepted connection");
                        let event = ComEvent::Connected {
                            module: inner.name.clone(),
                            conn,
                        };
                        if inner.events.send(event).await.is_err() {
                            break;
                        }
                        inner.spawn_reader(conn, reader, conn_token);
                    }
                    Err(e) => {
                        debug!(module = %inner.name, error = %e, "accept failed");
                    }
                }
            }
        });
        Ok(bound)
    }

    async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.writers.clear();
        self.inner.tokens.clear();
    }
}
