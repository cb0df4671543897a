//! Component-side middleware API.
//!
//! [`Middleware::init`] spawns the broker core as a child process,
//! accepts its connection on a private Unix socket, and presents the
//! random session key as the very first bytes on the channel. From then
//! on two background tasks run: a receive task extracting frames from
//! the socket, and a dispatcher task that parses delivery frames and
//! invokes endpoint handlers — user threads never touch the socket
//! directly.
//!
//! Blocking calls register a per-call completion keyed by the command's
//! message id; the receive task fulfils it when the matching `b`-tagged
//! reply arrives, and a 5 second timeout yields `None`.

pub mod endpoint;

pub use endpoint::{Endpoint, EndpointBuilder, MessageHandler};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{CommandFrame, InboundFrame, ReturnKind, decode, parse_int_payload};
use crate::core::EndpointKind;
use crate::error::{Error, Result};
use crate::framing::FrameBuffer;
use crate::message::{Message, Status, generate_session_key};
use crate::transport::READ_BUFFER_SIZE;

use endpoint::EndpointShared;

/// Timeout applied to every blocking call.
pub const BLOCKING_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the receive→dispatcher delivery queue.
const DELIVERY_QUEUE_CAPACITY: usize = 1024;

/// Options for [`Middleware::init`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Configuration file handed to the core with `-c`.
    pub config_path: Option<PathBuf>,
    /// Core executable; defaults to `commux-core` on the PATH.
    pub core_binary: Option<PathBuf>,
    /// Verbosity forwarded to the core (`-v` repeated).
    pub verbosity: u8,
}

/// Handle to the middleware: owns the component↔core channel.
#[derive(Clone)]
pub struct Middleware {
    inner: Arc<MwInner>,
}

pub(crate) struct MwInner {
    app_name: String,
    writer: Mutex<OwnedWriteHalf>,
    pub(crate) pending: DashMap<String, oneshot::Sender<Bytes>>,
    pub(crate) endpoints: DashMap<String, Arc<EndpointShared>>,
    cancel: CancellationToken,
    child: Mutex<Option<tokio::process::Child>>,
}

impl MwInner {
    async fn send_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| Error::ChannelClosed(format!("core channel write: {e}")))
    }
}

impl Middleware {
    /// Spawns the core process and establishes the component channel.
    ///
    /// # Errors
    ///
    /// Returns an error when the socket cannot be bound, the core cannot
    /// be spawned, or it fails to connect within the call timeout.
    pub async fn init(app_name: &str, options: InitOptions) -> Result<Self> {
        let session_key = generate_session_key();
        let socket_path = component_socket_path(app_name, &session_key);
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| Error::Transport(format!("bind {}: {e}", socket_path.display())))?;

        let binary = options
            .core_binary
            .unwrap_or_else(|| PathBuf::from("commux-core"));
        let mut command = tokio::process::Command::new(&binary);
        command
            .arg("-f")
            .arg("0")
            .arg("-a")
            .arg(app_name)
            .arg("-k")
            .arg(&session_key);
        if let Some(config) = &options.config_path {
            command.arg("-c").arg(config);
        }
        for _ in 0..options.verbosity {
            command.arg("-v");
        }
        command.kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|e| Error::Config(format!("spawn {}: {e}", binary.display())))?;

        let accepted = timeout(BLOCKING_CALL_TIMEOUT, listener.accept())
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|e| Error::Transport(format!("accept core connection: {e}")))?;
        let (stream, _) = accepted;
        // The rendezvous socket has served its purpose.
        let _ = std::fs::remove_file(&socket_path);

        Self::from_stream(app_name, &session_key, stream, Some(child)).await
    }

    /// Drives an already connected channel (an in-process core, a test
    /// harness socket pair).
    ///
    /// # Errors
    ///
    /// Returns an error when the key exchange does not complete.
    pub async fn connect_stream(
        app_name: &str,
        session_key: &str,
        stream: UnixStream,
    ) -> Result<Self> {
        Self::from_stream(app_name, session_key, stream, None).await
    }

    async fn from_stream(
        app_name: &str,
        session_key: &str,
        stream: UnixStream,
        child: Option<tokio::process::Child>,
    ) -> Result<Self> {
        let (reader, writer) = stream.into_split();
        let inner = Arc::new(MwInner {
            app_name: app_name.to_string(),
            writer: Mutex::new(writer),
            pending: DashMap::new(),
            endpoints: DashMap::new(),
            cancel: CancellationToken::new(),
            child: Mutex::new(child),
        });

        let (ready_tx, ready_rx) = oneshot::channel();
        let (deliver_tx, deliver_rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        tokio::spawn(receive_loop(
            Arc::clone(&inner),
            reader,
            ready_tx,
            deliver_tx,
        ));
        tokio::spawn(dispatch_loop(Arc::clone(&inner), deliver_rx));

        // Present the session key; the core answers with its first frame
        // once it accepted us.
        inner
            .send_frame(format!("{{{session_key}}}").as_bytes())
            .await?;
        timeout(BLOCKING_CALL_TIMEOUT, ready_rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::ChannelClosed("core closed during startup".to_string()))?;

        info!(app = %app_name, "middleware initialised");
        Ok(Self { inner })
    }

    /// The component name registered with the core.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// True while the core channel is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Sends a non-blocking command.
    pub(crate) async fn call(
        &self,
        function: &str,
        kind: ReturnKind,
        args: Vec<String>,
    ) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::ChannelClosed("core is gone".to_string()));
        }
        let cmd = CommandFrame::core(function, kind, args);
        self.inner.send_frame(&cmd.encode()).await
    }

    /// Sends a command and waits for its reply; `None` on timeout.
    pub(crate) async fn call_blocking(
        &self,
        function: &str,
        kind: ReturnKind,
        args: Vec<String>,
    ) -> Result<Option<Bytes>> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::ChannelClosed("core is gone".to_string()));
        }
        let cmd = CommandFrame::core(function, kind, args);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(cmd.msg_id.clone(), tx);
        if let Err(e) = self.inner.send_frame(&cmd.encode()).await {
            self.inner.pending.remove(&cmd.msg_id);
            return Err(e);
        }
        match timeout(BLOCKING_CALL_TIMEOUT, rx).await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            Ok(Err(_)) => Err(Error::ChannelClosed(
                "core closed while a call was in flight".to_string(),
            )),
            Err(_) => {
                self.inner.pending.remove(&cmd.msg_id);
                debug!(%function, "blocking call timed out");
                Ok(None)
            }
        }
    }

    /// Blocking call with an integer reply; -1 on timeout.
    pub(crate) async fn call_int(&self, function: &str, args: Vec<String>) -> Result<i64> {
        Ok(self
            .call_blocking(function, ReturnKind::Int, args)
            .await?
            .and_then(|payload| parse_int_payload(&payload))
            .unwrap_or(-1))
    }

    /// Blocking call with a string reply.
    pub(crate) async fn call_str(&self, function: &str, args: Vec<String>) -> Result<Option<String>> {
        Ok(self
            .call_blocking(function, ReturnKind::Str, args)
            .await?
            .map(|payload| String::from_utf8_lossy(&payload).into_owned()))
    }

    /// Blocking call with a message reply; empty payloads mean `None`.
    pub(crate) async fn call_msg(&self, function: &str, args: Vec<String>) -> Result<Option<Message>> {
        Ok(self
            .call_blocking(function, ReturnKind::Msg, args)
            .await?
            .filter(|payload| !payload.is_empty())
            .and_then(|payload| {
                let text = String::from_utf8_lossy(&payload);
                Message::parse(&text).ok()
            }))
    }

    /// Starts building an endpoint of the given kind.
    #[must_use]
    pub fn endpoint(&self, kind: EndpointKind, name: &str) -> EndpointBuilder {
        EndpointBuilder::new(self.clone(), kind, name)
    }

    /// A source endpoint (publishes messages).
    #[must_use]
    pub fn source(&self, name: &str) -> EndpointBuilder {
        self.endpoint(EndpointKind::Src, name)
    }

    /// A sink endpoint (consumes messages).
    #[must_use]
    pub fn sink(&self, name: &str) -> EndpointBuilder {
        self.endpoint(EndpointKind::Snk, name)
    }

    /// A combined source/sink endpoint.
    #[must_use]
    pub fn source_sink(&self, name: &str) -> EndpointBuilder {
        self.endpoint(EndpointKind::Ss, name)
    }

    /// A requesting endpoint.
    #[must_use]
    pub fn requester(&self, name: &str) -> EndpointBuilder {
        self.endpoint(EndpointKind::Req, name)
    }

    /// A responding endpoint.
    #[must_use]
    pub fn responder(&self, name: &str) -> EndpointBuilder {
        self.endpoint(EndpointKind::Resp, name)
    }

    /// A stream source (byte-pipe writer).
    #[must_use]
    pub fn stream_source(&self, name: &str) -> EndpointBuilder {
        self.endpoint(EndpointKind::StreamSrc, name)
    }

    /// A stream sink (byte-pipe reader).
    #[must_use]
    pub fn stream_sink(&self, name: &str) -> EndpointBuilder {
        self.endpoint(EndpointKind::StreamSnk, name)
    }

    /// Merges extra data into the component manifest.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn add_manifest(&self, manifest: &Value) -> Result<()> {
        let wrapped = Message::new(Status::Cmd, manifest.clone());
        self.call(
            "add_manifest",
            ReturnKind::Void,
            vec![wrapped.to_string()],
        )
        .await
    }

    /// Fetches the component manifest the core would advertise.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn get_manifest(&self) -> Result<Option<String>> {
        self.call_str("get_manifest", vec![]).await
    }

    /// Fetches the manifest a peer presented on a connection.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone or arguments are empty.
    pub async fn get_remote_manifest(&self, module: &str, conn: u64) -> Result<Option<String>> {
        if module.is_empty() || conn == 0 {
            return Err(Error::InvalidArgument(
                "module and connection are required".to_string(),
            ));
        }
        self.call_str(
            "get_remote_manif",
            vec![module.to_string(), conn.to_string()],
        )
        .await
    }

    /// Registers a resource-discovery service address.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn add_rdc(&self, module: &str, address: &str) -> Result<()> {
        self.call(
            "add_rdc",
            ReturnKind::Void,
            vec![module.to_string(), address.to_string()],
        )
        .await
    }

    /// Announces this component to every registered RDC.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn register_rdcs(&self) -> Result<()> {
        self.call("rdc_register", ReturnKind::Void, vec![]).await
    }

    /// Announces this component to one RDC.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn register_rdc_at(&self, module: &str, address: &str) -> Result<()> {
        self.call(
            "rdc_register",
            ReturnKind::Void,
            vec![address.to_string(), module.to_string()],
        )
        .await
    }

    /// Withdraws this component from every registered RDC.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn unregister_rdcs(&self) -> Result<()> {
        self.call("rdc_unregister", ReturnKind::Void, vec![]).await
    }

    /// Withdraws this component from the RDC at one address.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn unregister_rdc_at(&self, address: &str) -> Result<()> {
        self.call(
            "rdc_unregister",
            ReturnKind::Void,
            vec![address.to_string()],
        )
        .await
    }

    /// Activates a built-in transport module in the core, optionally
    /// with a `{"listen": "<address>"}` configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn load_com_module(&self, name: &str, config: Option<&str>) -> Result<i64> {
        let mut args = vec![name.to_string()];
        if let Some(config) = config {
            args.push(config.to_string());
        }
        self.call_int("load_com_module", args).await
    }

    /// Activates an access-control module in the core.
    ///
    /// # Errors
    ///
    /// Returns an error when the channel is gone.
    pub async fn load_access_module(&self, name: &str) -> Result<i64> {
        self.call_int("load_acc_module", vec![name.to_string()])
            .await
    }

    /// Orderly shutdown: asks the core to terminate and reaps it.
    ///
    /// # Errors
    ///
    /// Returns an error when the terminate command cannot be sent (the
    /// core may already be gone; that is not an error here).
    pub async fn terminate(&self) -> Result<()> {
        if !self.inner.cancel.is_cancelled() {
            let _ = self.call("terminate", ReturnKind::Void, vec![]).await;
        }
        self.inner.cancel.cancel();
        if let Some(mut child) = self.inner.child.lock().await.take() {
            let _ = timeout(Duration::from_secs(2), child.wait()).await;
            let _ = child.start_kill();
        }
        Ok(())
    }
}

async fn receive_loop(
    inner: Arc<MwInner>,
    mut reader: OwnedReadHalf,
    ready: oneshot::Sender<()>,
    deliver: mpsc::Sender<(String, Bytes)>,
) {
    let mut ready = Some(ready);
    let mut buffer = FrameBuffer::new();
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            () = inner.cancel.cancelled() => break,
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "core channel read failed");
                    break;
                }
            },
        };
        for frame in buffer.push(&chunk[..n]) {
            // The very first frame only acknowledges the session key.
            if let Some(tx) = ready.take() {
                let _ = tx.send(());
                continue;
            }
            match decode(&frame) {
                Ok(InboundFrame::Reply {
                    msg_id, payload, ..
                }) => {
                    if let Some((_, tx)) = inner.pending.remove(&msg_id) {
                        let _ = tx.send(payload);
                    } else {
                        debug!(%msg_id, "reply nobody waits for");
                    }
                }
                Ok(InboundFrame::Delivery { ep_id, payload }) => {
                    if deliver.send((ep_id, payload)).await.is_err() {
                        break;
                    }
                }
                Ok(other) => debug!(?other, "unexpected frame from core"),
                Err(e) => warn!(error = %e, "undecodable frame from core"),
            }
        }
    }
    // Core gone: fail every in-flight call by dropping its sender.
    if !inner.cancel.is_cancelled() {
        error!("core disconnected");
    }
    inner.cancel.cancel();
    inner.pending.clear();
}

async fn dispatch_loop(inner: Arc<MwInner>, mut deliveries: mpsc::Receiver<(String, Bytes)>) {
    loop {
        let (ep_id, payload) = tokio::select! {
            () = inner.cancel.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let text = String::from_utf8_lossy(&payload);
        let msg = match Message::parse(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "undeliverable message payload");
                continue;
            }
        };
        let handler = inner
            .endpoints
            .get(&ep_id)
            .and_then(|ep| ep.handler.clone());
        match handler {
            Some(handler) => handler(msg),
            None => debug!(%ep_id, "delivery for endpoint without a handler"),
        }
    }
}

/// Rendezvous socket path, derivable by both sides from the spawn
/// arguments (app name + session key).
#[must_use]
pub fn component_socket_path(app_name: &str, session_key: &str) -> PathBuf {
    let tag: String = session_key.chars().take(6).collect();
    std::env::temp_dir().join(format!("commux-{app_name}-{tag}.sock"))
}

/// Connects to a byte-pipe path handed out by a stream STREAM_CMD.
///
/// # Errors
///
/// Returns an error when the pipe cannot be opened.
pub async fn open_byte_pipe(path: &str) -> Result<UnixStream> {
    UnixStream::connect(path)
        .await
        .map_err(|e| Error::Transport(format!("byte pipe {path}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_is_stable_and_keyed() {
        let a = component_socket_path("sender", "AbCdEf123456");
        let b = component_socket_path("sender", "AbCdEf123456");
        let c = component_socket_path("sender", "XyZw99123456");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.to_string_lossy().contains("sender"));
    }
}
