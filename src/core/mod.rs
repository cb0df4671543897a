//! The broker core.
//!
//! One core runs beside each component. It owns the transport modules,
//! the endpoint registry, the mapping table, and per-connection protocol
//! state, and drives everything from a single event loop draining the
//! shared transport-event channel — so none of those structures need
//! locking and frames from one peer are processed in arrival order.

pub mod access;
pub mod dispatch;
pub mod handshake;
pub mod manifest;
pub mod mapper;
pub mod registry;
pub mod router;
pub mod state;

pub use access::{AccessModule, OpenAccess};
pub use dispatch::CommandName;
pub use mapper::{Mapping, MappingTable};
pub use registry::{EndpointDecl, EndpointKind, EndpointRegistry, LocalEndpoint, MsgQueue};
pub use router::BytePipe;
pub use state::{Callback, ConnKey, ConnState, Connection, ConnectionTable};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{ReturnKind, encode_reply};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::{
    ComEvent, ComModule, ConnId, EVENT_CHANNEL_CAPACITY, TcpModule, UnixModule,
};

/// The broker core: registry, mapper, router, and dispatch glue.
pub struct Core {
    app_name: String,
    session_key: String,
    config: Config,
    modules: BTreeMap<String, Arc<dyn ComModule>>,
    events_tx: mpsc::Sender<ComEvent>,
    events_rx: mpsc::Receiver<ComEvent>,
    conns: ConnectionTable,
    registry: EndpointRegistry,
    mappings: MappingTable,
    /// Values merged into the component manifest via `add_manifest`.
    manifest_extra: Vec<Value>,
    /// Manifests received in HELLO, per connection.
    remote_manifests: HashMap<ConnKey, Value>,
    /// Resource-discovery services registered via `add_rdc` or config.
    rdcs: Vec<(String, String)>,
    /// Outbound request id → local endpoint awaiting its responses.
    pending_responses: HashMap<String, String>,
    /// Inbound request id → connection to route responses back on.
    request_origins: HashMap<String, ConnKey>,
    app_conn: Option<ConnKey>,
    access: Arc<dyn AccessModule>,
    cancel: CancellationToken,
    terminating: bool,
    exit_code: i32,
}

impl Core {
    /// Creates a core for the named component.
    #[must_use]
    pub fn new(app_name: &str, session_key: &str, config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let rdcs = config
            .rdc
            .iter()
            .map(|t| (t.module.clone(), t.address.clone()))
            .collect();
        Self {
            app_name: app_name.to_string(),
            session_key: session_key.to_string(),
            config,
            modules: BTreeMap::new(),
            events_tx,
            events_rx,
            conns: ConnectionTable::new(),
            registry: EndpointRegistry::new(),
            mappings: MappingTable::new(),
            manifest_extra: Vec::new(),
            remote_manifests: HashMap::new(),
            rdcs,
            pending_responses: HashMap::new(),
            request_origins: HashMap::new(),
            app_conn: None,
            access: Arc::new(OpenAccess::new(app_name)),
            cancel: CancellationToken::new(),
            terminating: false,
            exit_code: 0,
        }
    }

    /// The sender transport modules push their events into.
    #[must_use]
    pub fn events_sender(&self) -> mpsc::Sender<ComEvent> {
        self.events_tx.clone()
    }

    /// Token cancelled when the core shuts down; cancelling it from the
    /// outside stops the event loop.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers a transport module.
    pub fn add_module(&mut self, module: Arc<dyn ComModule>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Replaces the access-control module.
    pub fn set_access_module(&mut self, access: Arc<dyn AccessModule>) {
        self.access = access;
    }

    #[must_use]
    pub(crate) fn module(&self, name: &str) -> Option<Arc<dyn ComModule>> {
        self.modules.get(name).cloned()
    }

    /// Activates the transport modules named in the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when a configured listen address cannot be bound.
    pub async fn activate_config_modules(&mut self) -> Result<()> {
        for entry in self.config.core.modules.clone() {
            let listen = entry.listen.clone();
            let module = self.activate_module(&entry.name)?;
            if let Some(address) = listen {
                let bound = module.listen(&address).await?;
                info!(module = %entry.name, %bound, "listening");
            }
        }
        Ok(())
    }

    /// Creates (or returns) a built-in module by name.
    pub(crate) fn activate_module(&mut self, name: &str) -> Result<Arc<dyn ComModule>> {
        if let Some(existing) = self.modules.get(name) {
            return Ok(Arc::clone(existing));
        }
        let module: Arc<dyn ComModule> = match name {
            "tcp" => Arc::new(TcpModule::new(self.events_sender())),
            "unix" => Arc::new(UnixModule::new(self.events_sender())),
            other => {
                return Err(Error::Config(format!("unknown com module '{other}'")));
            }
        };
        self.modules.insert(name.to_string(), Arc::clone(&module));
        Ok(module)
    }

    /// Dials the component's socket and installs the component channel.
    ///
    /// # Errors
    ///
    /// Returns an error when the unix module is missing or the connect
    /// fails.
    pub async fn connect_component(&mut self, path: &str) -> Result<()> {
        let module = self
            .module("unix")
            .ok_or_else(|| Error::Config("unix module not registered".to_string()))?;
        let conn = module.connect(path).await?;
        self.attach_component("unix", conn);
        Ok(())
    }

    /// Installs an already connected channel as the component channel.
    pub fn attach_component(&mut self, module: &str, conn: ConnId) {
        let key = (module.to_string(), conn);
        self.conns.insert(Connection::new(
            key.clone(),
            ConnState::FirstMsg,
            Callback::Component,
        ));
        self.app_conn = Some(key);
    }

    /// Runs the event loop until termination; returns the exit code.
    pub async fn run(mut self) -> i32 {
        info!(app = %self.app_name, "core running");
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }
        self.shutdown_all().await;
        info!(app = %self.app_name, code = self.exit_code, "core stopped");
        self.exit_code
    }

    async fn handle_event(&mut self, event: ComEvent) {
        match event {
            ComEvent::Connected { module, conn } => {
                self.handle_new_connection((module, conn), None).await;
            }
            ComEvent::Data {
                module,
                conn,
                bytes,
            } => {
                self.handle_data((module, conn), &bytes).await;
            }
            ComEvent::Disconnected { module, conn } => {
                self.handle_disconnect((module, conn)).await;
            }
        }
    }

    async fn handle_data(&mut self, key: ConnKey, bytes: &Bytes) {
        let frames = match self.conns.get_mut(&key) {
            Some(conn) => conn.buffer.push(bytes),
            None => {
                debug!(?key, "data on unknown connection");
                return;
            }
        };
        for frame in frames {
            // The callback can change between frames (handshake
            // completion, session-key acceptance), so re-read it each time.
            let callback = match self.conns.get(&key) {
                Some(conn) => conn.callback.clone(),
                None => return,
            };
            match callback {
                Callback::Component => self.handle_component_frame(&key, &frame).await,
                Callback::Proto => match parse_peer(&frame) {
                    Some(msg) => self.handle_proto_message(&key, msg).await,
                    None => debug!(?key, "unparseable proto frame"),
                },
                Callback::Operational => match parse_peer(&frame) {
                    Some(msg) => self.handle_operational_message(&key, msg).await,
                    None => debug!(?key, "unparseable peer frame"),
                },
                Callback::Rdc(exchange) => {
                    self.handle_rdc_frame(&key, &exchange, &frame).await;
                }
            }
        }
    }

    async fn handle_disconnect(&mut self, key: ConnKey) {
        let Some(conn) = self.conns.remove(&key) else {
            return;
        };
        if self.app_conn.as_ref() == Some(&key) {
            if self.terminating {
                return;
            }
            // Losing the component channel is fatal.
            error!("component channel disconnected");
            self.exit_code = 1;
            self.cancel.cancel();
            return;
        }
        self.access.on_disconnect(conn.peer_subject.as_deref());
        self.remote_manifests.remove(&key);
        self.finalize_unmap(&key).await;
    }

    /// Sends a serialized peer message on a connection; failures are
    /// logged, never surfaced (asynchronous sends do not report).
    pub(crate) async fn send_peer(&self, key: &ConnKey, msg: &Message) {
        let Some(module) = self.module(&key.0) else {
            warn!(module = %key.0, "send on unknown module");
            return;
        };
        if let Err(e) = module.send(key.1, msg.to_string().as_bytes()).await {
            warn!(?key, error = %e, status = %msg.status, "peer send failed");
        }
    }

    /// Sends a `b`-tagged reply frame to the component.
    pub(crate) async fn reply_to_app(&self, msg_id: &str, kind: ReturnKind, payload: &[u8]) {
        let Some(app) = &self.app_conn else {
            return;
        };
        let Some(module) = self.module(&app.0) else {
            return;
        };
        let frame = encode_reply(msg_id, kind, payload);
        if let Err(e) = module.send(app.1, &frame).await {
            warn!(error = %e, "reply to component failed");
        }
    }

    /// Sends raw bytes to the component channel.
    pub(crate) async fn send_to_app(&self, bytes: &[u8]) {
        let Some(app) = &self.app_conn else {
            return;
        };
        let Some(module) = self.module(&app.0) else {
            return;
        };
        if let Err(e) = module.send(app.1, bytes).await {
            warn!(error = %e, "send to component failed");
        }
    }

    /// Closes a transport connection and forgets its state.
    pub(crate) async fn close_conn(&mut self, key: &ConnKey) {
        self.conns.remove(key);
        self.remote_manifests.remove(key);
        if let Some(module) = self.module(&key.0) {
            let _ = module.close(key.1).await;
        }
    }

    /// Orderly termination: unmap everything, close the component
    /// channel, stop the loop with exit code 0.
    pub(crate) async fn begin_terminate(&mut self) {
        if self.terminating {
            return;
        }
        self.terminating = true;
        let handles: Vec<i64> = self.mappings.iter().map(|m| m.handle).collect();
        for handle in handles {
            self.send_unmap_for_handle(handle).await;
        }
        if let Some(app) = self.app_conn.clone() {
            self.close_conn(&app).await;
        }
        self.exit_code = 0;
        self.cancel.cancel();
    }

    async fn shutdown_all(&mut self) {
        for module in self.modules.values() {
            module.shutdown().await;
        }
    }
}

/// Parses a peer frame into a message, tolerating loose JSON.
fn parse_peer(frame: &[u8]) -> Option<Message> {
    let text = std::str::from_utf8(frame).ok()?;
    Message::parse(text).ok()
}
