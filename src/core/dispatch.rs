//! Command dispatch.
//!
//! The four fixed-width function tables of the wire protocol collapse
//! into one typed [`CommandName`] enum; the key is still the
//! (module id, function id, return kind) triple carried by every command
//! frame. Unknown keys yield no reply — the component's blocking call
//! observes a timeout — and are logged, never fatal. Replies for `map`
//! and the fetch family may be parked and released later by MAP_ACK or
//! message arrival.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec::{CommandFrame, InboundFrame, ReturnKind, decode, int_payload};
use crate::message::{Message, Status};
use crate::observability;
use crate::predicate::{Predicate, parse_query};

use super::Core;
use super::registry::{EndpointDecl, LocalEndpoint};
use super::state::{ConnKey, ConnState};

/// Every command the core dispatches, with its reply kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    RegisterEndpoint,
    RemoveEndpoint,
    Map,
    MapModule,
    MapLookup,
    Unmap,
    UnmapConnection,
    UnmapAll,
    Divert,
    EpMoreMessages,
    EpMoreRequests,
    EpMoreResponses,
    EpSendMessage,
    EpSendRequest,
    EpSendResponse,
    EpStreamStart,
    EpStreamStop,
    EpStreamSend,
    EpFetchMessage,
    EpFetchRequest,
    EpFetchResponse,
    AddManifest,
    GetManifest,
    AddRdc,
    RdcRegister,
    RdcUnregister,
    EpAddFilter,
    EpResetFilter,
    EpSetAccess,
    EpResetAccess,
    EpGetAllConns,
    GetRemoteManif,
    Terminate,
    LoadComModule,
    LoadAccModule,
}

impl CommandName {
    /// Every command, for table-completeness checks.
    pub const ALL: [Self; 35] = [
        Self::RegisterEndpoint,
        Self::RemoveEndpoint,
        Self::Map,
        Self::MapModule,
        Self::MapLookup,
        Self::Unmap,
        Self::UnmapConnection,
        Self::UnmapAll,
        Self::Divert,
        Self::EpMoreMessages,
        Self::EpMoreRequests,
        Self::EpMoreResponses,
        Self::EpSendMessage,
        Self::EpSendRequest,
        Self::EpSendResponse,
        Self::EpStreamStart,
        Self::EpStreamStop,
        Self::EpStreamSend,
        Self::EpFetchMessage,
        Self::EpFetchRequest,
        Self::EpFetchResponse,
        Self::AddManifest,
        Self::GetManifest,
        Self::AddRdc,
        Self::RdcRegister,
        Self::RdcUnregister,
        Self::EpAddFilter,
        Self::EpResetFilter,
        Self::EpSetAccess,
        Self::EpResetAccess,
        Self::EpGetAllConns,
        Self::GetRemoteManif,
        Self::Terminate,
        Self::LoadComModule,
        Self::LoadAccModule,
    ];

    /// Function id on the wire (before width padding).
    #[must_use]
    pub const fn function_id(self) -> &'static str {
        match self {
            Self::RegisterEndpoint => "register_endpoint",
            Self::RemoveEndpoint => "remove_endpoint",
            Self::Map => "map",
            Self::MapModule => "map_module",
            Self::MapLookup => "map_lookup",
            Self::Unmap => "unmap",
            Self::UnmapConnection => "unmap_connection",
            Self::UnmapAll => "unmap_all",
            Self::Divert => "divert",
            Self::EpMoreMessages => "ep_more_messages",
            Self::EpMoreRequests => "ep_more_requests",
            Self::EpMoreResponses => "ep_more_responses",
            Self::EpSendMessage => "ep_send_message",
            Self::EpSendRequest => "ep_send_request",
            Self::EpSendResponse => "ep_send_response",
            Self::EpStreamStart => "ep_stream_start",
            Self::EpStreamStop => "ep_stream_stop",
            Self::EpStreamSend => "ep_stream_send",
            Self::EpFetchMessage => "ep_fetch_message",
            Self::EpFetchRequest => "ep_fetch_request",
            Self::EpFetchResponse => "ep_fetch_response",
            Self::AddManifest => "add_manifest",
            Self::GetManifest => "get_manifest",
            Self::AddRdc => "add_rdc",
            Self::RdcRegister => "rdc_register",
            Self::RdcUnregister => "rdc_unregister",
            Self::EpAddFilter => "ep_add_filter",
            Self::EpResetFilter => "ep_reset_filter",
            Self::EpSetAccess => "ep_set_access",
            Self::EpResetAccess => "ep_reset_access",
            Self::EpGetAllConns => "ep_get_all_conns",
            Self::GetRemoteManif => "get_remote_manif",
            Self::Terminate => "terminate",
            Self::LoadComModule => "load_com_module",
            Self::LoadAccModule => "load_acc_module",
        }
    }

    /// Reply kind of the command.
    #[must_use]
    pub const fn return_kind(self) -> ReturnKind {
        match self {
            Self::RegisterEndpoint
            | Self::Map
            | Self::MapModule
            | Self::Unmap
            | Self::UnmapConnection
            | Self::UnmapAll
            | Self::Divert
            | Self::EpMoreMessages
            | Self::EpMoreRequests
            | Self::EpMoreResponses
            | Self::LoadComModule
            | Self::LoadAccModule => ReturnKind::Int,
            Self::GetManifest | Self::EpGetAllConns | Self::GetRemoteManif => ReturnKind::Str,
            Self::EpFetchMessage | Self::EpFetchRequest | Self::EpFetchResponse => ReturnKind::Msg,
            Self::RemoveEndpoint
            | Self::MapLookup
            | Self::EpSendMessage
            | Self::EpSendRequest
            | Self::EpSendResponse
            | Self::EpStreamStart
            | Self::EpStreamStop
            | Self::EpStreamSend
            | Self::AddManifest
            | Self::AddRdc
            | Self::RdcRegister
            | Self::RdcUnregister
            | Self::EpAddFilter
            | Self::EpResetFilter
            | Self::EpSetAccess
            | Self::EpResetAccess
            | Self::Terminate => ReturnKind::Void,
        }
    }

    /// Looks up a command by its dispatch key. The return kind is part of
    /// the key: a known function with the wrong kind does not dispatch.
    #[must_use]
    pub fn lookup(module_id: &str, function_id: &str, return_kind: ReturnKind) -> Option<Self> {
        if module_id != "core" {
            return None;
        }
        Self::ALL
            .into_iter()
            .find(|name| name.function_id() == function_id && name.return_kind() == return_kind)
    }
}

/// Result of one dispatched command.
enum Outcome {
    /// No reply kind (or reply parked for later release).
    Silent,
    Int(i64),
    Str(String),
    Msg(Box<Message>),
}

impl Core {
    /// Handles a frame on the component channel: the session key first,
    /// then commands.
    pub(crate) async fn handle_component_frame(&mut self, key: &ConnKey, frame: &[u8]) {
        let state = match self.conns.get(key) {
            Some(conn) => conn.state,
            None => return,
        };
        if state == ConnState::FirstMsg {
            let expected = format!("{{{}}}", self.session_key);
            if frame == expected.as_bytes() {
                if let Some(conn) = self.conns.get_mut(key) {
                    conn.state = ConnState::AppMsg;
                }
                info!("component channel established");
                // First bytes back release the component's init wait.
                self.send_to_app(b"{}").await;
            } else {
                warn!("component presented a bad session key");
            }
            return;
        }
        match decode(frame) {
            Ok(InboundFrame::Command(cmd)) => self.dispatch_command(cmd).await,
            Ok(other) => debug!(?other, "non-command frame on component channel"),
            Err(e) => warn!(error = %e, "undecodable component frame"),
        }
    }

    /// Dispatches one command and emits its reply, if any.
    pub(crate) async fn dispatch_command(&mut self, cmd: CommandFrame) {
        let Some(name) = CommandName::lookup(&cmd.module_id, &cmd.function_id, cmd.return_kind)
        else {
            warn!(
                module = %cmd.module_id,
                function = %cmd.function_id,
                kind = cmd.return_kind.wire(),
                "unknown dispatch key"
            );
            return;
        };
        observability::record_command(name.function_id());
        let msg_id = cmd.msg_id.clone();
        let outcome = self.run_command(name, cmd).await;
        match outcome {
            Outcome::Silent => {}
            Outcome::Int(v) => {
                self.reply_to_app(&msg_id, ReturnKind::Int, int_payload(v).as_bytes())
                    .await;
            }
            Outcome::Str(s) => {
                self.reply_to_app(&msg_id, ReturnKind::Str, s.as_bytes())
                    .await;
            }
            Outcome::Msg(m) => {
                self.reply_to_app(&msg_id, ReturnKind::Msg, m.to_string().as_bytes())
                    .await;
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn run_command(&mut self, name: CommandName, cmd: CommandFrame) -> Outcome {
        let args = &cmd.args;
        match name {
            CommandName::RegisterEndpoint => {
                let Some(blob) = args.first() else {
                    return Outcome::Int(-1);
                };
                self.cmd_register_endpoint(blob)
            }
            CommandName::RemoveEndpoint => {
                if let Some(ep_id) = args.first().cloned() {
                    self.cmd_remove_endpoint(&ep_id).await;
                }
                Outcome::Silent
            }
            CommandName::Map => {
                let (Some(lep), Some(addr)) = (args.first(), args.get(1)) else {
                    return Outcome::Int(-1);
                };
                let epq = args.get(2).cloned().unwrap_or_default();
                let cptq = args.get(3).cloned().unwrap_or_default();
                let code = self
                    .start_mapping(
                        &lep.clone(),
                        &addr.clone(),
                        &epq,
                        &cptq,
                        None,
                        Some(cmd.msg_id.clone()),
                    )
                    .await;
                if code < 0 {
                    Outcome::Int(code)
                } else {
                    // Reply parked until MAP_ACK.
                    Outcome::Silent
                }
            }
            CommandName::MapModule => {
                let (Some(lep), Some(module), Some(addr)) =
                    (args.first(), args.get(1), args.get(2))
                else {
                    return Outcome::Int(-1);
                };
                let epq = args.get(3).cloned().unwrap_or_default();
                let cptq = args.get(4).cloned().unwrap_or_default();
                let (lep, addr, module) = (lep.clone(), addr.clone(), module.clone());
                let code = self
                    .start_mapping(
                        &lep,
                        &addr,
                        &epq,
                        &cptq,
                        Some(module.as_str()),
                        Some(cmd.msg_id.clone()),
                    )
                    .await;
                if code < 0 {
                    Outcome::Int(code)
                } else {
                    Outcome::Silent
                }
            }
            CommandName::MapLookup => {
                let Some(lep) = args.first().cloned() else {
                    return Outcome::Silent;
                };
                let epq = args.get(1).cloned().unwrap_or_default();
                let cptq = args.get(2).cloned().unwrap_or_default();
                let max = args
                    .get(3)
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(1);
                self.rdc_lookup(&lep, &epq, &cptq, max).await;
                Outcome::Silent
            }
            CommandName::Unmap => {
                let (Some(lep), Some(addr)) = (args.first(), args.get(1)) else {
                    return Outcome::Int(-1);
                };
                if !self.registry.contains(lep) {
                    return Outcome::Int(-2);
                }
                let (lep, addr) = (lep.clone(), addr.clone());
                Outcome::Int(self.unmap_endpoint(&lep, &addr).await)
            }
            CommandName::UnmapConnection => {
                let (Some(lep), Some(module), Some(conn)) =
                    (args.first(), args.get(1), args.get(2))
                else {
                    return Outcome::Int(-1);
                };
                let Ok(conn) = conn.parse::<u64>() else {
                    return Outcome::Int(-2);
                };
                if !self.registry.contains(lep) || conn == 0 {
                    return Outcome::Int(-2);
                }
                let (lep, module) = (lep.clone(), module.clone());
                Outcome::Int(self.unmap_connection_op(&lep, &module, conn).await)
            }
            CommandName::UnmapAll => {
                let Some(lep) = args.first() else {
                    return Outcome::Int(-1);
                };
                if !self.registry.contains(lep) {
                    return Outcome::Int(-2);
                }
                let lep = lep.clone();
                Outcome::Int(self.unmap_all_op(&lep).await)
            }
            CommandName::Divert => {
                let (Some(lep), Some(from_ep), Some(addr), Some(to_ep)) =
                    (args.first(), args.get(1), args.get(2), args.get(3))
                else {
                    return Outcome::Int(-1);
                };
                if !self.registry.contains(lep) {
                    return Outcome::Int(-2);
                }
                Outcome::Int(self.divert_op(lep, from_ep, addr, to_ep))
            }
            CommandName::EpMoreMessages => {
                let Some(lep) = args.first() else {
                    return Outcome::Int(-1);
                };
                self.registry.get(lep).map_or(Outcome::Int(-2), |lep| {
                    Outcome::Int(lep.messages.len() as i64)
                })
            }
            CommandName::EpMoreRequests => {
                let Some(lep) = args.first() else {
                    return Outcome::Int(-1);
                };
                self.registry.get(lep).map_or(Outcome::Int(-2), |lep| {
                    Outcome::Int(lep.requests.len() as i64)
                })
            }
            CommandName::EpMoreResponses => {
                let (Some(lep), Some(req_id)) = (args.first(), args.get(1)) else {
                    return Outcome::Int(-1);
                };
                self.registry.get(lep).map_or(Outcome::Int(-2), |lep| {
                    Outcome::Int(
                        lep.responses
                            .get(req_id)
                            .map_or(0, |queue| queue.len() as i64),
                    )
                })
            }
            CommandName::EpSendMessage => {
                if let (Some(lep), Some(msg_id), Some(body)) =
                    (args.first(), args.get(1), args.get(2))
                {
                    let (lep, msg_id, body) = (lep.clone(), msg_id.clone(), body.clone());
                    self.cmd_send_message(&lep, &msg_id, &body).await;
                }
                Outcome::Silent
            }
            CommandName::EpSendRequest => {
                if let (Some(lep), Some(req_id), Some(msg_str)) =
                    (args.first(), args.get(1), args.get(2))
                {
                    let (lep, req_id, msg_str) = (lep.clone(), req_id.clone(), msg_str.clone());
                    self.cmd_send_request(&lep, &req_id, &msg_str).await;
                }
                Outcome::Silent
            }
            CommandName::EpSendResponse => {
                if let (Some(lep), Some(req_id), Some(msg_str)) =
                    (args.first(), args.get(1), args.get(2))
                {
                    let (lep, req_id, msg_str) = (lep.clone(), req_id.clone(), msg_str.clone());
                    self.cmd_send_response(&lep, &req_id, &msg_str).await;
                }
                Outcome::Silent
            }
            CommandName::EpStreamStart => {
                if let Some(lep) = args.first().cloned() {
                    self.cmd_stream_cmd(&lep, 1).await;
                }
                Outcome::Silent
            }
            CommandName::EpStreamStop => {
                if let Some(lep) = args.first().cloned() {
                    self.cmd_stream_cmd(&lep, 0).await;
                }
                Outcome::Silent
            }
            CommandName::EpStreamSend => {
                if let (Some(lep), Some(data)) = (args.first(), args.get(1)) {
                    let (lep, data) = (lep.clone(), data.clone());
                    self.cmd_stream_send(&lep, &data).await;
                }
                Outcome::Silent
            }
            CommandName::EpFetchMessage => {
                let Some(lep) = args.first() else {
                    return Outcome::Silent;
                };
                self.cmd_fetch(lep, &cmd.msg_id, FetchKind::Message)
            }
            CommandName::EpFetchRequest => {
                let Some(lep) = args.first() else {
                    return Outcome::Silent;
                };
                self.cmd_fetch(lep, &cmd.msg_id, FetchKind::Request)
            }
            CommandName::EpFetchResponse => {
                let (Some(lep), Some(req_id)) = (args.first(), args.get(1)) else {
                    return Outcome::Silent;
                };
                let req_id = req_id.clone();
                self.cmd_fetch(lep, &cmd.msg_id, FetchKind::Response(req_id))
            }
            CommandName::AddManifest => {
                if let Some(blob) = args.first() {
                    self.cmd_add_manifest(blob);
                }
                Outcome::Silent
            }
            CommandName::GetManifest => Outcome::Str(self.build_manifest(None).to_string()),
            CommandName::AddRdc => {
                if let (Some(module), Some(addr)) = (args.first(), args.get(1)) {
                    self.rdcs.push((module.clone(), addr.clone()));
                }
                Outcome::Silent
            }
            CommandName::RdcRegister => {
                let target = args
                    .first()
                    .zip(args.get(1))
                    .map(|(addr, module)| (module.clone(), addr.clone()));
                self.rdc_register(target).await;
                Outcome::Silent
            }
            CommandName::RdcUnregister => {
                let address = args.first().cloned();
                self.rdc_unregister(address).await;
                Outcome::Silent
            }
            CommandName::EpAddFilter => {
                if let (Some(lep), Some(filter)) = (args.first(), args.get(1)) {
                    match Predicate::parse(filter) {
                        Ok(pred) => {
                            if let Some(lep) = self.registry.get_mut(lep) {
                                lep.filters.push(pred);
                            }
                        }
                        Err(e) => warn!(%filter, error = %e, "bad filter"),
                    }
                }
                Outcome::Silent
            }
            CommandName::EpResetFilter => {
                if let Some(lep_id) = args.first() {
                    let filters = args
                        .get(1)
                        .map(|q| parse_query(q).unwrap_or_default())
                        .unwrap_or_default();
                    if let Some(lep) = self.registry.get_mut(lep_id) {
                        lep.filters = filters;
                    }
                }
                Outcome::Silent
            }
            CommandName::EpSetAccess => {
                if let (Some(lep), Some(subject)) = (args.first(), args.get(1)) {
                    if let Some(lep) = self.registry.get_mut(lep) {
                        lep.access.insert(subject.clone());
                    }
                }
                Outcome::Silent
            }
            CommandName::EpResetAccess => {
                if let (Some(lep), Some(subject)) = (args.first(), args.get(1)) {
                    if let Some(lep) = self.registry.get_mut(lep) {
                        if subject.is_empty() {
                            lep.access.clear();
                        } else {
                            lep.access.remove(subject);
                        }
                    }
                }
                Outcome::Silent
            }
            CommandName::EpGetAllConns => {
                let Some(lep) = args.first() else {
                    return Outcome::Str(String::new());
                };
                Outcome::Str(self.cmd_all_connections(lep).to_string())
            }
            CommandName::GetRemoteManif => {
                let (Some(module), Some(conn)) = (args.first(), args.get(1)) else {
                    return Outcome::Str(String::new());
                };
                let conn = conn.parse::<u64>().unwrap_or(0);
                let manifest = self
                    .remote_manifests
                    .get(&(module.clone(), conn))
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                Outcome::Str(manifest.to_string())
            }
            CommandName::Terminate => {
                self.begin_terminate().await;
                Outcome::Silent
            }
            CommandName::LoadComModule => {
                let Some(name) = args.first() else {
                    return Outcome::Int(-1);
                };
                let config = args.get(1).cloned();
                let name = name.clone();
                Outcome::Int(self.cmd_load_com_module(&name, config.as_deref()).await)
            }
            CommandName::LoadAccModule => {
                let Some(name) = args.first() else {
                    return Outcome::Int(-1);
                };
                Outcome::Int(self.cmd_load_acc_module(name))
            }
        }
    }

    fn cmd_register_endpoint(&mut self, blob: &str) -> Outcome {
        let value: Value = match serde_json::from_str(blob) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "unparseable endpoint declaration");
                return Outcome::Int(-2);
            }
        };
        match EndpointDecl::from_json(&value) {
            Ok(decl) => {
                info!(ep_id = %decl.ep_id, ep_name = %decl.ep_name, kind = decl.kind.as_str(), "endpoint registered");
                self.registry.insert(LocalEndpoint::new(decl));
                Outcome::Int(0)
            }
            Err(e) => {
                warn!(error = %e, "invalid endpoint declaration");
                Outcome::Int(-2)
            }
        }
    }

    async fn cmd_remove_endpoint(&mut self, ep_id: &str) {
        if !self.registry.contains(ep_id) {
            return;
        }
        self.unmap_all_op(ep_id).await;
        self.wake_response_waiters(ep_id).await;
        let waiters: Vec<String> = self
            .registry
            .get_mut(ep_id)
            .map(|lep| {
                let mut waiters = lep.messages.drain_waiters();
                waiters.extend(lep.requests.drain_waiters());
                waiters
            })
            .unwrap_or_default();
        for waiter in waiters {
            self.reply_to_app(&waiter, ReturnKind::Msg, b"").await;
        }
        self.pending_responses.retain(|_, lep| lep != ep_id);
        self.registry.remove(ep_id);
        info!(%ep_id, "endpoint removed");
    }

    /// Forwards a MSG to every established mapping of the endpoint.
    async fn cmd_send_message(&mut self, lep: &str, msg_id: &str, body: &str) {
        let body: Value =
            serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()));
        let targets = self.established_targets(lep);
        for (key, remote_ep) in targets {
            let mut msg = Message::with_id(Status::Msg, msg_id, body.clone());
            msg.ep_id = remote_ep;
            self.send_peer(&key, &msg).await;
        }
    }

    /// Forwards a REQ and records it in the pending-responses table.
    async fn cmd_send_request(&mut self, lep: &str, req_id: &str, msg_str: &str) {
        let Ok(mut msg) = Message::parse(msg_str) else {
            warn!(%lep, "unparseable request payload");
            return;
        };
        msg.status = Status::Req;
        msg.msg_id = req_id.to_string();
        let targets = self.established_targets(lep);
        if targets.is_empty() {
            debug!(%lep, "request with no mappings");
            return;
        }
        self.pending_responses
            .insert(req_id.to_string(), lep.to_string());
        for (key, remote_ep) in targets {
            msg.ep_id = remote_ep;
            self.send_peer(&key, &msg).await;
        }
    }

    /// Routes a RESP back on the connection its request arrived on.
    async fn cmd_send_response(&mut self, lep: &str, req_id: &str, msg_str: &str) {
        let Ok(mut msg) = Message::parse(msg_str) else {
            warn!(%lep, "unparseable response payload");
            return;
        };
        if !matches!(msg.status, Status::RespNext | Status::RespLast) {
            msg.status = Status::RespNext;
        }
        msg.msg_id = req_id.to_string();
        let Some(origin) = self.request_origins.get(req_id).cloned() else {
            debug!(%req_id, "response without a recorded request origin");
            return;
        };
        if msg.status == Status::RespLast {
            self.request_origins.remove(req_id);
        }
        self.send_peer(&origin, &msg).await;
    }

    /// Sends STREAM_CMD (open/close) to the endpoint's peers.
    async fn cmd_stream_cmd(&mut self, lep: &str, command: i64) {
        let targets = self.established_targets(lep);
        for (key, remote_ep) in targets {
            let mut msg = Message::new(Status::StreamCmd, serde_json::json!({"command": command}));
            msg.ep_id = remote_ep;
            self.send_peer(&key, &msg).await;
        }
    }

    /// Sends a STREAM frame carrying raw data to the endpoint's peers.
    async fn cmd_stream_send(&mut self, lep: &str, data: &str) {
        let targets = self.established_targets(lep);
        for (key, remote_ep) in targets {
            let mut msg = Message::new(Status::Stream, serde_json::json!({"stream": data}));
            msg.ep_id = remote_ep;
            self.send_peer(&key, &msg).await;
        }
    }

    fn cmd_fetch(&mut self, lep: &str, reply_id: &str, kind: FetchKind) -> Outcome {
        let Some(lep) = self.registry.get_mut(lep) else {
            return Outcome::Silent;
        };
        let queue = match &kind {
            FetchKind::Message => &mut lep.messages,
            FetchKind::Request => &mut lep.requests,
            FetchKind::Response(req_id) => lep.responses_for(req_id),
        };
        match queue.pop() {
            Some(msg) => Outcome::Msg(Box::new(msg)),
            None => {
                // Empty: park the reply until the next arrival.
                queue.park(reply_id.to_string());
                Outcome::Silent
            }
        }
    }

    fn cmd_add_manifest(&mut self, blob: &str) {
        // The component wraps manifest data in a CMD message; accept the
        // bare JSON form as well.
        let value = Message::parse(blob).map_or_else(
            |_| serde_json::from_str(blob).ok(),
            |msg| Some(msg.body),
        );
        match value {
            Some(value) if value.is_object() => self.manifest_extra.push(value),
            _ => warn!("unusable manifest payload"),
        }
    }

    fn cmd_all_connections(&self, lep: &str) -> Value {
        // An unknown or unmapped endpoint yields an empty list, never null.
        let mappings: Vec<Value> = self
            .mappings
            .iter()
            .filter(|m| m.lep == lep)
            .map(|m| {
                serde_json::json!({
                    "handle": m.handle,
                    "module": m.module,
                    "address": m.address,
                    "conn": m.conn,
                    "remote_ep": m.remote_ep,
                })
            })
            .collect();
        serde_json::json!({ "all_mappings": mappings })
    }

    async fn cmd_load_com_module(&mut self, name: &str, config: Option<&str>) -> i64 {
        let module = match self.activate_module(name) {
            Ok(module) => module,
            Err(e) => {
                warn!(%name, error = %e, "com module load failed");
                return -1;
            }
        };
        let listen = config
            .and_then(|c| serde_json::from_str::<Value>(c).ok())
            .and_then(|c| {
                c.get("listen")
                    .and_then(Value::as_str)
                    .map(ToString::to_string)
            });
        if let Some(address) = listen {
            match module.listen(&address).await {
                Ok(bound) => info!(module = %name, %bound, "listening"),
                Err(e) => {
                    warn!(module = %name, %address, error = %e, "listen failed");
                    return -1;
                }
            }
        }
        0
    }

    fn cmd_load_acc_module(&mut self, name: &str) -> i64 {
        match name {
            "open" => {
                self.set_access_module(std::sync::Arc::new(super::OpenAccess::new(
                    self.app_name.clone(),
                )));
                0
            }
            other => {
                warn!(module = %other, "unknown access module");
                -1
            }
        }
    }

    /// (connection key, remote endpoint id) of every established mapping.
    fn established_targets(&self, lep: &str) -> Vec<(ConnKey, Option<String>)> {
        self.mappings
            .established_for_lep(lep)
            .filter_map(|m| {
                m.conn
                    .map(|conn| ((m.module.clone(), conn), m.remote_ep.clone()))
            })
            .collect()
    }
}

enum FetchKind {
    Message,
    Request,
    Response(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_is_complete() {
        // Every name from the protocol surface dispatches with its kind.
        let expected: [(&str, ReturnKind); 35] = [
            ("register_endpoint", ReturnKind::Int),
            ("remove_endpoint", ReturnKind::Void),
            ("map", ReturnKind::Int),
            ("map_module", ReturnKind::Int),
            ("map_lookup", ReturnKind::Void),
            ("unmap", ReturnKind::Int),
            ("unmap_connection", ReturnKind::Int),
            ("unmap_all", ReturnKind::Int),
            ("divert", ReturnKind::Int),
            ("ep_more_messages", ReturnKind::Int),
            ("ep_more_requests", ReturnKind::Int),
            ("ep_more_responses", ReturnKind::Int),
            ("ep_send_message", ReturnKind::Void),
            ("ep_send_request", ReturnKind::Void),
            ("ep_send_response", ReturnKind::Void),
            ("ep_stream_start", ReturnKind::Void),
            ("ep_stream_stop", ReturnKind::Void),
            ("ep_stream_send", ReturnKind::Void),
            ("ep_fetch_message", ReturnKind::Msg),
            ("ep_fetch_request", ReturnKind::Msg),
            ("ep_fetch_response", ReturnKind::Msg),
            ("add_manifest", ReturnKind::Void),
            ("get_manifest", ReturnKind::Str),
            ("add_rdc", ReturnKind::Void),
            ("rdc_register", ReturnKind::Void),
            ("rdc_unregister", ReturnKind::Void),
            ("ep_add_filter", ReturnKind::Void),
            ("ep_reset_filter", ReturnKind::Void),
            ("ep_set_access", ReturnKind::Void),
            ("ep_reset_access", ReturnKind::Void),
            ("ep_get_all_conns", ReturnKind::Str),
            ("get_remote_manif", ReturnKind::Str),
            ("terminate", ReturnKind::Void),
            ("load_com_module", ReturnKind::Int),
            ("load_acc_module", ReturnKind::Int),
        ];
        for (function_id, kind) in expected {
            let name = CommandName::lookup("core", function_id, kind);
            assert!(name.is_some(), "missing dispatch entry for {function_id}");
            let name = name.unwrap();
            assert_eq!(name.function_id(), function_id);
            assert_eq!(name.return_kind(), kind);
        }
        assert_eq!(CommandName::ALL.len(), expected.len());
    }

    #[test]
    fn lookup_requires_matching_kind_and_module() {
        assert!(CommandName::lookup("core", "map", ReturnKind::Int).is_some());
        assert!(CommandName::lookup("core", "map", ReturnKind::Str).is_none());
        assert!(CommandName::lookup("xxxx", "map", ReturnKind::Int).is_none());
        assert!(CommandName::lookup("core", "frobnicate", ReturnKind::Int).is_none());
    }

    #[test]
    fn function_ids_fit_the_wire_width() {
        for name in CommandName::ALL {
            assert!(
                name.function_id().len() <= crate::codec::FUNCTION_ID_WIDTH,
                "{} exceeds the function id field",
                name.function_id()
            );
            assert!(!name.function_id().ends_with('_'));
        }
    }
}
