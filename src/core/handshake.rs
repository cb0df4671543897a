//! Connection handshake: HELLO and AUTH.
//!
//! Bridge transports run a symmetric handshake — both sides HELLO with
//! their manifest on connect, acknowledge the peer's HELLO, then exchange
//! credentials. Because the two directions race, HELLO and HELLO_ACK can
//! arrive in either order; the `Hello2`/`HelloAckS` states record which
//! half completed first. The authentication flags are authoritative:
//! a connection becomes operational exactly when `am_auth && is_auth`.
//! Non-bridge transports skip all of this and start at `Map`.

use tracing::{debug, info, warn};

use crate::message::{Message, Status};

use super::state::{Callback, ConnKey, ConnState, Connection};
use super::Core;

impl Core {
    /// Installs state for a fresh connection (inbound accept or outbound
    /// dial). `active_map` carries the mapping handle the dialing side
    /// will MAP for once the handshake completes.
    pub(crate) async fn handle_new_connection(&mut self, key: ConnKey, active_map: Option<i64>) {
        let Some(module) = self.module(&key.0) else {
            warn!(module = %key.0, "connection on unknown module");
            return;
        };
        if module.is_bridge() {
            let mut conn = Connection::new(key.clone(), ConnState::HelloS, Callback::Proto);
            conn.active_map = active_map;
            self.conns.insert(conn);
            let hello = Message::new(Status::Hello, self.build_manifest(Some(&key.0)));
            self.send_peer(&key, &hello).await;
        } else {
            // Direct external transport: no peer core, no handshake.
            let mut conn = Connection::new(key.clone(), ConnState::Map, Callback::Operational);
            conn.active_map = active_map;
            conn.am_auth = true;
            conn.is_auth = true;
            self.conns.insert(conn);
            if active_map.is_some() {
                self.send_map(&key).await;
            }
        }
    }

    /// Handles a message on a connection still in the handshake.
    pub(crate) async fn handle_proto_message(&mut self, key: &ConnKey, msg: Message) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        let state = conn.state;
        match msg.status {
            Status::Hello => match state {
                ConnState::HelloS => {
                    self.remote_manifests.insert(key.clone(), msg.body);
                    self.send_hello_ack(key).await;
                    if let Some(conn) = self.conns.get_mut(key) {
                        conn.state = ConnState::Hello2;
                    }
                }
                ConnState::HelloAckS => {
                    // Their HELLO_ACK overtook their HELLO.
                    self.remote_manifests.insert(key.clone(), msg.body);
                    self.send_hello_ack(key).await;
                    self.enter_auth(key).await;
                }
                _ => debug!(?key, ?state, "HELLO out of order"),
            },
            Status::HelloAck => match state {
                ConnState::Hello2 => self.enter_auth(key).await,
                ConnState::HelloS => {
                    if let Some(conn) = self.conns.get_mut(key) {
                        conn.state = ConnState::HelloAckS;
                    }
                }
                _ => debug!(?key, ?state, "HELLO_ACK out of order"),
            },
            Status::Auth => {
                let accepted = self.access.verify(&msg.body);
                match accepted {
                    Some(subject) => {
                        if let Some(conn) = self.conns.get_mut(key) {
                            conn.is_auth = true;
                            conn.peer_subject = Some(subject.clone());
                            if !conn.am_auth {
                                conn.state = ConnState::Auth2;
                            }
                        }
                        debug!(?key, %subject, "peer authenticated");
                        let ack = Message::new(
                            Status::AuthAck,
                            serde_json::json!({ "accepted": true }),
                        );
                        self.send_peer(key, &ack).await;
                    }
                    None => {
                        warn!(?key, "peer credential rejected");
                    }
                }
                self.check_authenticated(key).await;
            }
            Status::AuthAck => {
                if let Some(conn) = self.conns.get_mut(key) {
                    conn.am_auth = true;
                    if !conn.is_auth {
                        conn.state = ConnState::AuthAck;
                    }
                }
                self.check_authenticated(key).await;
            }
            other => {
                debug!(?key, status = %other, "unexpected message during handshake");
            }
        }
    }

    async fn send_hello_ack(&self, key: &ConnKey) {
        let ack = Message::new(Status::HelloAck, self.build_manifest(Some(&key.0)));
        self.send_peer(key, &ack).await;
    }

    /// Moves into the AUTH phase and presents this side's credential.
    async fn enter_auth(&mut self, key: &ConnKey) {
        if let Some(conn) = self.conns.get_mut(key) {
            conn.state = ConnState::Auth;
        }
        let auth = Message::new(Status::Auth, self.access.credential());
        self.send_peer(key, &auth).await;
    }

    /// Once both flags hold, swaps to the operational callback and either
    /// sends MAP (active mapper) or waits for one (passive side).
    async fn check_authenticated(&mut self, key: &ConnKey) {
        let ready = self
            .conns
            .get(key)
            .is_some_and(Connection::authenticated);
        if !ready {
            return;
        }
        let active = {
            let Some(conn) = self.conns.get_mut(key) else {
                return;
            };
            conn.callback = Callback::Operational;
            conn.state = ConnState::Map;
            conn.active_map
        };
        info!(?key, active = active.is_some(), "connection authenticated");
        if active.is_some() {
            self.send_map(key).await;
        }
    }

    /// Sends the MAP message for the mapping this connection was dialed
    /// for, carrying the endpoint and component queries.
    pub(crate) async fn send_map(&mut self, key: &ConnKey) {
        let Some(handle) = self.conns.get(key).and_then(|c| c.active_map) else {
            return;
        };
        let Some(mapping) = self.mappings.get(handle) else {
            return;
        };
        let ep_query: serde_json::Value =
            serde_json::from_str(&mapping.ep_query).unwrap_or_else(|_| serde_json::json!([]));
        let cpt_query: serde_json::Value =
            serde_json::from_str(&mapping.cpt_query).unwrap_or_else(|_| serde_json::json!([]));
        let ep_name = self
            .registry
            .get(&mapping.lep)
            .map(|lep| lep.decl.ep_name.clone())
            .unwrap_or_default();
        let body = serde_json::json!({
            "ep_query": ep_query,
            "cpt_query": cpt_query,
            "ep_id": mapping.lep,
            "ep_name": ep_name,
        });
        let map = Message::new(Status::Map, body);
        if let Some(conn) = self.conns.get_mut(key) {
            conn.state = ConnState::MapAck;
        }
        self.send_peer(key, &map).await;
    }
}
