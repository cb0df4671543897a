//! Per-connection protocol state.
//!
//! Every open transport connection — peer cores, the component channel,
//! and transient RDC exchanges — owns a [`Connection`] record holding its
//! handshake state, frame buffer, and authentication flags. The records
//! live in a [`ConnectionTable`] mutated only by the core's event loop.

use std::collections::HashMap;

use crate::framing::FrameBuffer;
use crate::transport::ConnId;

/// Key of a connection: (module name, connection handle).
pub type ConnKey = (String, ConnId);

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// HELLO sent, nothing received yet.
    HelloS,
    /// Peer's HELLO handled before its HELLO_ACK arrived.
    Hello2,
    /// Peer's HELLO_ACK handled before its HELLO arrived.
    HelloAckS,
    /// Handshake: exchanging credentials.
    Auth,
    /// Peer credential verified, own acknowledgement outstanding.
    Auth2,
    /// Own credential acknowledged, peer credential outstanding.
    AuthAck,
    /// Authenticated, awaiting a MAP (passive side).
    Map,
    /// MAP sent, awaiting MAP_ACK (active side).
    MapAck,
    /// Operational endpoint traffic.
    ExtMsg,
    /// Component channel awaiting the session key.
    FirstMsg,
    /// Component channel processing commands.
    AppMsg,
    /// Torn down.
    Closed,
}

/// Which handler consumes frames on this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    /// HELLO/AUTH handshake on a bridge transport.
    Proto,
    /// Operational MAP/endpoint traffic.
    Operational,
    /// The component channel (session key, then commands).
    Component,
    /// A transient resource-discovery exchange.
    Rdc(RdcExchange),
}

/// Context carried by an in-flight RDC lookup connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdcExchange {
    /// Local endpoint the lookup maps for (empty for register/unregister).
    pub lep: String,
    pub ep_query: String,
    pub cpt_query: String,
    /// Maximum number of returned candidates to map to.
    pub max_maps: usize,
}

/// State of one transport connection.
#[derive(Debug)]
pub struct Connection {
    pub key: ConnKey,
    pub state: ConnState,
    pub callback: Callback,
    pub buffer: FrameBuffer,
    pub am_auth: bool,
    pub is_auth: bool,
    /// Local endpoint this connection is mapped to, once established.
    pub lep: Option<String>,
    pub is_mapped: bool,
    /// Authenticated peer subject, set by the access module.
    pub peer_subject: Option<String>,
    /// Mapping handle this side should MAP for once authenticated
    /// (present only on the active, dialing side).
    pub active_map: Option<i64>,
}

impl Connection {
    #[must_use]
    pub fn new(key: ConnKey, state: ConnState, callback: Callback) -> Self {
        Self {
            key,
            state,
            callback,
            buffer: FrameBuffer::new(),
            am_auth: false,
            is_auth: false,
            lep: None,
            is_mapped: false,
            peer_subject: None,
            active_map: None,
        }
    }

    /// True once both sides accepted each other's credentials.
    #[must_use]
    pub const fn authenticated(&self) -> bool {
        self.am_auth && self.is_auth
    }
}

/// All open connections, keyed by (module, conn).
#[derive(Debug, Default)]
pub struct ConnectionTable {
    conns: HashMap<ConnKey, Connection>,
}

impl ConnectionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, conn: Connection) {
        self.conns.insert(conn.key.clone(), conn);
    }

    #[must_use]
    pub fn get(&self, key: &ConnKey) -> Option<&Connection> {
        self.conns.get(key)
    }

    pub fn get_mut(&mut self, key: &ConnKey) -> Option<&mut Connection> {
        self.conns.get_mut(key)
    }

    pub fn remove(&mut self, key: &ConnKey) -> Option<Connection> {
        self.conns.remove(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Keys of every open connection.
    #[must_use]
    pub fn keys(&self) -> Vec<ConnKey> {
        self.conns.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConnKey {
        ("tcp".to_string(), 1)
    }

    #[test]
    fn authenticated_needs_both_flags() {
        let mut conn = Connection::new(key(), ConnState::Auth, Callback::Proto);
        assert!(!conn.authenticated());
        conn.is_auth = true;
        assert!(!conn.authenticated());
        conn.am_auth = true;
        assert!(conn.authenticated());
    }

    #[test]
    fn table_insert_get_remove() {
        let mut table = ConnectionTable::new();
        table.insert(Connection::new(key(), ConnState::HelloS, Callback::Proto));
        assert_eq!(table.len(), 1);
        assert!(table.get(&key()).is_some());
        table.get_mut(&key()).unwrap().state = ConnState::ExtMsg;
        assert_eq!(table.get(&key()).unwrap().state, ConnState::ExtMsg);
        assert!(table.remove(&key()).is_some());
        assert!(table.is_empty());
    }
}
