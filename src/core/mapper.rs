//! Mapping table: live associations between local endpoints and peers.
//!
//! A mapping is the unit manipulated by map/unmap/divert. At most one
//! mapping exists per (local endpoint, address, module) triple; mapping
//! the same triple again replaces the previous entry. Mappings created
//! by the active (dialing) side carry a parked command reply released
//! when the peer's MAP_ACK finalises the handshake.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{ReturnKind, int_payload};
use crate::message::{Message, Status};
use crate::predicate::{self, Predicate};
use crate::transport::{ComModule, ConnId};

use super::Core;
use super::registry::MsgQueue;
use super::state::{ConnKey, ConnState};

/// One live (or in-flight) mapping.
#[derive(Debug, Clone)]
pub struct Mapping {
    /// Process-unique non-negative handle returned to the component.
    pub handle: i64,
    /// Local endpoint id.
    pub lep: String,
    /// Remote address as given to map (or `conn:<id>` on the passive side).
    pub address: String,
    /// Transport module carrying the mapping.
    pub module: String,
    /// Endpoint-level query sent in MAP (normalised text).
    pub ep_query: String,
    /// Component-level query sent in MAP (normalised text).
    pub cpt_query: String,
    /// Connection handle once established.
    pub conn: Option<ConnId>,
    /// Remote endpoint id once the peer acknowledged.
    pub remote_ep: Option<String>,
    /// UNMAP sent, waiting for UNMAP_ACK or transport close.
    pub pending_teardown: bool,
    /// Command reply msg id released on MAP_ACK (active side only).
    pub parked_reply: Option<String>,
}

/// All mappings, across every endpoint.
#[derive(Debug, Default)]
pub struct MappingTable {
    maps: Vec<Mapping>,
    next_handle: i64,
}

impl MappingTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            maps: Vec::new(),
            next_handle: 1,
        }
    }

    /// Allocates the next mapping handle.
    pub fn next_handle(&mut self) -> i64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Inserts a mapping, replacing any prior entry on the same
    /// (lep, address, module) triple. Returns the replaced mapping.
    pub fn insert_replacing(&mut self, mapping: Mapping) -> Option<Mapping> {
        let replaced = self
            .maps
            .iter()
            .position(|m| {
                m.lep == mapping.lep && m.address == mapping.address && m.module == mapping.module
            })
            .map(|idx| self.maps.remove(idx));
        self.maps.push(mapping);
        replaced
    }

    #[must_use]
    pub fn get(&self, handle: i64) -> Option<&Mapping> {
        self.maps.iter().find(|m| m.handle == handle)
    }

    pub fn get_mut(&mut self, handle: i64) -> Option<&mut Mapping> {
        self.maps.iter_mut().find(|m| m.handle == handle)
    }

    pub fn remove(&mut self, handle: i64) -> Option<Mapping> {
        self.maps
            .iter()
            .position(|m| m.handle == handle)
            .map(|idx| self.maps.remove(idx))
    }

    /// The mapping currently carried on a connection.
    #[must_use]
    pub fn find_by_conn(&self, module: &str, conn: ConnId) -> Option<&Mapping> {
        self.maps
            .iter()
            .find(|m| m.module == module && m.conn == Some(conn))
    }

    pub fn find_by_conn_mut(&mut self, module: &str, conn: ConnId) -> Option<&mut Mapping> {
        self.maps
            .iter_mut()
            .find(|m| m.module == module && m.conn == Some(conn))
    }

    /// Handles of every mapping of an endpoint.
    #[must_use]
    pub fn handles_for_lep(&self, lep: &str) -> Vec<i64> {
        self.maps
            .iter()
            .filter(|m| m.lep == lep)
            .map(|m| m.handle)
            .collect()
    }

    /// Handles of an endpoint's mappings on an address (any module).
    #[must_use]
    pub fn handles_for_lep_addr(&self, lep: &str, address: &str) -> Vec<i64> {
        self.maps
            .iter()
            .filter(|m| m.lep == lep && m.address == address)
            .map(|m| m.handle)
            .collect()
    }

    /// Established mappings of an endpoint.
    pub fn established_for_lep(&self, lep: &str) -> impl Iterator<Item = &Mapping> {
        self.maps
            .iter()
            .filter(move |m| m.lep == lep && m.conn.is_some() && !m.pending_teardown)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.maps.iter()
    }
}

impl Core {
    /// Starts a mapping: dials the address (on one named module or every
    /// registered one), installs the mapping, and triggers the handshake.
    ///
    /// Returns the mapping handle, or a negative code: -1 when no
    /// transport could connect, -2 on invalid arguments. When
    /// `parked_reply` is set, the command reply is deferred until the
    /// peer's MAP_ACK finalises the mapping.
    pub(crate) async fn start_mapping(
        &mut self,
        lep: &str,
        address: &str,
        ep_query: &str,
        cpt_query: &str,
        only_module: Option<&str>,
        parked_reply: Option<String>,
    ) -> i64 {
        if address.is_empty() || !self.registry.contains(lep) {
            return -2;
        }
        let ep_query = normalize_query(ep_query);
        let cpt_query = normalize_query(cpt_query);

        let candidates: Vec<(String, Arc<dyn ComModule>)> = self
            .modules
            .iter()
            .filter(|(name, _)| only_module.is_none_or(|m| m == name.as_str()))
            .map(|(name, module)| (name.clone(), Arc::clone(module)))
            .collect();
        if candidates.is_empty() {
            return -2;
        }

        for (name, module) in candidates {
            match module.connect(address).await {
                Ok(conn) => {
                    let handle = self.mappings.next_handle();
                    let mapping = Mapping {
                        handle,
                        lep: lep.to_string(),
                        address: address.to_string(),
                        module: name.clone(),
                        ep_query: ep_query.clone(),
                        cpt_query: cpt_query.clone(),
                        conn: Some(conn),
                        remote_ep: None,
                        pending_teardown: false,
                        parked_reply,
                    };
                    if let Some(replaced) = self.mappings.insert_replacing(mapping) {
                        self.teardown_replaced(replaced).await;
                    }
                    let key = (name, conn);
                    self.handle_new_connection(key, Some(handle)).await;
                    return handle;
                }
                Err(e) => {
                    debug!(module = %name, %address, error = %e, "connect failed");
                }
            }
        }
        -1
    }

    /// Tears down the mapping displaced by a re-map of the same triple.
    async fn teardown_replaced(&mut self, replaced: Mapping) {
        if let Some(conn) = replaced.conn {
            let key = (replaced.module.clone(), conn);
            let unmap = Message::new(Status::Unmap, serde_json::Value::Null);
            self.send_peer(&key, &unmap).await;
            self.close_conn(&key).await;
        }
    }

    /// Passive side of MAP: select a local endpoint by the queries,
    /// install the reverse mapping, and acknowledge.
    pub(crate) async fn handle_map(&mut self, key: &ConnKey, msg: Message) {
        let ep_preds = query_from_body(&msg.body, "ep_query");
        let cpt_preds = query_from_body(&msg.body, "cpt_query");

        let manifest = self
            .remote_manifests
            .get(key)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        if !predicate::matches_all(&cpt_preds, &manifest) {
            warn!(?key, "component query rejected the peer");
            let nack = Message::with_id(Status::MapAck, msg.msg_id, serde_json::json!({}));
            self.send_peer(key, &nack).await;
            return;
        }

        let chosen = self
            .registry
            .iter()
            .find(|lep| predicate::matches_all(&ep_preds, &lep.decl.to_json()))
            .map(|lep| (lep.decl.ep_id.clone(), lep.decl.ep_name.clone()));

        let Some((ep_id, ep_name)) = chosen else {
            warn!(?key, "no endpoint matches the map query");
            let nack = Message::with_id(Status::MapAck, msg.msg_id, serde_json::json!({}));
            self.send_peer(key, &nack).await;
            return;
        };

        let handle = self.mappings.next_handle();
        let mapping = Mapping {
            handle,
            lep: ep_id.clone(),
            address: format!("conn:{}", key.1),
            module: key.0.clone(),
            ep_query: "[]".to_string(),
            cpt_query: "[]".to_string(),
            conn: Some(key.1),
            remote_ep: msg
                .body
                .get("ep_id")
                .and_then(serde_json::Value::as_str)
                .map(ToString::to_string),
            pending_teardown: false,
            parked_reply: None,
        };
        self.mappings.insert_replacing(mapping);
        if let Some(conn) = self.conns.get_mut(key) {
            conn.lep = Some(ep_id.clone());
            conn.is_mapped = true;
            conn.state = ConnState::ExtMsg;
        }
        info!(?key, %ep_id, %ep_name, "mapped (passive)");
        let ack = Message::with_id(
            Status::MapAck,
            msg.msg_id,
            serde_json::json!({ "ep_id": ep_id, "ep_name": ep_name }),
        );
        self.send_peer(key, &ack).await;
    }

    /// Active side of MAP_ACK: finalise the mapping and release the
    /// parked map reply.
    pub(crate) async fn handle_map_ack(&mut self, key: &ConnKey, msg: Message) {
        let Some(mapping) = self.mappings.find_by_conn_mut(&key.0, key.1) else {
            debug!(?key, "MAP_ACK without a mapping");
            return;
        };
        let handle = mapping.handle;
        let parked = mapping.parked_reply.take();
        let remote_ep = msg
            .body
            .get("ep_id")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string);

        let Some(remote_ep) = remote_ep else {
            // Peer refused the mapping.
            warn!(?key, "peer refused the mapping");
            let lep = mapping.lep.clone();
            self.mappings.remove(handle);
            if let Some(reply) = parked {
                self.reply_to_app(&reply, ReturnKind::Int, int_payload(-1).as_bytes())
                    .await;
            }
            debug!(%lep, "mapping removed after refusal");
            self.close_conn(key).await;
            return;
        };

        mapping.remote_ep = Some(remote_ep);
        let lep = mapping.lep.clone();
        if let Some(conn) = self.conns.get_mut(key) {
            conn.lep = Some(lep.clone());
            conn.is_mapped = true;
            conn.state = ConnState::ExtMsg;
        }
        info!(?key, %lep, handle, "mapped (active)");
        if let Some(reply) = parked {
            self.reply_to_app(&reply, ReturnKind::Int, int_payload(handle).as_bytes())
                .await;
        }
    }

    /// Peer-initiated UNMAP: acknowledge, drop the mapping, close.
    pub(crate) async fn handle_unmap(&mut self, key: &ConnKey, msg: Message) {
        let mapped = self.conns.get(key).is_some_and(|c| c.is_mapped);
        if !mapped {
            debug!(?key, "UNMAP on unmapped connection");
            return;
        }
        let ack = Message::with_id(Status::UnmapAck, msg.msg_id, serde_json::Value::Null);
        self.send_peer(key, &ack).await;
        self.finalize_unmap(key).await;
        self.close_conn(key).await;
    }

    /// UNMAP_ACK (or transport close): final teardown of whatever
    /// mapping the connection carried.
    pub(crate) async fn handle_unmap_ack(&mut self, key: &ConnKey) {
        self.finalize_unmap(key).await;
        self.close_conn(key).await;
    }

    /// Removes the mapping carried on a connection and wakes any fetch
    /// waiters for responses that can no longer arrive.
    pub(crate) async fn finalize_unmap(&mut self, key: &ConnKey) {
        let Some(handle) = self.mappings.find_by_conn(&key.0, key.1).map(|m| m.handle) else {
            return;
        };
        let Some(removed) = self.mappings.remove(handle) else {
            return;
        };
        if let Some(conn) = self.conns.get_mut(key) {
            conn.lep = None;
            conn.is_mapped = false;
        }
        if let Some(reply) = removed.parked_reply {
            self.reply_to_app(&reply, ReturnKind::Int, int_payload(-1).as_bytes())
                .await;
        }
        self.wake_response_waiters(&removed.lep).await;
        debug!(?key, lep = %removed.lep, "mapping torn down");
    }

    /// Releases every parked response-fetch waiter of an endpoint with an
    /// empty payload (the component observes a null message).
    pub(crate) async fn wake_response_waiters(&mut self, lep: &str) {
        let waiters: Vec<String> = self
            .registry
            .get_mut(lep)
            .map(|lep| {
                lep.responses
                    .values_mut()
                    .flat_map(MsgQueue::drain_waiters)
                    .collect()
            })
            .unwrap_or_default();
        for waiter in waiters {
            self.reply_to_app(&waiter, ReturnKind::Msg, b"").await;
        }
    }

    /// Sends UNMAP for one mapping and marks it pending teardown; the
    /// teardown finalises on UNMAP_ACK or transport close.
    pub(crate) async fn send_unmap_for_handle(&mut self, handle: i64) {
        let Some(mapping) = self.mappings.get_mut(handle) else {
            return;
        };
        mapping.pending_teardown = true;
        let conn = mapping.conn;
        let module = mapping.module.clone();
        match conn {
            Some(conn) => {
                let unmap = Message::new(Status::Unmap, serde_json::Value::Null);
                self.send_peer(&(module, conn), &unmap).await;
            }
            None => {
                // Never established; nothing to tell the peer.
                self.mappings.remove(handle);
            }
        }
    }

    /// Unmaps every mapping of `lep` on `address`; returns how many
    /// teardowns were initiated (0 when none matched).
    pub(crate) async fn unmap_endpoint(&mut self, lep: &str, address: &str) -> i64 {
        let handles = self.mappings.handles_for_lep_addr(lep, address);
        let count = handles.len() as i64;
        for handle in handles {
            self.send_unmap_for_handle(handle).await;
        }
        count
    }

    /// Unmaps exactly the mapping carried on a specific connection.
    pub(crate) async fn unmap_connection_op(
        &mut self,
        lep: &str,
        module: &str,
        conn: ConnId,
    ) -> i64 {
        let Some(mapping) = self.mappings.find_by_conn(module, conn) else {
            return 0;
        };
        if mapping.lep != lep {
            return 0;
        }
        let handle = mapping.handle;
        self.send_unmap_for_handle(handle).await;
        1
    }

    /// Unmaps every mapping of an endpoint; returns the count.
    pub(crate) async fn unmap_all_op(&mut self, lep: &str) -> i64 {
        let handles = self.mappings.handles_for_lep(lep);
        let count = handles.len() as i64;
        for handle in handles {
            self.send_unmap_for_handle(handle).await;
        }
        count
    }

    /// Atomically retargets an existing mapping at a new remote endpoint
    /// id without re-handshaking. In-flight responses keep flowing on the
    /// connection; only future traffic carries the new target.
    pub(crate) fn divert_op(&mut self, lep: &str, from_ep: &str, address: &str, to_ep: &str) -> i64 {
        let handles = self.mappings.handles_for_lep_addr(lep, address);
        for handle in handles {
            if let Some(mapping) = self.mappings.get_mut(handle) {
                if mapping.remote_ep.as_deref() == Some(from_ep) {
                    mapping.remote_ep = Some(to_ep.to_string());
                    return 0;
                }
            }
        }
        -2
    }
}

/// Normalises a query: empty or one-character text means match-all.
pub(crate) fn normalize_query(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.len() <= 1 {
        "[]".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extracts and parses a query array from a MAP body; malformed or
/// missing queries match everything.
fn query_from_body(body: &serde_json::Value, field: &str) -> Vec<Predicate> {
    body.get(field)
        .map(|q| predicate::parse_query(&q.to_string()).unwrap_or_default())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(table: &mut MappingTable, lep: &str, address: &str, module: &str) -> Mapping {
        Mapping {
            handle: table.next_handle(),
            lep: lep.to_string(),
            address: address.to_string(),
            module: module.to_string(),
            ep_query: "[]".to_string(),
            cpt_query: "[]".to_string(),
            conn: None,
            remote_ep: None,
            pending_teardown: false,
            parked_reply: None,
        }
    }

    #[test]
    fn double_map_on_a_triple_replaces() {
        let mut table = MappingTable::new();
        let first = mapping(&mut table, "ep1", "10.0.0.1:1505", "tcp");
        let first_handle = first.handle;
        assert!(table.insert_replacing(first).is_none());

        let second = mapping(&mut table, "ep1", "10.0.0.1:1505", "tcp");
        let replaced = table.insert_replacing(second).expect("should replace");
        assert_eq!(replaced.handle, first_handle);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_triples_coexist() {
        let mut table = MappingTable::new();
        let a = mapping(&mut table, "ep1", "10.0.0.1:1505", "tcp");
        let b = mapping(&mut table, "ep1", "10.0.0.2:1505", "tcp");
        let c = mapping(&mut table, "ep2", "10.0.0.1:1505", "tcp");
        table.insert_replacing(a);
        table.insert_replacing(b);
        table.insert_replacing(c);
        assert_eq!(table.len(), 3);
        assert_eq!(table.handles_for_lep("ep1").len(), 2);
        assert_eq!(table.handles_for_lep_addr("ep1", "10.0.0.1:1505").len(), 1);
    }

    #[test]
    fn find_by_conn() {
        let mut table = MappingTable::new();
        let mut m = mapping(&mut table, "ep1", "10.0.0.1:1505", "tcp");
        m.conn = Some(7);
        let handle = m.handle;
        table.insert_replacing(m);
        assert_eq!(table.find_by_conn("tcp", 7).map(|m| m.handle), Some(handle));
        assert!(table.find_by_conn("tcp", 8).is_none());
        assert!(table.find_by_conn("unix", 7).is_none());
    }

    #[test]
    fn remove_by_handle() {
        let mut table = MappingTable::new();
        let m = mapping(&mut table, "ep1", "addr", "tcp");
        let handle = m.handle;
        table.insert_replacing(m);
        assert!(table.remove(handle).is_some());
        assert!(table.remove(handle).is_none());
        assert!(table.is_empty());
    }
}
