//! Endpoint registry: the core's shadow of the component's endpoints.
//!
//! Each registered endpoint materialises as a [`LocalEndpoint`] holding
//! its declaration, filters, access subjects, and — for pull-mode
//! endpoints — the message/request/response queues drained by blocking
//! fetch calls. A fetch on an empty queue parks the caller's reply id;
//! the next arrival releases it instead of being stored.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::predicate::Predicate;

use super::router::BytePipe;

/// Endpoint kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Src,
    Snk,
    Ss,
    Req,
    Resp,
    ReqP,
    RespP,
    Rr,
    RrP,
    StreamSrc,
    StreamSnk,
}

impl EndpointKind {
    /// Wire name used in endpoint declarations and manifests.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Src => "src",
            Self::Snk => "snk",
            Self::Ss => "ss",
            Self::Req => "req",
            Self::Resp => "resp",
            Self::ReqP => "req_p",
            Self::RespP => "resp_p",
            Self::Rr => "rr",
            Self::RrP => "rr_p",
            Self::StreamSrc => "str_src",
            Self::StreamSnk => "str_snk",
        }
    }

    /// Parses a wire name.
    #[must_use]
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "src" => Some(Self::Src),
            "snk" => Some(Self::Snk),
            "ss" => Some(Self::Ss),
            "req" => Some(Self::Req),
            "resp" => Some(Self::Resp),
            "req_p" => Some(Self::ReqP),
            "resp_p" => Some(Self::RespP),
            "rr" => Some(Self::Rr),
            "rr_p" => Some(Self::RrP),
            "str_src" => Some(Self::StreamSrc),
            "str_snk" => Some(Self::StreamSnk),
            _ => None,
        }
    }

    /// True for the byte-pipe endpoint kinds.
    #[must_use]
    pub const fn is_stream(self) -> bool {
        matches!(self, Self::StreamSrc | Self::StreamSnk)
    }
}

/// An endpoint declaration as exchanged in `register_endpoint` and in
/// manifests.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointDecl {
    pub ep_id: String,
    pub ep_name: String,
    pub ep_description: String,
    pub kind: EndpointKind,
    pub message_schema: Option<Value>,
    pub response_schema: Option<Value>,
    /// Pull mode: messages queue in the core until fetched.
    pub queuing: bool,
}

impl EndpointDecl {
    /// Parses the declaration blob sent by the component.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] on missing id/name or an
    /// unknown endpoint type.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::InvalidArgument("endpoint declaration must be an object".to_string()))?;
        let text = |field: &str| -> Result<String> {
            obj.get(field)
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| Error::InvalidArgument(format!("endpoint declaration missing '{field}'")))
        };
        let ep_id = text("ep_id")?;
        if ep_id.is_empty() {
            return Err(Error::InvalidArgument("endpoint id must not be empty".to_string()));
        }
        let type_name = text("ep_type")?;
        let kind = EndpointKind::from_str(&type_name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown endpoint type '{type_name}'")))?;
        Ok(Self {
            ep_id,
            ep_name: text("ep_name")?,
            ep_description: obj
                .get("ep_description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            kind,
            message_schema: obj.get("message").cloned(),
            response_schema: obj.get("response").cloned(),
            queuing: obj.get("blocking").and_then(Value::as_i64).unwrap_or(0) != 0,
        })
    }

    /// Serializes the declaration for manifests and MAP matching.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = json!({
            "ep_id": self.ep_id,
            "ep_name": self.ep_name,
            "ep_description": self.ep_description,
            "ep_type": self.kind.as_str(),
            "blocking": i32::from(self.queuing),
        });
        if let Some(map) = obj.as_object_mut() {
            if let Some(schema) = &self.message_schema {
                map.insert("message".to_string(), schema.clone());
            }
            if let Some(schema) = &self.response_schema {
                map.insert("response".to_string(), schema.clone());
            }
        }
        obj
    }
}

/// A queue with parked fetch waiters.
///
/// `push` returns the reply id of a parked waiter when one exists; the
/// caller must answer that reply with the message instead of storing it.
#[derive(Debug, Default)]
pub struct MsgQueue {
    items: VecDeque<Message>,
    waiters: VecDeque<String>,
}

impl MsgQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a message, or hands it to the oldest parked waiter.
    pub fn push(&mut self, msg: Message) -> Option<(String, Message)> {
        if let Some(waiter) = self.waiters.pop_front() {
            return Some((waiter, msg));
        }
        self.items.push_back(msg);
        None
    }

    pub fn pop(&mut self) -> Option<Message> {
        self.items.pop_front()
    }

    /// Parks a fetch reply until the next arrival.
    pub fn park(&mut self, reply_msg_id: String) {
        self.waiters.push_back(reply_msg_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes and returns every parked waiter (used on teardown).
    pub fn drain_waiters(&mut self) -> Vec<String> {
        self.waiters.drain(..).collect()
    }
}

/// Core-side record of one registered endpoint.
#[derive(Debug)]
pub struct LocalEndpoint {
    pub decl: EndpointDecl,
    pub filters: Vec<Predicate>,
    pub access: HashSet<String>,
    pub messages: MsgQueue,
    pub requests: MsgQueue,
    /// Response queues keyed by request id.
    pub responses: HashMap<String, MsgQueue>,
    /// Byte pipe of a stream endpoint, while open.
    pub pipe: Option<BytePipe>,
}

impl LocalEndpoint {
    #[must_use]
    pub fn new(decl: EndpointDecl) -> Self {
        Self {
            decl,
            filters: Vec::new(),
            access: HashSet::new(),
            messages: MsgQueue::new(),
            requests: MsgQueue::new(),
            responses: HashMap::new(),
            pipe: None,
        }
    }

    /// Response queue for a request id, created on demand.
    pub fn responses_for(&mut self, req_id: &str) -> &mut MsgQueue {
        self.responses.entry(req_id.to_string()).or_default()
    }
}

/// All registered endpoints, keyed by id.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    eps: HashMap<String, LocalEndpoint>,
}

impl EndpointRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) an endpoint.
    pub fn insert(&mut self, lep: LocalEndpoint) {
        self.eps.insert(lep.decl.ep_id.clone(), lep);
    }

    pub fn remove(&mut self, ep_id: &str) -> Option<LocalEndpoint> {
        self.eps.remove(ep_id)
    }

    #[must_use]
    pub fn get(&self, ep_id: &str) -> Option<&LocalEndpoint> {
        self.eps.get(ep_id)
    }

    pub fn get_mut(&mut self, ep_id: &str) -> Option<&mut LocalEndpoint> {
        self.eps.get_mut(ep_id)
    }

    #[must_use]
    pub fn contains(&self, ep_id: &str) -> bool {
        self.eps.contains_key(ep_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalEndpoint> {
        self.eps.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.eps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.eps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Status;
    use serde_json::json;

    fn decl_json() -> Value {
        json!({
            "ep_id": "AbCdEfGhIj",
            "ep_name": "ep_source",
            "ep_description": "example src endpoint",
            "ep_type": "src",
            "message": {"type": "object"},
            "blocking": 0,
        })
    }

    #[test]
    fn decl_round_trip() {
        let decl = EndpointDecl::from_json(&decl_json()).unwrap();
        assert_eq!(decl.kind, EndpointKind::Src);
        assert!(!decl.queuing);
        let back = EndpointDecl::from_json(&decl.to_json()).unwrap();
        assert_eq!(back, decl);
    }

    #[test]
    fn decl_rejects_unknown_type() {
        let mut bad = decl_json();
        bad["ep_type"] = json!("teleport");
        assert!(EndpointDecl::from_json(&bad).is_err());
    }

    #[test]
    fn decl_rejects_missing_id() {
        let mut bad = decl_json();
        bad.as_object_mut().unwrap().remove("ep_id");
        assert!(EndpointDecl::from_json(&bad).is_err());
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            EndpointKind::Src,
            EndpointKind::Snk,
            EndpointKind::Ss,
            EndpointKind::Req,
            EndpointKind::Resp,
            EndpointKind::ReqP,
            EndpointKind::RespP,
            EndpointKind::Rr,
            EndpointKind::RrP,
            EndpointKind::StreamSrc,
            EndpointKind::StreamSnk,
        ] {
            assert_eq!(EndpointKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(EndpointKind::from_str("bogus"), None);
    }

    #[test]
    fn queue_hands_message_to_parked_waiter() {
        let mut queue = MsgQueue::new();
        queue.park("0000000042".to_string());
        let released = queue.push(Message::new(Status::Msg, json!({"v": 1})));
        let (waiter, msg) = released.expect("waiter should be released");
        assert_eq!(waiter, "0000000042");
        assert_eq!(msg.body, json!({"v": 1}));
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_stores_when_no_waiter() {
        let mut queue = MsgQueue::new();
        assert!(queue.push(Message::new(Status::Msg, json!(1))).is_none());
        assert_eq!(queue.len(), 1);
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn registry_insert_lookup_remove() {
        let mut registry = EndpointRegistry::new();
        let decl = EndpointDecl::from_json(&decl_json()).unwrap();
        registry.insert(LocalEndpoint::new(decl));
        assert!(registry.contains("AbCdEfGhIj"));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("AbCdEfGhIj").is_some());
        assert!(registry.is_empty());
    }
}
