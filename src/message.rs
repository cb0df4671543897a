//! Peer message model and identifier generation.
//!
//! Every frame exchanged between cores (and the payload of every delivery
//! to a component) is a loose JSON object with at minimum `status` and
//! `msg_id` fields. The status discriminants are fixed on the wire and
//! shared with the component↔core command envelope, whose two-digit kind
//! field is the `CMD` discriminant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use rand::distr::Alphanumeric;
use serde_json::{Value, json};

use crate::error::{Error, Result};

/// Width of message and endpoint identifiers on the wire.
pub const ID_WIDTH: usize = 10;

/// Width of the component session key.
pub const SESSION_KEY_LEN: usize = 16;

/// Message status discriminants.
///
/// The numeric values are part of the wire format and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum Status {
    None = 0,
    Hello = 1,
    HelloAck = 2,
    Auth = 3,
    AuthAck = 4,
    Map = 5,
    MapAck = 6,
    Unmap = 7,
    UnmapAck = 8,
    Msg = 9,
    Req = 10,
    RespNext = 11,
    RespLast = 12,
    Stream = 13,
    StreamCmd = 14,
    Cmd = 15,
}

impl Status {
    /// Maps a wire discriminant back to a status.
    #[must_use]
    pub const fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Hello),
            2 => Some(Self::HelloAck),
            3 => Some(Self::Auth),
            4 => Some(Self::AuthAck),
            5 => Some(Self::Map),
            6 => Some(Self::MapAck),
            7 => Some(Self::Unmap),
            8 => Some(Self::UnmapAck),
            9 => Some(Self::Msg),
            10 => Some(Self::Req),
            11 => Some(Self::RespNext),
            12 => Some(Self::RespLast),
            13 => Some(Self::Stream),
            14 => Some(Self::StreamCmd),
            15 => Some(Self::Cmd),
            _ => None,
        }
    }

    /// Returns the wire discriminant.
    #[must_use]
    pub const fn to_wire(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Hello => "HELLO",
            Self::HelloAck => "HELLO_ACK",
            Self::Auth => "AUTH",
            Self::AuthAck => "AUTH_ACK",
            Self::Map => "MAP",
            Self::MapAck => "MAP_ACK",
            Self::Unmap => "UNMAP",
            Self::UnmapAck => "UNMAP_ACK",
            Self::Msg => "MSG",
            Self::Req => "REQ",
            Self::RespNext => "RESP_NEXT",
            Self::RespLast => "RESP_LAST",
            Self::Stream => "STREAM",
            Self::StreamCmd => "STREAM_CMD",
            Self::Cmd => "CMD",
        };
        write!(f, "{name}")
    }
}

/// A message routed between endpoints or carried on the component channel.
///
/// `body` holds the user payload (`msg_json` on the wire); `module` and
/// `conn` identify the source connection once a message has crossed a
/// transport and are absent on locally built messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub status: Status,
    pub msg_id: String,
    pub ep_id: Option<String>,
    pub body: Value,
    pub module: Option<String>,
    pub conn: Option<u64>,
}

impl Message {
    /// Builds a message with a fresh process-unique id.
    #[must_use]
    pub fn new(status: Status, body: Value) -> Self {
        Self {
            status,
            msg_id: next_message_id(),
            ep_id: None,
            body,
            module: None,
            conn: None,
        }
    }

    /// Builds a message reusing an existing id (responses echo the
    /// request id).
    #[must_use]
    pub fn with_id(status: Status, msg_id: impl Into<String>, body: Value) -> Self {
        Self {
            status,
            msg_id: msg_id.into(),
            ep_id: None,
            body,
            module: None,
            conn: None,
        }
    }

    /// Serializes to the wire JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = json!({
            "status": self.status.to_wire(),
            "msg_id": self.msg_id,
        });
        if let Some(map) = obj.as_object_mut() {
            if let Some(ep_id) = &self.ep_id {
                map.insert("ep_id".to_string(), json!(ep_id));
            }
            if !self.body.is_null() {
                map.insert("msg_json".to_string(), self.body.clone());
            }
            if let Some(module) = &self.module {
                map.insert("module".to_string(), json!(module));
            }
            if let Some(conn) = self.conn {
                map.insert("conn".to_string(), json!(conn));
            }
        }
        obj
    }

    /// Parses a wire JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when the text is not a JSON object or the
    /// status discriminant is unknown.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Converts a parsed JSON value into a message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] on a non-object value or unknown status.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Codec("message must be a JSON object".to_string()))?;
        let raw_status = obj
            .get("status")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Codec("message missing numeric 'status'".to_string()))?;
        let status = Status::from_wire(raw_status)
            .ok_or_else(|| Error::Codec(format!("unknown message status {raw_status}")))?;
        let msg_id = obj
            .get("msg_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            status,
            msg_id,
            ep_id: obj
                .get("ep_id")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            body: obj.get("msg_json").cloned().unwrap_or(Value::Null),
            module: obj
                .get("module")
                .and_then(Value::as_str)
                .map(ToString::to_string),
            conn: obj.get("conn").and_then(Value::as_u64),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns the next process-unique message id: a zero-padded decimal
/// counter, monotonic within this process.
#[must_use]
pub fn next_message_id() -> String {
    let n = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{n:010}")
}

/// Generates a fresh endpoint id: ten random alphanumerics.
#[must_use]
pub fn generate_endpoint_id() -> String {
    random_token(ID_WIDTH)
}

/// Generates the random printable session key presented by the component
/// as the very first bytes on the component channel.
#[must_use]
pub fn generate_session_key() -> String {
    random_token(SESSION_KEY_LEN)
}

/// Random alphanumeric token of the given length.
#[must_use]
pub fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
