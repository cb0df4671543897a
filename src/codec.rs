//! Component↔core command codec.
//!
//! Commands travel inside a nested `{{…}}` envelope with fixed-position
//! fields so the core can dispatch without parsing JSON:
//!
//! ```text
//! {{15}{MMMM}{FFFFFFFFFFFFFFFFF}{RRR}{IIIIIIIIII}{{DDDDDDDDDD}arg…{0000000000}}}
//! ```
//!
//! `15` is the CMD status discriminant, `MMMM` the module id (4 chars,
//! space padded), `F…` the function id (right-padded with `_` to 17),
//! `RRR` the return kind (`voi`/`int`/`str`/`msg`), `I…` the message id
//! (10 chars). Each argument is prefixed by a zero-padded decimal length
//! in braces; a zero-length marker terminates the list, which makes inner
//! payloads binary safe regardless of content.
//!
//! The core answers with a `b`-tagged reply addressed to the originating
//! message id, and pushes unsolicited deliveries with an `a` tag:
//!
//! ```text
//! {b{IIIIIIIIII}{RRR}{DDDDDDDDDD}{payload}}
//! {a{EEEEEEEEEE}{DDDDDDDDDD}{payload}}
//! ```
//!
//! The same logical command may instead be sent as a structured peer
//! message (`status = 15`, `msg_json = {module_id, function_id,
//! return_type, args}`); both encodings are accepted on the receive side.

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::message::{Message, Status, next_message_id};

/// Module id field width.
pub const MODULE_ID_WIDTH: usize = 4;
/// Function id field width.
pub const FUNCTION_ID_WIDTH: usize = 17;
/// Return kind field width.
pub const RETURN_KIND_WIDTH: usize = 3;
/// Message id field width.
pub const MSG_ID_WIDTH: usize = 10;
/// Argument length prefix width (digits only).
pub const LEN_WIDTH: usize = 10;

/// Reply kind of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// No reply is synthesised.
    Void,
    /// Ten-character zero-padded decimal.
    Int,
    /// Length-prefixed string body.
    Str,
    /// Serialized message.
    Msg,
}

impl ReturnKind {
    /// Three-character wire tag.
    #[must_use]
    pub const fn wire(self) -> &'static str {
        match self {
            Self::Void => "voi",
            Self::Int => "int",
            Self::Str => "str",
            Self::Msg => "msg",
        }
    }

    /// Parses the wire tag.
    #[must_use]
    pub fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "voi" => Some(Self::Void),
            "int" => Some(Self::Int),
            "str" => Some(Self::Str),
            "msg" => Some(Self::Msg),
            _ => None,
        }
    }
}

/// A decoded command addressed to the core's dispatch table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub module_id: String,
    pub function_id: String,
    pub return_kind: ReturnKind,
    pub msg_id: String,
    pub args: Vec<String>,
}

impl CommandFrame {
    /// Builds a command for the `core` module with a fresh message id.
    #[must_use]
    pub fn core(function_id: impl Into<String>, return_kind: ReturnKind, args: Vec<String>) -> Self {
        Self {
            module_id: "core".to_string(),
            function_id: function_id.into(),
            return_kind,
            msg_id: next_message_id(),
            args,
        }
    }

    /// Encodes the fixed-width streaming form.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(b"{{15}{");
        out.put_slice(pad_right(&self.module_id, MODULE_ID_WIDTH, ' ').as_bytes());
        out.put_slice(b"}{");
        out.put_slice(pad_right(&self.function_id, FUNCTION_ID_WIDTH, '_').as_bytes());
        out.put_slice(b"}{");
        out.put_slice(self.return_kind.wire().as_bytes());
        out.put_slice(b"}{");
        out.put_slice(pad_right(&self.msg_id, MSG_ID_WIDTH, ' ').as_bytes());
        out.put_slice(b"}{");
        for arg in &self.args {
            out.put_slice(format!("{{{:010}}}", arg.len()).as_bytes());
            out.put_slice(arg.as_bytes());
        }
        out.put_slice(b"{0000000000}}}");
        out.freeze()
    }

    /// Serializes the structured (JSON) form of the same command.
    #[must_use]
    pub fn to_message(&self) -> Message {
        let mut msg = Message::with_id(
            Status::Cmd,
            self.msg_id.clone(),
            json!({
                "module_id": self.module_id,
                "function_id": self.function_id,
                "return_type": self.return_kind.wire(),
                "args": self.args,
            }),
        );
        msg.ep_id = None;
        msg
    }

    /// Recovers a command from its structured form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] when the message is not a CMD or required
    /// fields are missing.
    pub fn from_message(msg: &Message) -> Result<Self> {
        if msg.status != Status::Cmd {
            return Err(Error::Codec(format!(
                "expected CMD message, got {}",
                msg.status
            )));
        }
        let body = msg
            .body
            .as_object()
            .ok_or_else(|| Error::Codec("CMD body must be an object".to_string()))?;
        let field = |name: &str| -> Result<String> {
            body.get(name)
                .and_then(Value::as_str)
                .map(|s| s.trim_end_matches('_').trim_end().to_string())
                .ok_or_else(|| Error::Codec(format!("CMD body missing '{name}'")))
        };
        let return_tag = field("return_type")?;
        let return_kind = ReturnKind::from_wire(&return_tag)
            .ok_or_else(|| Error::Codec(format!("unknown return type '{return_tag}'")))?;
        let args = body
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            module_id: field("module_id")?,
            function_id: field("function_id")?,
            return_kind,
            msg_id: msg.msg_id.clone(),
            args,
        })
    }
}

/// A frame received on the component channel, decoded by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A command for the dispatch table (either encoding).
    Command(CommandFrame),
    /// A `b`-tagged reply to an earlier blocking command.
    Reply {
        msg_id: String,
        return_kind: ReturnKind,
        payload: Bytes,
    },
    /// An `a`-tagged delivery addressed to an endpoint.
    Delivery { ep_id: String, payload: Bytes },
    /// Any other peer message.
    Peer(Message),
}

/// Decodes one complete frame from the framing layer.
///
/// # Errors
///
/// Returns [`Error::Codec`] on malformed fixed-width envelopes or
/// unparseable JSON.
pub fn decode(frame: &[u8]) -> Result<InboundFrame> {
    if frame.starts_with(b"{{15}") {
        return decode_command(frame).map(InboundFrame::Command);
    }
    if frame.starts_with(b"{b{") {
        return decode_reply(frame);
    }
    if frame.starts_with(b"{a{") {
        return decode_delivery(frame);
    }
    let text = std::str::from_utf8(frame)
        .map_err(|_| Error::Codec("frame is not valid UTF-8".to_string()))?;
    let msg = Message::parse(text)?;
    if msg.status == Status::Cmd {
        return CommandFrame::from_message(&msg).map(InboundFrame::Command);
    }
    Ok(InboundFrame::Peer(msg))
}

/// Encodes a `b`-tagged reply frame.
#[must_use]
pub fn encode_reply(msg_id: &str, return_kind: ReturnKind, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(b"{b{");
    out.put_slice(pad_right(msg_id, MSG_ID_WIDTH, ' ').as_bytes());
    out.put_slice(b"}{");
    out.put_slice(return_kind.wire().as_bytes());
    out.put_slice(format!("}}{{{:010}}}{{", payload.len()).as_bytes());
    out.put_slice(payload);
    out.put_slice(b"}}");
    out.freeze()
}

/// Encodes an `a`-tagged delivery frame addressed to an endpoint.
#[must_use]
pub fn encode_delivery(ep_id: &str, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_slice(b"{a{");
    out.put_slice(pad_right(ep_id, MSG_ID_WIDTH, ' ').as_bytes());
    out.put_slice(format!("}}{{{:010}}}{{", payload.len()).as_bytes());
    out.put_slice(payload);
    out.put_slice(b"}}");
    out.freeze()
}

/// Formats an integer reply payload: ten characters, zero padded, sign
/// included for negatives.
#[must_use]
pub fn int_payload(value: i64) -> String {
    format!("{value:010}")
}

/// Parses an integer reply payload.
#[must_use]
pub fn parse_int_payload(payload: &[u8]) -> Option<i64> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

fn pad_right(value: &str, width: usize, fill: char) -> String {
    let mut out: String = value.chars().take(width).collect();
    while out.len() < width {
        out.push(fill);
    }
    out
}

fn decode_command(frame: &[u8]) -> Result<CommandFrame> {
    // {{15}{MMMM}{FFF…F}{RRR}{IIIIIIIIII}{ args }}
    let args_start = 6
        + MODULE_ID_WIDTH
        + 2
        + FUNCTION_ID_WIDTH
        + 2
        + RETURN_KIND_WIDTH
        + 2
        + MSG_ID_WIDTH
        + 2;
    if frame.len() < args_start + LEN_WIDTH + 2 + 2 {
        return Err(Error::Codec("command frame too short".to_string()));
    }
    fn field(frame: &[u8], start: usize, width: usize) -> Result<&str> {
        std::str::from_utf8(&frame[start..start + width])
            .map_err(|_| Error::Codec("command field is not valid UTF-8".to_string()))
    }
    let module_id = field(frame, 6, MODULE_ID_WIDTH)?.trim_end().to_string();
    let function_id = field(frame, 6 + MODULE_ID_WIDTH + 2, FUNCTION_ID_WIDTH)?
        .trim_end_matches('_')
        .to_string();
    let return_tag = field(
        frame,
        6 + MODULE_ID_WIDTH + 2 + FUNCTION_ID_WIDTH + 2,
        RETURN_KIND_WIDTH,
    )?;
    let return_kind = ReturnKind::from_wire(return_tag)
        .ok_or_else(|| Error::Codec(format!("unknown return type '{return_tag}'")))?;
    let msg_id = field(
        frame,
        6 + MODULE_ID_WIDTH + 2 + FUNCTION_ID_WIDTH + 2 + RETURN_KIND_WIDTH + 2,
        MSG_ID_WIDTH,
    )?
    .trim_end()
    .to_string();

    let mut args = Vec::new();
    let mut cursor = args_start;
    loop {
        let len = read_length(frame, cursor)?;
        cursor += LEN_WIDTH + 2;
        if len == 0 {
            break;
        }
        let end = cursor
            .checked_add(len)
            .filter(|&e| e <= frame.len())
            .ok_or_else(|| Error::Codec("argument length exceeds frame".to_string()))?;
        let arg = std::str::from_utf8(&frame[cursor..end])
            .map_err(|_| Error::Codec("argument is not valid UTF-8".to_string()))?;
        args.push(arg.to_string());
        cursor = end;
    }

    Ok(CommandFrame {
        module_id,
        function_id,
        return_kind,
        msg_id,
        args,
    })
}

fn decode_reply(frame: &[u8]) -> Result<InboundFrame> {
    // {b{IIIIIIIIII}{RRR}{DDDDDDDDDD}{payload}}
    let header = 3 + MSG_ID_WIDTH + 2 + RETURN_KIND_WIDTH + 2;
    if frame.len() < header + LEN_WIDTH + 2 + 2 {
        return Err(Error::Codec("reply frame too short".to_string()));
    }
    let msg_id = std::str::from_utf8(&frame[3..3 + MSG_ID_WIDTH])
        .map_err(|_| Error::Codec("reply id is not valid UTF-8".to_string()))?
        .trim_end()
        .to_string();
    let tag = std::str::from_utf8(&frame[3 + MSG_ID_WIDTH + 2..3 + MSG_ID_WIDTH + 2 + RETURN_KIND_WIDTH])
        .map_err(|_| Error::Codec("reply kind is not valid UTF-8".to_string()))?;
    let return_kind = ReturnKind::from_wire(tag)
        .ok_or_else(|| Error::Codec(format!("unknown return type '{tag}'")))?;
    let len = read_length(frame, header - 1)?;
    let start = header - 1 + LEN_WIDTH + 2 + 1;
    let end = start
        .checked_add(len)
        .filter(|&e| e + 2 <= frame.len())
        .ok_or_else(|| Error::Codec("reply payload length exceeds frame".to_string()))?;
    Ok(InboundFrame::Reply {
        msg_id,
        return_kind,
        payload: Bytes::copy_from_slice(&frame[start..end]),
    })
}

fn decode_delivery(frame: &[u8]) -> Result<InboundFrame> {
    // {a{EEEEEEEEEE}{DDDDDDDDDD}{payload}}
    let header = 3 + MSG_ID_WIDTH + 1;
    if frame.len() < header + LEN_WIDTH + 2 + 2 {
        return Err(Error::Codec("delivery frame too short".to_string()));
    }
    let ep_id = std::str::from_utf8(&frame[3..3 + MSG_ID_WIDTH])
        .map_err(|_| Error::Codec("delivery endpoint id is not valid UTF-8".to_string()))?
        .trim_end()
        .to_string();
    let len = read_length(frame, header)?;
    let start = header + LEN_WIDTH + 2 + 1;
    let end = start
        .checked_add(len)
        .filter(|&e| e + 2 <= frame.len())
        .ok_or_else(|| Error::Codec("delivery payload length exceeds frame".to_string()))?;
    Ok(InboundFrame::Delivery {
        ep_id,
        payload: Bytes::copy_from_slice(&frame[start..end]),
    })
}

/// Reads a `{DDDDDDDDDD}` length marker at the given offset.
fn read_length(frame: &[u8], offset: usize) -> Result<usize> {
    let end = offset + LEN_WIDTH + 2;
    if end > frame.len() || frame[offset] != b'{' || frame[end - 1] != b'}' {
        return Err(Error::Codec("malformed length marker".to_string()));
    }
    std::str::from_utf8(&frame[offset + 1..end - 1])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Codec("malformed length digits".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameBuffer;

    // ========================================================================
    // Command envelope
    // ========================================================================

    #[test]
    fn command_encode_decode_round_trip() {
        let cmd = CommandFrame::core(
            "register_endpoint",
            ReturnKind::Int,
            vec![r#"{"ep_id":"AbCdEfGhIj"}"#.to_string()],
        );
        let wire = cmd.encode();
        match decode(&wire).unwrap() {
            InboundFrame::Command(decoded) => assert_eq!(decoded, cmd),
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn command_function_id_is_underscore_padded() {
        let cmd = CommandFrame::core("map", ReturnKind::Int, vec![]);
        let wire = cmd.encode();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("{map______________}"), "wire: {text}");
    }

    #[test]
    fn command_zero_args() {
        let cmd = CommandFrame::core("terminate", ReturnKind::Void, vec![]);
        match decode(&cmd.encode()).unwrap() {
            InboundFrame::Command(decoded) => assert!(decoded.args.is_empty()),
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn command_args_are_binary_safe() {
        // An argument containing unbalanced braces and both quote kinds.
        let tricky = r#"}}}{{{ "a": 'b" "#.to_string();
        let cmd = CommandFrame::core("ep_send_message", ReturnKind::Void, vec![tricky.clone()]);
        match decode(&cmd.encode()).unwrap() {
            InboundFrame::Command(decoded) => assert_eq!(decoded.args, vec![tricky]),
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn command_envelope_survives_the_frame_scanner() {
        let cmd = CommandFrame::core(
            "ep_send_message",
            ReturnKind::Void,
            vec!["AbCdEfGhIj".to_string(), r#"{"value": 1}"#.to_string()],
        );
        let mut buf = FrameBuffer::new();
        let frames = buf.push(&cmd.encode());
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            decode(&frames[0]).unwrap(),
            InboundFrame::Command(_)
        ));
    }

    #[test]
    fn structured_command_form_is_accepted() {
        let cmd = CommandFrame::core("get_manifest", ReturnKind::Str, vec![]);
        let wire = cmd.to_message().to_string();
        match decode(wire.as_bytes()).unwrap() {
            InboundFrame::Command(decoded) => {
                assert_eq!(decoded.function_id, "get_manifest");
                assert_eq!(decoded.return_kind, ReturnKind::Str);
                assert_eq!(decoded.msg_id, cmd.msg_id);
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn structured_form_strips_padding() {
        let wire = r#"{"status":15,"msg_id":"0000000042","msg_json":{"module_id":"core","function_id":"unmap____________","return_type":"int","args":["AbCdEfGhIj","10.0.0.1:1505"]}}"#;
        match decode(wire.as_bytes()).unwrap() {
            InboundFrame::Command(cmd) => {
                assert_eq!(cmd.function_id, "unmap");
                assert_eq!(cmd.args.len(), 2);
            }
            other => panic!("expected command, got {other:?}"),
        }
    }

    // ========================================================================
    // Reply and delivery frames
    // ========================================================================

    #[test]
    fn reply_round_trip() {
        let wire = encode_reply("0000000007", ReturnKind::Int, int_payload(-2).as_bytes());
        match decode(&wire).unwrap() {
            InboundFrame::Reply {
                msg_id,
                return_kind,
                payload,
            } => {
                assert_eq!(msg_id, "0000000007");
                assert_eq!(return_kind, ReturnKind::Int);
                assert_eq!(parse_int_payload(&payload), Some(-2));
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn delivery_round_trip() {
        let msg = Message::new(Status::Msg, serde_json::json!({"value": 15}));
        let payload = msg.to_string();
        let wire = encode_delivery("AbCdEfGhIj", payload.as_bytes());
        match decode(&wire).unwrap() {
            InboundFrame::Delivery { ep_id, payload } => {
                assert_eq!(ep_id, "AbCdEfGhIj");
                let parsed = Message::parse(std::str::from_utf8(&payload).unwrap()).unwrap();
                assert_eq!(parsed, msg);
            }
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn reply_payload_with_braces_survives_framing() {
        let inner = r#"{"status": 9, "msg_id": "0000000001", "msg_json": {"a": "}{"}}"#;
        let wire = encode_reply("0000000003", ReturnKind::Msg, inner.as_bytes());
        let mut buf = FrameBuffer::new();
        let frames = buf.push(&wire);
        assert_eq!(frames.len(), 1);
        match decode(&frames[0]).unwrap() {
            InboundFrame::Reply { payload, .. } => {
                assert_eq!(payload.as_ref(), inner.as_bytes());
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn int_payload_widths() {
        assert_eq!(int_payload(0), "0000000000");
        assert_eq!(int_payload(7), "0000000007");
        assert_eq!(int_payload(-1), "-000000001");
        assert_eq!(int_payload(-2).len(), 10);
    }

    #[test]
    fn peer_message_passthrough() {
        let msg = Message::new(Status::Hello, serde_json::json!({"app_name": "sender"}));
        match decode(msg.to_string().as_bytes()).unwrap() {
            InboundFrame::Peer(parsed) => assert_eq!(parsed.status, Status::Hello),
            other => panic!("expected peer message, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(decode(b"{{15}{core}").is_err());
        assert!(decode(b"{b{short}}").is_err());
        assert!(decode(b"{not json at all}").is_err());
    }
}
