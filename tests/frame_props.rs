//! Frame parser properties: any split of an encoded byte stream yields
//! the same frame sequence as parsing it whole.

use commux::codec::{CommandFrame, ReturnKind, encode_delivery, encode_reply};
use commux::framing::FrameBuffer;
use commux::message::{Message, Status};
use proptest::prelude::*;

fn parse_whole(wire: &[u8]) -> Vec<Vec<u8>> {
    let mut buf = FrameBuffer::new();
    buf.push(wire).into_iter().map(|b| b.to_vec()).collect()
}

fn parse_split(wire: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut buf = FrameBuffer::new();
    let mut frames = Vec::new();
    let mut start = 0;
    let mut cuts: Vec<usize> = cuts.iter().map(|&c| c % (wire.len() + 1)).collect();
    cuts.sort_unstable();
    for cut in cuts {
        if cut > start {
            frames.extend(buf.push(&wire[start..cut]));
            start = cut;
        }
    }
    frames.extend(buf.push(&wire[start..]));
    frames.into_iter().map(|b| b.to_vec()).collect()
}

proptest! {
    /// Peer messages with arbitrary string payloads (JSON escaping keeps
    /// the scanner's quote tracking balanced) survive any chunking.
    #[test]
    fn peer_messages_split_invariant(
        payloads in proptest::collection::vec(".{0,40}", 1..8),
        cuts in proptest::collection::vec(0usize..4096, 0..12),
    ) {
        let wire: Vec<u8> = payloads
            .iter()
            .map(|p| {
                Message::new(Status::Msg, serde_json::json!({"value": p}))
                    .to_string()
                    .into_bytes()
            })
            .collect::<Vec<_>>()
            .concat();

        let whole = parse_whole(&wire);
        prop_assert_eq!(whole.len(), payloads.len());
        let split = parse_split(&wire, &cuts);
        prop_assert_eq!(whole, split);
    }

    /// Command envelopes (with JSON-encoded arguments) survive any
    /// chunking, and every frame still decodes to the same command.
    #[test]
    fn command_frames_split_invariant(
        args in proptest::collection::vec(".{0,30}", 0..4),
        cuts in proptest::collection::vec(0usize..2048, 0..8),
    ) {
        let args: Vec<String> = args
            .into_iter()
            .map(|a| serde_json::json!({"arg": a}).to_string())
            .collect();
        let cmd = CommandFrame::core("ep_send_message", ReturnKind::Void, args);
        let wire = cmd.encode();

        let whole = parse_whole(&wire);
        prop_assert_eq!(whole.len(), 1);
        let split = parse_split(&wire, &cuts);
        prop_assert_eq!(&whole, &split);

        match commux::codec::decode(&split[0]) {
            Ok(commux::codec::InboundFrame::Command(decoded)) => {
                prop_assert_eq!(decoded, cmd);
            }
            other => prop_assert!(false, "expected command, got {:?}", other),
        }
    }

    /// Interleaved reply and delivery frames keep their boundaries at
    /// every split point.
    #[test]
    fn mixed_frames_split_invariant(
        bodies in proptest::collection::vec(".{0,24}", 1..6),
        cuts in proptest::collection::vec(0usize..4096, 0..10),
    ) {
        let mut wire = Vec::new();
        let mut expected = 0usize;
        for (i, body) in bodies.iter().enumerate() {
            let msg = Message::new(Status::RespNext, serde_json::json!({"body": body}));
            let payload = msg.to_string();
            if i % 2 == 0 {
                wire.extend_from_slice(&encode_reply("0000000042", ReturnKind::Msg, payload.as_bytes()));
            } else {
                wire.extend_from_slice(&encode_delivery("AbCdEfGhIj", payload.as_bytes()));
            }
            expected += 1;
        }
        let whole = parse_whole(&wire);
        prop_assert_eq!(whole.len(), expected);
        let split = parse_split(&wire, &cuts);
        prop_assert_eq!(whole, split);
    }
}

/// Exhaustive single-split sweep over one encoded buffer: cutting at
/// every offset yields the identical frame sequence.
#[test]
fn every_single_split_offset() {
    let mut wire = Vec::new();
    for v in 0..5 {
        wire.extend_from_slice(
            Message::new(Status::Msg, serde_json::json!({"value": v, "text": "a}b{'c\""}))
                .to_string()
                .as_bytes(),
        );
    }
    let whole = parse_whole(&wire);
    assert_eq!(whole.len(), 5);
    for cut in 0..=wire.len() {
        let split = parse_split(&wire, &[cut]);
        assert_eq!(whole, split, "mismatch when splitting at offset {cut}");
    }
}
