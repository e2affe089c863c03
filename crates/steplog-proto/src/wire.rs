// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packet framing and CBOR helpers for the hub socket.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR `OpEnvelope`
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD

use blake3::Hasher;
use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{HistoryPayload, Message, OpEnvelope, PollSincePayload, StepsPayload};

/// Protocol magic constant "STEP".
pub const MAGIC: [u8; 4] = *b"STEP";
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (set to zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header length in bytes.
pub const HEADER_BYTES: usize = 12;
/// Trailing checksum length in bytes.
pub const CHECKSUM_BYTES: usize = 32;
/// Framing overhead around the payload.
pub const OVERHEAD_BYTES: usize = HEADER_BYTES + CHECKSUM_BYTES;
/// Default ceiling on payload size.
pub const DEFAULT_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Framing or codec failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than the header or declared length require.
    #[error("incomplete packet")]
    Incomplete,
    /// Header does not start with [`MAGIC`].
    #[error("bad magic")]
    BadMagic,
    /// Unknown protocol version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// Declared payload exceeds the receiver's ceiling.
    #[error("payload too large ({len} > {max})")]
    PayloadTooLarge {
        /// Declared length.
        len: usize,
        /// Receiver ceiling.
        max: usize,
    },
    /// Checksum over header and payload does not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Envelope names an op this build does not know.
    #[error("unknown op {0}")]
    UnknownOp(String),
    /// CBOR encoding failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR decoding failed.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Encode to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decode from CBOR bytes.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::de::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, WireError> {
    Value::serialized(value).map_err(|e| WireError::Encode(e.to_string()))
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, WireError> {
    value
        .deserialized()
        .map_err(|e| WireError::Decode(e.to_string()))
}

fn checksum(header: &[u8], payload: &[u8]) -> [u8; CHECKSUM_BYTES] {
    let mut hasher = Hasher::new();
    hasher.update(header);
    hasher.update(payload);
    *hasher.finalize().as_bytes()
}

/// Full length of the frame at the front of `buf`, or `None` while the header
/// is still incomplete.
pub fn frame_len(buf: &[u8], max_payload: usize) -> Result<Option<usize>, WireError> {
    if buf.len() < HEADER_BYTES {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    if len > max_payload {
        return Err(WireError::PayloadTooLarge {
            len,
            max: max_payload,
        });
    }
    Ok(Some(len + OVERHEAD_BYTES))
}

/// Split the first complete frame off the accumulator, leaving the remainder.
pub fn try_extract_frame(
    acc: &mut Vec<u8>,
    max_payload: usize,
) -> Result<Option<Vec<u8>>, WireError> {
    let Some(len) = frame_len(acc, max_payload)? else {
        return Ok(None);
    };
    if acc.len() < len {
        return Ok(None);
    }
    Ok(Some(acc.drain(..len).collect()))
}

/// Frame a CBOR payload.
pub fn frame_payload(payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let len = u32::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(payload.len() + OVERHEAD_BYTES);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(&FLAGS.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    let sum = checksum(&out, payload);
    out.extend_from_slice(payload);
    out.extend_from_slice(&sum);
    Ok(out)
}

/// Verify a frame and return its payload bytes and the bytes consumed.
pub fn unframe(bytes: &[u8]) -> Result<(&[u8], usize), WireError> {
    if bytes.len() < OVERHEAD_BYTES {
        return Err(WireError::Incomplete);
    }
    if bytes[0..4] != MAGIC {
        return Err(WireError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let total = len + OVERHEAD_BYTES;
    if bytes.len() < total {
        return Err(WireError::Incomplete);
    }
    let header = &bytes[..HEADER_BYTES];
    let payload = &bytes[HEADER_BYTES..HEADER_BYTES + len];
    if checksum(header, payload) != bytes[HEADER_BYTES + len..total] {
        return Err(WireError::ChecksumMismatch);
    }
    Ok((payload, total))
}

/// Encode a `Message` into a packet with the provided logical timestamp.
pub fn encode_message(msg: &Message, ts: u64) -> Result<Vec<u8>, WireError> {
    let payload = match msg {
        Message::Handshake(p) => to_value(p)?,
        Message::HandshakeAck(p) => to_value(p)?,
        Message::Error(p) => to_value(p)?,
        Message::SubmitStep(step) | Message::StepCommitted(step) => to_value(step)?,
        Message::Bootstrap { history } | Message::Synchronize { history } => {
            to_value(&HistoryPayload {
                history: history.clone(),
            })?
        }
        Message::RequestResync => Value::Null,
        Message::PollSince { cursor } => to_value(&PollSincePayload {
            cursor: cursor.clone(),
        })?,
        Message::PollResult { steps } | Message::StepsCommitted { steps } => {
            to_value(&StepsPayload {
                steps: steps.clone(),
            })?
        }
        Message::PushStep(p) => to_value(p)?,
        Message::PushAck(p) => to_value(p)?,
    };
    let env = OpEnvelope {
        op: msg.op_name().to_string(),
        ts,
        payload,
    };
    frame_payload(&to_cbor(&env)?)
}

/// Decode bytes into (Message, ts, bytes_consumed).
pub fn decode_message(bytes: &[u8]) -> Result<(Message, u64, usize), WireError> {
    let (payload, used) = unframe(bytes)?;
    let env: OpEnvelope<Value> = from_cbor(payload)?;
    let ts = env.ts;
    let body = env.payload;
    let msg = match env.op.as_str() {
        "handshake" => Message::Handshake(from_value(body)?),
        "handshake_ack" => Message::HandshakeAck(from_value(body)?),
        "error" => Message::Error(from_value(body)?),
        "submit_step" => Message::SubmitStep(from_value(body)?),
        "bootstrap" => {
            let p: HistoryPayload = from_value(body)?;
            Message::Bootstrap { history: p.history }
        }
        "request_resync" => Message::RequestResync,
        "step_committed" => Message::StepCommitted(from_value(body)?),
        "steps_committed" => {
            let p: StepsPayload = from_value(body)?;
            Message::StepsCommitted { steps: p.steps }
        }
        "synchronize" => {
            let p: HistoryPayload = from_value(body)?;
            Message::Synchronize { history: p.history }
        }
        "poll_since" => {
            let p: PollSincePayload = from_value(body)?;
            Message::PollSince { cursor: p.cursor }
        }
        "poll_result" => {
            let p: StepsPayload = from_value(body)?;
            Message::PollResult { steps: p.steps }
        }
        "push_step" => Message::PushStep(from_value(body)?),
        "push_ack" => Message::PushAck(from_value(body)?),
        other => return Err(WireError::UnknownOp(other.to_string())),
    };
    Ok((msg, ts, used))
}

/// Op named by the envelope of a sound frame, even when its body does not
/// decode into a [`Message`].
pub fn peek_op(bytes: &[u8]) -> Option<String> {
    let (payload, _) = unframe(bytes).ok()?;
    let env: OpEnvelope<Value> = from_cbor(payload).ok()?;
    Some(env.op)
}

// --- Unit tests -----------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::{PollCursor, Step};
    use serde_json::json;

    #[test]
    fn header_layout_is_stable() {
        let pkt = frame_payload(&[0xaa, 0xbb]).unwrap();
        assert_eq!(hex::encode(&pkt[..HEADER_BYTES]), "535445500001000000000002");
        assert_eq!(pkt.len(), 2 + OVERHEAD_BYTES);
    }

    #[test]
    fn step_survives_the_wire_with_opaque_payload() {
        let mut step = Step::after(
            "328e7db4-6abf-48e5-88de-2ac505323735",
            "199bee91-e88e-4681-a2f7-54ec8fe6fe3c",
            json!({
                "cursor": {"anchorNode": 1, "anchorOffset": 2},
                "mutations": [{"type": "add", "append": 1, "node": {"tagName": "B"}}],
                "userId": "268d771b",
                "ratio": 0.5
            }),
        );
        step.index = Some(1);
        let pkt = encode_message(&Message::StepCommitted(step.clone()), 9).unwrap();
        let (msg, ts, used) = decode_message(&pkt).unwrap();
        assert_eq!(msg, Message::StepCommitted(step));
        assert_eq!(ts, 9);
        assert_eq!(used, pkt.len());
    }

    #[test]
    fn first_step_keeps_null_predecessor() {
        let step = Step::first(1u64, json!({"m": []}));
        let pkt = encode_message(&Message::Bootstrap { history: vec![step.clone()] }, 0).unwrap();
        let (msg, _, _) = decode_message(&pkt).unwrap();
        assert_eq!(msg, Message::Bootstrap { history: vec![step] });
    }

    #[test]
    fn cursor_and_unit_ops_decode() {
        for msg in [
            Message::RequestResync,
            Message::PollSince {
                cursor: PollCursor::AfterId("abc".into()),
            },
            Message::PollSince {
                cursor: PollCursor::Start,
            },
        ] {
            let pkt = encode_message(&msg, 1).unwrap();
            assert_eq!(decode_message(&pkt).unwrap().0, msg);
        }
    }

    #[test]
    fn batch_of_commits_travels_as_one_packet() {
        let steps: Vec<Step> = (0..3u64)
            .map(|n| {
                let mut step = if n == 0 {
                    Step::first(n, json!({"n": n}))
                } else {
                    Step::after(n, n - 1, json!({"n": n}))
                };
                step.index = Some(n);
                step
            })
            .collect();
        let msg = Message::StepsCommitted { steps };
        let pkt = encode_message(&msg, 4).unwrap();
        assert_eq!(decode_message(&pkt).unwrap().0, msg);
    }

    #[test]
    fn op_is_readable_from_an_undecodable_body() {
        let env = OpEnvelope {
            op: "submit_step".to_string(),
            ts: 0,
            payload: Value::Text("not a step".into()),
        };
        let pkt = frame_payload(&to_cbor(&env).unwrap()).unwrap();
        assert!(matches!(decode_message(&pkt), Err(WireError::Decode(_))));
        assert_eq!(peek_op(&pkt).as_deref(), Some("submit_step"));
        assert_eq!(peek_op(&pkt[..pkt.len() - 1]), None);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut pkt = encode_message(&Message::RequestResync, 0).unwrap();
        pkt[HEADER_BYTES] ^= 0xff;
        assert_eq!(decode_message(&pkt).unwrap_err(), WireError::ChecksumMismatch);
    }

    #[test]
    fn unknown_op_is_rejected() {
        let env = OpEnvelope {
            op: "rmg_stream".to_string(),
            ts: 0,
            payload: Value::Null,
        };
        let pkt = frame_payload(&to_cbor(&env).unwrap()).unwrap();
        assert_eq!(
            decode_message(&pkt).unwrap_err(),
            WireError::UnknownOp("rmg_stream".into())
        );
    }

    #[test]
    fn try_extract_frame_drains_one_frame_and_preserves_remainder() {
        let f1 = encode_message(&Message::RequestResync, 0).unwrap();
        let f2 = encode_message(&Message::RequestResync, 1).unwrap();
        let mut acc = [f1.clone(), f2[..5].to_vec()].concat();

        let pkt1 = try_extract_frame(&mut acc, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(pkt1, Some(f1));
        assert_eq!(acc, f2[..5].to_vec());
        assert_eq!(try_extract_frame(&mut acc, DEFAULT_MAX_PAYLOAD).unwrap(), None);

        acc.extend_from_slice(&f2[5..]);
        assert_eq!(try_extract_frame(&mut acc, DEFAULT_MAX_PAYLOAD).unwrap(), Some(f2));
        assert!(acc.is_empty());
    }

    #[test]
    fn oversized_frame_is_refused_from_header_alone() {
        let pkt = frame_payload(&[0u8; 64]).unwrap();
        assert_eq!(
            frame_len(&pkt[..HEADER_BYTES], 16),
            Err(WireError::PayloadTooLarge { len: 64, max: 16 })
        );
    }
}
