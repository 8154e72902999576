//! Wire protocol shared by the broker and the client: message shape, the
//! length-prefixed JSON framing codec, and the reserved subscription frame.
//!
//! Frame layout: a 4-byte big-endian length prefix `L`, followed by exactly
//! `L` bytes of UTF-8 JSON. The JSON value is always an array whose first
//! element is the channel name.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Reserved channel name carrying the subscription declaration frame.
/// MUST NOT be used as a user channel (see §4.1 / §9 Open Questions).
pub const RESERVED_SUBSCRIBE_CHANNEL: &str = "__subscribe__";

/// Default broker TCP port.
pub const DEFAULT_PORT: u16 = 5001;

/// Default bind address for the standalone server.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";

/// Cap on a single frame's JSON payload, to bound memory exhaustion from a
/// hostile publisher declaring an enormous length prefix.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_BYTES: usize = 4;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An ordered tuple whose first element is a channel name and whose
/// remaining elements are arbitrary JSON values. Round-trips through JSON
/// array encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    channel: String,
    payload: Vec<Value>,
}

impl Message {
    /// Build a message from an already-JSON `Value` payload.
    ///
    /// Fails with [`EncodeError::EmptyChannel`] if `channel` is empty.
    pub fn new(channel: impl Into<String>, payload: Vec<Value>) -> Result<Self, EncodeError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(EncodeError::EmptyChannel);
        }
        Ok(Message { channel, payload })
    }

    /// Build a message from typed payload elements, serializing each one.
    ///
    /// Fails with [`EncodeError::Json`] if any element is not
    /// JSON-serializable, or [`EncodeError::EmptyChannel`] if `channel` is
    /// empty.
    pub fn try_new<T: Serialize>(
        channel: impl Into<String>,
        items: Vec<T>,
    ) -> Result<Self, EncodeError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(EncodeError::EmptyChannel);
        }
        let payload = items
            .into_iter()
            .map(|item| serde_json::to_value(item).map_err(|e| EncodeError::Json(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Message { channel, payload })
    }

    /// Build the subscription declaration frame for a set of channels.
    pub fn subscribe(channels: impl IntoIterator<Item = impl Into<String>>) -> Message {
        let payload = channels
            .into_iter()
            .map(|c| Value::String(c.into()))
            .collect();
        Message {
            channel: RESERVED_SUBSCRIBE_CHANNEL.to_owned(),
            payload,
        }
    }

    /// Interpret this message as a subscription declaration.
    ///
    /// Returns `None` if the channel isn't the reserved sentinel, or any
    /// payload element isn't a string.
    pub fn as_subscription(&self) -> Option<Vec<String>> {
        if self.channel != RESERVED_SUBSCRIBE_CHANNEL {
            return None;
        }
        self.payload
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &[Value] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<Value> {
        self.payload
    }

    /// Whether this message targets the reserved subscription channel.
    pub fn is_reserved(&self) -> bool {
        self.channel == RESERVED_SUBSCRIBE_CHANNEL
    }

    fn to_value(&self) -> Value {
        let mut arr = Vec::with_capacity(1 + self.payload.len());
        arr.push(Value::String(self.channel.clone()));
        arr.extend(self.payload.iter().cloned());
        Value::Array(arr)
    }

    fn from_value(value: Value) -> Result<Message, FrameError> {
        let mut arr = match value {
            Value::Array(arr) => arr,
            _ => return Err(FrameError::WrongRootType),
        };
        if arr.is_empty() {
            return Err(FrameError::EmptyChannel);
        }
        let payload = arr.split_off(1);
        let channel = match arr.into_iter().next() {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(FrameError::EmptyChannel),
        };
        Ok(Message { channel, payload })
    }
}

/// Encode a message into its frame payload (JSON bytes, no length prefix).
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    if message.channel.is_empty() {
        return Err(EncodeError::EmptyChannel);
    }
    serde_json::to_vec(&message.to_value()).map_err(|e| EncodeError::Json(e.to_string()))
}

/// Decode as many complete frames as `bytes` contains, returning the parsed
/// messages and whatever trailing, not-yet-complete bytes remain.
pub fn decode_stream(bytes: &[u8]) -> Result<(Vec<Message>, Vec<u8>), FrameError> {
    let mut buf = BytesMut::from(bytes);
    let mut codec = YdlCodec;
    let mut messages = Vec::new();
    loop {
        match Decoder::decode(&mut codec, &mut buf) {
            Ok(Some(msg)) => messages.push(msg),
            Ok(None) => break,
            Err(CodecError::Frame(e)) => return Err(e),
            Err(other) => return Err(FrameError::MalformedJson(other.to_string())),
        }
    }
    Ok((messages, buf.to_vec()))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A message failed to encode at the sender's side.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("channel name must be a non-empty string")]
    EmptyChannel,
    #[error("payload element is not JSON-serializable: {0}")]
    Json(String),
}

/// A frame on the wire could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
    #[error("frame root value must be a JSON array")]
    WrongRootType,
    #[error("channel name must be a non-empty string")]
    EmptyChannel,
    #[error("declared frame length {0} exceeds the {1}-byte cap")]
    TooLarge(u32, usize),
}

/// The combined error surface of [`YdlCodec`], required so it can drive a
/// `tokio_util::codec::Framed` over a live socket (whose I/O errors must
/// convert into the codec's error type).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Length-prefixed JSON frame codec. Drives a `tokio_util::codec::Framed`
/// over any `AsyncRead + AsyncWrite` transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct YdlCodec;

impl Encoder<Message> for YdlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let bytes = encode(&item)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(bytes.len() as u32, MAX_FRAME_BYTES).into());
        }
        dst.reserve(LENGTH_PREFIX_BYTES + bytes.len());
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

impl Decoder for YdlCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(len as u32, MAX_FRAME_BYTES).into());
        }
        if src.len() < LENGTH_PREFIX_BYTES + len {
            src.reserve(LENGTH_PREFIX_BYTES + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        let frame = src.split_to(len);
        let value: Value = serde_json::from_slice(&frame)
            .map_err(|e| FrameError::MalformedJson(e.to_string()))?;
        Ok(Some(Message::from_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encodes_and_decodes_a_simple_message() {
        let msg = Message::try_new("cheese", vec![1, 2, 3]).unwrap();
        let bytes = encode(&msg).unwrap();
        let mut framed = BytesMut::new();
        framed.put_u32(bytes.len() as u32);
        framed.extend_from_slice(&bytes);
        let (decoded, leftover) = decode_stream(&framed).unwrap();
        assert_eq!(decoded, vec![msg]);
        assert!(leftover.is_empty());
    }

    #[test]
    fn decode_stream_returns_leftover_partial_frame() {
        let msg = Message::try_new("x", vec!["hi"]).unwrap();
        let bytes = encode(&msg).unwrap();
        let mut framed = BytesMut::new();
        framed.put_u32(bytes.len() as u32);
        framed.extend_from_slice(&bytes);
        framed.extend_from_slice(&[0, 0, 0, 10, 1, 2]); // truncated second frame
        let (decoded, leftover) = decode_stream(&framed).unwrap();
        assert_eq!(decoded, vec![msg]);
        assert_eq!(leftover, vec![0, 0, 0, 10, 1, 2]);
    }

    #[test]
    fn decode_stream_parses_multiple_frames_in_one_buffer() {
        let a = Message::try_new("a", vec![1]).unwrap();
        let b = Message::try_new("b", vec![2]).unwrap();
        let mut framed = BytesMut::new();
        for msg in [&a, &b] {
            let bytes = encode(msg).unwrap();
            framed.put_u32(bytes.len() as u32);
            framed.extend_from_slice(&bytes);
        }
        let (decoded, leftover) = decode_stream(&framed).unwrap();
        assert_eq!(decoded, vec![a, b]);
        assert!(leftover.is_empty());
    }

    #[test]
    fn rejects_non_array_root() {
        let mut framed = BytesMut::new();
        let bytes = serde_json::to_vec(&serde_json::json!({"not": "an array"})).unwrap();
        framed.put_u32(bytes.len() as u32);
        framed.extend_from_slice(&bytes);
        let err = decode_stream(&framed).unwrap_err();
        assert!(matches!(err, FrameError::WrongRootType));
    }

    #[test]
    fn rejects_malformed_json() {
        let mut framed = BytesMut::new();
        let bytes = b"not json at all";
        framed.put_u32(bytes.len() as u32);
        framed.extend_from_slice(bytes);
        let err = decode_stream(&framed).unwrap_err();
        assert!(matches!(err, FrameError::MalformedJson(_)));
    }

    #[test]
    fn rejects_empty_array() {
        let mut framed = BytesMut::new();
        let bytes = serde_json::to_vec(&serde_json::json!([])).unwrap();
        framed.put_u32(bytes.len() as u32);
        framed.extend_from_slice(&bytes);
        let err = decode_stream(&framed).unwrap_err();
        assert!(matches!(err, FrameError::EmptyChannel));
    }

    #[test]
    fn rejects_declared_length_over_cap() {
        let mut framed = BytesMut::new();
        framed.put_u32((MAX_FRAME_BYTES as u32) + 1);
        let err = decode_stream(&framed).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_, _)));
    }

    #[test]
    fn try_new_rejects_empty_channel() {
        let err = Message::try_new("", vec![1]).unwrap_err();
        assert!(matches!(err, EncodeError::EmptyChannel));
    }

    #[test]
    fn subscribe_round_trips_through_as_subscription() {
        let msg = Message::subscribe(["a", "b", "c"]);
        assert_eq!(msg.channel(), RESERVED_SUBSCRIBE_CHANNEL);
        assert!(msg.is_reserved());
        assert_eq!(
            msg.as_subscription(),
            Some(vec!["a".to_owned(), "b".to_owned(), "c".to_owned()])
        );
    }

    #[test]
    fn as_subscription_is_none_for_non_reserved_channel() {
        let msg = Message::try_new("cheese", vec![1]).unwrap();
        assert_eq!(msg.as_subscription(), None);
    }

    fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| Value::Number(n.into())),
            "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        ]
    }

    fn arb_channel() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9_-]{0,15}"
    }

    proptest! {
        /// Invariant 4 (§8): for all JSON-serializable tuples T starting
        /// with a non-empty string, decode(encode(T)) == T.
        #[test]
        fn round_trip_encoding(
            channel in arb_channel(),
            payload in proptest::collection::vec(arb_scalar(), 0..6),
        ) {
            let msg = Message::new(channel, payload).unwrap();
            let bytes = encode(&msg).unwrap();
            let mut framed = BytesMut::new();
            framed.put_u32(bytes.len() as u32);
            framed.extend_from_slice(&bytes);
            let (decoded, leftover) = decode_stream(&framed).unwrap();
            prop_assert!(leftover.is_empty());
            prop_assert_eq!(decoded.len(), 1);
            prop_assert_eq!(&decoded[0], &msg);
        }
    }
}
