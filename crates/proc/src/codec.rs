//! Decoding of inbound client requests.

use bytes::Bytes;
use kvproxy_common::{Message, OpCode};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("empty message")]
    Empty,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub trait MessageCodec: Send + Sync + 'static {
    fn decode(&self, raw: &[u8]) -> Result<Message, CodecError>;

    fn encode(&self, message: &Message) -> Result<Bytes, CodecError>;

    /// Op code of an encoded message, used to route it to a processor pool.
    fn peek_op_code(&self, raw: &[u8]) -> Result<OpCode, CodecError> {
        Ok(self.decode(raw)?.op_code)
    }
}

/// JSON encoding of [`Message`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn decode(&self, raw: &[u8]) -> Result<Message, CodecError> {
        if raw.is_empty() {
            return Err(CodecError::Empty);
        }
        Ok(serde_json::from_slice(raw)?)
    }

    fn encode(&self, message: &Message) -> Result<Bytes, CodecError> {
        Ok(serde_json::to_vec(message)?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvproxy_common::Payload;

    #[test]
    fn test_roundtrip() {
        let m = Message::request(OpCode::Create, b"ns", b"key").with_payload(Payload::clear("v"));
        let raw = JsonCodec.encode(&m).unwrap();
        assert_eq!(JsonCodec.decode(&raw).unwrap(), m);
        assert_eq!(JsonCodec.peek_op_code(&raw).unwrap(), OpCode::Create);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(JsonCodec.decode(b""), Err(CodecError::Empty)));
        assert!(matches!(
            JsonCodec.decode(b"{not json"),
            Err(CodecError::Malformed(_))
        ));
    }
}
