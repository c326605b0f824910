//! The operational message exchanged with clients and storage servers.

use crate::op::{OpCode, OpStatus};
use crate::RequestId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// How a payload's bytes are encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    #[default]
    Clear,
    EncryptedByProxy,
}

/// Record value carried by a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: PayloadType,
    pub data: Bytes,
}

impl Payload {
    pub fn clear(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadType::Clear,
            data: data.into(),
        }
    }

    pub fn encrypted(data: impl Into<Bytes>) -> Self {
        Self {
            kind: PayloadType::EncryptedByProxy,
            data: data.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_encrypted_by_proxy(&self) -> bool {
        self.kind == PayloadType::EncryptedByProxy
    }
}

/// A request or response.
///
/// Timestamps follow the storage tier's conventions: `creation_time` and
/// `expiration_time` are unix seconds, `last_modification_time` is unix
/// nanoseconds. Zero means "not set" for every numeric metadata field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub op_code: OpCode,
    pub status: OpStatus,
    pub is_response: bool,
    pub for_replication: bool,
    /// Correlation tag echoed back by the receiver.
    pub opaque: u32,
    pub shard_id: u16,

    pub namespace: Vec<u8>,
    pub key: Vec<u8>,
    pub app_name: Vec<u8>,
    pub udf_name: Vec<u8>,

    pub ttl: u32,
    pub version: u32,
    pub creation_time: u32,
    pub expiration_time: u32,
    pub last_modification_time: u64,
    /// Milliseconds the proxy spent on the request, set on client replies.
    pub request_handling_time: u32,

    pub request_id: RequestId,
    pub originator: RequestId,

    pub payload: Payload,
}

impl Message {
    /// A new request with a fresh request id.
    pub fn request(op_code: OpCode, namespace: &[u8], key: &[u8]) -> Self {
        Self {
            op_code,
            namespace: namespace.to_vec(),
            key: key.to_vec(),
            request_id: RequestId::new(),
            ..Default::default()
        }
    }

    /// Builder-style payload setter.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// A response to this request carrying `status` and no payload.
    pub fn response(&self, status: OpStatus) -> Self {
        let mut resp = self.clone();
        resp.is_response = true;
        resp.status = status;
        resp.payload = Payload::default();
        resp
    }

    /// Turn a response's record metadata into a request carrying `op_code`.
    /// Used to push an agreed value back to replicas.
    pub fn to_request(&self, op_code: OpCode) -> Self {
        let mut req = self.clone();
        req.op_code = op_code;
        req.is_response = false;
        req.status = OpStatus::NoError;
        req
    }

    /// Absolute expiration time, derived from the TTL when not set explicitly.
    pub fn effective_expiration(&self, now_secs: u32) -> u32 {
        if self.expiration_time != 0 {
            self.expiration_time
        } else {
            now_secs.saturating_add(self.ttl)
        }
    }

    /// True if both carry the same record metadata and value.
    pub fn same_record_as(&self, other: &Message) -> bool {
        self.creation_time == other.creation_time
            && self.ttl == other.ttl
            && self.version == other.version
            && self.last_modification_time == other.last_modification_time
            && self.originator == other.originator
            && self.payload == other.payload
    }

    pub fn namespace_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.namespace)
    }

    pub fn key_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}
