//! kvproxy-common: protocol vocabulary shared by the kvproxy crates.
//!
//! Provides op codes and statuses, the 16-byte request id, and the
//! [`Message`] type that the proxy decodes from clients and exchanges with
//! storage servers.

pub mod message;
pub mod op;

pub use message::{Message, Payload, PayloadType};
pub use op::{OpCode, OpStatus};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of bytes in a request id.
pub const REQUEST_ID_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// Identifies a client request. Also used as the originator of a record
/// version: the id of the request that created it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId([u8; REQUEST_ID_BYTES]);

impl RequestId {
    /// The unset id.
    pub const ZERO: Self = Self([0u8; REQUEST_ID_BYTES]);

    /// Generate a random id.
    pub fn new() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; REQUEST_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_BYTES] {
        &self.0
    }

    pub fn is_set(&self) -> bool {
        self.0 != [0u8; REQUEST_ID_BYTES]
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ---------------------------------------------------------------------------
// Clock helpers
// ---------------------------------------------------------------------------

/// Current unix time in seconds, as stored in creation and expiration times.
pub fn unix_now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Current unix time in nanoseconds, as stored in last-modification times.
pub fn unix_now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
