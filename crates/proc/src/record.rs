//! Per-replica bookkeeping for one outstanding sub-request.

use kvproxy_common::{Message, OpCode, OpStatus};
use tokio::time::Instant;

/// Lifecycle of a sub-request.
///
/// `Init -> Sent -> {ResponseReceived | ResponseIoError | RequestTimeout}`.
/// `RequestIoError` marks a request the connection refused. The overall
/// deadline and client cancellation impose `RequestTimedOut` and
/// `RequestCancelled` on whatever is still `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Init,
    Sent,
    ResponseReceived,
    RequestIoError,
    ResponseIoError,
    RequestTimeout,
    RequestTimedOut,
    RequestCancelled,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RecordState::Init | RecordState::Sent)
    }

    pub fn is_io_error(self) -> bool {
        matches!(
            self,
            RecordState::RequestIoError | RecordState::ResponseIoError
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaRequestRecord {
    pub replica_index: usize,
    pub op_code: OpCode,
    pub state: RecordState,
    /// Storage status, or `NoStorageServer` when no usable response came back.
    pub status: OpStatus,
    pub sent_at: Option<Instant>,
    pub received_at: Option<Instant>,
    pub expires_at: Instant,
    pub response: Option<Message>,
}

impl ReplicaRequestRecord {
    pub fn new(replica_index: usize, op_code: OpCode, expires_at: Instant) -> Self {
        Self {
            replica_index,
            op_code,
            state: RecordState::Init,
            status: OpStatus::NoError,
            sent_at: None,
            received_at: None,
            expires_at,
            response: None,
        }
    }

    /// The response message. Only set in `ResponseReceived`.
    pub fn response(&self) -> Option<&Message> {
        self.response.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Opaque tagging
// ---------------------------------------------------------------------------

const REPLICA_BITS: u32 = 8;
const REPLICA_MASK: u32 = (1 << REPLICA_BITS) - 1;

/// Tag carried by a sub-request: the replica slot in the low byte and the
/// record's sequence number above it, so a late answer to an earlier
/// request on the same slot is never mistaken for the current one.
pub(crate) fn encode_opaque(seq: usize, replica: usize) -> u32 {
    ((seq as u32) << REPLICA_BITS) | (replica as u32 & REPLICA_MASK)
}

/// Inverse of [`encode_opaque`]: `(seq, replica)`.
pub(crate) fn decode_opaque(opaque: u32) -> (usize, usize) {
    (
        (opaque >> REPLICA_BITS) as usize,
        (opaque & REPLICA_MASK) as usize,
    )
}
