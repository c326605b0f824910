//! Inbound client requests and their validation.

use crate::conf::ProcConfig;
use bytes::Bytes;
use kvproxy_common::{Message, OpCode};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// An encoded client request together with its reply path and deadline.
#[derive(Debug)]
pub struct InboundRequest {
    pub(crate) raw: Bytes,
    pub(crate) received_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) cancel: Option<oneshot::Receiver<()>>,
    pub(crate) reply: oneshot::Sender<Message>,
}

impl InboundRequest {
    /// Wrap `raw`, allowing `timeout` for the whole request. The returned
    /// receiver yields the single reply.
    pub fn new(raw: impl Into<Bytes>, timeout: Duration) -> (Self, oneshot::Receiver<Message>) {
        let (reply, rx) = oneshot::channel();
        let received_at = Instant::now();
        let req = Self {
            raw: raw.into(),
            received_at,
            deadline: received_at + timeout,
            cancel: None,
            reply,
        };
        (req, rx)
    }

    /// Attach a cancellation handle, e.g. for when the client goes away.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = oneshot::channel();
        self.cancel = Some(rx);
        (self, CancelHandle(tx))
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Answer without running a processor.
    pub(crate) fn reply_directly(self, reply: Message) -> bool {
        self.reply.send(reply).is_ok()
    }
}

/// Cancels an in-flight request. Dropping the handle does not cancel.
#[derive(Debug)]
pub struct CancelHandle(oneshot::Sender<()>);

impl CancelHandle {
    pub fn cancel(self) {
        let _ = self.0.send(());
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("empty key")]
    EmptyKey,
    #[error("invalid namespace length {len} (max {max})")]
    NamespaceLength { len: usize, max: usize },
    #[error("limit exceeded: key length {len} > {max}")]
    KeyTooLong { len: usize, max: usize },
    #[error("limit exceeded: TTL {ttl} > {max}")]
    TtlTooLarge { ttl: u32, max: u32 },
    #[error("limit exceeded: payload length {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("zero TTL for replicated {0}")]
    ZeroTtlReplication(OpCode),
}

/// Check a decoded client request against the configured limits.
///
/// Replicated requests were validated in their home datacenter; they only
/// need a TTL, except for Destroy.
pub fn validate(request: &Message, config: &ProcConfig) -> Result<(), ValidationError> {
    if request.key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    let ns_len = request.namespace.len();
    let max_ns = config.limits.max_namespace_length;
    if ns_len == 0 || ns_len > max_ns {
        return Err(ValidationError::NamespaceLength {
            len: ns_len,
            max: max_ns,
        });
    }

    if request.for_replication {
        if request.ttl == 0 && request.op_code != OpCode::Destroy {
            return Err(ValidationError::ZeroTtlReplication(request.op_code));
        }
        return Ok(());
    }

    let limits = config.limits.for_namespace(&request.namespace_lossy());
    if limits.max_key_length != 0 && request.key.len() > limits.max_key_length {
        return Err(ValidationError::KeyTooLong {
            len: request.key.len(),
            max: limits.max_key_length,
        });
    }
    if limits.max_ttl != 0 && request.ttl > limits.max_ttl {
        return Err(ValidationError::TtlTooLarge {
            ttl: request.ttl,
            max: limits.max_ttl,
        });
    }
    if limits.max_payload_length != 0 && request.payload.len() > limits.max_payload_length {
        return Err(ValidationError::PayloadTooLarge {
            len: request.payload.len(),
            max: limits.max_payload_length,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvproxy_common::Payload;
    use kvproxy_config::NamespaceLimits;

    fn config() -> ProcConfig {
        let mut c = ProcConfig::default();
        c.limits.max_key_length = 8;
        c.limits.max_ttl = 100;
        c.limits.max_payload_length = 4;
        c.limits.namespaces.insert(
            "big".into(),
            NamespaceLimits {
                max_payload_length: Some(0),
                ..Default::default()
            },
        );
        c
    }

    #[test]
    fn test_accepts_valid_request() {
        let mut m = Message::request(OpCode::Set, b"ns", b"key").with_payload(Payload::clear("1234"));
        m.ttl = 100;
        assert_eq!(validate(&m, &config()), Ok(()));
    }

    #[test]
    fn test_rejects_empty_key_and_bad_namespace() {
        let m = Message::request(OpCode::Get, b"ns", b"");
        assert_eq!(validate(&m, &config()), Err(ValidationError::EmptyKey));

        let m = Message::request(OpCode::Get, b"", b"k");
        assert!(matches!(
            validate(&m, &config()),
            Err(ValidationError::NamespaceLength { len: 0, .. })
        ));

        let long_ns = vec![b'n'; 65];
        let m = Message::request(OpCode::Get, &long_ns, b"k");
        assert!(matches!(
            validate(&m, &config()),
            Err(ValidationError::NamespaceLength { len: 65, max: 64 })
        ));
    }

    #[test]
    fn test_enforces_limits() {
        let m = Message::request(OpCode::Get, b"ns", b"waytoolongkey");
        assert!(matches!(
            validate(&m, &config()),
            Err(ValidationError::KeyTooLong { .. })
        ));

        let mut m = Message::request(OpCode::Create, b"ns", b"k");
        m.ttl = 101;
        assert_eq!(
            validate(&m, &config()),
            Err(ValidationError::TtlTooLarge { ttl: 101, max: 100 })
        );

        let m = Message::request(OpCode::Create, b"ns", b"k").with_payload(Payload::clear("12345"));
        assert_eq!(
            validate(&m, &config()),
            Err(ValidationError::PayloadTooLarge { len: 5, max: 4 })
        );
    }

    #[test]
    fn test_namespace_override_unlimited() {
        let m = Message::request(OpCode::Create, b"big", b"k").with_payload(Payload::clear("123456789"));
        assert_eq!(validate(&m, &config()), Ok(()));
    }

    #[test]
    fn test_replication_requires_ttl_except_destroy() {
        let mut m = Message::request(OpCode::Update, b"ns", b"waytoolongkey");
        m.for_replication = true;
        assert_eq!(
            validate(&m, &config()),
            Err(ValidationError::ZeroTtlReplication(OpCode::Update))
        );

        m.ttl = 10_000;
        assert_eq!(validate(&m, &config()), Ok(()), "limits do not apply");

        let mut d = Message::request(OpCode::Destroy, b"ns", b"k");
        d.for_replication = true;
        assert_eq!(validate(&d, &config()), Ok(()));
    }
}
