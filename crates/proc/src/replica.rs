//! Abstraction over the link to one storage server.
//!
//! A processor never blocks on a replica: [`ReplicaConnection::send_request`]
//! only enqueues, and the response comes back later on the processor's
//! response channel, tagged with the request's opaque value.

use kvproxy_common::Message;
use std::time::Duration;
use tokio::sync::mpsc;

/// Failure to hand a request to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("connection busy")]
    Busy,
    #[error("no connection")]
    NoConnection,
    #[error("replica already has a request pending")]
    AlreadyPending,
}

/// Transport failure reported in place of a storage response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timeout")]
    Timeout,
    #[error("I/O failed: {0}")]
    Io(String),
}

/// What a connection delivers back to the processor.
#[derive(Debug, Clone)]
pub struct ReplicaResponse {
    /// Opaque value of the request this answers.
    pub opaque: u32,
    pub result: Result<Message, ReplicaError>,
}

pub type ResponseSender = mpsc::UnboundedSender<ReplicaResponse>;
pub type ResponseReceiver = mpsc::UnboundedReceiver<ReplicaResponse>;

/// A request addressed to one storage server.
#[derive(Debug)]
pub struct OutboundRequest {
    pub message: Message,
    /// Deadline the connection may apply on its side.
    pub timeout: Duration,
    reply_to: ResponseSender,
}

impl OutboundRequest {
    pub(crate) fn new(message: Message, timeout: Duration, reply_to: ResponseSender) -> Self {
        Self {
            message,
            timeout,
            reply_to,
        }
    }

    /// Take the request apart, e.g. to interpose on its response path.
    pub(crate) fn into_parts(self) -> (Message, Duration, ResponseSender) {
        (self.message, self.timeout, self.reply_to)
    }

    /// Deliver the outcome to the waiting processor. Returns `false` if the
    /// processor is no longer listening.
    pub fn respond(&self, result: Result<Message, ReplicaError>) -> bool {
        self.reply_to
            .send(ReplicaResponse {
                opaque: self.message.opaque,
                result,
            })
            .is_ok()
    }
}

/// A connection to one storage server, shared by all processors.
pub trait ReplicaConnection: Send + Sync + 'static {
    /// Enqueue `request` without blocking.
    fn send_request(&self, request: OutboundRequest) -> Result<(), SendError>;

    /// Whether the connection can currently take requests.
    fn is_available(&self) -> bool {
        true
    }

    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Remote address or other connection details.
    fn conn_info(&self) -> String {
        String::new()
    }

    /// Identity of the storage node behind the connection.
    fn node_info(&self) -> String {
        self.name().to_string()
    }
}
