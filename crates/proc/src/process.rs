//! The processor base and the per-request event loop.
//!
//! [`ProcessorBase`] owns everything a request needs regardless of the
//! operation: the decoded client request, the selected replicas, one record
//! per sub-request, the pending map, and the single-reply guard. Protocol
//! engines embed it and implement [`RequestProcessor`]; [`process`] drives
//! any of them from arrival to completion.

use crate::env::ProcessorEnv;
use crate::group::ReplicaGroup;
use crate::hooks::{call_udf, open_payload, seal_payload, UdfError};
use crate::record::{decode_opaque, encode_opaque, RecordState, ReplicaRequestRecord};
use crate::replica::{
    OutboundRequest, ReplicaResponse, ResponseReceiver, ResponseSender, SendError,
};
use crate::request::{validate, InboundRequest};
use crate::stats::RequestStats;
use kvproxy_common::{unix_now_secs, Message, OpCode, OpStatus, Payload};
use kvproxy_metrics::{metrics, observe_request_latency};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// A storage response that contradicts the processor's own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("response tagged for replica {replica} but only {available} replicas were selected")]
    ReplicaOutOfRange { replica: usize, available: usize },
    #[error("replica {replica} answered {got} to a pending {expected}")]
    OpCodeMismatch {
        replica: usize,
        expected: OpCode,
        got: OpCode,
    },
}

/// Outcome of matching a storage response against the pending map.
pub(crate) enum Accepted {
    Received(usize),
    IoError(usize),
    Discarded,
}

// ---------------------------------------------------------------------------
// RequestProcessor
// ---------------------------------------------------------------------------

/// A reusable processor for one kind of client operation.
pub trait RequestProcessor: Send {
    fn base(&self) -> &ProcessorBase;
    fn base_mut(&mut self) -> &mut ProcessorBase;

    /// Whether this processor handles client op `op`.
    fn accepts(&self, op: OpCode) -> bool;

    /// Reset all per-request state. Idempotent.
    fn init(&mut self);

    /// Fan out the first phase.
    fn send_initial_requests(&mut self);

    /// Record `idx` now holds a storage response.
    fn on_response_received(&mut self, idx: usize);

    /// Record `idx` expired without an answer.
    fn on_ss_timeout(&mut self, idx: usize);

    /// Record `idx` failed in transport.
    fn on_ss_io_error(&mut self, idx: usize);

    /// Reply when every sub-request settled without the protocol deciding.
    fn reply_unanswered(&mut self);

    /// Whether replies to client op `op` go through the UDF transform.
    fn needs_udf(&self, _op: OpCode) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// ProcessorBase
// ---------------------------------------------------------------------------

pub struct ProcessorBase {
    env: Arc<ProcessorEnv>,
    pub(crate) client_request: Message,
    pub(crate) group: ReplicaGroup,
    pub(crate) records: Vec<ReplicaRequestRecord>,
    /// Replica index -> record of its outstanding sub-request.
    pending: Vec<Option<usize>>,
    /// Sent records in send order, which is also expiry order.
    queue: VecDeque<usize>,
    num_sent: usize,
    num_settled: usize,
    replied: bool,
    delivered: bool,
    aborted: bool,
    apply_udf: bool,
    received_at: Option<Instant>,
    reply_tx: Option<oneshot::Sender<Message>>,
    resp_tx: ResponseSender,
    resp_rx: Option<ResponseReceiver>,
}

impl std::fmt::Debug for ProcessorBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorBase")
            .field("op", &self.client_request.op_code)
            .field("num_sent", &self.num_sent)
            .field("num_settled", &self.num_settled)
            .field("replied", &self.replied)
            .finish_non_exhaustive()
    }
}

impl ProcessorBase {
    pub fn new(env: Arc<ProcessorEnv>) -> Self {
        let zones = env.config.num_zones;
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        Self {
            env,
            client_request: Message::default(),
            group: ReplicaGroup::default(),
            records: Vec::with_capacity(5 * zones),
            pending: Vec::with_capacity(zones),
            queue: VecDeque::with_capacity(5 * zones),
            num_sent: 0,
            num_settled: 0,
            replied: false,
            delivered: false,
            aborted: false,
            apply_udf: false,
            received_at: None,
            reply_tx: None,
            resp_tx,
            resp_rx: Some(resp_rx),
        }
    }

    /// Forget the previous request. A fresh response channel makes sure
    /// stragglers addressed to it are dropped.
    pub fn init(&mut self) {
        self.client_request = Message::default();
        self.group.clear();
        self.records.clear();
        self.pending.clear();
        self.queue.clear();
        self.num_sent = 0;
        self.num_settled = 0;
        self.replied = false;
        self.delivered = false;
        self.aborted = false;
        self.apply_udf = false;
        self.received_at = None;
        self.reply_tx = None;
        let (tx, rx) = mpsc::unbounded_channel();
        self.resp_tx = tx;
        self.resp_rx = Some(rx);
    }

    pub fn env(&self) -> &ProcessorEnv {
        &self.env
    }

    pub fn client_request(&self) -> &Message {
        &self.client_request
    }

    pub fn num_writes(&self) -> usize {
        self.env.config.num_writes
    }

    pub fn max_failures(&self) -> usize {
        self.env.config.max_failures()
    }

    pub fn has_replied(&self) -> bool {
        self.replied
    }

    /// Every sub-request sent has settled.
    pub fn is_done(&self) -> bool {
        self.num_sent == self.num_settled
    }

    pub fn num_sent(&self) -> usize {
        self.num_sent
    }

    pub fn group(&self) -> &ReplicaGroup {
        &self.group
    }

    pub fn records(&self) -> &[ReplicaRequestRecord] {
        &self.records
    }

    pub(crate) fn response(&self, idx: usize) -> Option<&Message> {
        self.records.get(idx).and_then(|r| r.response())
    }

    pub(crate) fn replica_of(&self, idx: usize) -> usize {
        self.records[idx].replica_index
    }

    fn begin(
        &mut self,
        received_at: Instant,
        reply: oneshot::Sender<Message>,
    ) -> ResponseReceiver {
        self.received_at = Some(received_at);
        self.reply_tx = Some(reply);
        match self.resp_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.resp_tx = tx;
                rx
            }
        }
    }

    fn select_replicas(&mut self) -> bool {
        let config = &self.env.config;
        let ok = self.group.select(
            self.env.shards.as_ref(),
            &self.client_request.key,
            config.num_zones,
            config.num_writes,
        );
        self.pending.clear();
        self.pending.resize(self.group.num_available(), None);
        if !ok {
            warn!(
                "only {} of {} replicas available for {} (need {})",
                self.group.num_available(),
                config.num_zones,
                self.client_request.op_code,
                config.num_writes
            );
        }
        ok
    }

    /// A storage request derived from the client request.
    pub(crate) fn ss_request(&self, op: OpCode, version: u32, keep_payload: bool) -> Message {
        let mut m = self.client_request.clone();
        m.op_code = op;
        m.version = version;
        m.shard_id = self.group.shard_id();
        m.is_response = false;
        m.status = OpStatus::NoError;
        if !keep_payload {
            m.payload = Payload::default();
        }
        m
    }

    // ── Sending ──

    /// Send the phase's template to `replica`. Refusals are counted in
    /// `stats` and do not count as sent.
    pub(crate) fn send(&mut self, stats: &mut RequestStats, replica: usize) -> bool {
        let mut message = match stats.template.as_ref() {
            Some(t) => t.clone(),
            None => {
                error!("no request prepared for replica {}", replica);
                return false;
            }
        };
        let op = message.op_code;
        if !op.is_for_storage() {
            error!("refusing to send client op {} to storage", op);
            self.reply_status(OpStatus::BadParam);
            return false;
        }
        let conn = match self.group.get(replica) {
            Some(slot) => Arc::clone(&slot.conn),
            None => {
                error!(
                    "replica index {} out of range ({} available)",
                    replica,
                    self.group.num_available()
                );
                return false;
            }
        };
        if let Some(Some(seq)) = self.pending.get(replica) {
            warn!(
                "{} not sent: {} still pending on {} (request {})",
                op,
                self.records[*seq].op_code,
                conn.name(),
                seq
            );
            stats.on_fail_to_send(SendError::AlreadyPending);
            return false;
        }

        let seq = self.records.len();
        let timeout = self.env.config.ss_request_timeout;
        let now = Instant::now();
        message.opaque = encode_opaque(seq, replica);
        message.shard_id = self.group.shard_id();
        self.records
            .push(ReplicaRequestRecord::new(replica, op, now + timeout));

        match conn.send_request(OutboundRequest::new(message, timeout, self.resp_tx.clone())) {
            Ok(()) => {
                let rec = &mut self.records[seq];
                rec.state = RecordState::Sent;
                rec.sent_at = Some(now);
                self.pending[replica] = Some(seq);
                self.queue.push_back(seq);
                self.num_sent += 1;
                stats.on_sent();
                metrics()
                    .ss_requests_sent
                    .with_label_values(&[op.name()])
                    .inc();
                debug!("{} -> {} (replica {})", op, conn.name(), replica);
                true
            }
            Err(e) => {
                let rec = &mut self.records[seq];
                rec.state = RecordState::RequestIoError;
                rec.status = OpStatus::NoStorageServer;
                stats.on_fail_to_send(e);
                let reason = match e {
                    SendError::Busy => "busy",
                    SendError::NoConnection => "no_conn",
                    SendError::AlreadyPending => "pending",
                };
                metrics()
                    .ss_send_failures
                    .with_label_values(&[reason])
                    .inc();
                info!("failed to send {} to {}: {}", op, conn.name(), e);
                false
            }
        }
    }

    /// Reply after the initial fan-out reached fewer than W replicas.
    pub(crate) fn reply_send_shortfall(&mut self, stats: &RequestStats) {
        let status = if stats.all_refusals_no_conn() {
            OpStatus::NoStorageServer
        } else {
            OpStatus::Busy
        };
        warn!(
            "{} reached {} replicas, {} required",
            self.client_request.op_code,
            stats.num_sent,
            self.num_writes()
        );
        self.reply_status(status);
    }

    // ── Receiving ──

    fn settle(&mut self, replica: usize) {
        if let Some(slot) = self.pending.get_mut(replica) {
            *slot = None;
        }
        self.num_settled += 1;
    }

    /// Earliest expiry among sub-requests still in flight.
    pub(crate) fn next_expiry(&self) -> Option<Instant> {
        self.queue
            .iter()
            .map(|&seq| &self.records[seq])
            .find(|r| r.state == RecordState::Sent)
            .map(|r| r.expires_at)
    }

    /// Pop the next sub-request that expired by `now`, marking it timed out.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<usize> {
        while let Some(&seq) = self.queue.front() {
            let rec = &self.records[seq];
            if rec.state != RecordState::Sent {
                self.queue.pop_front();
                continue;
            }
            if rec.expires_at > now {
                return None;
            }
            self.queue.pop_front();
            let (replica, op) = (rec.replica_index, rec.op_code);
            let rec = &mut self.records[seq];
            rec.state = RecordState::RequestTimeout;
            rec.status = OpStatus::NoStorageServer;
            self.settle(replica);
            metrics().ss_timeouts.with_label_values(&[op.name()]).inc();
            info!(
                "{} to {} timed out",
                op,
                self.group.get(replica).map_or("?", |s| s.conn.name())
            );
            return Some(seq);
        }
        None
    }

    pub(crate) fn accept_response(
        &mut self,
        resp: ReplicaResponse,
    ) -> Result<Accepted, InvariantViolation> {
        let (seq, replica) = decode_opaque(resp.opaque);
        if replica >= self.pending.len() {
            return Err(InvariantViolation::ReplicaOutOfRange {
                replica,
                available: self.pending.len(),
            });
        }
        if self.pending[replica] != Some(seq) {
            debug!(
                "discarding late response from replica {} (request {})",
                replica, seq
            );
            return Ok(Accepted::Discarded);
        }
        let expected = self.records[seq].op_code;
        match resp.result {
            Err(e) => {
                let rec = &mut self.records[seq];
                rec.state = RecordState::ResponseIoError;
                rec.status = OpStatus::NoStorageServer;
                rec.received_at = Some(Instant::now());
                self.settle(replica);
                metrics()
                    .ss_io_errors
                    .with_label_values(&[expected.name()])
                    .inc();
                info!("{} to replica {} failed: {}", expected, replica, e);
                Ok(Accepted::IoError(seq))
            }
            Ok(msg) => {
                if msg.op_code != expected {
                    return Err(InvariantViolation::OpCodeMismatch {
                        replica,
                        expected,
                        got: msg.op_code,
                    });
                }
                debug!(
                    "{} <- replica {}: {} v{}",
                    expected, replica, msg.status, msg.version
                );
                let rec = &mut self.records[seq];
                rec.state = RecordState::ResponseReceived;
                rec.status = msg.status;
                rec.received_at = Some(Instant::now());
                rec.response = Some(msg);
                self.settle(replica);
                Ok(Accepted::Received(seq))
            }
        }
    }

    fn abandon_outstanding(&mut self, state: RecordState) {
        for rec in self.records.iter_mut() {
            if rec.state == RecordState::Sent {
                rec.state = state;
            }
        }
        self.pending.iter_mut().for_each(|p| *p = None);
        self.queue.clear();
    }

    fn on_request_timeout(&mut self) {
        warn!(
            "{} {:?} timed out with {} of {} sub-requests settled",
            self.client_request.op_code,
            self.client_request.key_lossy(),
            self.num_settled,
            self.num_sent
        );
        self.reply_status(OpStatus::Busy);
        self.abandon_outstanding(RecordState::RequestTimedOut);
    }

    fn on_cancelled(&mut self) {
        warn!(
            "{} {:?} cancelled with {} of {} sub-requests settled",
            self.client_request.op_code,
            self.client_request.key_lossy(),
            self.num_settled,
            self.num_sent
        );
        self.reply_status(OpStatus::Busy);
        self.abandon_outstanding(RecordState::RequestCancelled);
    }

    fn on_invariant_violation(&mut self, violation: InvariantViolation) {
        error!(
            "{} {:?}: {}",
            self.client_request.op_code,
            self.client_request.key_lossy(),
            violation
        );
        metrics().invariant_violations.inc();
        self.reply_status(OpStatus::Internal);
        self.abandon_outstanding(RecordState::RequestCancelled);
        self.aborted = true;
    }

    // ── Replying ──

    /// Reply with a bare status. Never replicates.
    pub fn reply_status(&mut self, status: OpStatus) {
        if self.replied {
            return;
        }
        let msg = self.client_request.response(status);
        self.deliver(msg);
    }

    /// Reply with the storage response held by record `idx`.
    pub fn reply_to_client(&mut self, idx: usize) {
        if self.replied {
            return;
        }
        match self.response(idx).cloned() {
            Some(resp) => self.reply_with(resp),
            None => {
                error!("record {} holds no response to reply with", idx);
                self.reply_status(OpStatus::Internal);
            }
        }
    }

    /// Reply with a storage response, then hand the write to the
    /// replicator when it qualifies.
    pub fn reply_with(&mut self, mut resp: Message) {
        if self.replied {
            return;
        }
        if resp.status == OpStatus::AlreadyFulfilled {
            resp.status = OpStatus::NoError;
        }
        if resp.payload.is_encrypted_by_proxy() && !self.client_request.for_replication {
            let opened = match self.env.cipher.as_deref() {
                Some(cipher) => open_payload(cipher, &resp.payload).map_err(|e| e.to_string()),
                None => Err("no cipher configured".to_string()),
            };
            match opened {
                Ok(payload) => resp.payload = payload,
                Err(e) => {
                    error!("failed to decrypt payload: {}", e);
                    self.reply_status(OpStatus::Internal);
                    return;
                }
            }
        }
        if self.apply_udf {
            self.apply_udf(&mut resp);
        }
        let replication = self.replication_request(&resp);
        self.deliver(resp);

        if let (Some(request), Some(replicator)) = (replication, self.env.replicator.as_ref()) {
            debug!(
                "replicating {} v{}",
                request.op_code, request.version
            );
            replicator.send_request(request);
            metrics().replications.inc();
        }
    }

    fn apply_udf(&self, resp: &mut Message) {
        if resp.status != OpStatus::NoError {
            return;
        }
        let name = String::from_utf8_lossy(&self.client_request.udf_name).into_owned();
        let result = match self.env.udfs.as_deref() {
            Some(udfs) => call_udf(
                udfs,
                &name,
                &resp.payload.data,
                &self.client_request.payload.data,
            ),
            None => Err(UdfError::NotFound(name)),
        };
        match result {
            Ok(out) => resp.payload = Payload::clear(out),
            Err(e) => {
                warn!("{}", e);
                resp.status = match e {
                    UdfError::NotFound(_) => OpStatus::BadParam,
                    UdfError::Failed { .. } => OpStatus::Internal,
                };
                resp.payload = Payload::default();
            }
        }
    }

    fn deliver(&mut self, mut msg: Message) {
        self.replied = true;
        let client = &self.client_request;
        let elapsed = self.received_at.map(|t| t.elapsed()).unwrap_or_default();
        msg.op_code = client.op_code;
        msg.is_response = true;
        msg.opaque = client.opaque;
        msg.request_id = client.request_id;
        msg.for_replication = client.for_replication;
        msg.request_handling_time = elapsed.as_millis().min(u32::MAX as u128) as u32;

        let op = client.op_code.name();
        metrics()
            .client_replies
            .with_label_values(&[op, msg.status.short_name()])
            .inc();
        observe_request_latency(op, elapsed);
        debug!(
            "client <- {} {} v{} rid={}",
            op, msg.status, msg.version, msg.request_id
        );

        if let Some(tx) = self.reply_tx.take() {
            self.delivered = tx.send(msg).is_ok();
            if !self.delivered {
                debug!("client went away before the reply");
            }
        }
    }

    /// The request to hand to the replicator for a reply, if any.
    fn replication_request(&self, resp: &Message) -> Option<Message> {
        self.env.replicator.as_ref()?;
        let client = &self.client_request;
        if client.for_replication {
            return None;
        }
        if !matches!(resp.status, OpStatus::NoError | OpStatus::Inconsistent) {
            return None;
        }
        if matches!(client.op_code, OpCode::Get | OpCode::UdfGet) && client.ttl == 0 {
            return None;
        }
        if resp.creation_time == 0 || resp.version == 0 {
            debug!(
                "not replicating {}: ct={} v={}",
                client.op_code, resp.creation_time, resp.version
            );
            return None;
        }
        if !resp.originator.is_set() {
            warn!("originator not set, rid={}", client.request_id);
        }

        let mut request = client.clone();
        request.op_code = match client.op_code {
            OpCode::Create => OpCode::Update,
            OpCode::UdfGet => OpCode::Get,
            op => op,
        };
        request.for_replication = true;
        request.creation_time = resp.creation_time;
        request.version = resp.version;
        request.last_modification_time = resp.last_modification_time;
        request.originator = resp.originator;
        request.expiration_time = resp.effective_expiration(unix_now_secs());
        if let Some(cipher) = self.env.replication_cipher() {
            match seal_payload(cipher, &request.payload) {
                Ok(payload) => request.payload = payload,
                Err(e) => {
                    error!("not replicating, payload encryption failed: {}", e);
                    return None;
                }
            }
        }
        Some(request)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Run one client request through `processor` and reset it for reuse.
///
/// Returns `true` if the reply reached the client's receiver.
pub async fn process(processor: &mut dyn RequestProcessor, request: InboundRequest) -> bool {
    let InboundRequest {
        raw,
        received_at,
        deadline,
        mut cancel,
        reply,
    } = request;
    let mut responses = processor.base_mut().begin(received_at, reply);

    if admit(processor, &raw) {
        processor.send_initial_requests();
        run_event_loop(processor, &mut responses, deadline, &mut cancel).await;
    }
    if !processor.base().has_replied() {
        processor.reply_unanswered();
    }

    let delivered = processor.base().delivered;
    processor.init();
    delivered
}

/// Decode, validate, and select replicas. Replies and returns `false` on
/// the first failure.
fn admit(processor: &mut dyn RequestProcessor, raw: &[u8]) -> bool {
    let decoded = processor.base().env.codec.decode(raw);
    let request = match decoded {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to decode inbound request: {}", e);
            processor.base_mut().reply_status(OpStatus::BadMsg);
            return false;
        }
    };
    let op = request.op_code;
    let accepted = processor.accepts(op);
    let apply_udf = processor.needs_udf(op);
    let base = processor.base_mut();
    base.client_request = request;
    base.apply_udf = apply_udf;
    if !accepted {
        warn!("processor cannot handle {}", op);
        base.reply_status(OpStatus::NotSupported);
        return false;
    }
    if let Err(e) = validate(&base.client_request, &base.env.config) {
        warn!(
            "bad {} request rid={}: {}",
            op, base.client_request.request_id, e
        );
        base.reply_status(OpStatus::BadParam);
        return false;
    }
    if !base.select_replicas() {
        base.reply_status(OpStatus::NoStorageServer);
        return false;
    }
    true
}

async fn run_event_loop(
    processor: &mut dyn RequestProcessor,
    responses: &mut ResponseReceiver,
    deadline: Instant,
    cancel: &mut Option<oneshot::Receiver<()>>,
) {
    while !processor.base().is_done() && !processor.base().aborted {
        let expiry = processor.base().next_expiry();
        tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                processor.base_mut().on_cancelled();
                return;
            }
            _ = tokio::time::sleep_until(deadline) => {
                processor.base_mut().on_request_timeout();
                return;
            }
            Some(resp) = responses.recv() => dispatch_response(processor, resp),
            _ = sleep_until_opt(expiry) => expire_sub_requests(processor, Instant::now()),
        }
    }
}

fn dispatch_response(processor: &mut dyn RequestProcessor, resp: ReplicaResponse) {
    match processor.base_mut().accept_response(resp) {
        Ok(Accepted::Received(idx)) => processor.on_response_received(idx),
        Ok(Accepted::IoError(idx)) => processor.on_ss_io_error(idx),
        Ok(Accepted::Discarded) => {}
        Err(violation) => processor.base_mut().on_invariant_violation(violation),
    }
}

/// Time out everything that expired by `now`, oldest first. Handlers may
/// send new sub-requests; those expire later and stay queued.
fn expire_sub_requests(processor: &mut dyn RequestProcessor, now: Instant) {
    while let Some(idx) = processor.base_mut().pop_expired(now) {
        processor.on_ss_timeout(idx);
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Resolves on explicit cancellation only; a dropped handle never fires.
async fn cancelled(cancel: &mut Option<oneshot::Receiver<()>>) {
    match cancel {
        Some(rx) => {
            if rx.await.is_err() {
                *cancel = None;
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}
