//! Prepare/commit protocol engine for writes.
//!
//! `Init -> Prepare -> {Commit | Abort}`. Prepare goes to every available
//! replica. Once the policy accepts the prepare round it builds the commit
//! from the winning prepare response and commits on every replica that
//! prepared; otherwise the prepared replicas are aborted. Replicas whose
//! commit fails are repaired with the agreed value.

use crate::env::ProcessorEnv;
use crate::hooks::seal_payload;
use crate::process::{ProcessorBase, RequestProcessor};
use crate::record::RecordState;
use crate::stats::{CommitStats, OnePhaseStats, RequestStats};
use kvproxy_common::{Message, OpCode, OpStatus};
use kvproxy_metrics::metrics;
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Init,
    Prepare,
    Commit,
    Abort,
}

/// Commit, repair, and delete all treat these as success.
pub(crate) fn is_write_success(status: OpStatus) -> bool {
    matches!(status, OpStatus::NoError | OpStatus::AlreadyFulfilled)
}

#[derive(Debug)]
pub struct TwoPhaseState {
    pub base: ProcessorBase,
    pub phase: Phase,
    prepare_op: OpCode,
    /// The prepare reached fewer than W replicas and the request failed.
    abandoned: bool,
    pub prepare: OnePhaseStats,
    pub commit: CommitStats,
    pub abort: RequestStats,
    pub repair: RequestStats,
}

impl TwoPhaseState {
    pub fn new(env: Arc<ProcessorEnv>, prepare_op: OpCode) -> Self {
        Self {
            base: ProcessorBase::new(env),
            phase: Phase::Init,
            prepare_op,
            abandoned: false,
            prepare: OnePhaseStats::default(),
            commit: CommitStats::default(),
            abort: RequestStats::default(),
            repair: RequestStats::default(),
        }
    }

    pub fn init(&mut self) {
        self.base.init();
        self.phase = Phase::Init;
        self.abandoned = false;
        self.prepare.reset();
        self.commit.reset();
        self.abort.reset();
        self.repair.reset();
    }

    // ── Predicates ──

    pub fn num_writes(&self) -> usize {
        self.base.num_writes()
    }

    pub fn max_failures(&self) -> usize {
        self.base.max_failures()
    }

    pub fn prepare_succeeded(&self) -> bool {
        self.prepare.stats.num_success >= self.num_writes()
    }

    /// Errors, transport failures, and zones without a replica exceed N - W.
    pub fn prepare_failed(&self) -> bool {
        let s = &self.prepare.stats;
        s.num_error + s.num_io_and_timeout() + self.base.group.num_broken() > self.max_failures()
    }

    pub fn commit_succeeded(&self) -> bool {
        let committed = self.commit.stats.num_success;
        committed > 0 && committed + self.repair.num_success >= self.num_writes()
    }

    pub fn commit_failed(&self) -> bool {
        self.commit.stats.num_error + self.repair.num_error >= self.num_writes()
    }

    /// The most recent successful prepare response.
    pub fn winner(&self) -> Option<&Message> {
        self.prepare
            .most_recent()
            .and_then(|idx| self.base.response(idx))
    }

    // ── Sending ──

    /// Fan the prepare out to every available replica.
    pub(crate) fn send_prepares(&mut self) {
        self.phase = Phase::Prepare;
        let version = self.base.client_request.version;
        let mut template = self.base.ss_request(self.prepare_op, version, true);
        if let Some(cipher) = self.base.env().payload_cipher() {
            match seal_payload(cipher, &template.payload) {
                Ok(payload) => template.payload = payload,
                Err(e) => {
                    error!("failed to encrypt payload: {}", e);
                    self.base.reply_status(OpStatus::Internal);
                    return;
                }
            }
        }
        self.prepare.stats.template = Some(template);
        for replica in 0..self.base.group.num_available() {
            self.base.send(&mut self.prepare.stats, replica);
        }
        if self.prepare.stats.num_sent < self.num_writes() {
            self.base.reply_send_shortfall(&self.prepare.stats);
            self.phase = Phase::Abort;
            self.abandoned = true;
        }
    }

    /// Once the prepare is abandoned, every replica that answers it is
    /// rolled back and the policy never sees the response.
    fn absorb_abandoned_prepare(&mut self, idx: usize) -> bool {
        let rec = &self.base.records[idx];
        if !self.abandoned || rec.op_code != self.prepare_op {
            return false;
        }
        if rec.state == RecordState::ResponseReceived {
            let replica = rec.replica_index;
            self.send_abort(replica);
        }
        true
    }

    pub(crate) fn set_commit(&mut self, commit: Message) {
        debug!(
            "commit v{} ct={} ttl={}",
            commit.version, commit.creation_time, commit.ttl
        );
        self.commit.stats.template = Some(commit);
    }

    pub(crate) fn send_commit(&mut self, replica: usize) -> bool {
        self.base.send(&mut self.commit.stats, replica)
    }

    /// Commit on every replica that prepared.
    pub(crate) fn send_commits(&mut self) {
        self.phase = Phase::Commit;
        let replicas: Vec<usize> = self
            .prepare
            .successes
            .iter()
            .map(|&idx| self.base.replica_of(idx))
            .collect();
        for replica in replicas {
            self.send_commit(replica);
        }
    }

    pub(crate) fn send_abort(&mut self, replica: usize) -> bool {
        if !self.abort.is_set() {
            self.abort.template = Some(self.base.ss_request(OpCode::Abort, 0, false));
        }
        self.base.send(&mut self.abort, replica)
    }

    /// Roll back every replica that prepared. Runs at most once.
    pub(crate) fn abort_succeeded_prepares(&mut self) {
        if self.phase == Phase::Abort {
            return;
        }
        self.phase = Phase::Abort;
        let replicas: Vec<usize> = self
            .prepare
            .successes
            .iter()
            .map(|&idx| self.base.replica_of(idx))
            .collect();
        for replica in replicas {
            self.send_abort(replica);
        }
    }

    /// Repair `replica` with the committed value.
    pub(crate) fn send_repair(&mut self, replica: usize) {
        if !self.repair.is_set() {
            let Some(commit) = self.commit.stats.template.as_ref() else {
                error!("repair requested before a commit was built");
                self.reply_status(OpStatus::Inconsistent);
                return;
            };
            let mut repair = commit.clone();
            repair.op_code = OpCode::Repair;
            repair.payload = self
                .prepare
                .stats
                .template
                .as_ref()
                .map(|p| p.payload.clone())
                .unwrap_or_default();
            self.repair.template = Some(repair);
        }
        if self.base.send(&mut self.repair, replica) {
            metrics()
                .repairs_sent
                .with_label_values(&[self.base.client_request.op_code.name()])
                .inc();
        } else {
            self.reply_status(OpStatus::Inconsistent);
        }
    }

    /// Repair every replica whose commit failed so far.
    pub(crate) fn send_repairs(&mut self) {
        let failed = std::mem::take(&mut self.commit.failed_replicas);
        for replica in failed {
            self.send_repair(replica);
        }
    }

    // ── Outcomes ──

    /// Client status for a failed prepare round.
    ///
    /// DupKey wins outright, then RecordLocked, then the last error seen.
    /// Too many transport failures override all of them.
    pub fn error_prepare_status(&self) -> OpStatus {
        let mut status = OpStatus::NoError;
        let mut locked = false;
        for &idx in &self.prepare.errors {
            match self.base.records[idx].status {
                OpStatus::DupKey => return OpStatus::DupKey,
                OpStatus::RecordLocked => locked = true,
                st => status = st,
            }
        }
        if locked {
            status = OpStatus::RecordLocked;
        }
        let s = &self.prepare.stats;
        if s.num_io_and_timeout() > self.max_failures() {
            status = if s.num_no_stage_errors() > self.max_failures() {
                OpStatus::NoStorageServer
            } else {
                OpStatus::Busy
            };
        }
        if status == OpStatus::NoError {
            warn!("prepare failed without an error status");
            status = OpStatus::Busy;
        }
        status
    }

    /// Status for a request whose sub-requests all settled without a
    /// decision.
    pub fn fallback_status(&self) -> OpStatus {
        match self.phase {
            Phase::Init => OpStatus::Internal,
            Phase::Prepare | Phase::Abort => self.error_prepare_status(),
            Phase::Commit if self.commit.stats.num_success > 0 => OpStatus::Inconsistent,
            Phase::Commit => OpStatus::CommitFailure,
        }
    }

    pub(crate) fn on_prepare_success(&mut self, idx: usize) {
        self.prepare.on_success(&self.base.records, idx);
    }

    pub(crate) fn on_prepare_failure(&mut self, idx: usize) {
        self.prepare.on_failure(&self.base.records, idx);
    }

    pub(crate) fn on_commit_success(&mut self, idx: usize) {
        self.commit.on_success(idx);
    }

    pub(crate) fn on_commit_failure(&mut self, idx: usize) {
        let replica = self.base.replica_of(idx);
        self.commit.on_failure(replica);
    }

    pub(crate) fn on_repair_success(&mut self) {
        self.repair.on_success_response();
        if self.commit_succeeded() {
            self.reply_clean_commit();
        }
    }

    pub(crate) fn on_repair_failure(&mut self) {
        self.repair.on_error_response();
        if !self.base.has_replied() {
            warn!(
                "repair failed for {} {:?}",
                self.base.client_request.op_code,
                self.base.client_request.key_lossy()
            );
            self.reply_status(OpStatus::Inconsistent);
        }
    }

    /// Reply with the first successful commit response.
    pub(crate) fn reply_clean_commit(&mut self) {
        match self.commit.clean_response {
            Some(idx) => self.base.reply_to_client(idx),
            None => self.base.reply_status(OpStatus::NoError),
        }
    }

    /// Like [`ProcessorBase::reply_status`], except that Inconsistent after
    /// a successful commit carries the committed record.
    pub fn reply_status(&mut self, status: OpStatus) {
        if status == OpStatus::Inconsistent {
            let clean = self
                .commit
                .clean_response
                .and_then(|idx| self.base.response(idx))
                .cloned();
            if let Some(mut resp) = clean {
                resp.status = OpStatus::Inconsistent;
                if resp.payload.is_empty() {
                    resp.payload = self.base.client_request.payload.clone();
                }
                self.base.reply_with(resp);
                return;
            }
        }
        self.base.reply_status(status);
    }
}

/// What a prepare/commit operation plugs into [`TwoPhaseProcessor`].
pub trait TwoPhasePolicy: Default + Send + 'static {
    const PREPARE_OP: OpCode;

    fn accepts(op: OpCode) -> bool;

    fn reset(&mut self);

    /// Fill in client request defaults before the prepare is built.
    fn prepare_client_request(&mut self, _base: &mut ProcessorBase) {}

    fn on_response(&mut self, state: &mut TwoPhaseState, idx: usize);

    /// Record `idx` timed out or failed in transport.
    fn on_request_failure(&mut self, state: &mut TwoPhaseState, idx: usize);

    fn fallback_status(&self, state: &TwoPhaseState) -> OpStatus;
}

/// A two-phase processor specialised by policy `P`.
#[derive(Debug)]
pub struct TwoPhaseProcessor<P: TwoPhasePolicy> {
    state: TwoPhaseState,
    policy: P,
}

impl<P: TwoPhasePolicy> TwoPhaseProcessor<P> {
    pub fn new(env: Arc<ProcessorEnv>) -> Self {
        Self {
            state: TwoPhaseState::new(env, P::PREPARE_OP),
            policy: P::default(),
        }
    }

    pub fn state(&self) -> &TwoPhaseState {
        &self.state
    }
}

impl<P: TwoPhasePolicy> RequestProcessor for TwoPhaseProcessor<P> {
    fn base(&self) -> &ProcessorBase {
        &self.state.base
    }

    fn base_mut(&mut self) -> &mut ProcessorBase {
        &mut self.state.base
    }

    fn accepts(&self, op: OpCode) -> bool {
        P::accepts(op)
    }

    fn init(&mut self) {
        self.state.init();
        self.policy.reset();
    }

    fn send_initial_requests(&mut self) {
        self.policy.prepare_client_request(&mut self.state.base);
        self.state.send_prepares();
    }

    fn on_response_received(&mut self, idx: usize) {
        if !self.state.absorb_abandoned_prepare(idx) {
            self.policy.on_response(&mut self.state, idx);
        }
    }

    fn on_ss_timeout(&mut self, idx: usize) {
        if !self.state.absorb_abandoned_prepare(idx) {
            self.policy.on_request_failure(&mut self.state, idx);
        }
    }

    fn on_ss_io_error(&mut self, idx: usize) {
        if !self.state.absorb_abandoned_prepare(idx) {
            self.policy.on_request_failure(&mut self.state, idx);
        }
    }

    fn reply_unanswered(&mut self) {
        let status = self.policy.fallback_status(&self.state);
        self.state.reply_status(status);
    }
}
