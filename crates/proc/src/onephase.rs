//! Single-round protocol engine: one storage op to every replica, decided
//! by counting the answers.

use crate::env::ProcessorEnv;
use crate::process::{ProcessorBase, RequestProcessor};
use crate::stats::OnePhaseStats;
use kvproxy_common::{Message, OpCode, OpStatus};
use std::sync::Arc;

/// Engine state shared by every one-phase operation.
#[derive(Debug)]
pub struct OnePhaseState {
    pub base: ProcessorBase,
    pub request: OnePhaseStats,
}

impl OnePhaseState {
    pub fn new(env: Arc<ProcessorEnv>) -> Self {
        Self {
            base: ProcessorBase::new(env),
            request: OnePhaseStats::default(),
        }
    }

    pub fn init(&mut self) {
        self.base.init();
        self.request.reset();
    }

    /// Send `template` to every available replica. Fails the request when
    /// fewer than W could be sent.
    pub(crate) fn fan_out(&mut self, template: Message) {
        self.request.stats.template = Some(template);
        for replica in 0..self.base.group.num_available() {
            self.base.send(&mut self.request.stats, replica);
        }
        if self.request.stats.num_sent < self.base.num_writes() {
            self.base.reply_send_shortfall(&self.request.stats);
        }
    }

    /// `#success >= W`.
    pub fn succeeded(&self) -> bool {
        self.request.stats.num_success >= self.base.num_writes()
    }

    /// `#error + #io_and_timeout > N - W`.
    pub fn failed(&self) -> bool {
        self.request.stats.num_error + self.request.stats.num_io_and_timeout()
            > self.base.max_failures()
    }

    pub(crate) fn on_success(&mut self, idx: usize) {
        self.request.on_success(&self.base.records, idx);
    }

    pub(crate) fn on_failure(&mut self, idx: usize) {
        self.request.on_failure(&self.base.records, idx);
    }

    /// Status of record `idx`'s response, or `NoStorageServer` if none.
    pub(crate) fn status_of(&self, idx: usize) -> OpStatus {
        self.base.records[idx].status
    }
}

/// What a one-phase operation plugs into [`OnePhaseProcessor`].
pub trait OnePhasePolicy: Default + Send + 'static {
    fn accepts(op: OpCode) -> bool;

    /// The storage request sent to every replica.
    fn storage_request(&self, base: &ProcessorBase) -> Message;

    fn reset(&mut self);

    /// A response to one of this request's sub-requests arrived.
    fn on_response(&mut self, state: &mut OnePhaseState, idx: usize);

    fn on_ss_timeout(&mut self, state: &mut OnePhaseState, idx: usize);

    fn on_ss_io_error(&mut self, state: &mut OnePhaseState, idx: usize);

    /// Reply sent when every sub-request settled without a decision.
    fn fallback_status(&self, state: &OnePhaseState) -> OpStatus;

    fn needs_udf(_op: OpCode) -> bool {
        false
    }
}

/// A one-phase processor specialised by policy `P`.
#[derive(Debug)]
pub struct OnePhaseProcessor<P: OnePhasePolicy> {
    state: OnePhaseState,
    policy: P,
}

impl<P: OnePhasePolicy> OnePhaseProcessor<P> {
    pub fn new(env: Arc<ProcessorEnv>) -> Self {
        Self {
            state: OnePhaseState::new(env),
            policy: P::default(),
        }
    }

    pub fn state(&self) -> &OnePhaseState {
        &self.state
    }
}

impl<P: OnePhasePolicy> RequestProcessor for OnePhaseProcessor<P> {
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
        let template = self.policy.storage_request(&self.state.base);
        self.state.fan_out(template);
    }

    fn on_response_received(&mut self, idx: usize) {
        self.policy.on_response(&mut self.state, idx);
    }

    fn on_ss_timeout(&mut self, idx: usize) {
        self.policy.on_ss_timeout(&mut self.state, idx);
    }

    fn on_ss_io_error(&mut self, idx: usize) {
        self.policy.on_ss_io_error(&mut self.state, idx);
    }

    fn reply_unanswered(&mut self) {
        let status = self.policy.fallback_status(&self.state);
        self.state.base.reply_status(status);
    }

    fn needs_udf(&self, op: OpCode) -> bool {
        P::needs_udf(op)
    }
}
