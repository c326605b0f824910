//! Single-round Destroy: Delete on every replica. A missing key counts as
//! deleted.

use crate::onephase::{OnePhasePolicy, OnePhaseState};
use crate::process::ProcessorBase;
use kvproxy_common::{Message, OpCode, OpStatus};

#[derive(Debug, Default)]
pub struct DestroyPolicy;

impl DestroyPolicy {
    fn error_status(state: &OnePhaseState) -> OpStatus {
        let s = &state.request.stats;
        let w = state.base.num_writes();
        if s.num_error == 0 || s.num_io_and_timeout() >= w {
            return if s.num_no_stage_errors() >= w {
                OpStatus::NoStorageServer
            } else {
                OpStatus::Busy
            };
        }
        state
            .request
            .errors
            .first()
            .map_or(OpStatus::Busy, |&idx| state.status_of(idx))
    }

    fn on_failure(state: &mut OnePhaseState, idx: usize) {
        state.on_failure(idx);
        if state.failed() {
            let status = Self::error_status(state);
            state.base.reply_status(status);
        }
    }
}

impl OnePhasePolicy for DestroyPolicy {
    fn accepts(op: OpCode) -> bool {
        op == OpCode::Destroy
    }

    fn storage_request(&self, base: &ProcessorBase) -> Message {
        base.ss_request(OpCode::Delete, base.client_request().version, false)
    }

    fn reset(&mut self) {}

    fn on_response(&mut self, state: &mut OnePhaseState, idx: usize) {
        match state.status_of(idx) {
            OpStatus::NoError | OpStatus::NoKey => {
                state.on_success(idx);
                if state.succeeded() && !state.base.has_replied() {
                    if let Some(mut resp) = state.base.response(idx).cloned() {
                        resp.status = OpStatus::NoError;
                        state.base.reply_with(resp);
                    }
                }
            }
            _ => Self::on_failure(state, idx),
        }
    }

    fn on_ss_timeout(&mut self, state: &mut OnePhaseState, idx: usize) {
        Self::on_failure(state, idx);
    }

    fn on_ss_io_error(&mut self, state: &mut OnePhaseState, idx: usize) {
        Self::on_failure(state, idx);
    }

    fn fallback_status(&self, state: &OnePhaseState) -> OpStatus {
        Self::error_status(state)
    }
}
