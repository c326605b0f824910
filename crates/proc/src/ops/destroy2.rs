//! Two-phase Destroy.
//!
//! PrepareDelete goes to every replica; a missing key prepares fine. When
//! every zone prepared, the delete is committed, falling back to a plain
//! Delete on replicas whose commit fails. When only a quorum prepared, the
//! replicas holding the record are marked deleted instead, so that a
//! replica that missed the delete cannot resurrect it.

use crate::process::ProcessorBase;
use crate::stats::RequestStats;
use crate::twophase::{is_write_success, Phase, TwoPhasePolicy, TwoPhaseState};
use kvproxy_common::{Message, OpCode, OpStatus};
use kvproxy_metrics::metrics;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct TwoPhaseDestroyPolicy {
    num_no_key: usize,
    delete: RequestStats,
    mark_delete: RequestStats,
    /// First successful MarkDelete response.
    mark_delete_response: Option<usize>,
}

fn is_delete_success(status: OpStatus) -> bool {
    is_write_success(status) || status == OpStatus::NoKey
}

impl TwoPhaseDestroyPolicy {
    fn act_if_done_with_prepare(&mut self, state: &mut TwoPhaseState) {
        if state.phase != Phase::Prepare || !state.prepare.stats.has_no_pending() {
            return;
        }
        let num_success = state.prepare.stats.num_success;
        if num_success >= state.num_writes() && num_success == self.num_no_key {
            // Nothing to delete anywhere that answered.
            state.abort_succeeded_prepares();
            state.reply_status(OpStatus::NoError);
        } else if num_success == state.base.env().config.num_zones {
            let commit = state.base.ss_request(OpCode::Commit, 1, false);
            state.set_commit(commit);
            state.send_commits();
        } else if num_success >= state.num_writes() {
            self.mark_delete_prepared(state);
        } else {
            let status = state.error_prepare_status();
            state.abort_succeeded_prepares();
            state.reply_status(status);
        }
    }

    /// Mark the record deleted where it exists, abort where it does not.
    fn mark_delete_prepared(&mut self, state: &mut TwoPhaseState) {
        state.phase = Phase::Abort;
        let targets: Vec<(usize, OpStatus)> = state
            .prepare
            .successes
            .iter()
            .map(|&idx| (state.base.replica_of(idx), state.base.records[idx].status))
            .collect();
        for (replica, status) in targets {
            if status == OpStatus::NoKey {
                state.send_abort(replica);
            } else {
                self.send_mark_delete(&mut state.base, replica);
            }
        }
        if self.mark_delete.num_sent == 0 {
            state.reply_status(OpStatus::Inconsistent);
        }
    }

    fn send_mark_delete(&mut self, base: &mut ProcessorBase, replica: usize) {
        if !self.mark_delete.is_set() {
            self.mark_delete.template = Some(base.ss_request(OpCode::MarkDelete, 0, false));
        }
        if base.send(&mut self.mark_delete, replica) {
            metrics()
                .mark_deletes_sent
                .with_label_values(&[OpCode::Destroy.name()])
                .inc();
        }
    }

    fn send_delete(&mut self, base: &mut ProcessorBase, replica: usize) {
        if !self.delete.is_set() {
            self.delete.template = Some(base.ss_request(OpCode::Delete, 0, false));
        }
        base.send(&mut self.delete, replica);
    }

    fn on_commit_failure(&mut self, state: &mut TwoPhaseState, idx: usize) {
        state.on_commit_failure(idx);
        let replica = state.base.replica_of(idx);
        self.send_delete(&mut state.base, replica);
        self.act_if_done_with_commit(state);
    }

    /// Once every commit and fallback delete settled: a quorum of
    /// successes is a clean delete, none is a commit failure, anything in
    /// between is inconsistent.
    fn act_if_done_with_commit(&mut self, state: &mut TwoPhaseState) {
        if !state.commit.stats.has_no_pending() || !self.delete.has_no_pending() {
            return;
        }
        let num_deleted = state.commit.stats.num_success + self.delete.num_success;
        // Fallback deletes count toward the quorum: W deletions reply
        // NoError even when every commit failed.
        if num_deleted >= state.num_writes() {
            match state.commit.clean_response {
                Some(idx) => {
                    let Some(mut resp) = state.base.response(idx).cloned() else {
                        state.reply_status(OpStatus::NoError);
                        return;
                    };
                    if let Some(winner) = state.winner() {
                        resp.creation_time = winner.creation_time;
                        resp.ttl = winner.ttl;
                        resp.last_modification_time = winner.last_modification_time;
                        resp.originator = winner.originator;
                    }
                    state.base.reply_with(resp);
                }
                None => state.reply_status(OpStatus::NoError),
            }
        } else if num_deleted == 0 {
            state.reply_status(OpStatus::CommitFailure);
        } else {
            state.reply_status(OpStatus::Inconsistent);
        }
    }

    fn act_if_done_with_mark_delete(&mut self, state: &mut TwoPhaseState) {
        if !self.mark_delete.has_no_pending() {
            return;
        }
        if self.mark_delete.all_succeeded() {
            match self.mark_delete_response {
                Some(idx) => state.base.reply_to_client(idx),
                None => state.reply_status(OpStatus::NoError),
            }
        } else {
            state.reply_status(OpStatus::Inconsistent);
        }
    }

    fn on_follow_up_failure(&mut self, state: &mut TwoPhaseState, idx: usize) {
        let rec = &state.base.records[idx];
        let (op, io_error) = (rec.op_code, rec.state.is_io_error());
        let settle = |stats: &mut RequestStats| {
            if io_error {
                stats.on_io_error()
            } else {
                stats.on_timeout()
            }
        };
        match op {
            OpCode::Commit => self.on_commit_failure(state, idx),
            OpCode::Repair => state.on_repair_failure(),
            OpCode::MarkDelete => {
                settle(&mut self.mark_delete);
                self.act_if_done_with_mark_delete(state);
            }
            OpCode::Delete => {
                settle(&mut self.delete);
                self.act_if_done_with_commit(state);
            }
            OpCode::Abort => {}
            op => warn!("unexpected {} failure", op),
        }
    }
}

impl TwoPhasePolicy for TwoPhaseDestroyPolicy {
    const PREPARE_OP: OpCode = OpCode::PrepareDelete;

    fn accepts(op: OpCode) -> bool {
        op == OpCode::Destroy
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn on_response(&mut self, state: &mut TwoPhaseState, idx: usize) {
        let rec = &state.base.records[idx];
        let (op, status) = (rec.op_code, rec.status);
        match op {
            OpCode::PrepareDelete => {
                match status {
                    OpStatus::NoError | OpStatus::AlreadyFulfilled => state.on_prepare_success(idx),
                    OpStatus::NoKey => {
                        self.num_no_key += 1;
                        state.on_prepare_success(idx);
                    }
                    OpStatus::BadParam | OpStatus::RecordLocked | OpStatus::VersionConflict => {
                        state.on_prepare_failure(idx)
                    }
                    st => {
                        warn!("unexpected {} response: {}", op, st);
                        state.on_prepare_failure(idx);
                    }
                }
                self.act_if_done_with_prepare(state);
            }
            OpCode::Commit if is_write_success(status) => {
                state.on_commit_success(idx);
                self.act_if_done_with_commit(state);
            }
            OpCode::Commit => self.on_commit_failure(state, idx),
            OpCode::MarkDelete => {
                if is_write_success(status) {
                    self.mark_delete_response.get_or_insert(idx);
                    self.mark_delete.on_success_response();
                } else {
                    info!("MarkDelete failed: {}", status);
                    self.mark_delete.on_error_response();
                }
                self.act_if_done_with_mark_delete(state);
            }
            OpCode::Delete => {
                if is_delete_success(status) {
                    self.delete.on_success_response();
                } else {
                    self.delete.on_error_response();
                }
                self.act_if_done_with_commit(state);
            }
            OpCode::Abort => {}
            op => warn!("unexpected {} response", op),
        }
    }

    fn on_request_failure(&mut self, state: &mut TwoPhaseState, idx: usize) {
        if state.base.records[idx].op_code == OpCode::PrepareDelete {
            state.on_prepare_failure(idx);
            self.act_if_done_with_prepare(state);
        } else {
            self.on_follow_up_failure(state, idx);
        }
    }

    fn fallback_status(&self, state: &TwoPhaseState) -> OpStatus {
        if self.mark_delete.num_sent > 0 {
            OpStatus::Inconsistent
        } else {
            state.fallback_status()
        }
    }
}
