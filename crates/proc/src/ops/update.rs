//! Update: modify an existing record, optionally conditioned on its version.

use super::{
    finish_commit, on_write_follow_up, on_write_follow_up_failure, reply_prepare_failure,
    track_conflict, CommitFields,
};
use crate::stats::RequestStats;
use crate::twophase::{Phase, TwoPhasePolicy, TwoPhaseState};
use kvproxy_common::{Message, OpCode, OpStatus};
use kvproxy_metrics::metrics;
use tracing::info;

#[derive(Debug, Default)]
pub struct UpdatePolicy {
    num_inserting: usize,
    /// Most recent VersionConflict response.
    conflict: Option<usize>,
    mark_delete: RequestStats,
}

impl UpdatePolicy {
    /// The winner is inserting yet carries a version: the record was
    /// deleted but not yet purged.
    fn is_marked_deleted(state: &TwoPhaseState) -> bool {
        state
            .winner()
            .map_or(false, |w| w.status == OpStatus::Inserting && w.version != 0)
    }

    fn prepare_succeeded(&self, state: &TwoPhaseState) -> bool {
        if Self::is_marked_deleted(state) {
            return false;
        }
        let num_success = state.prepare.stats.num_success;
        if state.base.client_request().for_replication {
            num_success >= state.num_writes()
        } else {
            num_success > self.num_inserting && num_success >= state.num_writes()
        }
    }

    fn prepare_failed(&self, state: &TwoPhaseState) -> bool {
        Self::is_marked_deleted(state)
            || state.prepare_failed()
            || (self.num_inserting >= state.num_writes()
                && !state.base.client_request().for_replication)
    }

    fn error_status(&self, state: &TwoPhaseState) -> OpStatus {
        if self.num_inserting >= state.num_writes() && !state.base.client_request().for_replication
        {
            OpStatus::NoKey
        } else {
            state.error_prepare_status()
        }
    }

    fn act_if_done_with_prepare(&mut self, state: &mut TwoPhaseState) {
        if state.phase != Phase::Prepare || !state.prepare.stats.has_no_pending() {
            return;
        }
        if Self::is_marked_deleted(state) {
            self.mark_deleted(state);
        } else if self.prepare_failed(state) {
            let status = self.error_status(state);
            reply_prepare_failure(state, self.conflict, status);
            state.abort_succeeded_prepares();
        } else if self.prepare_succeeded(state) {
            let commit = commit_message(state);
            state.set_commit(commit);
            state.send_commits();
        }
    }

    /// Finish deleting on replicas that still hold the record, abort the
    /// rest, and report the key as missing.
    fn mark_deleted(&mut self, state: &mut TwoPhaseState) {
        state.phase = Phase::Abort;
        let creation_time = state.winner().map_or(0, |w| w.creation_time);
        let targets: Vec<(usize, OpStatus)> = state
            .prepare
            .successes
            .iter()
            .map(|&idx| (state.base.replica_of(idx), state.base.records[idx].status))
            .collect();
        for (replica, status) in targets {
            if matches!(status, OpStatus::NoError | OpStatus::AlreadyFulfilled) {
                if !self.mark_delete.is_set() {
                    let mut msg = state.base.ss_request(OpCode::MarkDelete, 0, false);
                    msg.creation_time = creation_time;
                    self.mark_delete.template = Some(msg);
                }
                if state.base.send(&mut self.mark_delete, replica) {
                    metrics()
                        .mark_deletes_sent
                        .with_label_values(&[OpCode::Update.name()])
                        .inc();
                }
            } else {
                state.send_abort(replica);
            }
        }
        state.reply_status(OpStatus::NoKey);
    }
}

/// Commit built from the winning prepare response. Local updates bump the
/// winner's version; replicated ones carry the source datacenter's values.
fn commit_message(state: &TwoPhaseState) -> Message {
    let base = &state.base;
    let client = base.client_request();
    let mut commit = base.ss_request(OpCode::Commit, 0, false);
    let mut fields = CommitFields::default();
    if let Some(winner) = state.winner() {
        commit.originator = if client.for_replication {
            client.originator
        } else {
            winner.originator
        };
        fields.ttl = winner.ttl;
        if client.for_replication {
            fields.version = client.version as u64;
            fields.ttl = fields.ttl.max(client.ttl);
            fields.creation_time = client.creation_time;
        } else {
            fields.creation_time = winner.creation_time;
            fields.version = winner.version as u64 + 1;
        }
    }
    finish_commit(
        &mut commit,
        client,
        fields,
        base.env().config.max_record_version(),
    );
    commit
}

impl TwoPhasePolicy for UpdatePolicy {
    const PREPARE_OP: OpCode = OpCode::PrepareUpdate;

    fn accepts(op: OpCode) -> bool {
        op == OpCode::Update
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn on_response(&mut self, state: &mut TwoPhaseState, idx: usize) {
        let rec = &state.base.records[idx];
        let (op, status) = (rec.op_code, rec.status);
        if op != OpCode::PrepareUpdate {
            on_write_follow_up(state, idx);
            return;
        }
        match status {
            OpStatus::NoError | OpStatus::AlreadyFulfilled => state.on_prepare_success(idx),
            OpStatus::Inserting => {
                self.num_inserting += 1;
                state.on_prepare_success(idx);
            }
            OpStatus::RecordLocked | OpStatus::NoStorageServer | OpStatus::BadParam => {
                state.on_prepare_failure(idx)
            }
            OpStatus::VersionConflict => {
                track_conflict(&mut self.conflict, state, idx);
                state.on_prepare_failure(idx);
            }
            st => {
                info!("unexpected {} response: {}", op, st);
                state.on_prepare_failure(idx);
            }
        }
        self.act_if_done_with_prepare(state);
    }

    fn on_request_failure(&mut self, state: &mut TwoPhaseState, idx: usize) {
        if state.base.records[idx].op_code == OpCode::PrepareUpdate {
            state.on_prepare_failure(idx);
            self.act_if_done_with_prepare(state);
        } else {
            on_write_follow_up_failure(state, idx);
        }
    }

    fn fallback_status(&self, state: &TwoPhaseState) -> OpStatus {
        if matches!(state.phase, Phase::Prepare | Phase::Abort) {
            self.error_status(state)
        } else {
            state.fallback_status()
        }
    }
}
