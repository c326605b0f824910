//! Set (upsert) and UDFSet: write a record whether or not it exists.
//!
//! Set commits as soon as W replicas prepared; replicas that prepare later
//! are committed or aborted to match whatever the request already decided.

use super::{
    finish_commit, on_write_follow_up, on_write_follow_up_failure, reply_prepare_failure,
    track_conflict, CommitFields,
};
use crate::twophase::{Phase, TwoPhasePolicy, TwoPhaseState};
use kvproxy_common::{unix_now_secs, Message, OpCode, OpStatus};
use tracing::info;

#[derive(Debug, Default)]
pub struct SetPolicy {
    num_inserting: usize,
    conflict: Option<usize>,
}

impl SetPolicy {
    fn on_prepare_success(&mut self, state: &mut TwoPhaseState, idx: usize) {
        state.on_prepare_success(idx);
        let replica = state.base.replica_of(idx);
        match state.phase {
            Phase::Abort => {
                state.send_abort(replica);
            }
            Phase::Commit => {
                state.send_commit(replica);
            }
            _ => {
                if state.prepare_succeeded() {
                    let commit = self.commit_message(state);
                    state.set_commit(commit);
                    state.send_commits();
                }
            }
        }
    }

    fn on_prepare_failure(&mut self, state: &mut TwoPhaseState, idx: usize) {
        state.on_prepare_failure(idx);
        if state.phase == Phase::Prepare && state.prepare_failed() {
            let status = state.error_prepare_status();
            reply_prepare_failure(state, self.conflict, status);
            state.abort_succeeded_prepares();
        }
    }

    /// Commit built from the winning prepare response. An inserting winner
    /// means the record is new: it gets a fresh originator, creation time,
    /// and TTL, and starts from version 0.
    fn commit_message(&self, state: &TwoPhaseState) -> Message {
        let base = &state.base;
        let client = base.client_request();
        let default_ttl = base.env().config.default_ttl();
        let mut commit = base.ss_request(OpCode::Commit, 0, false);
        let mut fields = CommitFields::default();

        if let Some(winner) = state.winner() {
            let mut version = 0u64;
            if winner.status == OpStatus::Inserting {
                commit.originator = client.request_id;
                fields.creation_time = if client.creation_time != 0 {
                    client.creation_time
                } else {
                    unix_now_secs()
                };
                fields.ttl = if client.ttl != 0 { client.ttl } else { default_ttl };
            } else {
                commit.originator = winner.originator;
                fields.creation_time = winner.creation_time;
                version = winner.version as u64;
                fields.ttl = winner.ttl;
            }
            if client.for_replication {
                version = version.max(client.version as u64);
                fields.ttl = fields.ttl.max(client.ttl);
                fields.creation_time = fields.creation_time.max(client.creation_time);
            } else {
                version += 1;
            }
            fields.version = version;
        }

        if state.prepare.stats.num_success == self.num_inserting {
            if fields.creation_time == 0 {
                fields.creation_time = unix_now_secs();
            }
            if client.ttl == 0 {
                fields.ttl = default_ttl;
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
}

impl TwoPhasePolicy for SetPolicy {
    const PREPARE_OP: OpCode = OpCode::PrepareSet;

    fn accepts(op: OpCode) -> bool {
        matches!(op, OpCode::Set | OpCode::UdfSet)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn on_response(&mut self, state: &mut TwoPhaseState, idx: usize) {
        let rec = &state.base.records[idx];
        let (op, status) = (rec.op_code, rec.status);
        if op != OpCode::PrepareSet {
            on_write_follow_up(state, idx);
            return;
        }
        match status {
            OpStatus::NoError | OpStatus::AlreadyFulfilled => self.on_prepare_success(state, idx),
            OpStatus::Inserting => {
                self.num_inserting += 1;
                self.on_prepare_success(state, idx);
            }
            OpStatus::RecordLocked | OpStatus::NoStorageServer | OpStatus::BadParam => {
                self.on_prepare_failure(state, idx)
            }
            OpStatus::VersionConflict => {
                track_conflict(&mut self.conflict, state, idx);
                self.on_prepare_failure(state, idx);
            }
            st => {
                info!("unexpected {} response: {}", op, st);
                self.on_prepare_failure(state, idx);
            }
        }
    }

    fn on_request_failure(&mut self, state: &mut TwoPhaseState, idx: usize) {
        if state.base.records[idx].op_code == OpCode::PrepareSet {
            self.on_prepare_failure(state, idx);
        } else {
            on_write_follow_up_failure(state, idx);
        }
    }

    fn fallback_status(&self, state: &TwoPhaseState) -> OpStatus {
        state.fallback_status()
    }
}
