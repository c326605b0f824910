//! Create: insert a record that must not exist yet.

use crate::process::ProcessorBase;
use crate::twophase::{is_write_success, Phase, TwoPhasePolicy, TwoPhaseState};
use kvproxy_common::{unix_now_nanos, unix_now_secs, Message, OpCode, OpStatus};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct CreatePolicy {
    num_dup_key: usize,
    num_inserting: usize,
}

impl CreatePolicy {
    /// Decide the prepare round once every prepare settled.
    fn act_if_done_with_prepare(&mut self, state: &mut TwoPhaseState) {
        if state.phase != Phase::Prepare || !state.prepare.stats.has_no_pending() {
            return;
        }
        if state.prepare_succeeded() {
            // DupKey from a replica is overruled when another one is
            // inserting the same key for us.
            if self.num_dup_key == 0 || self.num_inserting > 0 {
                let commit = commit_message(&state.base);
                state.set_commit(commit);
                state.send_commits();
            } else {
                let status = state.error_prepare_status();
                state.reply_status(status);
                state.abort_succeeded_prepares();
            }
        } else if state.prepare.stats.num_errors() + state.base.group.num_broken()
            >= state.num_writes()
        {
            let status = state.error_prepare_status();
            state.reply_status(status);
            state.abort_succeeded_prepares();
        }
    }

    /// After a successful commit, reply and repair the replicas that
    /// rejected the prepare.
    fn reply_and_repair(&mut self, state: &mut TwoPhaseState) {
        if state.base.has_replied() || !state.commit_succeeded() {
            return;
        }
        state.reply_clean_commit();
        let rejected: Vec<usize> = state
            .prepare
            .errors
            .iter()
            .map(|&idx| state.base.replica_of(idx))
            .collect();
        for replica in rejected {
            state.send_repair(replica);
        }
    }

    fn on_commit_failure(&mut self, state: &mut TwoPhaseState, idx: usize) {
        state.on_commit_failure(idx);
        if state.commit_failed() {
            state.reply_status(OpStatus::CommitFailure);
        } else {
            state.send_repairs();
        }
    }
}

/// Commit version 1 carrying the create's own creation time and TTL.
fn commit_message(base: &ProcessorBase) -> Message {
    let client = base.client_request();
    let mut commit = base.ss_request(OpCode::Commit, 1, false);
    if !commit.originator.is_set() {
        commit.originator = client.request_id;
    }
    commit.last_modification_time =
        if client.for_replication && client.last_modification_time != 0 {
            client.last_modification_time
        } else {
            if client.for_replication {
                debug!(
                    "no modification time on replicated create, rid={}",
                    client.request_id
                );
            }
            unix_now_nanos()
        };
    commit
}

impl TwoPhasePolicy for CreatePolicy {
    const PREPARE_OP: OpCode = OpCode::PrepareCreate;

    fn accepts(op: OpCode) -> bool {
        op == OpCode::Create
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn prepare_client_request(&mut self, base: &mut ProcessorBase) {
        let default_ttl = base.env().config.default_ttl();
        let client = &mut base.client_request;
        if client.creation_time == 0 {
            client.creation_time = unix_now_secs();
        }
        if client.ttl == 0 {
            debug!(
                "zero TTL on create, using default {}, rid={}",
                default_ttl, client.request_id
            );
            client.ttl = default_ttl;
        }
    }

    fn on_response(&mut self, state: &mut TwoPhaseState, idx: usize) {
        let rec = &state.base.records[idx];
        let (op, status) = (rec.op_code, rec.status);
        match op {
            OpCode::PrepareCreate => {
                match status {
                    OpStatus::NoError | OpStatus::AlreadyFulfilled => state.on_prepare_success(idx),
                    OpStatus::Inserting => {
                        self.num_inserting += 1;
                        state.on_prepare_success(idx);
                    }
                    OpStatus::DupKey => {
                        self.num_dup_key += 1;
                        state.on_prepare_failure(idx);
                    }
                    OpStatus::RecordLocked | OpStatus::NoStorageServer | OpStatus::BadParam => {
                        state.on_prepare_failure(idx)
                    }
                    st => {
                        info!("unexpected {} response: {}", op, st);
                        state.on_prepare_failure(idx);
                    }
                }
                self.act_if_done_with_prepare(state);
            }
            OpCode::Commit if is_write_success(status) => {
                state.on_commit_success(idx);
                self.reply_and_repair(state);
            }
            OpCode::Commit => self.on_commit_failure(state, idx),
            OpCode::Repair if is_write_success(status) => {
                state.repair.on_success_response();
                self.reply_and_repair(state);
            }
            OpCode::Repair => state.on_repair_failure(),
            _ => {}
        }
    }

    fn on_request_failure(&mut self, state: &mut TwoPhaseState, idx: usize) {
        match state.base.records[idx].op_code {
            OpCode::PrepareCreate => {
                state.on_prepare_failure(idx);
                self.act_if_done_with_prepare(state);
            }
            OpCode::Commit => self.on_commit_failure(state, idx),
            OpCode::Repair => state.on_repair_failure(),
            _ => {}
        }
    }

    fn fallback_status(&self, state: &TwoPhaseState) -> OpStatus {
        state.fallback_status()
    }
}
