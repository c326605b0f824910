//! Get and UDFGet: read from every replica, reply with the most recent
//! value, and repair the replicas that disagree.

use crate::onephase::{OnePhasePolicy, OnePhaseState};
use crate::process::ProcessorBase;
use crate::recency::is_more_recent;
use crate::stats::RequestStats;
use crate::twophase::is_write_success;
use kvproxy_common::{Message, OpCode, OpStatus};
use kvproxy_metrics::metrics;
use tracing::{debug, error, info};

#[derive(Debug, Default)]
pub struct GetPolicy {
    repair: RequestStats,
    mark_delete: RequestStats,
    num_no_key: usize,
    num_ttl_extend_failures: usize,
    /// Record the client was answered from. Reads arriving afterwards are
    /// checked against it.
    replied_winner: Option<usize>,
}

/// A marked-deleted winner must be propagated to `resp`.
fn needs_mark_delete(resp: &Message, winner: &Message) -> bool {
    resp.status != OpStatus::KeyMarkedDelete
        || resp.version != winner.version
        || resp.originator != winner.originator
        || resp.ttl != winner.ttl
        || resp.creation_time != winner.creation_time
}

/// `resp` holds something other than the winning record.
fn differs(resp: &Message, winner: &Message) -> bool {
    resp.status != winner.status || !resp.same_record_as(winner)
}

impl GetPolicy {
    fn succeeded(&self, state: &OnePhaseState) -> bool {
        let s = &state.request.stats;
        s.num_success > 0
            && s.num_success + self.num_no_key + self.num_ttl_extend_failures
                >= state.base.num_writes()
    }

    /// NoKey and TTL extension failures are errors that still count
    /// towards a successful read, so they do not count towards failure.
    fn failed(&self, state: &OnePhaseState) -> bool {
        let s = &state.request.stats;
        let w = state.base.num_writes();
        (s.num_error + s.num_io_and_timeout())
            .saturating_sub(self.num_no_key + self.num_ttl_extend_failures)
            >= w
            || self.num_no_key >= w
    }

    fn error_status(&self, state: &OnePhaseState) -> OpStatus {
        let s = &state.request.stats;
        let max_failures = state.base.max_failures();
        if s.num_io_and_timeout() > max_failures {
            return if s.num_no_stage_errors() > max_failures {
                OpStatus::NoStorageServer
            } else {
                OpStatus::Busy
            };
        }
        let mut status = OpStatus::NoKey;
        for &idx in &state.request.errors {
            status = state.status_of(idx);
            if status == OpStatus::NoKey {
                break;
            }
        }
        status
    }

    fn decide(&mut self, state: &mut OnePhaseState) {
        if self.succeeded(state) {
            self.reply_and_repair(state);
        } else if self.failed(state) {
            let status = self.error_status(state);
            state.base.reply_status(status);
        }
    }

    fn send_repair(&mut self, base: &mut ProcessorBase, winner: &Message, replica: usize) {
        if !self.repair.is_set() {
            self.repair.template = Some(winner.to_request(OpCode::Repair));
        }
        if base.send(&mut self.repair, replica) {
            metrics()
                .repairs_sent
                .with_label_values(&[base.client_request().op_code.name()])
                .inc();
        }
    }

    fn send_mark_delete(&mut self, base: &mut ProcessorBase, winner: &Message, replica: usize) {
        if !self.mark_delete.is_set() {
            if !winner.originator.is_set() {
                debug!(
                    "originator not set in read response, rid={}",
                    base.client_request().request_id
                );
            }
            self.mark_delete.template = Some(winner.to_request(OpCode::MarkDelete));
        }
        if base.send(&mut self.mark_delete, replica) {
            metrics()
                .mark_deletes_sent
                .with_label_values(&[base.client_request().op_code.name()])
                .inc();
        }
    }

    /// Reply from the most recent success, bringing the other replicas in
    /// line with it.
    fn reply_and_repair(&mut self, state: &mut OnePhaseState) {
        if state.base.has_replied() {
            return;
        }
        let Some((winner_idx, winner)) = state
            .request
            .most_recent()
            .and_then(|idx| state.base.response(idx).cloned().map(|m| (idx, m)))
        else {
            error!("read succeeded without a winning response");
            state.base.reply_status(OpStatus::Internal);
            return;
        };
        self.replied_winner = Some(winner_idx);

        let successes: Vec<(usize, Message)> = state
            .request
            .successes
            .iter()
            .filter(|&&idx| idx != winner_idx)
            .filter_map(|&idx| {
                state
                    .base
                    .response(idx)
                    .map(|m| (state.base.replica_of(idx), m.clone()))
            })
            .collect();
        let errors: Vec<(usize, OpStatus)> = state
            .request
            .errors
            .iter()
            .map(|&idx| (state.base.replica_of(idx), state.status_of(idx)))
            .collect();

        if winner.status == OpStatus::KeyMarkedDelete {
            for (replica, resp) in &successes {
                if needs_mark_delete(resp, &winner) {
                    self.send_mark_delete(&mut state.base, &winner, *replica);
                }
            }
            for (replica, status) in &errors {
                if *status != OpStatus::NoKey {
                    self.send_mark_delete(&mut state.base, &winner, *replica);
                }
            }
            state.base.reply_status(OpStatus::NoKey);
        } else {
            debug!(
                "winner v{} ttl={} originator={}",
                winner.version, winner.ttl, winner.originator
            );
            for (replica, resp) in &successes {
                if differs(resp, &winner) {
                    self.send_repair(&mut state.base, &winner, *replica);
                }
            }
            for (replica, _) in &errors {
                self.send_repair(&mut state.base, &winner, *replica);
            }
            state.base.reply_to_client(winner_idx);
        }
    }

    /// A read answered after the client was: repair it if it is stale.
    fn repair_late(&mut self, state: &mut OnePhaseState, idx: usize, winner_idx: usize) {
        let (Some(late), Some(winner)) = (
            state.base.response(idx).cloned(),
            state.base.response(winner_idx).cloned(),
        ) else {
            return;
        };
        let replica = state.base.replica_of(idx);
        let is_value = matches!(late.status, OpStatus::NoError | OpStatus::KeyMarkedDelete);
        if winner.status == OpStatus::KeyMarkedDelete {
            let stale = match late.status {
                OpStatus::NoKey => false,
                _ if is_value => {
                    needs_mark_delete(&late, &winner) && !is_more_recent(&late, &winner)
                }
                _ => true,
            };
            if stale {
                debug!("late read from replica {} is not marked deleted", replica);
                self.send_mark_delete(&mut state.base, &winner, replica);
            }
        } else {
            let stale = !is_value || (differs(&late, &winner) && !is_more_recent(&late, &winner));
            if stale {
                debug!("late read from replica {} is stale", replica);
                self.send_repair(&mut state.base, &winner, replica);
            }
        }
    }

    fn settle_follow_up(&mut self, state: &OnePhaseState, idx: usize, timed_out: bool) {
        let rec = &state.base.records[idx];
        let stats = match rec.op_code {
            OpCode::Repair => &mut self.repair,
            OpCode::MarkDelete => &mut self.mark_delete,
            _ => return,
        };
        if timed_out {
            stats.on_timeout();
        } else if rec.state.is_io_error() {
            stats.on_io_error();
        } else if is_write_success(rec.status) {
            stats.on_success_response();
        } else {
            info!("{} failed on replica {}: {}", rec.op_code, rec.replica_index, rec.status);
            stats.on_error_response();
        }
    }

    fn on_read_failure(&mut self, state: &mut OnePhaseState, idx: usize, timed_out: bool) {
        if state.base.records[idx].op_code != OpCode::Read {
            self.settle_follow_up(state, idx, timed_out);
            return;
        }
        state.on_failure(idx);
        if !state.base.has_replied() {
            self.decide(state);
        }
    }
}

impl OnePhasePolicy for GetPolicy {
    fn accepts(op: OpCode) -> bool {
        matches!(op, OpCode::Get | OpCode::UdfGet)
    }

    fn storage_request(&self, base: &ProcessorBase) -> Message {
        base.ss_request(OpCode::Read, base.client_request().version, false)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn on_response(&mut self, state: &mut OnePhaseState, idx: usize) {
        let rec = &state.base.records[idx];
        if rec.op_code != OpCode::Read {
            self.settle_follow_up(state, idx, false);
            return;
        }
        let status = rec.status;
        if let Some(winner_idx) = self.replied_winner {
            self.repair_late(state, idx, winner_idx);
            return;
        }
        match status {
            OpStatus::NoError | OpStatus::KeyMarkedDelete => {
                state.on_success(idx);
                if self.succeeded(state) {
                    self.reply_and_repair(state);
                }
                return;
            }
            OpStatus::NoKey => {
                state.on_failure(idx);
                self.num_no_key += 1;
            }
            OpStatus::SsReadTtlExtendErr => {
                state.on_failure(idx);
                self.num_ttl_extend_failures += 1;
            }
            OpStatus::BadParam => state.on_failure(idx),
            st => {
                info!("unexpected Read response: {}", st);
                state.on_failure(idx);
            }
        }
        self.decide(state);
    }

    fn on_ss_timeout(&mut self, state: &mut OnePhaseState, idx: usize) {
        self.on_read_failure(state, idx, true);
    }

    fn on_ss_io_error(&mut self, state: &mut OnePhaseState, idx: usize) {
        self.on_read_failure(state, idx, false);
    }

    fn fallback_status(&self, state: &OnePhaseState) -> OpStatus {
        if self.num_ttl_extend_failures > 0 {
            OpStatus::SsReadTtlExtendErr
        } else {
            self.error_status(state)
        }
    }

    fn needs_udf(op: OpCode) -> bool {
        op == OpCode::UdfGet
    }
}
