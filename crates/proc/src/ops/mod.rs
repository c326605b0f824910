//! Operation policies: the per-operation rules plugged into the one-phase
//! and two-phase engines.

pub mod create;
pub mod destroy;
pub mod destroy2;
pub mod get;
pub mod set;
pub mod update;

use crate::onephase::OnePhaseProcessor;
use crate::recency::is_more_recent;
use crate::twophase::{is_write_success, TwoPhaseProcessor, TwoPhaseState};
use kvproxy_common::{unix_now_nanos, unix_now_secs, Message, OpCode, OpStatus};
use kvproxy_metrics::metrics;
use tracing::info;

pub type CreateProcessor = TwoPhaseProcessor<create::CreatePolicy>;
pub type GetProcessor = OnePhaseProcessor<get::GetPolicy>;
pub type UpdateProcessor = TwoPhaseProcessor<update::UpdatePolicy>;
pub type SetProcessor = TwoPhaseProcessor<set::SetPolicy>;
pub type DestroyProcessor = OnePhaseProcessor<destroy::DestroyPolicy>;
pub type TwoPhaseDestroyProcessor = TwoPhaseProcessor<destroy2::TwoPhaseDestroyPolicy>;

/// Record metadata agreed for a commit. Zero fields keep the value copied
/// from the client request.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CommitFields {
    /// Wide enough to hold `u32::MAX + 1`.
    pub version: u64,
    pub creation_time: u32,
    pub ttl: u32,
}

/// Write `fields` into `commit`, stamp the last modification time, and
/// handle version overflow.
///
/// A replicated write past `max_version` commits version 0. A local one
/// restarts the record at version 1 under a new originator and creation
/// time.
pub(crate) fn finish_commit(
    commit: &mut Message,
    client: &Message,
    fields: CommitFields,
    max_version: u32,
) {
    if fields.creation_time != 0 {
        commit.creation_time = fields.creation_time;
    }
    if fields.version != 0 {
        commit.version = fields.version.min(u32::MAX as u64) as u32;
    }
    if fields.ttl != 0 {
        commit.ttl = fields.ttl;
    }

    let overflowed = fields.version > max_version as u64;
    if client.for_replication {
        commit.last_modification_time = if client.last_modification_time != 0 {
            client.last_modification_time
        } else {
            unix_now_nanos()
        };
        if overflowed {
            info!(
                "version overflow on replicated {}: v{} > {}, rid={}",
                client.op_code, fields.version, max_version, client.request_id
            );
            commit.version = 0;
            metrics().version_overflows.inc();
        }
    } else {
        commit.last_modification_time = unix_now_nanos();
        if overflowed {
            info!(
                "version overflow on {}: v{} > {}, rid={}",
                client.op_code, fields.version, max_version, client.request_id
            );
            commit.version = 1;
            commit.creation_time = unix_now_secs();
            commit.originator = client.request_id;
            metrics().version_overflows.inc();
        }
    }
}

/// Remember the most recent VersionConflict prepare response.
pub(crate) fn track_conflict(conflict: &mut Option<usize>, state: &TwoPhaseState, idx: usize) {
    let Some(resp) = state.base.response(idx) else {
        return;
    };
    let newer = match *conflict {
        None => true,
        Some(cur) => state
            .base
            .response(cur)
            .map_or(true, |cur_resp| is_more_recent(resp, cur_resp)),
    };
    if newer {
        *conflict = Some(idx);
    }
}

/// Reply to a failed prepare round. A version conflict is answered with
/// the conflicting record so the client sees the current version.
pub(crate) fn reply_prepare_failure(
    state: &mut TwoPhaseState,
    conflict: Option<usize>,
    status: OpStatus,
) {
    match conflict {
        Some(idx) if status == OpStatus::VersionConflict => state.base.reply_to_client(idx),
        _ => state.reply_status(status),
    }
}

/// Commit and repair responses for Update and Set.
pub(crate) fn on_write_follow_up(state: &mut TwoPhaseState, idx: usize) {
    let rec = &state.base.records[idx];
    let (op, ok) = (rec.op_code, is_write_success(rec.status));
    match (op, ok) {
        (OpCode::Commit, true) => {
            state.on_commit_success(idx);
            if state.commit_succeeded() {
                state.reply_clean_commit();
            }
            state.send_repairs();
        }
        (OpCode::Commit, false) => on_write_commit_failure(state, idx),
        (OpCode::Repair, true) => state.on_repair_success(),
        (OpCode::Repair, false) => state.on_repair_failure(),
        _ => {}
    }
}

/// Commit and repair timeouts and transport failures for Update and Set.
pub(crate) fn on_write_follow_up_failure(state: &mut TwoPhaseState, idx: usize) {
    match state.base.records[idx].op_code {
        OpCode::Commit => on_write_commit_failure(state, idx),
        OpCode::Repair => state.on_repair_failure(),
        _ => {}
    }
}

fn on_write_commit_failure(state: &mut TwoPhaseState, idx: usize) {
    state.on_commit_failure(idx);
    if state.commit.stats.num_success != 0 {
        state.send_repairs();
    } else if state.commit_failed() {
        state.reply_status(OpStatus::CommitFailure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvproxy_common::{OpCode, RequestId};

    #[test]
    fn test_local_overflow_restarts_record() {
        let client = Message::request(OpCode::Update, b"ns", b"k");
        let mut commit = client.to_request(OpCode::Commit);
        commit.originator = RequestId::new();
        let fields = CommitFields {
            version: u32::MAX as u64 + 1,
            creation_time: 100,
            ttl: 60,
        };
        finish_commit(&mut commit, &client, fields, u32::MAX);
        assert_eq!(commit.version, 1);
        assert_eq!(commit.originator, client.request_id);
        assert!(commit.creation_time > 100);
        assert_eq!(commit.ttl, 60);
        assert!(commit.last_modification_time > 0);
    }

    #[test]
    fn test_replicated_overflow_wraps_to_zero() {
        let mut client = Message::request(OpCode::Set, b"ns", b"k");
        client.for_replication = true;
        client.last_modification_time = 42;
        let mut commit = client.to_request(OpCode::Commit);
        let fields = CommitFields {
            version: 11,
            creation_time: 100,
            ttl: 60,
        };
        finish_commit(&mut commit, &client, fields, 10);
        assert_eq!(commit.version, 0);
        assert_eq!(commit.creation_time, 100);
        assert_eq!(commit.last_modification_time, 42);
    }

    #[test]
    fn test_zero_fields_keep_client_values() {
        let mut client = Message::request(OpCode::Set, b"ns", b"k");
        client.ttl = 30;
        client.creation_time = 7;
        let mut commit = client.to_request(OpCode::Commit);
        finish_commit(&mut commit, &client, CommitFields::default(), u32::MAX);
        assert_eq!(commit.ttl, 30);
        assert_eq!(commit.creation_time, 7);
        assert_eq!(commit.version, 0);
    }
}
