//! Phase outcome aggregation: what happened to the sub-requests sent in one
//! protocol phase, and the quorum arithmetic built on it.

use crate::recency::is_more_recent;
use crate::record::{RecordState, ReplicaRequestRecord};
use crate::replica::SendError;
use kvproxy_common::Message;

/// Counters for one phase, plus the message template sent in it.
///
/// Every sent sub-request is pending until exactly one of the
/// `on_*_response`, `on_io_error` or `on_timeout` callbacks settles it.
#[derive(Debug, Clone, Default)]
pub struct RequestStats {
    /// Request sent to every replica in this phase. `None` until the phase
    /// is first used.
    pub template: Option<Message>,
    pub num_sent: usize,
    pub num_pending: usize,
    pub num_fail_to_send: usize,
    pub num_fail_to_send_busy: usize,
    pub num_fail_to_send_no_conn: usize,
    pub num_io_error: usize,
    pub num_timeout: usize,
    pub num_success: usize,
    pub num_error: usize,
}

impl RequestStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_set(&self) -> bool {
        self.template.is_some()
    }

    pub fn on_sent(&mut self) {
        self.num_sent += 1;
        self.num_pending += 1;
    }

    pub fn on_fail_to_send(&mut self, err: SendError) {
        self.num_fail_to_send += 1;
        match err {
            SendError::Busy => self.num_fail_to_send_busy += 1,
            SendError::NoConnection => self.num_fail_to_send_no_conn += 1,
            SendError::AlreadyPending => {}
        }
    }

    pub fn on_io_error(&mut self) {
        self.num_io_error += 1;
        self.settle();
    }

    pub fn on_timeout(&mut self) {
        self.num_timeout += 1;
        self.settle();
    }

    pub fn on_success_response(&mut self) {
        self.num_success += 1;
        self.settle();
    }

    pub fn on_error_response(&mut self) {
        self.num_error += 1;
        self.settle();
    }

    fn settle(&mut self) {
        self.num_pending = self.num_pending.saturating_sub(1);
    }

    pub fn has_no_pending(&self) -> bool {
        self.num_pending == 0
    }

    /// Transport-level failures: IO errors, timeouts, and refused sends.
    pub fn num_io_and_timeout(&self) -> usize {
        self.num_io_error + self.num_timeout + self.num_fail_to_send
    }

    /// Failures that suggest the storage server is unreachable rather than
    /// slow.
    pub fn num_no_stage_errors(&self) -> usize {
        self.num_io_error + self.num_fail_to_send_no_conn
    }

    /// Every outcome other than success.
    pub fn num_errors(&self) -> usize {
        self.num_error + self.num_io_error + self.num_timeout + self.num_fail_to_send
    }

    /// Every attempted sub-request of the phase succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.num_sent + self.num_fail_to_send == self.num_success
    }

    /// At least one send was refused and every refusal was for lack of a
    /// connection.
    pub fn all_refusals_no_conn(&self) -> bool {
        self.num_fail_to_send > 0 && self.num_fail_to_send == self.num_fail_to_send_no_conn
    }
}

/// Stats for a phase whose responses are compared with each other: keeps
/// the records of success and error responses and the most recent success.
#[derive(Debug, Clone, Default)]
pub struct OnePhaseStats {
    pub stats: RequestStats,
    /// Record indices of success responses, in arrival order.
    pub successes: Vec<usize>,
    /// Record indices of error responses, in arrival order.
    pub errors: Vec<usize>,
    most_recent: Option<usize>,
}

impl OnePhaseStats {
    pub fn reset(&mut self) {
        self.stats.reset();
        self.successes.clear();
        self.errors.clear();
        self.most_recent = None;
    }

    /// Record index of the most recent success response.
    pub fn most_recent(&self) -> Option<usize> {
        self.most_recent
    }

    /// Count the record as a success. Records that ended in an IO error or
    /// a timeout are counted as such instead.
    pub fn on_success(&mut self, records: &[ReplicaRequestRecord], idx: usize) {
        let rec = &records[idx];
        match rec.state {
            RecordState::ResponseReceived => {
                self.stats.on_success_response();
                self.successes.push(idx);
                let newer = match (self.most_recent, rec.response()) {
                    (None, _) => true,
                    (Some(cur), Some(resp)) => records[cur]
                        .response()
                        .map_or(true, |cur_resp| is_more_recent(resp, cur_resp)),
                    (Some(_), None) => false,
                };
                if newer {
                    self.most_recent = Some(idx);
                }
            }
            RecordState::RequestIoError | RecordState::ResponseIoError => {
                self.stats.on_io_error()
            }
            RecordState::RequestTimeout => self.stats.on_timeout(),
            _ => {}
        }
    }

    /// Count the record as a failure, by the same rules as [`on_success`].
    ///
    /// [`on_success`]: OnePhaseStats::on_success
    pub fn on_failure(&mut self, records: &[ReplicaRequestRecord], idx: usize) {
        match records[idx].state {
            RecordState::ResponseReceived => {
                self.stats.on_error_response();
                self.errors.push(idx);
            }
            RecordState::RequestIoError | RecordState::ResponseIoError => {
                self.stats.on_io_error()
            }
            RecordState::RequestTimeout => self.stats.on_timeout(),
            _ => {}
        }
    }
}

/// Stats for the commit phase.
#[derive(Debug, Clone, Default)]
pub struct CommitStats {
    pub stats: RequestStats,
    /// First successful commit response, replied to the client.
    pub clean_response: Option<usize>,
    /// Replicas whose commit failed and still need a repair.
    pub failed_replicas: Vec<usize>,
}

impl CommitStats {
    pub fn reset(&mut self) {
        self.stats.reset();
        self.clean_response = None;
        self.failed_replicas.clear();
    }

    pub fn on_success(&mut self, idx: usize) {
        self.stats.on_success_response();
        if self.clean_response.is_none() {
            self.clean_response = Some(idx);
        }
    }

    /// A failed commit counts as an error whatever the cause, since the
    /// replica now needs a repair either way.
    pub fn on_failure(&mut self, replica: usize) {
        self.stats.on_error_response();
        self.failed_replicas.push(replica);
    }
}
