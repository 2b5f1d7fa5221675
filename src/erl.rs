//! Error Recovery Level policy: SNACK dispatch, the Status SNACK replay
//! buffer, and TASK_REASSIGN cursor reseeding.
//!
//! Grounded in the original driver's `iscsi_target_erl1.c`. ERL selects
//! how aggressively a connection failure is treated: ERL=0 fails the
//! session outright, ERL=1 allows SNACK-driven retransmission within a
//! surviving connection, ERL=2 additionally allows `TASK_REASSIGN` to
//! move an in-flight command to a different connection.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::snack_type;

/// What a connection should do when it hits a transport-level fault,
/// decided purely from the negotiated ERL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPolicy {
    /// ERL=0: any digest failure or sequencing gap fails the session.
    FailSession,
    /// ERL>=1: drop the offending PDU and let SNACK recovery request it.
    DropAndAwaitSnack,
}

pub fn fault_policy(error_recovery_level: u8) -> FaultPolicy {
    if error_recovery_level == 0 {
        FaultPolicy::FailSession
    } else {
        FaultPolicy::DropAndAwaitSnack
    }
}

/// A stored R2T, kept so an R2T SNACK can replay it verbatim rather than
/// regenerating potentially different offsets.
#[derive(Debug, Clone, Copy)]
pub struct StoredR2t {
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_length: u32,
}

/// Per-command recovery bookkeeping an ERL>=1 session keeps alongside
/// the live [`crate::seqbook::SeqBook`]/[`crate::seqbook::R2tGenerator`].
#[derive(Debug, Clone, Default)]
pub struct RecoveryLedger {
    r2ts: Vec<StoredR2t>,
    acked_data_sn: Option<u32>,
    last_data_sn_sent: Option<u32>,
}

impl RecoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_r2t(&mut self, r2t: StoredR2t) {
        self.r2ts.push(r2t);
    }

    pub fn record_data_in_sent(&mut self, data_sn: u32) {
        self.last_data_sn_sent = Some(data_sn);
    }

    pub fn record_data_ack(&mut self, acked_through: u32) {
        self.acked_data_sn = Some(acked_through);
    }

    /// `iscsi_handle_r2t_snack`: replay stored R2Ts whose `r2t_sn` falls in
    /// `[beg_run, beg_run + run_length)`. `run_length == 0` means "through
    /// the last R2T issued".
    pub fn r2t_snack(&self, beg_run: u32, run_length: u32, itt: u32) -> ScsiResult<Vec<StoredR2t>> {
        if let Some(acked) = self.acked_data_sn {
            if beg_run <= acked {
                return Err(IscsiError::ProtocolError {
                    itt,
                    detail: format!("R2T SNACK BegRun {beg_run} already Data-ACK'd through {acked}"),
                });
            }
        }
        let end = if run_length == 0 {
            self.r2ts.last().map(|r| r.r2t_sn + 1).unwrap_or(beg_run)
        } else {
            beg_run + run_length
        };
        let matched: Vec<StoredR2t> = self
            .r2ts
            .iter()
            .copied()
            .filter(|r| r.r2t_sn >= beg_run && r.r2t_sn < end)
            .collect();
        if matched.is_empty() {
            return Err(IscsiError::ProtocolError {
                itt,
                detail: format!("R2T SNACK requests unknown range [{beg_run}, {end})"),
            });
        }
        Ok(matched)
    }

    /// `iscsi_handle_data_ack`: record the BegRun as acknowledged. Never
    /// triggers retransmission on its own.
    pub fn data_ack(&mut self, beg_run: u32) {
        self.record_data_ack(beg_run);
    }

    pub fn last_data_sn_sent(&self) -> Option<u32> {
        self.last_data_sn_sent
    }
}

/// Recovery cursor used to replay a span of DataIN PDUs without
/// disturbing the live, forward-progress [`crate::seqbook::SeqBook`]
/// cursor. Grounded in
/// `create_recovery_datain_values_datasequenceinorder_{yes,no}`.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryCursor {
    pub beg_data_sn: u32,
    pub end_data_sn: u32,
}

impl RecoveryCursor {
    /// `RunLength == 0` means "replay through the last DataSN sent".
    pub fn from_snack(beg_run: u32, run_length: u32, last_data_sn_sent: Option<u32>) -> ScsiResult<Self> {
        let end = if run_length == 0 {
            last_data_sn_sent
                .map(|sn| sn + 1)
                .ok_or_else(|| IscsiError::ProtocolError {
                    itt: 0,
                    detail: "DataIN SNACK with RunLength=0 but nothing sent yet".into(),
                })?
        } else {
            beg_run + run_length
        };
        if end <= beg_run {
            return Err(IscsiError::ProtocolError {
                itt: 0,
                detail: format!("DataIN SNACK empty range [{beg_run}, {end})"),
            });
        }
        Ok(RecoveryCursor {
            beg_data_sn: beg_run,
            end_data_sn: end,
        })
    }

    pub fn contains(&self, data_sn: u32) -> bool {
        data_sn >= self.beg_data_sn && data_sn < self.end_data_sn
    }
}

/// One Response-class PDU kept for Status SNACK replay.
#[derive(Debug, Clone)]
pub struct ReplayedStatus {
    pub stat_sn: u32,
    pub bytes: Vec<u8>,
}

/// Bounded ring of recently-sent Response-class PDUs, so a Status SNACK
/// can be satisfied without re-deriving responses from command state.
#[derive(Debug, Clone)]
pub struct StatusReplayBuffer {
    capacity: usize,
    entries: std::collections::VecDeque<ReplayedStatus>,
}

impl StatusReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        StatusReplayBuffer {
            capacity: capacity.max(1),
            entries: std::collections::VecDeque::new(),
        }
    }

    pub fn push(&mut self, stat_sn: u32, bytes: Vec<u8>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ReplayedStatus { stat_sn, bytes });
    }

    /// `iscsi_handle_status_snack`: re-drain everything from `exp_stat_sn`
    /// onward (or `[beg_run, beg_run+run_length)` when a nonzero range is
    /// given). Returns references in StatSN order.
    pub fn status_snack(&self, beg_run: u32, run_length: u32) -> ScsiResult<Vec<&ReplayedStatus>> {
        let end = if run_length == 0 { None } else { Some(beg_run + run_length) };
        let matched: Vec<&ReplayedStatus> = self
            .entries
            .iter()
            .filter(|e| e.stat_sn >= beg_run && end.map(|e2| e.stat_sn < e2).unwrap_or(true))
            .collect();
        if matched.is_empty() {
            return Err(IscsiError::ProtocolError {
                itt: 0,
                detail: format!("Status SNACK requests StatSN {beg_run} no longer in the replay buffer"),
            });
        }
        Ok(matched)
    }
}

/// Where a `TASK_REASSIGN` (ERL=2) resumes a moved command's cursor, per
/// whether it is a read or a write.
#[derive(Debug, Clone, Copy)]
pub enum ReassignResumePoint {
    /// Read: resume DataIN generation at this ExpDataSN.
    Read { exp_data_sn: u32 },
    /// Write: resume R2T generation at this many bytes already written.
    Write { write_data_done: u32 },
}

/// Classify an incoming SNACK request's type field, rejecting the
/// declared-unsupported R-Data SNACK outright.
pub fn classify_snack(snack_type_field: u8, itt: u32) -> ScsiResult<u8> {
    match snack_type_field {
        snack_type::DATA_OR_R2T | snack_type::STATUS | snack_type::DATA_ACK => {
            Ok(snack_type_field)
        }
        snack_type::RDATA_SNACK => Err(IscsiError::ProtocolError {
            itt,
            detail: "R-Data SNACK is not supported".into(),
        }),
        other => Err(IscsiError::InvalidPduField {
            itt,
            field: "snack_type",
            detail: format!("unknown SNACK type {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erl0_fails_session_erl1_drops_and_awaits_snack() {
        assert_eq!(fault_policy(0), FaultPolicy::FailSession);
        assert_eq!(fault_policy(1), FaultPolicy::DropAndAwaitSnack);
        assert_eq!(fault_policy(2), FaultPolicy::DropAndAwaitSnack);
    }

    #[test]
    fn r2t_snack_replays_requested_range() {
        let mut ledger = RecoveryLedger::new();
        ledger.record_r2t(StoredR2t { r2t_sn: 0, buffer_offset: 0, desired_length: 4096 });
        ledger.record_r2t(StoredR2t { r2t_sn: 1, buffer_offset: 4096, desired_length: 4096 });

        let replayed = ledger.r2t_snack(1, 1, 1).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].r2t_sn, 1);
    }

    #[test]
    fn r2t_snack_zero_run_length_replays_through_last() {
        let mut ledger = RecoveryLedger::new();
        ledger.record_r2t(StoredR2t { r2t_sn: 0, buffer_offset: 0, desired_length: 4096 });
        ledger.record_r2t(StoredR2t { r2t_sn: 1, buffer_offset: 4096, desired_length: 4096 });

        let replayed = ledger.r2t_snack(0, 0, 1).unwrap();
        assert_eq!(replayed.len(), 2);
    }

    #[test]
    fn r2t_snack_rejects_already_acked_span() {
        let mut ledger = RecoveryLedger::new();
        ledger.record_r2t(StoredR2t { r2t_sn: 0, buffer_offset: 0, desired_length: 4096 });
        ledger.data_ack(0);
        assert!(ledger.r2t_snack(0, 1, 1).is_err());
    }

    #[test]
    fn recovery_cursor_from_snack_with_explicit_range() {
        let cursor = RecoveryCursor::from_snack(2, 3, None).unwrap();
        assert!(cursor.contains(2));
        assert!(cursor.contains(4));
        assert!(!cursor.contains(5));
    }

    #[test]
    fn recovery_cursor_zero_run_length_replays_through_last_sent() {
        let cursor = RecoveryCursor::from_snack(2, 0, Some(5)).unwrap();
        assert_eq!(cursor.beg_data_sn, 2);
        assert_eq!(cursor.end_data_sn, 6);
    }

    #[test]
    fn status_replay_buffer_drains_from_exp_stat_sn() {
        let mut buf = StatusReplayBuffer::new(4);
        for sn in 10..14 {
            buf.push(sn, vec![sn as u8]);
        }
        let replayed = buf.status_snack(11, 0).unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].stat_sn, 11);
    }

    #[test]
    fn status_replay_buffer_evicts_oldest_beyond_capacity() {
        let mut buf = StatusReplayBuffer::new(2);
        buf.push(1, vec![1]);
        buf.push(2, vec![2]);
        buf.push(3, vec![3]);
        assert!(buf.status_snack(1, 1).is_err());
        assert!(buf.status_snack(2, 0).is_ok());
    }

    #[test]
    fn rdata_snack_is_rejected_as_unsupported() {
        assert!(classify_snack(snack_type::RDATA_SNACK, 1).is_err());
        assert!(classify_snack(snack_type::STATUS, 1).is_ok());
    }

    #[test]
    fn scenario_s6_task_reassign_resume_points() {
        let read = ReassignResumePoint::Read { exp_data_sn: 4 };
        let write = ReassignResumePoint::Write { write_data_done: 524288 };
        match read {
            ReassignResumePoint::Read { exp_data_sn } => assert_eq!(exp_data_sn, 4),
            _ => panic!("wrong variant"),
        }
        match write {
            ReassignResumePoint::Write { write_data_done } => assert_eq!(write_data_done, 524288),
            _ => panic!("wrong variant"),
        }
    }
}
