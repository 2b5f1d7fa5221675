//! Session CmdSN/ExpCmdSN/MaxCmdSN window and out-of-order command buffer.
//!
//! Grounded in the original driver's `iscsi_handle_ooo_cmdsn` /
//! `iscsi_execute_ooo_cmdsns` (`iscsi_target_erl1.c`): commands that
//! arrive with a CmdSN ahead of `exp_cmd_sn` are buffered rather than
//! rejected whenever the session's `ErrorRecoveryLevel > 0`, and drained
//! in CmdSN order as soon as the gap closes.

use std::cmp::Ordering;

/// Windowed (wraparound-safe) comparison of two 32-bit sequence numbers,
/// per RFC 3720 Section 9.2: `a` is considered ahead of `b` when the
/// signed difference is positive.
pub fn sn_compare(a: u32, b: u32) -> Ordering {
    let diff = a.wrapping_sub(b) as i32;
    diff.cmp(&0)
}

/// Outcome of submitting a CmdSN to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSnOutcome {
    /// CmdSN matched `exp_cmd_sn`; the command executes now.
    Execute,
    /// CmdSN is ahead of `exp_cmd_sn`; buffered (ERL>0) or rejected (ERL=0).
    Higher,
    /// CmdSN is ahead of `exp_cmd_sn` but `ErrorRecoveryLevel == 0`, so
    /// the command must be rejected with a protocol error rather than
    /// buffered.
    RejectOutOfOrder,
    /// CmdSN is behind `exp_cmd_sn`; silently dropped, the initiator
    /// already knows this was executed or never mattered.
    Lower,
}

/// One command waiting in the out-of-order buffer, identified by its
/// command sequence number. `T` is whatever handle the caller needs to
/// resume a buffered command (an ITT, a boxed closure, etc).
#[derive(Debug, Clone)]
struct OooEntry<T> {
    cmd_sn: u32,
    item: T,
}

/// Session-wide CmdSN window plus the out-of-order buffer used when
/// `ErrorRecoveryLevel > 0`.
#[derive(Debug, Clone)]
pub struct CmdSnWindow<T> {
    exp_cmd_sn: u32,
    max_cmd_sn: u32,
    command_window: u32,
    error_recovery_level: u8,
    ooo: Vec<OooEntry<T>>,
}

impl<T> CmdSnWindow<T> {
    pub fn new(initial_cmd_sn: u32, command_window: u32, error_recovery_level: u8) -> Self {
        let command_window = command_window.max(1);
        CmdSnWindow {
            exp_cmd_sn: initial_cmd_sn,
            max_cmd_sn: initial_cmd_sn + command_window - 1,
            command_window,
            error_recovery_level,
            ooo: Vec::new(),
        }
    }

    pub fn exp_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn
    }

    pub fn max_cmd_sn(&self) -> u32 {
        self.max_cmd_sn
    }

    fn recompute_max_cmd_sn(&mut self) {
        self.max_cmd_sn = self.exp_cmd_sn + self.command_window - 1;
    }

    /// Submit a non-immediate command's CmdSN. Returns the classification;
    /// the caller is responsible for actually executing `item` when the
    /// outcome is `Execute`, and for draining [`Self::drain_ready`]
    /// afterward to pick up anything the execution unblocked.
    pub fn submit(&mut self, cmd_sn: u32, item: T) -> (CmdSnOutcome, Option<T>) {
        match sn_compare(cmd_sn, self.exp_cmd_sn) {
            Ordering::Equal => {
                self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);
                self.recompute_max_cmd_sn();
                (CmdSnOutcome::Execute, Some(item))
            }
            Ordering::Greater => {
                if self.error_recovery_level == 0 {
                    (CmdSnOutcome::RejectOutOfOrder, Some(item))
                } else {
                    let pos = self
                        .ooo
                        .binary_search_by(|e| sn_compare(e.cmd_sn, cmd_sn))
                        .unwrap_or_else(|p| p);
                    self.ooo.insert(pos, OooEntry { cmd_sn, item });
                    (CmdSnOutcome::Higher, None)
                }
            }
            Ordering::Less => (CmdSnOutcome::Lower, Some(item)),
        }
    }

    /// Drain buffered commands whose CmdSN is now contiguous with
    /// `exp_cmd_sn`, advancing the window as each is taken. Each drained
    /// item must be executed by the caller in the order returned.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(pos) = self
            .ooo
            .iter()
            .position(|e| e.cmd_sn == self.exp_cmd_sn)
        {
            let entry = self.ooo.remove(pos);
            self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);
            ready.push(entry.item);
        }
        if !ready.is_empty() {
            self.recompute_max_cmd_sn();
        }
        ready
    }

    pub fn pending_count(&self) -> usize {
        self.ooo.len()
    }
}
