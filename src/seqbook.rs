//! Per-command PDU/sequence ledger: DataIN generation, R2T generation,
//! and the cursor state SNACK retransmit looks up.
//!
//! This is a direct port of the four `iscsi_set_datain_values_*`
//! functions in the original driver's `iscsi_target_datain_values.c`,
//! selected by `(DataSequenceInOrder, DataPDUInOrder)` exactly as
//! `iscsi_get_datain_values` does. "InOrder" commands use a single
//! cursor; "OutOfOrder" commands hold an explicit array of `Sequence`
//! (and, when PDUs may also reorder, a flat `PduSlot[]`) so that a
//! SNACK can re-derive cursor state for an arbitrary span without
//! perturbing the live, forward-progress cursor.

use crate::error::{IscsiError, ScsiResult};

/// Parameters a SeqBook needs from the negotiated session/connection
/// options. Cheap to copy; sampled once per command.
#[derive(Debug, Clone, Copy)]
pub struct SeqBookParams {
    pub max_recv_data_segment_length: u32,
    pub max_burst_length: u32,
    pub error_recovery_level: u8,
    pub data_sequence_in_order: bool,
    pub data_pdu_in_order: bool,
}

/// Bit flags carried on a generated DataIN step, matching the wire F/A/S
/// bits (RFC 3720 Section 10.7.1).
pub mod datain_flags {
    pub const F_BIT: u8 = 0x80;
    pub const A_BIT: u8 = 0x40;
    pub const S_BIT: u8 = 0x01;
}

/// One DataIN PDU's worth of generated values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataInStep {
    pub offset: u32,
    pub length: u32,
    pub data_sn: u32,
    pub flags: u8,
}

impl DataInStep {
    pub fn is_final(&self) -> bool {
        self.flags & datain_flags::F_BIT != 0
    }
    pub fn is_status(&self) -> bool {
        self.flags & datain_flags::S_BIT != 0
    }
}

/// A burst-sized span of the read, used when `DataSequenceInOrder=No`.
#[derive(Debug, Clone)]
struct Sequence {
    offset: u32,
    xfer_len: u32,
    next_burst_len: u32,
    pdu_count: u32,
    pdu_send_order: u32,
    first_data_sn: Option<u32>,
    last_data_sn: Option<u32>,
    sent: bool,
}

/// A single PDU-sized span within a sequence, used when
/// `DataPDUInOrder=No`.
#[derive(Debug, Clone, Copy)]
struct PduSlot {
    seq_index: usize,
    offset: u32,
    length: u32,
}

/// Per-command DataIN/R2T ledger.
#[derive(Debug, Clone)]
pub struct SeqBook {
    data_length: u32,
    read_data_done: u32,
    next_burst_len: u32,
    data_sn: u32,
    seq_send_order: u32,
    pdu_send_order: u32,
    sequences: Vec<Sequence>,
    pdus: Vec<PduSlot>,
    /// DataSN already acknowledged via a Data ACK SNACK; retransmit
    /// requests at or below this are rejected as redundant.
    acked_data_sn: Option<u32>,
}

impl SeqBook {
    /// Build a ledger for a read command of `data_length` bytes. Sequence
    /// and PDU spans are pre-split at command-start time so that
    /// out-of-order emission (when negotiated) has something to index.
    pub fn new(data_length: u32, params: &SeqBookParams) -> Self {
        let mut sequences = Vec::new();
        let mut pdus = Vec::new();

        if !params.data_sequence_in_order {
            let mut offset = 0u32;
            while offset < data_length {
                let xfer_len = (data_length - offset).min(params.max_burst_length);
                let seq_index = sequences.len();
                let pdu_count = xfer_len.div_ceil(params.max_recv_data_segment_length.max(1));

                if !params.data_pdu_in_order {
                    let mut pdu_offset = offset;
                    let seq_end = offset + xfer_len;
                    while pdu_offset < seq_end {
                        let len = (seq_end - pdu_offset).min(params.max_recv_data_segment_length);
                        pdus.push(PduSlot {
                            seq_index,
                            offset: pdu_offset,
                            length: len,
                        });
                        pdu_offset += len;
                    }
                }

                sequences.push(Sequence {
                    offset,
                    xfer_len,
                    next_burst_len: 0,
                    pdu_count,
                    pdu_send_order: 0,
                    first_data_sn: None,
                    last_data_sn: None,
                    sent: false,
                });
                offset += xfer_len;
            }
        } else if !params.data_pdu_in_order {
            // DataSequenceInOrder=Yes, DataPDUInOrder=No: one implicit
            // sequence spanning the whole command, PDUs pre-split.
            let mut pdu_offset = 0u32;
            while pdu_offset < data_length {
                let len = (data_length - pdu_offset).min(params.max_recv_data_segment_length);
                pdus.push(PduSlot {
                    seq_index: 0,
                    offset: pdu_offset,
                    length: len,
                });
                pdu_offset += len;
            }
        }

        SeqBook {
            data_length,
            read_data_done: 0,
            next_burst_len: 0,
            data_sn: 0,
            seq_send_order: 0,
            pdu_send_order: 0,
            sequences,
            pdus,
            acked_data_sn: None,
        }
    }

    pub fn read_data_done(&self) -> u32 {
        self.read_data_done
    }

    pub fn is_complete(&self) -> bool {
        self.read_data_done >= self.data_length
    }

    /// Generate the next DataIN step, dispatching on the command's
    /// negotiated `(DataSequenceInOrder, DataPDUInOrder)` pair exactly as
    /// `iscsi_get_datain_values` does.
    pub fn next_data_in(&mut self, itt: u32, params: &SeqBookParams) -> ScsiResult<DataInStep> {
        if self.read_data_done >= self.data_length {
            return Err(IscsiError::CannotRecover(format!(
                "ITT 0x{itt:08x}: read_data_left is zero"
            )));
        }

        match (params.data_sequence_in_order, params.data_pdu_in_order) {
            (true, true) => self.step_yes_and_yes(params),
            (false, true) => self.step_no_and_yes(params),
            (true, false) => self.step_yes_and_no(params),
            (false, false) => self.step_no_and_no(params),
        }
    }

    fn step_yes_and_yes(&mut self, params: &SeqBookParams) -> ScsiResult<DataInStep> {
        let read_data_left = self.data_length - self.read_data_done;
        let length;
        let mut flags_byte = 0u8;

        if read_data_left <= params.max_recv_data_segment_length
            && read_data_left <= params.max_burst_length - self.next_burst_len
        {
            length = read_data_left;
            flags_byte |= datain_flags::F_BIT | datain_flags::S_BIT;
            if params.error_recovery_level > 0 {
                flags_byte |= datain_flags::A_BIT;
            }
        } else if self.next_burst_len + params.max_recv_data_segment_length < params.max_burst_length
        {
            length = params.max_recv_data_segment_length;
            self.next_burst_len += length;
        } else {
            length = params.max_burst_length - self.next_burst_len;
            self.next_burst_len = 0;
            flags_byte |= datain_flags::F_BIT;
            if params.error_recovery_level > 0 {
                flags_byte |= datain_flags::A_BIT;
            }
        }

        let data_sn = self.data_sn;
        self.data_sn += 1;
        let offset = self.read_data_done;
        self.read_data_done += length;

        Ok(DataInStep {
            offset,
            length,
            data_sn,
            flags: flags_byte,
        })
    }

    fn step_no_and_yes(&mut self, params: &SeqBookParams) -> ScsiResult<DataInStep> {
        let seq_index = self.seq_send_order as usize;
        if seq_index >= self.sequences.len() {
            return Err(IscsiError::CannotRecover("no sequence holder".into()));
        }

        if self.sequences[seq_index].next_burst_len == 0 {
            self.sequences[seq_index].first_data_sn = Some(self.data_sn);
        }
        self.sequences[seq_index].sent = true;

        let seq = &self.sequences[seq_index];
        let offset = seq.offset + seq.next_burst_len;
        let mut flags_byte = 0u8;
        let length;

        if offset + params.max_recv_data_segment_length >= seq.offset + seq.xfer_len {
            length = (seq.offset + seq.xfer_len) - offset;
            flags_byte |= datain_flags::F_BIT;
            if params.error_recovery_level > 0 {
                flags_byte |= datain_flags::A_BIT;
            }
            self.sequences[seq_index].next_burst_len = 0;
            self.seq_send_order += 1;
        } else if seq.next_burst_len + params.max_recv_data_segment_length < params.max_burst_length
        {
            length = params.max_recv_data_segment_length;
            self.sequences[seq_index].next_burst_len += length;
        } else {
            length = params.max_burst_length - seq.next_burst_len;
            flags_byte |= datain_flags::F_BIT;
            if params.error_recovery_level > 0 {
                flags_byte |= datain_flags::A_BIT;
            }
            self.sequences[seq_index].next_burst_len = 0;
            self.seq_send_order += 1;
        }

        if self.read_data_done + length == self.data_length {
            flags_byte |= datain_flags::S_BIT;
        }

        let data_sn = self.data_sn;
        self.data_sn += 1;
        self.read_data_done += length;
        if flags_byte & datain_flags::F_BIT != 0 {
            self.sequences[seq_index].last_data_sn = Some(data_sn);
        }

        Ok(DataInStep {
            offset,
            length,
            data_sn,
            flags: flags_byte,
        })
    }

    fn step_yes_and_no(&mut self, params: &SeqBookParams) -> ScsiResult<DataInStep> {
        let idx = self.pdu_send_order as usize;
        if idx >= self.pdus.len() {
            return Err(IscsiError::CannotRecover("no pdu holder".into()));
        }
        let pdu = self.pdus[idx];
        self.pdu_send_order += 1;

        let mut flags_byte = 0u8;
        if self.read_data_done + pdu.length == self.data_length {
            flags_byte |= datain_flags::F_BIT | datain_flags::S_BIT;
            if params.error_recovery_level > 0 {
                flags_byte |= datain_flags::A_BIT;
            }
            self.next_burst_len = 0;
        } else if self.next_burst_len + params.max_recv_data_segment_length < params.max_burst_length
        {
            self.next_burst_len += pdu.length;
        } else {
            flags_byte |= datain_flags::F_BIT;
            if params.error_recovery_level > 0 {
                flags_byte |= datain_flags::A_BIT;
            }
            self.next_burst_len = 0;
        }

        let data_sn = self.data_sn;
        self.data_sn += 1;
        self.read_data_done += pdu.length;

        Ok(DataInStep {
            offset: pdu.offset,
            length: pdu.length,
            data_sn,
            flags: flags_byte,
        })
    }

    fn step_no_and_no(&mut self, params: &SeqBookParams) -> ScsiResult<DataInStep> {
        let seq_index = self.seq_send_order as usize;
        if seq_index >= self.sequences.len() {
            return Err(IscsiError::CannotRecover("no sequence holder".into()));
        }
        if self.sequences[seq_index].next_burst_len == 0 {
            self.sequences[seq_index].first_data_sn = Some(self.data_sn);
        }
        self.sequences[seq_index].sent = true;

        let pdu_idx = self
            .pdus
            .iter()
            .position(|p| {
                p.seq_index == seq_index
                    && p.offset == self.sequences[seq_index].offset + self.sequences[seq_index].next_burst_len
            })
            .ok_or_else(|| IscsiError::CannotRecover("no pdu holder for sequence".into()))?;
        let pdu = self.pdus[pdu_idx];

        let mut flags_byte = 0u8;
        {
            let seq = &mut self.sequences[seq_index];
            seq.pdu_send_order += 1;
            if seq.pdu_send_order == seq.pdu_count {
                flags_byte |= datain_flags::F_BIT;
                if params.error_recovery_level > 0 {
                    flags_byte |= datain_flags::A_BIT;
                }
                seq.next_burst_len = 0;
                self.seq_send_order += 1;
            } else {
                seq.next_burst_len += pdu.length;
            }
        }

        if self.read_data_done + pdu.length == self.data_length {
            flags_byte |= datain_flags::S_BIT;
        }

        let data_sn = self.data_sn;
        self.data_sn += 1;
        self.read_data_done += pdu.length;
        if flags_byte & datain_flags::F_BIT != 0 {
            self.sequences[seq_index].last_data_sn = Some(data_sn);
        }

        Ok(DataInStep {
            offset: pdu.offset,
            length: pdu.length,
            data_sn,
            flags: flags_byte,
        })
    }

    /// Record a Data ACK SNACK's BegRun: everything below it is considered
    /// acknowledged and must not be retransmitted again.
    pub fn record_data_ack(&mut self, acked_through: u32) {
        self.acked_data_sn = Some(acked_through);
    }

    /// Whether a DataIN SNACK asking for `data_sn` is redundant because a
    /// Data ACK SNACK already covered it.
    pub fn already_acked(&self, data_sn: u32) -> bool {
        matches!(self.acked_data_sn, Some(acked) if crate::cmdsn::sn_compare(data_sn, acked) != std::cmp::Ordering::Greater)
    }
}

/// R2T generation: bursts of at most `MaxBurstLength`, honoring
/// `FirstBurstLength`/`ImmediateData`/`InitialR2T` for the first
/// unsolicited span, and `MaxOutstandingR2T` in flight at once.
#[derive(Debug, Clone)]
pub struct R2tGenerator {
    data_length: u32,
    next_offset: u32,
    next_r2t_sn: u32,
    outstanding: u32,
}

impl R2tGenerator {
    pub fn new(data_length: u32, unsolicited_bytes: u32) -> Self {
        R2tGenerator {
            data_length,
            next_offset: unsolicited_bytes,
            next_r2t_sn: 0,
            outstanding: 0,
        }
    }

    pub fn next_offset(&self) -> u32 {
        self.next_offset
    }

    /// Produce the next R2T's `(r2t_sn, offset, xfer_len)` if the
    /// outstanding-R2T budget and remaining data allow it.
    pub fn next_r2t(&mut self, max_burst_length: u32, max_outstanding_r2t: u32) -> Option<(u32, u32, u32)> {
        if self.next_offset >= self.data_length || self.outstanding >= max_outstanding_r2t {
            return None;
        }
        let xfer_len = (self.data_length - self.next_offset).min(max_burst_length);
        let offset = self.next_offset;
        let r2t_sn = self.next_r2t_sn;

        self.next_offset += xfer_len;
        self.next_r2t_sn += 1;
        self.outstanding += 1;

        Some((r2t_sn, offset, xfer_len))
    }

    /// Mark one outstanding R2T as satisfied (its DataOUT burst completed),
    /// freeing a slot in `MaxOutstandingR2T`.
    pub fn complete_one(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    /// Reassign the cursor to resume at `resume_offset` — used by
    /// `TASK_REASSIGN` (ERL=2) when a write moves to a surviving
    /// connection.
    pub fn reassign_at(&mut self, resume_offset: u32) {
        self.next_offset = resume_offset;
    }
}
