//! Bridges the connection-level PDU pipeline to a [`ScsiBlockDevice`]
//! backend: LUN resolution, the active-command table, and final CDB
//! execution once a command's data (immediate, unsolicited, or R2T'd)
//! has been fully collected.
//!
//! DataIN/R2T *sequencing* lives in [`crate::seqbook`]; this module owns
//! the bookkeeping around it — which command a TTT/ITT belongs to, and
//! when a write has enough bytes to hand to the device.

use std::collections::HashMap;

use crate::error::{IscsiError, ScsiResult};
use crate::erl::RecoveryLedger;
use crate::pdu::ScsiCommandPdu;
use crate::scsi::{ScsiBlockDevice, ScsiHandler, ScsiResponse};
use crate::seqbook::{R2tGenerator, SeqBook, SeqBookParams};

/// Data transfer direction of a SCSI command, derived from its CDB flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDirection {
    Read,
    Write,
    NoData,
}

impl CommandDirection {
    pub fn from_cmd_pdu(cmd: &ScsiCommandPdu) -> Self {
        if cmd.read {
            CommandDirection::Read
        } else if cmd.write {
            CommandDirection::Write
        } else {
            CommandDirection::NoData
        }
    }
}

/// Per-command state kept alive from SCSI Command PDU through its final
/// SCSI Response. Held in a [`CommandTable`] keyed by ITT.
pub struct ActiveCommand {
    pub itt: u32,
    pub lun: u64,
    pub cdb: [u8; 16],
    pub direction: CommandDirection,
    pub expected_data_length: u32,
    write_buffer: Vec<u8>,
    write_received: u32,
    pub r2t_gen: Option<R2tGenerator>,
    pub seqbook: Option<SeqBook>,
    pub recovery: RecoveryLedger,
}

impl ActiveCommand {
    fn new(cmd: &ScsiCommandPdu, direction: CommandDirection) -> Self {
        ActiveCommand {
            itt: cmd.itt,
            lun: cmd.lun,
            cdb: cmd.cdb,
            direction,
            expected_data_length: cmd.expected_data_length,
            write_buffer: if direction == CommandDirection::Write {
                vec![0u8; cmd.expected_data_length as usize]
            } else {
                Vec::new()
            },
            write_received: 0,
            r2t_gen: None,
            seqbook: None,
            recovery: RecoveryLedger::new(),
        }
    }

    /// Record one DataOUT PDU's payload (solicited or unsolicited) at
    /// `buffer_offset`. Returns the bytes still outstanding.
    pub fn ingest_data_out(&mut self, buffer_offset: u32, data: &[u8]) -> ScsiResult<u32> {
        let end = buffer_offset as usize + data.len();
        if end > self.write_buffer.len() {
            return Err(IscsiError::ProtocolError {
                itt: self.itt,
                detail: format!(
                    "DataOut buffer offset {buffer_offset} + {} exceeds expected transfer length {}",
                    data.len(),
                    self.write_buffer.len()
                ),
            });
        }
        self.write_buffer[buffer_offset as usize..end].copy_from_slice(data);
        self.write_received += data.len() as u32;
        Ok(self.expected_data_length.saturating_sub(self.write_received))
    }

    pub fn write_data_done(&self) -> u32 {
        self.write_received
    }

    pub fn write_is_complete(&self) -> bool {
        self.write_received >= self.expected_data_length
    }

    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }
}

/// Active commands indexed by Initiator Task Tag, scoped to one session.
#[derive(Default)]
pub struct CommandTable {
    commands: HashMap<u32, ActiveCommand>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, cmd: &ScsiCommandPdu) -> &mut ActiveCommand {
        let direction = CommandDirection::from_cmd_pdu(cmd);
        self.commands.entry(cmd.itt).or_insert_with(|| ActiveCommand::new(cmd, direction))
    }

    pub fn get_mut(&mut self, itt: u32) -> Option<&mut ActiveCommand> {
        self.commands.get_mut(&itt)
    }

    pub fn get(&self, itt: u32) -> Option<&ActiveCommand> {
        self.commands.get(&itt)
    }

    pub fn complete(&mut self, itt: u32) -> Option<ActiveCommand> {
        self.commands.remove(&itt)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Abort every outstanding command, e.g. on LOGICAL UNIT RESET or
    /// session teardown.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

/// Adapts one [`ScsiBlockDevice`] to the command pipeline. A target
/// backs a single LUN (LUN 0) per the backend trait's design; anything
/// else is rejected at resolution time rather than left to the device.
pub struct BackendBridge<D: ScsiBlockDevice> {
    device: D,
}

impl<D: ScsiBlockDevice> BackendBridge<D> {
    pub fn new(device: D) -> Self {
        BackendBridge { device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Confirm `lun` addresses the single backing LUN this bridge serves.
    pub fn resolve_lun(&self, lun: u64) -> ScsiResult<()> {
        if lun == 0 {
            Ok(())
        } else {
            Err(IscsiError::LunNotFound(lun))
        }
    }

    pub fn seqbook_params(&self, negotiated: &SeqBookParams) -> SeqBookParams {
        *negotiated
    }

    /// Execute a fully-assembled CDB against the device. `write_data` is
    /// `None` for read/no-data commands and `Some(buffer)` once a write's
    /// transfer is complete.
    pub fn execute(&mut self, cdb: &[u8], write_data: Option<&[u8]>) -> ScsiResult<ScsiResponse> {
        ScsiHandler::handle_command(cdb, &mut self.device, write_data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemDevice {
        blocks: Vec<u8>,
        block_size: u32,
    }

    impl MemDevice {
        fn new(blocks: u64, block_size: u32) -> Self {
            MemDevice {
                blocks: vec![0u8; (blocks * block_size as u64) as usize],
                block_size,
            }
        }
    }

    impl ScsiBlockDevice for MemDevice {
        fn read(&self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>> {
            let start = (lba * block_size as u64) as usize;
            let len = (blocks * block_size) as usize;
            Ok(self.blocks[start..start + len].to_vec())
        }
        fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()> {
            let start = (lba * block_size as u64) as usize;
            self.blocks[start..start + data.len()].copy_from_slice(data);
            Ok(())
        }
        fn capacity(&self) -> u64 {
            self.blocks.len() as u64 / self.block_size as u64
        }
        fn block_size(&self) -> u32 {
            self.block_size
        }
    }

    fn sample_write_cmd(itt: u32, expected_data_length: u32) -> ScsiCommandPdu {
        ScsiCommandPdu {
            lun: 0,
            itt,
            expected_data_length,
            cdb: [0u8; 16],
            read: false,
            write: true,
            final_flag: true,
        }
    }

    #[test]
    fn resolve_lun_accepts_only_lun_zero() {
        let bridge = BackendBridge::new(MemDevice::new(16, 512));
        assert!(bridge.resolve_lun(0).is_ok());
        assert!(bridge.resolve_lun(1).is_err());
    }

    #[test]
    fn command_table_tracks_write_assembly_across_multiple_data_out_pdus() {
        let mut table = CommandTable::new();
        let cmd = sample_write_cmd(7, 1024);
        table.begin(&cmd);

        let remaining = {
            let active = table.get_mut(7).unwrap();
            active.ingest_data_out(0, &[1u8; 512]).unwrap()
        };
        assert_eq!(remaining, 512);
        assert!(!table.get(7).unwrap().write_is_complete());

        let remaining = {
            let active = table.get_mut(7).unwrap();
            active.ingest_data_out(512, &[2u8; 512]).unwrap()
        };
        assert_eq!(remaining, 0);
        assert!(table.get(7).unwrap().write_is_complete());
    }

    #[test]
    fn ingest_data_out_rejects_overrun() {
        let mut table = CommandTable::new();
        let cmd = sample_write_cmd(1, 512);
        table.begin(&cmd);
        let active = table.get_mut(1).unwrap();
        assert!(active.ingest_data_out(256, &[0u8; 512]).is_err());
    }

    #[test]
    fn complete_removes_command_from_table() {
        let mut table = CommandTable::new();
        table.begin(&sample_write_cmd(3, 0));
        assert_eq!(table.len(), 1);
        assert!(table.complete(3).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn execute_dispatches_through_scsi_handler() {
        let mut bridge = BackendBridge::new(MemDevice::new(16, 512));
        // TEST UNIT READY
        let response = bridge.execute(&[0x00, 0, 0, 0, 0, 0], None).unwrap();
        assert_eq!(response.status, crate::scsi::scsi_status::GOOD);
    }
}
