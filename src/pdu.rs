//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::digest::{crc32c, encode_digest, DigestType};
use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (client → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → client)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// SNACK request types (RFC 3720 Section 10.16, byte 1 bits 0-3)
pub mod snack_type {
    pub const DATA_OR_R2T: u8 = 0;
    pub const STATUS: u8 = 1;
    pub const DATA_ACK: u8 = 2;
    pub const RDATA_SNACK: u8 = 3;
}

/// Task Management function codes (RFC 3720 Section 10.5.1)
pub mod tmf_function {
    pub const ABORT_TASK: u8 = 1;
    pub const ABORT_TASK_SET: u8 = 2;
    pub const CLEAR_ACA: u8 = 3;
    pub const CLEAR_TASK_SET: u8 = 4;
    pub const LOGICAL_UNIT_RESET: u8 = 5;
    pub const TARGET_WARM_RESET: u8 = 6;
    pub const TARGET_COLD_RESET: u8 = 7;
    pub const TASK_REASSIGN: u8 = 8;
}

/// Task Management response codes (RFC 3720 Section 10.6.2)
pub mod tmf_response {
    pub const COMPLETE: u8 = 0;
    pub const TASK_NOT_EXIST: u8 = 1;
    pub const LUN_NOT_EXIST: u8 = 2;
    pub const TASK_STILL_ALLEGIANT: u8 = 3;
    pub const REASSIGN_NOT_SUPPORTED: u8 = 4;
    pub const FUNCTION_NOT_SUPPORTED: u8 = 5;
    pub const AUTH_FAILED: u8 = 6;
    pub const FUNCTION_REJECTED: u8 = 255;
}

/// Reject reason codes (RFC 3720 Section 10.17.1)
pub mod reject_reason {
    pub const DATA_DIGEST_ERROR: u8 = 0x02;
    pub const SNACK_REJECT: u8 = 0x03;
    pub const PROTOCOL_ERROR: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x05;
    pub const IMMEDIATE_COMMAND_REJECT: u8 = 0x06;
    pub const TASK_IN_PROGRESS: u8 = 0x07;
    pub const INVALID_DATA_ACK: u8 = 0x08;
    pub const INVALID_PDU_FIELD: u8 = 0x09;
    pub const LONG_OPERATION_REJECT: u8 = 0x0A;
    pub const NEGOTIATION_RESET: u8 = 0x0B;
    pub const WAITING_FOR_LOGOUT: u8 = 0x0C;
}

/// iSCSI PDU flags (commonly used across PDU types)
pub mod flags {
    // Common flags
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // Login stages (CSG/NSG in bits 2-3 and 0-1)
    pub const CSG_SECURITY_NEG: u8 = 0x00;
    pub const CSG_LOGIN_OP_NEG: u8 = 0x04;
    pub const CSG_FULL_FEATURE: u8 = 0x0C;
    pub const NSG_SECURITY_NEG: u8 = 0x00;
    pub const NSG_LOGIN_OP_NEG: u8 = 0x01;
    pub const NSG_FULL_FEATURE: u8 = 0x03;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;

    // Common status detail codes
    pub const SUCCESS_ACCEPT: u16 = 0x0000;
    pub const TARGET_MOVED_TEMPORARILY: u16 = 0x0101;
    pub const TARGET_MOVED_PERMANENTLY: u16 = 0x0102;
    pub const INITIATOR_ERROR_GENERIC: u16 = 0x0200;
    pub const AUTH_FAILURE: u16 = 0x0201;
    pub const AUTHORIZATION_FAILURE: u16 = 0x0202;
    pub const TARGET_NOT_FOUND: u16 = 0x0203;
    pub const TARGET_REMOVED: u16 = 0x0204;
    pub const UNSUPPORTED_VERSION: u16 = 0x0205;
    pub const TOO_MANY_CONNECTIONS: u16 = 0x0206;
    pub const MISSING_PARAMETER: u16 = 0x0207;
    pub const CANT_INCLUDE_IN_SESSION: u16 = 0x0208;
    pub const SESSION_TYPE_NOT_SUPPORTED: u16 = 0x0209;
    pub const SESSION_DOES_NOT_EXIST: u16 = 0x020A;
    pub const INVALID_DURING_LOGIN: u16 = 0x020B;
    pub const TARGET_ERROR_GENERIC: u16 = 0x0300;
    pub const SERVICE_UNAVAILABLE: u16 = 0x0301;
    pub const OUT_OF_RESOURCES: u16 = 0x0302;
}

/// SCSI response status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone)]
pub struct IscsiPdu {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub ahs_length: u8,
    /// Bytes 2-3 of the BHS. Only the Login Request/Response PDUs give
    /// these a defined meaning (version-max, version-min/version-active);
    /// every other opcode leaves them reserved at zero.
    pub version_max: u8,
    pub version_min: u8,
    /// Data segment length (bytes)
    pub data_length: u32,
    /// Logical Unit Number (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Data segment (variable length)
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiPdu {
    /// Create a new empty PDU
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            ahs_length: 0,
            version_max: 0,
            version_min: 0,
            data_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    /// Parse a PDU from bytes
    ///
    /// The input buffer must contain at least the 48-byte BHS.
    /// If the PDU has data, the buffer must also contain the data segment.
    pub fn from_bytes(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let mut cursor = Cursor::new(buf);

        // Byte 0: Immediate flag (bit 6) and Opcode (bits 0-5)
        let byte0 = cursor.read_u8().map_err(IscsiError::Io)?;
        let immediate = (byte0 & 0x40) != 0;
        let opcode = byte0 & 0x3F;

        // Byte 1: Flags (opcode-specific)
        let flags = cursor.read_u8().map_err(IscsiError::Io)?;

        // Bytes 2-3: reserved for most opcodes; version-max/version-min for Login
        let version_max = cursor.read_u8().map_err(IscsiError::Io)?;
        let version_min = cursor.read_u8().map_err(IscsiError::Io)?;

        // Byte 4: Total AHS Length (4-byte units)
        let ahs_length = cursor.read_u8().map_err(IscsiError::Io)?;

        // Bytes 5-7: Data Segment Length (3 bytes, big-endian)
        let ds_len_high = cursor.read_u8().map_err(IscsiError::Io)? as u32;
        let ds_len_low = cursor.read_u16::<BigEndian>().map_err(IscsiError::Io)? as u32;
        let data_length = (ds_len_high << 16) | ds_len_low;

        // Bytes 8-15: LUN
        let lun = cursor.read_u64::<BigEndian>().map_err(IscsiError::Io)?;

        // Bytes 16-19: Initiator Task Tag
        let itt = cursor.read_u32::<BigEndian>().map_err(IscsiError::Io)?;

        // Bytes 20-47: Opcode-specific fields
        let mut specific = [0u8; 28];
        std::io::Read::read_exact(&mut cursor, &mut specific).map_err(IscsiError::Io)?;

        // Calculate total expected length (BHS + AHS + data + padding)
        let ahs_bytes = (ahs_length as usize) * 4;
        let padded_data_len = (data_length as usize).div_ceil(4) * 4; // Pad to 4-byte boundary
        let total_len = BHS_SIZE + ahs_bytes + padded_data_len;

        if buf.len() < total_len {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU incomplete: {} bytes, need {} (BHS={}, AHS={}, data={})",
                buf.len(),
                total_len,
                BHS_SIZE,
                ahs_bytes,
                padded_data_len
            )));
        }

        // Extract data segment (skip AHS for now)
        let data_start = BHS_SIZE + ahs_bytes;
        let data = buf[data_start..data_start + data_length as usize].to_vec();

        Ok(IscsiPdu {
            opcode,
            immediate,
            flags,
            ahs_length,
            version_max,
            version_min,
            data_length,
            lun,
            itt,
            specific,
            data,
        })
    }

    /// Serialize PDU to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let ahs_bytes = (self.ahs_length as usize) * 4;
        let padded_data_len = self.data.len().div_ceil(4) * 4;
        let total_len = BHS_SIZE + ahs_bytes + padded_data_len;

        let mut buf = Vec::with_capacity(total_len);

        // Byte 0: Immediate flag and Opcode
        let byte0 = (if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F);
        buf.push(byte0);

        // Byte 1: Flags
        buf.push(self.flags);

        // Bytes 2-3: version-max/version-min (Login PDUs only; zero otherwise)
        buf.push(self.version_max);
        buf.push(self.version_min);

        // Byte 4: Total AHS Length
        buf.push(self.ahs_length);

        // Bytes 5-7: Data Segment Length (3 bytes, big-endian)
        let data_len = self.data.len() as u32;
        buf.push(((data_len >> 16) & 0xFF) as u8);
        buf.write_u16::<BigEndian>((data_len & 0xFFFF) as u16).unwrap();

        // Bytes 8-15: LUN
        buf.write_u64::<BigEndian>(self.lun).unwrap();

        // Bytes 16-19: Initiator Task Tag
        buf.write_u32::<BigEndian>(self.itt).unwrap();

        // Bytes 20-47: Opcode-specific fields
        buf.extend_from_slice(&self.specific);

        // AHS (if any) - not implemented yet, would go here

        // Data segment
        buf.extend_from_slice(&self.data);

        // Pad to 4-byte boundary
        while buf.len() < total_len {
            buf.push(0);
        }

        buf
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        match self.opcode {
            opcode::NOP_OUT => "NOP-Out",
            opcode::SCSI_COMMAND => "SCSI Command",
            opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
            opcode::LOGIN_REQUEST => "Login Request",
            opcode::TEXT_REQUEST => "Text Request",
            opcode::SCSI_DATA_OUT => "SCSI Data-Out",
            opcode::LOGOUT_REQUEST => "Logout Request",
            opcode::SNACK_REQUEST => "SNACK Request",
            opcode::NOP_IN => "NOP-In",
            opcode::SCSI_RESPONSE => "SCSI Response",
            opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
            opcode::LOGIN_RESPONSE => "Login Response",
            opcode::TEXT_RESPONSE => "Text Response",
            opcode::SCSI_DATA_IN => "SCSI Data-In",
            opcode::LOGOUT_RESPONSE => "Logout Response",
            opcode::R2T => "Ready To Transfer",
            opcode::ASYNC_MESSAGE => "Async Message",
            opcode::REJECT => "Reject",
            _ => "Unknown",
        }
    }

    /// Get the total PDU length including headers and padded data
    pub fn total_length(&self) -> usize {
        let ahs_bytes = (self.ahs_length as usize) * 4;
        let padded_data_len = self.data.len().div_ceil(4) * 4;
        BHS_SIZE + ahs_bytes + padded_data_len
    }

    /// Serialize including header/data digests (RFC 3720 Section 3.2.2.1).
    ///
    /// Digest placement: header digest immediately follows the BHS+AHS;
    /// data digest follows the payload and its padding.
    pub fn to_bytes_with_digests(&self, header_digest: DigestType, data_digest: DigestType) -> Vec<u8> {
        let body = self.to_bytes();
        let ahs_bytes = (self.ahs_length as usize) * 4;
        let header_end = BHS_SIZE + ahs_bytes;

        let mut out = Vec::with_capacity(body.len() + header_digest.len() + data_digest.len());
        out.extend_from_slice(&body[..header_end]);
        if header_digest.is_enabled() {
            out.extend_from_slice(&encode_digest(crc32c(&body[..header_end])));
        }
        out.extend_from_slice(&body[header_end..]);
        if data_digest.is_enabled() && !self.data.is_empty() {
            out.extend_from_slice(&encode_digest(crc32c(&body[header_end..])));
        }
        out
    }

    /// Parse a PDU that may be followed by header/data digests. `buf` must
    /// contain at least the BHS+AHS+digest(s) the caller expects based on
    /// the connection's negotiated digest types; data length is read from
    /// the BHS itself before the data digest (if any) is consumed.
    pub fn from_bytes_with_digests(
        buf: &[u8],
        header_digest: DigestType,
        data_digest: DigestType,
    ) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu("PDU shorter than BHS".into()));
        }
        let ahs_bytes = (buf[4] as usize) * 4;
        let header_end = BHS_SIZE + ahs_bytes;

        if header_digest.is_enabled() {
            if buf.len() < header_end + 4 {
                return Err(IscsiError::InvalidPdu("missing header digest".into()));
            }
            let expected = BigEndian::read_u32(&buf[header_end..header_end + 4]);
            crate::digest::verify_header_digest(&buf[..header_end], expected)?;
        }

        let digest_offset = if header_digest.is_enabled() { 4 } else { 0 };
        let mut rebuilt = Vec::with_capacity(buf.len());
        rebuilt.extend_from_slice(&buf[..header_end]);
        rebuilt.extend_from_slice(&buf[header_end + digest_offset..]);

        let ds_len_high = rebuilt[5] as u32;
        let ds_len_low = BigEndian::read_u16(&rebuilt[6..8]) as u32;
        let data_length = ((ds_len_high << 16) | ds_len_low) as usize;
        let padded_data_len = data_length.div_ceil(4) * 4;
        let data_end = header_end + padded_data_len;

        if data_digest.is_enabled() && data_length > 0 {
            if rebuilt.len() < data_end + 4 {
                return Err(IscsiError::InvalidPdu("missing data digest".into()));
            }
            let expected = BigEndian::read_u32(&rebuilt[data_end..data_end + 4]);
            let itt = BigEndian::read_u32(&rebuilt[16..20]);
            crate::digest::verify_data_digest(&rebuilt[header_end..data_end], expected, itt)?;
        }

        IscsiPdu::from_bytes(&rebuilt[..data_end])
    }
}

// ============================================================================
// Login Request/Response PDU helpers
// ============================================================================

/// Login Request PDU parsing helpers
impl IscsiPdu {
    /// Create a Login Request PDU
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: u8,
        nsg: u8,
        transit: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;
        pdu.version_max = 0x00;
        pdu.version_min = 0x00;

        // Flags: Transit | Continue | CSG | NSG
        pdu.flags = (if transit { flags::TRANSIT } else { 0 })
            | ((csg & 0x03) << 2)
            | (nsg & 0x03);

        // ISID in LUN field (bytes 8-13 of BHS)
        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&isid);
        lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
        pdu.lun = u64::from_be_bytes(lun_bytes);

        // Opcode-specific fields
        // Bytes 20-21: CID
        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        // Bytes 24-27: CmdSN
        pdu.specific[4..8].copy_from_slice(&cmd_sn.to_be_bytes());
        // Bytes 28-31: ExpStatSN
        pdu.specific[8..12].copy_from_slice(&exp_stat_sn.to_be_bytes());

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;

        pdu
    }

    /// Parse Login Request fields
    pub fn parse_login_request(&self) -> ScsiResult<LoginRequest> {
        if self.opcode != opcode::LOGIN_REQUEST {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected Login Request opcode 0x03, got 0x{:02x}",
                self.opcode
            )));
        }

        let lun_bytes = self.lun.to_be_bytes();
        let mut isid = [0u8; 6];
        isid.copy_from_slice(&lun_bytes[0..6]);
        let tsih = BigEndian::read_u16(&lun_bytes[6..8]);

        let transit = (self.flags & flags::TRANSIT) != 0;
        let cont = (self.flags & flags::CONTINUE_LOGIN) != 0;
        let csg = (self.flags >> 2) & 0x03;
        let nsg = self.flags & 0x03;

        let cid = BigEndian::read_u16(&self.specific[0..2]);
        let cmd_sn = BigEndian::read_u32(&self.specific[4..8]);
        let exp_stat_sn = BigEndian::read_u32(&self.specific[8..12]);

        Ok(LoginRequest {
            isid,
            tsih,
            cid,
            cmd_sn,
            exp_stat_sn,
            transit,
            cont,
            csg,
            nsg,
            version_max: self.version_max,
            version_min: self.version_min,
            parameters: parse_text_parameters(&self.data)?,
        })
    }

    /// Create a Login Response PDU
    pub fn login_response(
        isid: [u8; 6],
        tsih: u16,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status_class: u8,
        status_detail: u8,
        csg: u8,
        nsg: u8,
        transit: bool,
        itt: u32,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_RESPONSE;

        // Flags: Transit | Continue | CSG | NSG
        pdu.flags = (if transit { flags::TRANSIT } else { 0 })
            | ((csg & 0x03) << 2)
            | (nsg & 0x03);

        // ISID + TSIH in LUN field
        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&isid);
        lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
        pdu.lun = u64::from_be_bytes(lun_bytes);

        pdu.itt = itt;

        // Opcode-specific fields
        // Bytes 24-27: StatSN
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        // Bytes 28-31: ExpCmdSN
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        // Bytes 32-35: MaxCmdSN
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        // Bytes 36-37: Status-Class and Status-Detail
        pdu.specific[16] = status_class;
        pdu.specific[17] = status_detail;

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;

        pdu
    }
}

/// Parsed Login Request
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub isid: [u8; 6],
    pub tsih: u16,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub version_max: u8,
    pub version_min: u8,
    pub parameters: Vec<(String, String)>,
}

// ============================================================================
// SCSI Command/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Parse SCSI Command PDU
    pub fn parse_scsi_command(&self) -> ScsiResult<ScsiCommandPdu> {
        if self.opcode != opcode::SCSI_COMMAND {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected SCSI Command opcode 0x01, got 0x{:02x}",
                self.opcode
            )));
        }

        let read = (self.flags & flags::READ) != 0;
        let write = (self.flags & flags::WRITE) != 0;
        let final_flag = (self.flags & flags::FINAL) != 0;

        let expected_data_length = BigEndian::read_u32(&self.specific[0..4]);

        // CDB is in specific[12..28] (16 bytes)
        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&self.specific[12..28]);

        Ok(ScsiCommandPdu {
            lun: self.lun,
            itt: self.itt,
            expected_data_length,
            cdb,
            read,
            write,
            final_flag,
        })
    }

    /// Create a SCSI Response PDU
    pub fn scsi_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status: u8,
        response: u8,
        residual_count: u32,
        sense_data: Option<&[u8]>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_RESPONSE;
        pdu.flags = flags::FINAL; // Always final for response
        pdu.itt = itt;

        // Opcode-specific fields
        pdu.specific[0] = response; // iSCSI response code
        pdu.specific[1] = status;   // SCSI status

        // StatSN
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        // ExpCmdSN
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        // MaxCmdSN
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        // Residual count
        pdu.specific[20..24].copy_from_slice(&residual_count.to_be_bytes());

        // Add sense data if provided
        if let Some(sense) = sense_data {
            pdu.data = sense.to_vec();
            pdu.data_length = pdu.data.len() as u32;
        }

        pdu
    }

    /// Create a SCSI Data-In PDU (data from target to initiator)
    pub fn scsi_data_in(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        data_sn: u32,
        buffer_offset: u32,
        data: Vec<u8>,
        final_flag: bool,
        status: Option<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::SCSI_DATA_IN;

        // Flags
        let mut flags_byte = 0u8;
        if final_flag {
            flags_byte |= flags::FINAL;
        }
        if status.is_some() {
            flags_byte |= 0x01; // S bit - status included
        }
        pdu.flags = flags_byte;

        pdu.itt = itt;

        // Target Transfer Tag
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        // StatSN (only valid if S bit set)
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        // ExpCmdSN
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        // MaxCmdSN
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        // DataSN
        pdu.specific[16..20].copy_from_slice(&data_sn.to_be_bytes());
        // Buffer Offset
        pdu.specific[20..24].copy_from_slice(&buffer_offset.to_be_bytes());
        // Residual count (for underflow/overflow)
        // pdu.specific[24..28] - residual count if needed

        if let Some(s) = status {
            // Status byte goes in byte 3 of flags area (handled differently)
            // Actually for Data-In, status is in specific[1] if S bit set
            pdu.specific[27] = s;
        }

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;

        pdu
    }

    /// Parse SCSI Data-Out PDU (data from initiator to target)
    pub fn parse_scsi_data_out(&self) -> ScsiResult<ScsiDataOutPdu> {
        if self.opcode != opcode::SCSI_DATA_OUT {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected SCSI Data-Out opcode 0x05, got 0x{:02x}",
                self.opcode
            )));
        }

        let final_flag = (self.flags & flags::FINAL) != 0;
        let ttt = BigEndian::read_u32(&self.specific[0..4]);
        let exp_stat_sn = BigEndian::read_u32(&self.specific[4..8]);
        let data_sn = BigEndian::read_u32(&self.specific[16..20]);
        let buffer_offset = BigEndian::read_u32(&self.specific[20..24]);

        Ok(ScsiDataOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt,
            exp_stat_sn,
            data_sn,
            buffer_offset,
            data: self.data.clone(),
            final_flag,
        })
    }
}

/// Parsed SCSI Command
#[derive(Debug, Clone)]
pub struct ScsiCommandPdu {
    pub lun: u64,
    pub itt: u32,
    pub expected_data_length: u32,
    pub cdb: [u8; 16],
    pub read: bool,
    pub write: bool,
    pub final_flag: bool,
}

/// Parsed SCSI Data-Out
#[derive(Debug, Clone)]
pub struct ScsiDataOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub exp_stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub data: Vec<u8>,
    pub final_flag: bool,
}

// ============================================================================
// NOP-Out/NOP-In PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a NOP-In PDU (target → initiator, usually response to NOP-Out)
    pub fn nop_in(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        lun: u64,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_IN;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;

        // Target Transfer Tag
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        // StatSN
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        // ExpCmdSN
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        // MaxCmdSN
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());

        pdu
    }

    /// Parse NOP-Out PDU
    pub fn parse_nop_out(&self) -> ScsiResult<NopOutPdu> {
        if self.opcode != opcode::NOP_OUT {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected NOP-Out opcode 0x00, got 0x{:02x}",
                self.opcode
            )));
        }

        let ttt = BigEndian::read_u32(&self.specific[0..4]);
        let cmd_sn = BigEndian::read_u32(&self.specific[4..8]);
        let exp_stat_sn = BigEndian::read_u32(&self.specific[8..12]);

        Ok(NopOutPdu {
            lun: self.lun,
            itt: self.itt,
            ttt,
            cmd_sn,
            exp_stat_sn,
            data: self.data.clone(),
        })
    }
}

/// Parsed NOP-Out
#[derive(Debug, Clone)]
pub struct NopOutPdu {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

// ============================================================================
// Logout Request/Response PDU helpers
// ============================================================================

/// Logout reason codes
pub mod logout_reason {
    pub const CLOSE_SESSION: u8 = 0;
    pub const CLOSE_CONNECTION: u8 = 1;
    pub const REMOVE_CONNECTION_FOR_RECOVERY: u8 = 2;
}

/// Logout response codes
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

impl IscsiPdu {
    /// Parse Logout Request
    pub fn parse_logout_request(&self) -> ScsiResult<LogoutRequest> {
        if self.opcode != opcode::LOGOUT_REQUEST {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected Logout Request opcode 0x06, got 0x{:02x}",
                self.opcode
            )));
        }

        let reason = self.flags & 0x7F;
        let cid = BigEndian::read_u16(&self.specific[0..2]);
        let cmd_sn = BigEndian::read_u32(&self.specific[4..8]);
        let exp_stat_sn = BigEndian::read_u32(&self.specific[8..12]);

        Ok(LogoutRequest {
            itt: self.itt,
            reason,
            cid,
            cmd_sn,
            exp_stat_sn,
        })
    }

    /// Create a Logout Response PDU
    pub fn logout_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
        time2wait: u16,
        time2retain: u16,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGOUT_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.itt = itt;

        // Response code
        pdu.specific[0] = response;
        // StatSN
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        // ExpCmdSN
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        // MaxCmdSN
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        // Time2Wait
        pdu.specific[20..22].copy_from_slice(&time2wait.to_be_bytes());
        // Time2Retain
        pdu.specific[22..24].copy_from_slice(&time2retain.to_be_bytes());

        pdu
    }
}

/// Parsed Logout Request
#[derive(Debug, Clone)]
pub struct LogoutRequest {
    pub itt: u32,
    pub reason: u8,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

// ============================================================================
// Text Request/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Parse Text Request
    pub fn parse_text_request(&self) -> ScsiResult<TextRequest> {
        if self.opcode != opcode::TEXT_REQUEST {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected Text Request opcode 0x04, got 0x{:02x}",
                self.opcode
            )));
        }

        let final_flag = (self.flags & flags::FINAL) != 0;
        let cont = (self.flags & flags::CONTINUE) != 0;
        let ttt = BigEndian::read_u32(&self.specific[0..4]);
        let cmd_sn = BigEndian::read_u32(&self.specific[4..8]);
        let exp_stat_sn = BigEndian::read_u32(&self.specific[8..12]);

        Ok(TextRequest {
            itt: self.itt,
            ttt,
            cmd_sn,
            exp_stat_sn,
            final_flag,
            cont,
            parameters: parse_text_parameters(&self.data)?,
        })
    }

    /// Create a Text Response PDU
    pub fn text_response(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_RESPONSE;
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.itt = itt;

        // Target Transfer Tag
        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        // StatSN
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        // ExpCmdSN
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        // MaxCmdSN
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());

        pdu.data = data;
        pdu.data_length = pdu.data.len() as u32;

        pdu
    }
}

/// Parsed Text Request
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub final_flag: bool,
    pub cont: bool,
    pub parameters: Vec<(String, String)>,
}

// ============================================================================
// R2T PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a Ready To Transfer PDU (target → initiator)
    pub fn r2t(
        itt: u32,
        ttt: u32,
        lun: u64,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        r2t_sn: u32,
        buffer_offset: u32,
        desired_length: u32,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::R2T;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = itt;

        pdu.specific[0..4].copy_from_slice(&ttt.to_be_bytes());
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[16..20].copy_from_slice(&r2t_sn.to_be_bytes());
        pdu.specific[20..24].copy_from_slice(&buffer_offset.to_be_bytes());
        pdu.specific[24..28].copy_from_slice(&desired_length.to_be_bytes());

        pdu
    }
}

// ============================================================================
// Task Management Request/Response PDU helpers
// ============================================================================

impl IscsiPdu {
    pub fn parse_task_management_request(&self) -> ScsiResult<TaskManagementRequest> {
        if self.opcode != opcode::TASK_MANAGEMENT_REQUEST {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected Task Management Request opcode 0x02, got 0x{:02x}",
                self.opcode
            )));
        }

        let function = self.flags & 0x7F;
        let referenced_task_tag = BigEndian::read_u32(&self.specific[0..4]);
        let cmd_sn = BigEndian::read_u32(&self.specific[4..8]);
        let exp_stat_sn = BigEndian::read_u32(&self.specific[8..12]);
        let ref_cmd_sn = BigEndian::read_u32(&self.specific[12..16]);
        let exp_data_sn = BigEndian::read_u32(&self.specific[16..20]);

        Ok(TaskManagementRequest {
            itt: self.itt,
            lun: self.lun,
            function,
            referenced_task_tag,
            cmd_sn,
            exp_stat_sn,
            ref_cmd_sn,
            exp_data_sn,
        })
    }

    pub fn task_management_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        response: u8,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TASK_MANAGEMENT_RESPONSE;
        pdu.flags = flags::FINAL;
        pdu.itt = itt;

        pdu.specific[0] = response;
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());

        pdu
    }
}

/// Parsed Task Management Request
#[derive(Debug, Clone)]
pub struct TaskManagementRequest {
    pub itt: u32,
    pub lun: u64,
    pub function: u8,
    pub referenced_task_tag: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub ref_cmd_sn: u32,
    pub exp_data_sn: u32,
}

// ============================================================================
// SNACK Request PDU helpers
// ============================================================================

impl IscsiPdu {
    pub fn parse_snack_request(&self) -> ScsiResult<SnackRequest> {
        if self.opcode != opcode::SNACK_REQUEST {
            return Err(IscsiError::InvalidPdu(format!(
                "Expected SNACK Request opcode 0x10, got 0x{:02x}",
                self.opcode
            )));
        }

        let snack_type = self.flags & 0x0F;
        let ttt = BigEndian::read_u32(&self.specific[0..4]);
        let exp_stat_sn = BigEndian::read_u32(&self.specific[8..12]);
        let beg_run = BigEndian::read_u32(&self.specific[16..20]);
        let run_length = BigEndian::read_u32(&self.specific[20..24]);

        Ok(SnackRequest {
            itt: self.itt,
            lun: self.lun,
            snack_type,
            ttt,
            exp_stat_sn,
            beg_run,
            run_length,
        })
    }
}

/// Parsed SNACK Request
#[derive(Debug, Clone)]
pub struct SnackRequest {
    pub itt: u32,
    pub lun: u64,
    pub snack_type: u8,
    pub ttt: u32,
    pub exp_stat_sn: u32,
    pub beg_run: u32,
    pub run_length: u32,
}

// ============================================================================
// Reject / Async Message PDU helpers
// ============================================================================

impl IscsiPdu {
    /// Create a Reject PDU. `rejected_header` is the 48-byte BHS of the
    /// PDU being rejected, carried verbatim as the data segment.
    pub fn reject(
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        data_sn: u32,
        reason: u8,
        rejected_header: [u8; BHS_SIZE],
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::REJECT;
        pdu.flags = flags::FINAL;
        pdu.itt = 0xFFFF_FFFF;

        pdu.specific[0] = reason;
        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[16..20].copy_from_slice(&data_sn.to_be_bytes());

        pdu.data = rejected_header.to_vec();
        pdu.data_length = pdu.data.len() as u32;

        pdu
    }

    /// Create an unsolicited Async Message PDU (target → initiator).
    pub fn async_message(
        lun: u64,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        async_event: u8,
        param1: u16,
        param2: u16,
        param3: u16,
    ) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::ASYNC_MESSAGE;
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.itt = 0xFFFF_FFFF;

        pdu.specific[4..8].copy_from_slice(&stat_sn.to_be_bytes());
        pdu.specific[8..12].copy_from_slice(&exp_cmd_sn.to_be_bytes());
        pdu.specific[12..16].copy_from_slice(&max_cmd_sn.to_be_bytes());
        pdu.specific[16] = async_event;
        pdu.specific[18..20].copy_from_slice(&param1.to_be_bytes());
        pdu.specific[20..22].copy_from_slice(&param2.to_be_bytes());
        pdu.specific[22..24].copy_from_slice(&param3.to_be_bytes());

        pdu
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
pub fn parse_text_parameters(data: &[u8]) -> ScsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    if data.is_empty() {
        return Ok(params);
    }

    // Split on null bytes
    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = String::from_utf8_lossy(chunk);
        if let Some(eq_pos) = s.find('=') {
            let key = s[..eq_pos].to_string();
            let value = s[eq_pos + 1..].to_string();
            params.push((key, value));
        }
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_new() {
        let pdu = IscsiPdu::new();
        assert_eq!(pdu.opcode, 0);
        assert!(!pdu.immediate);
        assert_eq!(pdu.flags, 0);
        assert_eq!(pdu.data_length, 0);
        assert!(pdu.data.is_empty());
    }

    #[test]
    fn test_pdu_roundtrip_simple() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.flags = flags::FINAL;
        pdu.itt = 0x12345678;
        pdu.lun = 0x0001020304050607;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE); // No data, so just BHS

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode, opcode::NOP_OUT);
        assert_eq!(parsed.flags, flags::FINAL);
        assert_eq!(parsed.itt, 0x12345678);
        assert_eq!(parsed.lun, 0x0001020304050607);
    }

    #[test]
    fn test_pdu_roundtrip_with_data() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.data = b"InitiatorName=iqn.test\0".to_vec();
        pdu.data_length = pdu.data.len() as u32;

        let bytes = pdu.to_bytes();
        // BHS + data + padding to 4-byte boundary
        assert!(bytes.len() >= BHS_SIZE + pdu.data.len());
        assert_eq!(bytes.len() % 4, 0);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode, opcode::LOGIN_REQUEST);
        assert_eq!(parsed.data, pdu.data);
    }

    #[test]
    fn test_pdu_too_short() {
        let bytes = vec![0u8; 20]; // Too short for BHS
        let result = IscsiPdu::from_bytes(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_text_parameters() {
        let data = b"Key1=Value1\0Key2=Value2\0";
        let params = parse_text_parameters(data).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("Key1".to_string(), "Value1".to_string()));
        assert_eq!(params[1], ("Key2".to_string(), "Value2".to_string()));
    }

    #[test]
    fn test_serialize_text_parameters() {
        let params = vec![
            ("Key1".to_string(), "Value1".to_string()),
            ("Key2".to_string(), "Value2".to_string()),
        ];
        let data = serialize_text_parameters(&params);
        assert_eq!(data, b"Key1=Value1\0Key2=Value2\0");
    }

    #[test]
    fn test_login_response_creation() {
        let isid = [0x00, 0x02, 0x3D, 0x00, 0x00, 0x00];
        let pdu = IscsiPdu::login_response(
            isid,
            1,     // tsih
            1,     // stat_sn
            1,     // exp_cmd_sn
            1,     // max_cmd_sn
            0,     // status class (success)
            0,     // status detail
            0,     // csg
            3,     // nsg (full feature)
            true,  // transit
            0x1234, // itt
            vec![], // no data
        );

        assert_eq!(pdu.opcode, opcode::LOGIN_RESPONSE);
        assert_eq!(pdu.flags & flags::TRANSIT, flags::TRANSIT);
        assert_eq!(pdu.itt, 0x1234);
    }

    #[test]
    fn test_scsi_response_creation() {
        let pdu = IscsiPdu::scsi_response(
            0x1234,  // itt
            1,       // stat_sn
            1,       // exp_cmd_sn
            1,       // max_cmd_sn
            scsi_status::GOOD, // status
            0,       // response (completed)
            0,       // residual count
            None,    // no sense data
        );

        assert_eq!(pdu.opcode, opcode::SCSI_RESPONSE);
        assert_eq!(pdu.flags, flags::FINAL);
        assert_eq!(pdu.itt, 0x1234);
        assert_eq!(pdu.specific[1], scsi_status::GOOD);
    }

    #[test]
    fn test_scsi_data_in_creation() {
        let data = vec![0xAB; 512];
        let pdu = IscsiPdu::scsi_data_in(
            0x1234,  // itt
            0xFFFF_FFFF, // ttt
            1,       // stat_sn
            1,       // exp_cmd_sn
            1,       // max_cmd_sn
            0,       // data_sn
            0,       // buffer_offset
            data.clone(),
            true,    // final
            Some(scsi_status::GOOD),
        );

        assert_eq!(pdu.opcode, opcode::SCSI_DATA_IN);
        assert_eq!(pdu.flags & flags::FINAL, flags::FINAL);
        assert_eq!(pdu.data, data);
    }

    #[test]
    fn test_nop_in_creation() {
        let pdu = IscsiPdu::nop_in(
            0x1234,      // itt
            0xFFFF_FFFF, // ttt
            1,           // stat_sn
            1,           // exp_cmd_sn
            1,           // max_cmd_sn
            0,           // lun
        );

        assert_eq!(pdu.opcode, opcode::NOP_IN);
        assert_eq!(pdu.flags, flags::FINAL);
        assert_eq!(pdu.itt, 0x1234);
    }

    #[test]
    fn test_logout_response_creation() {
        let pdu = IscsiPdu::logout_response(
            0x1234,  // itt
            1,       // stat_sn
            1,       // exp_cmd_sn
            1,       // max_cmd_sn
            logout_response::SUCCESS,
            2,       // time2wait
            20,      // time2retain
        );

        assert_eq!(pdu.opcode, opcode::LOGOUT_RESPONSE);
        assert_eq!(pdu.specific[0], logout_response::SUCCESS);
    }

    #[test]
    fn test_opcode_names() {
        let mut pdu = IscsiPdu::new();

        pdu.opcode = opcode::LOGIN_REQUEST;
        assert_eq!(pdu.opcode_name(), "Login Request");

        pdu.opcode = opcode::SCSI_COMMAND;
        assert_eq!(pdu.opcode_name(), "SCSI Command");

        pdu.opcode = opcode::SCSI_RESPONSE;
        assert_eq!(pdu.opcode_name(), "SCSI Response");

        pdu.opcode = 0xFF;
        assert_eq!(pdu.opcode_name(), "Unknown");
    }

    #[test]
    fn test_immediate_flag() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0] & 0x40, 0x40); // Immediate bit set

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert!(parsed.immediate);
    }

    #[test]
    fn test_login_request_version_fields_roundtrip() {
        let pdu = IscsiPdu::login_request(
            [0, 1, 2, 3, 4, 5],
            0,
            1,
            10,
            7,
            flags::CSG_SECURITY_NEG >> 2,
            flags::NSG_LOGIN_OP_NEG,
            false,
            Vec::new(),
        );
        assert_eq!(pdu.version_max, 0x00);
        assert_eq!(pdu.version_min, 0x00);

        let bytes = pdu.to_bytes();
        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        let login = parsed.parse_login_request().unwrap();
        assert_eq!(login.version_max, 0x00);
        assert_eq!(login.version_min, 0x00);
        assert_eq!(login.isid, [0, 1, 2, 3, 4, 5]);
        assert_eq!(login.cmd_sn, 10);
    }

    #[test]
    fn test_digest_roundtrip() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.itt = 0xA001;
        pdu.data = b"ping payload".to_vec();
        pdu.data_length = pdu.data.len() as u32;

        let wire = pdu.to_bytes_with_digests(DigestType::Crc32c, DigestType::Crc32c);
        let parsed =
            IscsiPdu::from_bytes_with_digests(&wire, DigestType::Crc32c, DigestType::Crc32c)
                .unwrap();
        assert_eq!(parsed.data, pdu.data);
        assert_eq!(parsed.itt, pdu.itt);
    }

    #[test]
    fn test_header_digest_mismatch_rejected() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        let mut wire = pdu.to_bytes_with_digests(DigestType::Crc32c, DigestType::None);
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let result = IscsiPdu::from_bytes_with_digests(&wire, DigestType::Crc32c, DigestType::None);
        assert!(result.is_err());
    }

    #[test]
    fn test_r2t_and_reject_and_async_and_tmf_roundtrip() {
        let r2t = IscsiPdu::r2t(0x1, 0x2, 0, 5, 6, 7, 0, 4096, 4096);
        assert_eq!(r2t.opcode, opcode::R2T);

        let tmf_req_pdu = {
            let mut p = IscsiPdu::new();
            p.opcode = opcode::TASK_MANAGEMENT_REQUEST;
            p.flags = tmf_function::ABORT_TASK;
            p.itt = 42;
            p.specific[0..4].copy_from_slice(&99u32.to_be_bytes());
            p
        };
        let parsed_tmf = tmf_req_pdu.parse_task_management_request().unwrap();
        assert_eq!(parsed_tmf.function, tmf_function::ABORT_TASK);
        assert_eq!(parsed_tmf.referenced_task_tag, 99);

        let tmf_rsp = IscsiPdu::task_management_response(42, 1, 2, 3, tmf_response::COMPLETE);
        assert_eq!(tmf_rsp.specific[0], tmf_response::COMPLETE);

        let reject = IscsiPdu::reject(1, 2, 3, 0, reject_reason::PROTOCOL_ERROR, [0u8; BHS_SIZE]);
        assert_eq!(reject.itt, 0xFFFF_FFFF);

        let async_msg = IscsiPdu::async_message(0, 1, 2, 3, 1, 0, 0, 0);
        assert_eq!(async_msg.opcode, opcode::ASYNC_MESSAGE);
    }

    #[test]
    fn test_data_padding() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_REQUEST;
        pdu.data = vec![1, 2, 3]; // 3 bytes, should pad to 4

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(bytes.len(), BHS_SIZE + 4); // BHS + 4 bytes (padded data)
    }
}
