//! Error types for iSCSI target operations

use thiserror::Error;

/// iSCSI target errors
///
/// Command-level variants are reported in-protocol (Reject, SCSI Response
/// with sense, TMF response) by the connection that encounters them.
/// Connection-level variants never unwind the process; the connection
/// loop catches them, drops the connection, and — depending on the
/// session's negotiated `ErrorRecoveryLevel` — either fails or preserves
/// the owning session.
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// PDU violates an RFC 3720 invariant unrelated to a single field.
    #[error("protocol violation on ITT 0x{itt:08x}: {detail}")]
    ProtocolError { itt: u32, detail: String },

    /// A specific field is out of the range the negotiated parameters allow.
    #[error("invalid field `{field}` on ITT 0x{itt:08x}: {detail}")]
    InvalidPduField {
        itt: u32,
        field: &'static str,
        detail: String,
    },

    /// Allocation failure (command table, SeqBook, backend task). The PDU
    /// is rejected; the initiator is expected to retry.
    #[error("out of resources: {0}")]
    OutOfResources(String),

    /// Data digest (CRC32C over payload+padding) mismatch.
    #[error("data digest mismatch on ITT 0x{itt:08x}")]
    DataDigestError { itt: u32 },

    /// Header digest (CRC32C over BHS+AHS) mismatch.
    #[error("header digest mismatch")]
    HeaderDigestError,

    /// CHAP (or configured) authentication failed during login.
    #[error("authentication failed: {0}")]
    AuthenticationError(String),

    /// A non-zero TSIH in a Login PDU names a session the registry does
    /// not have.
    #[error("session does not exist for TSIH 0x{0:04x}")]
    SessionDoesNotExist(u16),

    /// Adding a connection would exceed the session's negotiated
    /// `MaxConnections`.
    #[error("too many connections for session (limit {limit})")]
    TooManyConnections { limit: u32 },

    /// LUN addressed by a CDB has no backing resolution in the ACL/backend.
    #[error("LUN {0} not found")]
    LunNotFound(u64),

    /// Backend reports the LUN is reserved by another initiator.
    #[error("reservation conflict on LUN {0}")]
    ReservationConflict(u64),

    /// A watchdog (login, DataOUT, NopIn) elapsed without the expected PDU.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// Transport signaled half-close or an I/O error outside of a read/write
    /// call that could itself carry `Io`.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// An internal invariant was violated; the connection is dropped and
    /// the violation logged rather than propagated to the initiator.
    #[error("unrecoverable internal error: {0}")]
    CannotRecover(String),
}

impl IscsiError {
    /// True for errors that should only ever drop the offending PDU /
    /// command, never the whole connection.
    pub fn is_command_level(&self) -> bool {
        matches!(
            self,
            IscsiError::ProtocolError { .. }
                | IscsiError::InvalidPduField { .. }
                | IscsiError::OutOfResources(_)
                | IscsiError::LunNotFound(_)
                | IscsiError::ReservationConflict(_)
        )
    }
}

/// Result type for SCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;

/// Render an RFC 3720 login response status (class, detail) as an
/// operator-facing message: what happened and, where there's an
/// obvious next step, what to check.
pub fn decode_login_status(status_class: u8, status_detail: u8) -> String {
    match (status_class, status_detail) {
        (0x00, _) => "Login successful".to_string(),
        (0x01, 0x01) => {
            "Target moved temporarily: retry against the portal given in the \
             TargetAddress text key".to_string()
        }
        (0x01, 0x02) => {
            "Target moved permanently: update the initiator's configuration \
             to the new TargetAddress".to_string()
        }
        (0x02, 0x00) => "Authentication failure: initiator error (generic)".to_string(),
        (0x02, 0x01) => {
            "Authentication failed: check the CHAP username and password \
             configured on the initiator".to_string()
        }
        (0x02, 0x02) => {
            "Authorization failure: initiator authenticated but is not in \
             the target's ACL (tgtadm --op bind --mode target --name \
             <initiator> to grant access)".to_string()
        }
        (0x02, 0x03) => {
            "Target not found: the requested TargetName doesn't exist on \
             this portal, run SendTargets discovery to list what is available".to_string()
        }
        (0x02, 0x04) => "Target has been removed and is no longer available".to_string(),
        (0x02, 0x05) => {
            "Unsupported version: the initiator's iSCSI version range does \
             not overlap what this target supports".to_string()
        }
        (0x02, 0x06) => {
            "Too many connections: the session has reached its negotiated \
             MaxConnections, close an existing connection before adding a new one".to_string()
        }
        (0x02, 0x07) => {
            "Missing parameter: a required login key (InitiatorName, \
             TargetName) was not present".to_string()
        }
        (0x02, 0x08) => {
            "Cannot include in session: this connection cannot be included \
             in the existing session (ISID/TSIH or parameter mismatch)".to_string()
        }
        (0x02, 0x09) => {
            "Session type not supported: the target does not offer the \
             requested SessionType, use SendTargets discovery to see \
             supported TargetName values".to_string()
        }
        (0x02, 0x0A) => "Session does not exist for the given TSIH".to_string(),
        (0x02, 0x0B) => "Invalid request during login: the PDU is not allowed before login completes".to_string(),
        (0x03, 0x00) => "Target error: generic target failure".to_string(),
        (0x03, 0x01) => {
            "Service unavailable: target is temporarily unavailable, wait \
             and retry the login".to_string()
        }
        (0x03, 0x02) => {
            "Out of resources: target cannot allocate a new session or \
             connection right now".to_string()
        }
        _ => format!(
            "Unknown or unrecognized login status 0x{status_class:02x}{status_detail:02x} \
             (see RFC 3720 section 10.13.5 for the full status code table)"
        ),
    }
}
