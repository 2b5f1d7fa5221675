//! Text-key negotiation (RFC 3720 Section 11 / 12): a keyed store of the
//! operational parameters exchanged during Login (and, for a handful of
//! keys, Text) negotiation.
//!
//! Each recognized key carries a negotiation rule — minimum, maximum,
//! boolean AND, boolean OR, or "declare and move on" — applied in
//! [`NegotiatedParams::apply_initiator_value`]. The struct is built fresh
//! from defaults at the start of every login and is folded into
//! [`crate::session::SessionParams`] at the Operational→FullFeature
//! transition; it does not survive past login.

use crate::digest::DigestType;
use crate::error::{IscsiError, ScsiResult};

/// One value offered or declared during negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bool(bool),
    Numeric(u32),
    Text(String),
}

/// How a key's final value is derived from the initiator's proposal and
/// the target's own default/limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRule {
    /// Result is `min(target_limit, initiator_value)`.
    Minimum,
    /// Result is `max(target_floor, initiator_value)`.
    Maximum,
    /// Result is `target_value AND initiator_value`.
    BooleanAnd,
    /// Result is `target_value OR initiator_value`.
    BooleanOr,
    /// The initiator's value is taken as-is (declarative keys such as
    /// `InitiatorName`, `TargetName`, `SessionType`).
    Declarative,
}

/// The well-known operational keys this target negotiates. Keys outside
/// this set are answered with `NotUnderstood` (text value `"Irrelevant"`),
/// per spec: only `SendTargets=All` is implemented among keys this set
/// does not cover, and that one is handled directly in the Text phase
/// rather than through `NegotiatedParams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKey {
    InitiatorName,
    InitiatorAlias,
    TargetName,
    TargetAlias,
    SessionType,
    MaxConnections,
    MaxRecvDataSegmentLength,
    MaxBurstLength,
    FirstBurstLength,
    DefaultTime2Wait,
    DefaultTime2Retain,
    MaxOutstandingR2T,
    DataPduInOrder,
    DataSequenceInOrder,
    ErrorRecoveryLevel,
    ImmediateData,
    InitialR2T,
    HeaderDigest,
    DataDigest,
}

impl ParamKey {
    pub fn from_key_name(name: &str) -> Option<Self> {
        Some(match name {
            "InitiatorName" => ParamKey::InitiatorName,
            "InitiatorAlias" => ParamKey::InitiatorAlias,
            "TargetName" => ParamKey::TargetName,
            "TargetAlias" => ParamKey::TargetAlias,
            "SessionType" => ParamKey::SessionType,
            "MaxConnections" => ParamKey::MaxConnections,
            "MaxRecvDataSegmentLength" => ParamKey::MaxRecvDataSegmentLength,
            "MaxBurstLength" => ParamKey::MaxBurstLength,
            "FirstBurstLength" => ParamKey::FirstBurstLength,
            "DefaultTime2Wait" => ParamKey::DefaultTime2Wait,
            "DefaultTime2Retain" => ParamKey::DefaultTime2Retain,
            "MaxOutstandingR2T" => ParamKey::MaxOutstandingR2T,
            "DataPDUInOrder" => ParamKey::DataPduInOrder,
            "DataSequenceInOrder" => ParamKey::DataSequenceInOrder,
            "ErrorRecoveryLevel" => ParamKey::ErrorRecoveryLevel,
            "ImmediateData" => ParamKey::ImmediateData,
            "InitialR2T" => ParamKey::InitialR2T,
            "HeaderDigest" => ParamKey::HeaderDigest,
            "DataDigest" => ParamKey::DataDigest,
            _ => return None,
        })
    }

    pub fn rule(&self) -> NegotiationRule {
        match self {
            ParamKey::InitiatorName
            | ParamKey::InitiatorAlias
            | ParamKey::TargetName
            | ParamKey::TargetAlias
            | ParamKey::SessionType => NegotiationRule::Declarative,
            ParamKey::MaxConnections
            | ParamKey::MaxRecvDataSegmentLength
            | ParamKey::MaxBurstLength
            | ParamKey::FirstBurstLength
            | ParamKey::DefaultTime2Wait
            | ParamKey::MaxOutstandingR2T => NegotiationRule::Minimum,
            ParamKey::DefaultTime2Retain | ParamKey::ErrorRecoveryLevel => {
                NegotiationRule::Minimum
            }
            ParamKey::DataPduInOrder | ParamKey::DataSequenceInOrder | ParamKey::ImmediateData => {
                NegotiationRule::BooleanAnd
            }
            ParamKey::InitialR2T => NegotiationRule::BooleanOr,
            ParamKey::HeaderDigest | ParamKey::DataDigest => NegotiationRule::Declarative,
        }
    }
}

/// Parse a boolean text value (`"Yes"`/`"No"`) per RFC 3720 Section 11.
pub fn parse_bool(value: &str) -> ScsiResult<bool> {
    match value {
        "Yes" => Ok(true),
        "No" => Ok(false),
        other => Err(IscsiError::InvalidPduField {
            itt: 0,
            field: "boolean-param",
            detail: format!("expected Yes/No, got `{other}`"),
        }),
    }
}

pub fn bool_to_text(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

/// Negotiate a numeric key using [`NegotiationRule::Minimum`].
pub fn negotiate_min(target_limit: u32, initiator_value: u32) -> u32 {
    target_limit.min(initiator_value)
}

/// Negotiate a numeric key using [`NegotiationRule::Maximum`].
pub fn negotiate_max(target_floor: u32, initiator_value: u32) -> u32 {
    target_floor.max(initiator_value)
}

/// Choose the preferred digest when both ends may offer more than one
/// comma-separated alternative; the target always prefers `None` unless
/// explicitly configured to require CRC32C, matching the teacher's
/// existing digest negotiation shape in `session.rs`.
pub fn negotiate_digest(initiator_offer: &str, require_digest: bool) -> DigestType {
    let offers_crc32c = initiator_offer.split(',').any(|v| v == "CRC32C");
    if require_digest && offers_crc32c {
        DigestType::Crc32c
    } else if !require_digest && offers_crc32c {
        // Target prefers None when not configured to require it, but will
        // accept CRC32C if that's the initiator's only offer.
        if initiator_offer.split(',').any(|v| v == "None") {
            DigestType::None
        } else {
            DigestType::Crc32c
        }
    } else {
        DigestType::None
    }
}
