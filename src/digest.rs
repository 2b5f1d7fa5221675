//! CRC32C (Castagnoli) header/data digests, RFC 3720 Section 3.2.2.1
//!
//! Header digest covers the BHS plus any AHS; data digest covers the
//! payload plus its padding to a 4-byte boundary. Both are the same
//! polynomial, only the covered bytes differ.

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder};

/// Which digest, if any, a connection negotiated for a given direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestType {
    #[default]
    None,
    Crc32c,
}

impl DigestType {
    pub fn from_negotiated(key_value: &str) -> Self {
        match key_value {
            "CRC32C" => DigestType::Crc32c,
            _ => DigestType::None,
        }
    }

    pub fn as_key_value(&self) -> &'static str {
        match self {
            DigestType::None => "None",
            DigestType::Crc32c => "CRC32C",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DigestType::None => 0,
            DigestType::Crc32c => 4,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, DigestType::Crc32c)
    }
}

/// Compute the CRC32C of a byte slice in one shot.
pub fn crc32c(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// Incremental CRC32C accumulator for streaming header/data verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32cHasher {
    state: u32,
}

impl Crc32cHasher {
    pub fn new() -> Self {
        Self { state: 0 }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.state = crc32c::crc32c_append(self.state, bytes);
    }

    pub fn finish(&self) -> u32 {
        self.state
    }
}

/// Encode a digest value in network byte order.
pub fn encode_digest(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    buf
}

/// Verify `expected` (as read off the wire) against the CRC32C of `data`,
/// returning the appropriate typed error on mismatch.
pub fn verify_data_digest(data: &[u8], expected: u32, itt: u32) -> ScsiResult<()> {
    let actual = crc32c(data);
    if actual != expected {
        return Err(IscsiError::DataDigestError { itt });
    }
    Ok(())
}

pub fn verify_header_digest(header: &[u8], expected: u32) -> ScsiResult<()> {
    let actual = crc32c(header);
    if actual != expected {
        return Err(IscsiError::HeaderDigestError);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_known_vector() {
        // "123456789" is the standard CRC32C check vector.
        assert_eq!(crc32c(b"123456789"), 0xE3069283);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let one_shot = crc32c(data);

        let mut hasher = Crc32cHasher::new();
        hasher.write(&data[..10]);
        hasher.write(&data[10..]);
        assert_eq!(hasher.finish(), one_shot);
    }

    #[test]
    fn digest_type_round_trips_key_value() {
        assert_eq!(DigestType::from_negotiated("CRC32C"), DigestType::Crc32c);
        assert_eq!(DigestType::from_negotiated("None"), DigestType::None);
        assert_eq!(DigestType::Crc32c.as_key_value(), "CRC32C");
        assert_eq!(DigestType::Crc32c.len(), 4);
        assert_eq!(DigestType::None.len(), 0);
    }

    #[test]
    fn verify_data_digest_detects_mismatch() {
        let data = b"payload bytes";
        let good = crc32c(data);
        assert!(verify_data_digest(data, good, 1).is_ok());
        assert!(verify_data_digest(data, good.wrapping_add(1), 1).is_err());
    }
}
