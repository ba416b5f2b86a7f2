/*!
CRC handling for bundle blocks as specified in RFC 9171.

Both supported algorithms are table-driven digests from the `crc` crate. The
CRC of a block is circular: it covers every byte of the encoded block
including the CBOR byte-string markup of the CRC field itself, with the CRC
value bytes treated as zeros. The encoder therefore emits a zero placeholder
and patches the finalized value in afterwards; the decoder re-runs the same
procedure to validate.
*/

use thiserror::Error;

pub const X25: ::crc::Crc<u16> = ::crc::Crc::<u16>::new(&::crc::CRC_16_IBM_SDLC);
pub const CASTAGNOLI: ::crc::Crc<u32> = ::crc::Crc::<u32>::new(&::crc::CRC_32_ISCSI);

/// Errors that can occur during CRC processing.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CrcError {
    /// An unrecognised CRC type number.
    #[error("Invalid CRC type {0}")]
    InvalidType(u64),

    /// The CRC byte string did not have the width the CRC type implies.
    #[error("Block has unexpected CRC value length {0}")]
    InvalidLength(usize),

    /// A block with CRC type `none` carried a CRC value anyway.
    #[error("Block has a CRC value with no CRC type specified")]
    UnexpectedCrcValue,

    /// The computed CRC does not match the one carried in the block.
    #[error("Incorrect CRC value")]
    IncorrectCrc,
}

/// The CRC algorithm applied to a block.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CrcType {
    #[default]
    None,
    Crc16X25,
    Crc32Castagnoli,
}

impl CrcType {
    /// Width of the CRC value in bytes; zero for `None`.
    pub fn width(&self) -> usize {
        match self {
            CrcType::None => 0,
            CrcType::Crc16X25 => 2,
            CrcType::Crc32Castagnoli => 4,
        }
    }
}

impl TryFrom<u64> for CrcType {
    type Error = CrcError;

    fn try_from(value: u64) -> Result<Self, CrcError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Crc16X25),
            2 => Ok(Self::Crc32Castagnoli),
            v => Err(CrcError::InvalidType(v)),
        }
    }
}

impl From<CrcType> for u64 {
    fn from(value: CrcType) -> Self {
        match value {
            CrcType::None => 0,
            CrcType::Crc16X25 => 1,
            CrcType::Crc32Castagnoli => 2,
        }
    }
}

/// Computes a one-shot CRC of `data` under the given algorithm.
/// `None` returns 0 and costs nothing.
pub fn compute(crc_type: CrcType, data: &[u8]) -> u64 {
    match crc_type {
        CrcType::None => 0,
        CrcType::Crc16X25 => X25.checksum(data) as u64,
        CrcType::Crc32Castagnoli => CASTAGNOLI.checksum(data) as u64,
    }
}

/// Appends the CBOR byte-string CRC field to an encoded block.
///
/// The digest runs over the block bytes emitted so far, the byte-string
/// header just appended, and a zero placeholder of the CRC's width; the
/// finalized value then replaces the placeholder. Returns the patched block
/// and the CRC value.
pub fn append_crc_value(crc_type: CrcType, mut data: Vec<u8>) -> (Vec<u8>, u64) {
    match crc_type {
        CrcType::None => (data, 0),
        CrcType::Crc16X25 => {
            data.push(0x42);
            let mut digest = X25.digest();
            digest.update(&data);
            digest.update(&[0; 2]);
            let crc = digest.finalize();
            data.extend_from_slice(&crc.to_be_bytes());
            (data, crc as u64)
        }
        CrcType::Crc32Castagnoli => {
            data.push(0x44);
            let mut digest = CASTAGNOLI.digest();
            digest.update(&data);
            digest.update(&[0; 4]);
            let crc = digest.finalize();
            data.extend_from_slice(&crc.to_be_bytes());
            (data, crc as u64)
        }
    }
}

/// Validates the CRC of a decoded block.
///
/// `block` is the full encoded block (array header through CRC field);
/// `crc_range` is the byte range of the CRC value within it. Returns the
/// carried CRC value on success.
pub fn check_crc_value(
    crc_type: CrcType,
    block: &[u8],
    crc_range: core::ops::Range<usize>,
) -> Result<u64, CrcError> {
    let width = crc_range.len();
    if width != crc_type.width() {
        return if crc_type == CrcType::None {
            Err(CrcError::UnexpectedCrcValue)
        } else {
            Err(CrcError::InvalidLength(width))
        };
    }

    match crc_type {
        CrcType::None => Ok(0),
        CrcType::Crc16X25 => {
            let carried = u16::from_be_bytes(
                block[crc_range.clone()]
                    .try_into()
                    .map_err(|_| CrcError::InvalidLength(width))?,
            );
            let mut digest = X25.digest();
            digest.update(&block[..crc_range.start]);
            digest.update(&[0; 2]);
            digest.update(&block[crc_range.end..]);
            if digest.finalize() != carried {
                Err(CrcError::IncorrectCrc)
            } else {
                Ok(carried as u64)
            }
        }
        CrcType::Crc32Castagnoli => {
            let carried = u32::from_be_bytes(
                block[crc_range.clone()]
                    .try_into()
                    .map_err(|_| CrcError::InvalidLength(width))?,
            );
            let mut digest = CASTAGNOLI.digest();
            digest.update(&block[..crc_range.start]);
            digest.update(&[0; 4]);
            digest.update(&block[crc_range.end..]);
            if digest.finalize() != carried {
                Err(CrcError::IncorrectCrc)
            } else {
                Ok(carried as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // finalize of zero bytes under X25
        assert_eq!(compute(CrcType::Crc16X25, &[]), 0x0000);
        // the classic check vector under Castagnoli
        assert_eq!(compute(CrcType::Crc32Castagnoli, b"123456789"), 0xE3069283);
        // none is free
        assert_eq!(compute(CrcType::None, b"123456789"), 0);
    }

    #[test]
    fn append_then_check_round_trip() {
        let block = vec![0x85, 0x01, 0x01, 0x00, 0x01];
        let (patched, crc) = append_crc_value(CrcType::Crc16X25, block);
        let crc_range = patched.len() - 2..patched.len();
        assert_eq!(
            check_crc_value(CrcType::Crc16X25, &patched, crc_range).unwrap(),
            crc
        );
    }

    #[test]
    fn corrupted_block_detected() {
        let (mut patched, _) = append_crc_value(CrcType::Crc32Castagnoli, vec![0x01, 0x02]);
        patched[0] ^= 0xFF;
        let crc_range = patched.len() - 4..patched.len();
        assert_eq!(
            check_crc_value(CrcType::Crc32Castagnoli, &patched, crc_range),
            Err(CrcError::IncorrectCrc)
        );
    }
}
