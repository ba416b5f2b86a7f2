/*!
A cursor-style CBOR decoder over a contiguous byte slice.

The [`Decoder`] tracks its position as items are parsed, so a caller that
needs to know where an item landed (e.g. to CRC a byte range) reads
[`Decoder::offset`] before and after parsing it.
*/

use thiserror::Error;

/// Errors that can occur while decoding CBOR data.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The input ended in the middle of an item.
    #[error("Input truncated mid-item")]
    Truncated,

    /// A different major type was found than the one requested.
    #[error("Expected {expected}, found major type {actual}")]
    IncorrectType {
        expected: &'static str,
        actual: u8,
    },

    /// An additional-information value this subset does not support
    /// (floats, tags, indefinite strings, reserved minors).
    #[error("Unsupported additional info {0}")]
    UnsupportedAdditionalInfo(u8),

    /// An integer wider than 64 bits or a length wider than usize.
    #[error("Value out of range")]
    OutOfRange,
}

const MAJOR_UINT: u8 = 0;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;

/// The length of an array header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayLength {
    Definite(usize),
    Indefinite,
}

pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current byte offset into the input.
    #[inline]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// True when every input byte has been consumed.
    #[inline]
    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos.checked_add(n).ok_or(Error::OutOfRange)?;
        if end > self.data.len() {
            return Err(Error::Truncated);
        }
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn peek_byte(&self) -> Result<u8, Error> {
        self.data.get(self.pos).copied().ok_or(Error::Truncated)
    }

    /// Reads a header byte of the given major type and returns its
    /// argument value.
    fn parse_header(&mut self, major: u8, expected: &'static str) -> Result<u64, Error> {
        let b = self.peek_byte()?;
        if b >> 5 != major {
            return Err(Error::IncorrectType {
                expected,
                actual: b >> 5,
            });
        }
        self.pos += 1;
        match b & 0x1F {
            v @ 0..24 => Ok(v as u64),
            24 => Ok(self.take(1)?[0] as u64),
            25 => Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()) as u64),
            26 => Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()) as u64),
            27 => Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap())),
            v => Err(Error::UnsupportedAdditionalInfo(v)),
        }
    }

    /// Parses an unsigned integer.
    pub fn parse_uint(&mut self) -> Result<u64, Error> {
        self.parse_header(MAJOR_UINT, "unsigned integer")
    }

    /// Parses a definite-length byte string, returning a borrow of its
    /// content.
    pub fn parse_bytes(&mut self) -> Result<&'a [u8], Error> {
        let len = self.parse_header(MAJOR_BYTES, "byte string")?;
        self.take(usize::try_from(len).map_err(|_| Error::OutOfRange)?)
    }

    /// Parses a definite-length text string.
    pub fn parse_text(&mut self) -> Result<&'a str, Error> {
        let len = self.parse_header(MAJOR_TEXT, "text string")?;
        let raw = self.take(usize::try_from(len).map_err(|_| Error::OutOfRange)?)?;
        core::str::from_utf8(raw).map_err(|_| Error::OutOfRange)
    }

    /// Parses an array header, definite or indefinite.
    pub fn parse_array_header(&mut self) -> Result<ArrayLength, Error> {
        let b = self.peek_byte()?;
        if b == 0x9F {
            self.pos += 1;
            return Ok(ArrayLength::Indefinite);
        }
        let len = self.parse_header(MAJOR_ARRAY, "array")?;
        Ok(ArrayLength::Definite(
            usize::try_from(len).map_err(|_| Error::OutOfRange)?,
        ))
    }

    /// True if the next byte is the break code (does not consume it).
    pub fn at_break(&self) -> bool {
        matches!(self.data.get(self.pos), Some(0xFF))
    }

    /// Consumes a break code.
    pub fn parse_break(&mut self) -> Result<(), Error> {
        if self.peek_byte()? != 0xFF {
            return Err(Error::IncorrectType {
                expected: "break",
                actual: self.peek_byte()? >> 5,
            });
        }
        self.pos += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn uints() {
        let data = hex!("00 17 18 18 19 0100 1a 00010000 1b 0000000100000000");
        let mut d = Decoder::new(&data);
        assert_eq!(d.parse_uint().unwrap(), 0);
        assert_eq!(d.parse_uint().unwrap(), 23);
        assert_eq!(d.parse_uint().unwrap(), 24);
        assert_eq!(d.parse_uint().unwrap(), 256);
        assert_eq!(d.parse_uint().unwrap(), 65536);
        assert_eq!(d.parse_uint().unwrap(), u32::MAX as u64 + 1);
        assert!(d.at_end());
    }

    #[test]
    fn arrays_and_breaks() {
        let data = hex!("9f 82 01 02 ff");
        let mut d = Decoder::new(&data);
        assert_eq!(d.parse_array_header().unwrap(), ArrayLength::Indefinite);
        assert_eq!(d.parse_array_header().unwrap(), ArrayLength::Definite(2));
        assert_eq!(d.parse_uint().unwrap(), 1);
        assert_eq!(d.parse_uint().unwrap(), 2);
        assert!(d.at_break());
        d.parse_break().unwrap();
        assert!(d.at_end());
    }

    #[test]
    fn wrong_type_reports_major() {
        let data = hex!("42 aabb");
        let mut d = Decoder::new(&data);
        assert_eq!(
            d.parse_uint(),
            Err(Error::IncorrectType {
                expected: "unsigned integer",
                actual: 2
            })
        );
        assert_eq!(d.parse_bytes().unwrap(), &hex!("aabb"));
    }

    #[test]
    fn truncation() {
        let mut d = Decoder::new(&hex!("19 01"));
        assert_eq!(d.parse_uint(), Err(Error::Truncated));
    }
}
