use super::*;

/// Fragment placement fields, present when the fragment flag is set.
///
/// Carried through storage untouched; the agent performs no reassembly.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    pub offset: u64,
    pub total_adu_length: u64,
}

/// The decoded logical primary block.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PrimaryBlock {
    pub flags: BundleFlags,
    pub crc_type: CrcType,
    pub destination: Eid,
    pub source: Eid,
    pub report_to: Eid,
    pub timestamp: CreationTimestamp,
    /// Bundle lifetime in milliseconds.
    pub lifetime: u64,
    pub fragment_info: Option<FragmentInfo>,
    /// The CRC carried by (or computed for) the encoded form.
    pub crc_value: u64,
}

impl PrimaryBlock {
    /// Encodes the block as a definite-length CBOR array with the CRC
    /// patched in, returning the bytes and the CRC value.
    ///
    /// The field count is predicted up front: 8 fixed fields, two more when
    /// the fragment flag is set, one more when a CRC is attached.
    pub fn emit(&self) -> (Vec<u8>, u64) {
        let mut count = 8;
        if self.flags.is_fragment {
            count += 2;
        }
        if self.crc_type != CrcType::None {
            count += 1;
        }

        let body = tern_cbor::encode::emit(|a| {
            a.emit_array(Some(count), |a| {
                a.emit_uint(7);
                a.emit_uint(u64::from(self.flags));
                a.emit_uint(u64::from(self.crc_type));
                self.destination.emit(a);
                self.source.emit(a);
                self.report_to.emit(a);
                self.timestamp.emit(a);
                a.emit_uint(self.lifetime);
                if let Some(fragment_info) = &self.fragment_info {
                    a.emit_uint(fragment_info.offset);
                    a.emit_uint(fragment_info.total_adu_length);
                }
                // the CRC field itself is appended outside the closure so
                // the digest can cover the array header bytes
            });
        });

        crc::append_crc_value(self.crc_type, body)
    }

    /// Decodes a primary block from the start of `data`, validating the
    /// CRC. Returns the block and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), Error> {
        let mut d = tern_cbor::decode::Decoder::new(data);
        let definite = match d.parse_array_header()? {
            tern_cbor::decode::ArrayLength::Definite(_) => true,
            tern_cbor::decode::ArrayLength::Indefinite => false,
        };

        let version = d.parse_uint()?;
        if version != 7 {
            return Err(Error::UnsupportedVersion(version));
        }

        let flags = BundleFlags::from(d.parse_uint()?);
        let crc_type = CrcType::try_from(d.parse_uint()?)?;
        let destination = Eid::parse(&mut d)?;
        let source = Eid::parse(&mut d)?;
        let report_to = Eid::parse(&mut d)?;
        let timestamp = CreationTimestamp::parse(&mut d)?;
        let lifetime = d.parse_uint()?;

        let fragment_info = if flags.is_fragment {
            Some(FragmentInfo {
                offset: d.parse_uint()?,
                total_adu_length: d.parse_uint()?,
            })
        } else {
            None
        };

        let crc_value = if crc_type != CrcType::None {
            let value = d.parse_bytes()?;
            let end = d.offset();
            let range = end - value.len()..end;
            // the CRC covers the block only, never a trailing break code
            let checked = crc::check_crc_value(crc_type, &data[..end], range)?;
            if !definite {
                d.parse_break()?;
            }
            checked
        } else {
            if !definite {
                d.parse_break()?;
            }
            0
        };

        Ok((
            Self {
                flags,
                crc_type,
                destination,
                source,
                report_to,
                timestamp,
                lifetime,
                fragment_info,
                crc_value,
            },
            d.offset(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn sample() -> PrimaryBlock {
        PrimaryBlock {
            flags: BundleFlags {
                must_not_fragment: true,
                ..Default::default()
            },
            crc_type: CrcType::Crc16X25,
            destination: Eid::Ipn {
                node: 200,
                service: 1,
            },
            source: Eid::Ipn {
                node: 100,
                service: 1,
            },
            report_to: Eid::Ipn {
                node: 100,
                service: 1,
            },
            timestamp: CreationTimestamp {
                time: DtnTime::new(755533838904),
                sequence_number: 0,
            },
            lifetime: 3600000,
            fragment_info: None,
            crc_value: 0,
        }
    }

    #[test]
    fn emit_known_vector() {
        let (bytes, crc) = sample().emit();
        assert_eq!(
            bytes,
            hex!(
                "89 07 04 01"
                "82 02 82 18c8 01"
                "82 02 82 1864 01"
                "82 02 82 1864 01"
                "82 1b 000000afe9537a38 00"
                "1a 0036ee80"
                "42 0b19"
            )
        );
        assert_eq!(crc, 0x0B19);
    }

    #[test]
    fn parse_round_trip() {
        let (bytes, crc) = sample().emit();
        let (parsed, len) = PrimaryBlock::parse(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed.crc_value, crc);

        let mut expected = sample();
        expected.crc_value = crc;
        assert_eq!(parsed, expected);
    }

    #[test]
    fn fragment_fields_round_trip() {
        let mut block = sample();
        block.flags.is_fragment = true;
        block.fragment_info = Some(FragmentInfo {
            offset: 1024,
            total_adu_length: 4096,
        });
        let (bytes, crc) = block.emit();
        // 8 fixed + 2 fragment + CRC
        assert_eq!(bytes[0], 0x8B);
        let (parsed, _) = PrimaryBlock::parse(&bytes).unwrap();
        assert_eq!(parsed.fragment_info, block.fragment_info);
        assert_eq!(parsed.crc_value, crc);
    }

    #[test]
    fn wrong_version_rejected_before_other_fields() {
        // array(9), version 6, then deliberately un-decodable garbage
        let bytes = hex!("89 06 ff ff ff");
        assert!(matches!(
            PrimaryBlock::parse(&bytes),
            Err(Error::UnsupportedVersion(6))
        ));
    }

    #[test]
    fn corrupted_crc_rejected() {
        let (mut bytes, _) = sample().emit();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            PrimaryBlock::parse(&bytes),
            Err(Error::InvalidCrc(crc::CrcError::IncorrectCrc))
        ));
    }
}
