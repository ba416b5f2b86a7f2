use super::*;
use core::ops::Range;

/// The logical fields of a canonical block, excluding its content.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalBlock {
    pub block_type: BlockType,
    pub block_num: u64,
    pub flags: BlockFlags,
    pub crc_type: CrcType,
    pub crc_value: u64,
}

impl Default for CanonicalBlock {
    fn default() -> Self {
        Self {
            block_type: BlockType::Payload,
            block_num: 1,
            flags: BlockFlags::default(),
            crc_type: CrcType::None,
            crc_value: 0,
        }
    }
}

/// Typed content of the extension blocks the agent understands; everything
/// else (including the plain payload) is carried opaque, with the content
/// bytes owned by whatever holds the encoded block.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionData {
    PreviousNode(Eid),
    /// Milliseconds the bundle has spent in the network.
    BundleAge(u64),
    HopCount {
        limit: u64,
        count: u64,
    },
    /// The custodian currently responsible for the bundle.
    CustodyTracking(Eid),
    /// A custody acknowledgement masquerading as the payload block.
    CustodyAccept(CustodyAcceptPayload),
    Opaque,
}

impl ExtensionData {
    /// Encodes structured content to its inner CBOR form; `None` for
    /// opaque content, which the caller owns.
    pub fn emit_content(&self) -> Option<Vec<u8>> {
        match self {
            ExtensionData::PreviousNode(eid) => {
                Some(tern_cbor::encode::emit(|e| eid.emit(e)))
            }
            ExtensionData::BundleAge(age) => {
                Some(tern_cbor::encode::emit(|e| e.emit_uint(*age)))
            }
            ExtensionData::HopCount { limit, count } => Some(tern_cbor::encode::emit(|e| {
                e.emit_array(Some(2), |a| {
                    a.emit_uint(*limit);
                    a.emit_uint(*count);
                })
            })),
            ExtensionData::CustodyTracking(custodian) => {
                Some(tern_cbor::encode::emit(|e| custodian.emit(e)))
            }
            ExtensionData::CustodyAccept(payload) => {
                Some(tern_cbor::encode::emit(|e| payload.emit(e)))
            }
            ExtensionData::Opaque => None,
        }
    }

    /// Interprets block content after the outer decode. A type-1 payload in
    /// an admin-record bundle is decoded as an admin record and the block
    /// type promoted to the specific variant.
    pub fn parse_content(
        block_type: BlockType,
        content: &[u8],
        is_admin_record: bool,
    ) -> Result<(BlockType, Self), Error> {
        let mut d = tern_cbor::decode::Decoder::new(content);
        match block_type {
            BlockType::Payload if is_admin_record => {
                let payload = CustodyAcceptPayload::parse(&mut d)?;
                Ok((
                    BlockType::CustodyAcceptPayload,
                    ExtensionData::CustodyAccept(payload),
                ))
            }
            BlockType::PreviousNode => {
                let eid = Eid::parse(&mut d)
                    .map_err(|_| Error::MalformedExtension("previous node"))?;
                Ok((block_type, ExtensionData::PreviousNode(eid)))
            }
            BlockType::BundleAge => {
                let age = d
                    .parse_uint()
                    .map_err(|_| Error::MalformedExtension("bundle age"))?;
                Ok((block_type, ExtensionData::BundleAge(age)))
            }
            BlockType::HopCount => {
                match d.parse_array_header() {
                    Ok(tern_cbor::decode::ArrayLength::Definite(2)) => {}
                    _ => return Err(Error::MalformedExtension("hop count")),
                }
                let limit = d
                    .parse_uint()
                    .map_err(|_| Error::MalformedExtension("hop count"))?;
                let count = d
                    .parse_uint()
                    .map_err(|_| Error::MalformedExtension("hop count"))?;
                Ok((block_type, ExtensionData::HopCount { limit, count }))
            }
            BlockType::CustodyTracking => {
                let custodian = Eid::parse(&mut d)
                    .map_err(|_| Error::MalformedExtension("custody tracking"))?;
                Ok((block_type, ExtensionData::CustodyTracking(custodian)))
            }
            _ => Ok((block_type, ExtensionData::Opaque)),
        }
    }
}

impl CanonicalBlock {
    /// Encodes the block with the given content bytes, returning the block
    /// bytes, the range occupied by the content within them, and the CRC.
    ///
    /// Special payload variants are demoted to the mandatory wire type 1.
    pub fn emit_with_content(&self, content: &[u8]) -> (Vec<u8>, Range<usize>, u64) {
        let mut count = 5;
        if self.crc_type != CrcType::None {
            count += 1;
        }

        let mut content_range = 0..0;
        let body = tern_cbor::encode::emit(|a| {
            a.emit_array(Some(count), |a| {
                a.emit_uint(self.block_type.wire_value());
                a.emit_uint(self.block_num);
                a.emit_uint(u64::from(self.flags));
                a.emit_uint(u64::from(self.crc_type));
                a.emit_bytes_header(content.len());
                let start = a.offset();
                a.emit_raw(content);
                content_range = start..a.offset();
            });
        });

        let (bytes, crc_value) = crc::append_crc_value(self.crc_type, body);
        (bytes, content_range, crc_value)
    }

    /// Decodes a canonical block from the start of `data`, validating the
    /// CRC and interpreting structured content. Returns the block, its
    /// content, the content's byte range within `data`, and the total
    /// length consumed.
    pub fn parse(
        data: &[u8],
        is_admin_record: bool,
    ) -> Result<(Self, ExtensionData, Range<usize>, usize), Error> {
        let mut d = tern_cbor::decode::Decoder::new(data);
        let definite = match d.parse_array_header()? {
            tern_cbor::decode::ArrayLength::Definite(_) => true,
            tern_cbor::decode::ArrayLength::Indefinite => false,
        };

        let block_type = BlockType::from(d.parse_uint()?);
        let block_num = d.parse_uint()?;
        let flags = BlockFlags::from(d.parse_uint()?);
        let crc_type = CrcType::try_from(d.parse_uint()?)?;

        let content = d.parse_bytes()?;
        let content_end = d.offset();
        let content_range = content_end - content.len()..content_end;

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

        let (block_type, extension) =
            ExtensionData::parse_content(block_type, content, is_admin_record)?;

        Ok((
            Self {
                block_type,
                block_num,
                flags,
                crc_type,
                crc_value,
            },
            extension,
            content_range,
            d.offset(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn payload_block_known_vector() {
        let block = CanonicalBlock {
            block_type: BlockType::Payload,
            block_num: 1,
            flags: BlockFlags::default(),
            crc_type: CrcType::Crc16X25,
            crc_value: 0,
        };
        let (bytes, content_range, crc) = block.emit_with_content(&[0xAA; 20]);
        assert_eq!(
            bytes,
            hex!("86 01 01 00 01 54 aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa 42 c68f")
        );
        assert_eq!(crc, 0xC68F);
        assert_eq!(&bytes[content_range], &[0xAA; 20]);
    }

    #[test]
    fn parse_round_trip() {
        let block = CanonicalBlock {
            block_type: BlockType::Payload,
            block_num: 1,
            flags: BlockFlags::default(),
            crc_type: CrcType::Crc32Castagnoli,
            crc_value: 0,
        };
        let (bytes, _, crc) = block.emit_with_content(b"hello");
        let (parsed, ext, range, len) = CanonicalBlock::parse(&bytes, false).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(parsed.block_type, BlockType::Payload);
        assert_eq!(parsed.crc_value, crc);
        assert_eq!(ext, ExtensionData::Opaque);
        assert_eq!(&bytes[range], b"hello");
    }

    #[test]
    fn extension_blocks_round_trip() {
        for (block_type, ext) in [
            (
                BlockType::PreviousNode,
                ExtensionData::PreviousNode(Eid::Ipn {
                    node: 5,
                    service: 0,
                }),
            ),
            (BlockType::BundleAge, ExtensionData::BundleAge(300000)),
            (
                BlockType::HopCount,
                ExtensionData::HopCount {
                    limit: 30,
                    count: 2,
                },
            ),
            (
                BlockType::CustodyTracking,
                ExtensionData::CustodyTracking(Eid::Ipn {
                    node: 21,
                    service: 64,
                }),
            ),
        ] {
            let block = CanonicalBlock {
                block_type,
                block_num: 2,
                flags: BlockFlags::default(),
                crc_type: CrcType::Crc16X25,
                crc_value: 0,
            };
            let content = ext.emit_content().unwrap();
            let (bytes, _, _) = block.emit_with_content(&content);
            let (parsed, parsed_ext, _, _) = CanonicalBlock::parse(&bytes, false).unwrap();
            assert_eq!(parsed.block_type, block_type);
            assert_eq!(parsed_ext, ext);
        }
    }

    #[test]
    fn admin_record_promoted_on_parse() {
        let payload = CustodyAcceptPayload {
            flow_source_eid: Eid::Ipn {
                node: 10,
                service: 3,
            },
            sequence_nums: [7].into_iter().collect(),
        };
        let block = CanonicalBlock {
            block_type: BlockType::CustodyAcceptPayload,
            block_num: 1,
            flags: BlockFlags::default(),
            crc_type: CrcType::Crc16X25,
            crc_value: 0,
        };
        let content = ExtensionData::CustodyAccept(payload.clone())
            .emit_content()
            .unwrap();
        let (bytes, _, _) = block.emit_with_content(&content);

        // the wire carries a type-1 payload block
        assert_eq!(bytes[1], 0x01);

        // decoded without the admin flag it stays opaque
        let (parsed, ext, _, _) = CanonicalBlock::parse(&bytes, false).unwrap();
        assert_eq!(parsed.block_type, BlockType::Payload);
        assert_eq!(ext, ExtensionData::Opaque);

        // with the admin flag it is promoted to the specific type
        let (parsed, ext, _, _) = CanonicalBlock::parse(&bytes, true).unwrap();
        assert_eq!(parsed.block_type, BlockType::CustodyAcceptPayload);
        assert_eq!(ext, ExtensionData::CustodyAccept(payload));
    }
}
