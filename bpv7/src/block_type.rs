/// Canonical block types.
///
/// `CustodyAcceptPayload` never appears on the wire under its own number:
/// RFC 9171 insists the payload block is type 1, so the encoder demotes it
/// and the decoder promotes it back when the bundle's admin-record flag is
/// set. `CustodyTracking` uses a number from the private/experimental range
/// (192-255).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockType {
    Payload,
    PreviousNode,
    BundleAge,
    HopCount,
    /// BPsec block integrity (stub, carried opaque).
    BlockIntegrity,
    /// BPsec block confidentiality (stub, carried opaque).
    BlockSecurity,
    CustodyTracking,
    /// Internal: a payload whose content is a custody-acceptance admin
    /// record.
    CustodyAcceptPayload,
    Unrecognised(u64),
}

impl BlockType {
    /// The number emitted on the wire; special payload variants are
    /// demoted to the mandatory type-1 payload.
    pub fn wire_value(&self) -> u64 {
        match self {
            BlockType::CustodyAcceptPayload => 1,
            other => u64::from(*other),
        }
    }

    /// True for the block types that fulfil the RFC 9171 payload-block
    /// requirement.
    pub fn is_payload(&self) -> bool {
        matches!(self, BlockType::Payload | BlockType::CustodyAcceptPayload)
    }
}

impl From<u64> for BlockType {
    fn from(value: u64) -> Self {
        match value {
            1 => Self::Payload,
            6 => Self::PreviousNode,
            7 => Self::BundleAge,
            10 => Self::HopCount,
            11 => Self::BlockIntegrity,
            12 => Self::BlockSecurity,
            192 => Self::CustodyTracking,
            v => Self::Unrecognised(v),
        }
    }
}

impl From<BlockType> for u64 {
    fn from(value: BlockType) -> Self {
        match value {
            BlockType::Payload => 1,
            BlockType::PreviousNode => 6,
            BlockType::BundleAge => 7,
            BlockType::HopCount => 10,
            BlockType::BlockIntegrity => 11,
            BlockType::BlockSecurity => 12,
            BlockType::CustodyTracking => 192,
            // internal value, never emitted; see wire_value()
            BlockType::CustodyAcceptPayload => 1,
            BlockType::Unrecognised(v) => v,
        }
    }
}
