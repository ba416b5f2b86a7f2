/*!
BPv7 block formats as defined in RFC 9171.

This crate covers the logical representations and the wire codec for the
primary block, canonical blocks (payload plus the extension block types the
agent understands), and administrative records. Encoding produces
self-contained per-block byte vectors with the CRC already patched in; the
agent layers above decide where those bytes live.
*/

mod admin_record;
mod block_flags;
mod block_type;
mod bundle_flags;
mod canonical_block;
mod creation_timestamp;
mod dtn_time;
mod eid;
mod error;
mod primary_block;

pub mod crc;

pub use admin_record::{
    ADMIN_RECORD_TYPE_CUSTODY_ACK, CustodyAcceptPayload, DACS_MAX_SEQ_PER_PAYLOAD,
};
pub use block_flags::BlockFlags;
pub use block_type::BlockType;
pub use bundle_flags::BundleFlags;
pub use canonical_block::{CanonicalBlock, ExtensionData};
pub use crc::CrcType;
pub use creation_timestamp::CreationTimestamp;
pub use dtn_time::DtnTime;
pub use eid::Eid;
pub use error::Error;
pub use primary_block::{FragmentInfo, PrimaryBlock};
