/*!
The memory substrate of the tern DTN agent.

Everything the agent manipulates at runtime lives in a [`pool::Pool`]: a
fixed-population arena of typed, reference-counted blocks. On top of the
arena this crate provides the red-black tree used by every ordered index
([`rbtree`]), bounded flow queues with active-flow scheduling ([`flows`]),
and chunked CBOR byte streams with online CRC ([`stream`]).
*/

pub mod flows;
pub mod pool;
pub mod rbtree;
pub mod stream;

mod handle;

pub use handle::Handle;
pub use pool::{
    AllocPriority, BlockContent, BlockId, BlockType, CanonicalBlockData, CborChunk, DeliveryData,
    DeliveryPolicy, GenericData, Magic, Pool, PoolCounts, PrimaryBlockData, RecycleNotice, Ref,
};
