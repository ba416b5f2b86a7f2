/*!
The memory-pool arena.

Every runtime object of the agent - bundles, canonical blocks, encoded CBOR
chunks, flows, queueable references, module state - lives in a pool slot.
Slots are typed by [`BlockContent`], reference counted, and move between the
free list, the live population and the recycle list; actual destruction is
deferred to [`Pool::maintain`], which drains the recycle list in bounded
batches and recursively recycles owned sub-objects.

Allocation is priority-gated: when the free count drops to the reserve
threshold of the requested priority the allocation is refused. This keeps
headroom for the high-priority allocations (queueable refs) that are needed
to drain storage even when bulk bundle allocation is already refused.
*/

use crate::flows::Flow;
use crate::handle::Handle;
use crate::rbtree::{DuplicateKey, RbTree};
use std::any::Any;
use std::collections::VecDeque;
use tracing::warn;

/// 32-bit signature identifying a registered generic content variant.
pub type Magic = u32;

/// Recycle batch bound per maintenance pass.
const MAINTAIN_BATCH: usize = 20;

/// Handle to a pool slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) u32);

/// Block type discriminant, mirroring the content variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockType {
    Undefined,
    Api,
    Generic,
    CborData,
    Primary,
    Canonical,
    Flow,
    Ref,
}

/// Allocation priority; higher priorities retain less reserve.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AllocPriority {
    Low,
    Medium,
    High,
}

/// How a stored bundle wants to be treated by storage.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Fire and forget.
    #[default]
    None,
    /// Retain until a local CLA has taken the bundle.
    LocalAck,
    /// Retain until a downstream custodian acknowledges custody.
    CustodyTracking,
}

/// Local bookkeeping carried alongside a primary block while the bundle
/// moves through this agent.
#[derive(Debug, Default, Clone)]
pub struct DeliveryData {
    pub delivery_policy: DeliveryPolicy,
    pub ingress_intf_id: Handle,
    pub ingress_time: u64,
    pub egress_intf_id: Handle,
    pub egress_time: u64,
    pub storage_intf_id: Handle,
    pub committed_storage_id: u64,
    /// Local retransmit interval in milliseconds.
    pub local_retx_interval: u64,
}

/// A chunk of encoded CBOR held in one pool block.
#[derive(Debug, Default)]
pub struct CborChunk {
    pub data: Vec<u8>,
}

/// Pool-resident primary block: the logical fields plus the attached
/// canonical block list, the encoded chunks covering the primary block
/// alone, and the encode-size caches.
#[derive(Debug, Default)]
pub struct PrimaryBlockData {
    pub logical: tern_bpv7::PrimaryBlock,
    pub delivery: DeliveryData,
    pub cblocks: Vec<BlockId>,
    pub chunks: Vec<BlockId>,
    pub block_encode_size: Option<usize>,
    pub bundle_encode_size: Option<usize>,
}

/// Pool-resident canonical block: logical fields, typed extension data (or
/// opaque), encoded chunks, and the content's position within them.
#[derive(Debug)]
pub struct CanonicalBlockData {
    pub logical: tern_bpv7::CanonicalBlock,
    pub extension: tern_bpv7::ExtensionData,
    pub chunks: Vec<BlockId>,
    pub encoded_content_offset: usize,
    pub encoded_content_length: usize,
    pub block_encode_size: Option<usize>,
    pub parent: Option<BlockId>,
}

impl Default for CanonicalBlockData {
    fn default() -> Self {
        Self {
            logical: tern_bpv7::CanonicalBlock::default(),
            extension: tern_bpv7::ExtensionData::Opaque,
            chunks: Vec::new(),
            encoded_content_offset: 0,
            encoded_content_length: 0,
            block_encode_size: None,
            parent: None,
        }
    }
}

/// Posted when a queueable ref block carrying a notice is destroyed; the
/// storage interface identified by `intf_id` re-evaluates the entry named
/// by `token`.
#[derive(Debug, Copy, Clone)]
pub struct RecycleNotice {
    pub intf_id: Handle,
    pub token: u64,
}

/// A queueable reference block: pins `target` while it sits on a subq.
#[derive(Debug)]
pub struct RefBlock {
    pub(crate) target: BlockId,
    pub(crate) notice: Option<RecycleNotice>,
}

/// Registered generic content: a magic signature plus opaque user data.
pub struct GenericData {
    pub magic: Magic,
    pub data: Box<dyn Any + Send>,
}

impl core::fmt::Debug for GenericData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "GenericData {{ magic: {:#x} }}", self.magic)
    }
}

/// Typed content of a pool slot.
#[derive(Debug)]
pub enum BlockContent {
    Undefined,
    Api(GenericData),
    Generic(GenericData),
    Cbor(CborChunk),
    Primary(Box<PrimaryBlockData>),
    Canonical(Box<CanonicalBlockData>),
    Flow(Box<Flow>),
    Ref(RefBlock),
}

impl BlockContent {
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockContent::Undefined => BlockType::Undefined,
            BlockContent::Api(_) => BlockType::Api,
            BlockContent::Generic(_) => BlockType::Generic,
            BlockContent::Cbor(_) => BlockType::CborData,
            BlockContent::Primary(_) => BlockType::Primary,
            BlockContent::Canonical(_) => BlockType::Canonical,
            BlockContent::Flow(_) => BlockType::Flow,
            BlockContent::Ref(_) => BlockType::Ref,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    Free,
    Alloced,
    Recycled,
}

struct Slot {
    state: SlotState,
    refcount: u32,
    content: BlockContent,
}

/// An owned reference to a content block. Holding a `Ref` keeps the block's
/// refcount raised; it must be given back with [`Pool::ref_release`] (there
/// is no implicit drop, mirroring the explicit lifecycle of the pool).
#[derive(Debug)]
pub struct Ref {
    target: BlockId,
}

impl Ref {
    #[inline]
    pub fn target(&self) -> BlockId {
        self.target
    }
}

struct BlocktypeInfo {
    #[allow(dead_code)]
    user_size: usize,
}

/// Population counters; `free + alloced + recycled == total` always.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolCounts {
    pub total: usize,
    pub free: usize,
    pub alloced: usize,
    pub recycled: usize,
}

pub struct Pool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    recycle: VecDeque<u32>,
    active_flows: VecDeque<BlockId>,
    registry: RbTree<BlocktypeInfo>,
    notice_tx: flume::Sender<RecycleNotice>,
    notice_rx: flume::Receiver<RecycleNotice>,
}

impl Pool {
    /// Builds a pool with a fixed block population.
    pub fn new(num_blocks: usize) -> Self {
        let mut slots = Vec::with_capacity(num_blocks);
        let mut free = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            slots.push(Slot {
                state: SlotState::Free,
                refcount: 0,
                content: BlockContent::Undefined,
            });
            free.push(i as u32);
        }
        let (notice_tx, notice_rx) = flume::unbounded();
        Self {
            slots,
            free,
            recycle: VecDeque::new(),
            active_flows: VecDeque::new(),
            registry: RbTree::new(),
            notice_tx,
            notice_rx,
        }
    }

    pub fn counts(&self) -> PoolCounts {
        let total = self.slots.len();
        let free = self.free.len();
        let recycled = self.recycle.len();
        PoolCounts {
            total,
            free,
            alloced: total - free - recycled,
            recycled,
        }
    }

    /// Associates a magic signature with a generic content variant.
    /// Registering the same signature again reports `DuplicateKey` and
    /// leaves the registry unchanged; callers typically ignore it.
    pub fn register_blocktype(
        &mut self,
        magic: Magic,
        user_size: usize,
    ) -> Result<(), DuplicateKey> {
        self.registry
            .insert_unique(magic as u64, BlocktypeInfo { user_size })
            .map(|_| ())
            .map_err(|(dup, _)| dup)
    }

    fn reserve_threshold(&self, priority: AllocPriority) -> usize {
        match priority {
            AllocPriority::Low => self.slots.len() / 4,
            AllocPriority::Medium => self.slots.len() / 8,
            AllocPriority::High => 0,
        }
    }

    fn alloc_slot(&mut self, priority: AllocPriority, content: BlockContent) -> Option<BlockId> {
        if self.free.len() <= self.reserve_threshold(priority) {
            return None;
        }
        let i = self.free.pop()?;
        let slot = &mut self.slots[i as usize];
        slot.state = SlotState::Alloced;
        slot.refcount = 0;
        slot.content = content;
        Some(BlockId(i))
    }

    pub fn alloc_primary(&mut self, priority: AllocPriority) -> Option<BlockId> {
        self.alloc_slot(
            priority,
            BlockContent::Primary(Box::new(PrimaryBlockData::default())),
        )
    }

    pub fn alloc_canonical(&mut self, priority: AllocPriority) -> Option<BlockId> {
        self.alloc_slot(
            priority,
            BlockContent::Canonical(Box::new(CanonicalBlockData::default())),
        )
    }

    pub fn alloc_cbor(&mut self, priority: AllocPriority) -> Option<BlockId> {
        self.alloc_slot(priority, BlockContent::Cbor(CborChunk::default()))
    }

    pub fn alloc_flow(&mut self, priority: AllocPriority) -> Option<BlockId> {
        self.alloc_slot(priority, BlockContent::Flow(Box::new(Flow::default())))
    }

    /// Allocates a generic block; the signature must have been registered.
    pub fn alloc_generic(
        &mut self,
        magic: Magic,
        data: Box<dyn Any + Send>,
        priority: AllocPriority,
    ) -> Option<BlockId> {
        if self.registry.search_unique(magic as u64).is_none() {
            warn!("allocation of unregistered block signature {magic:#x}");
            return None;
        }
        self.alloc_slot(priority, BlockContent::Generic(GenericData { magic, data }))
    }

    pub fn alloc_api(
        &mut self,
        magic: Magic,
        data: Box<dyn Any + Send>,
        priority: AllocPriority,
    ) -> Option<BlockId> {
        if self.registry.search_unique(magic as u64).is_none() {
            warn!("allocation of unregistered block signature {magic:#x}");
            return None;
        }
        self.alloc_slot(priority, BlockContent::Api(GenericData { magic, data }))
    }

    pub fn get(&self, id: BlockId) -> &BlockContent {
        &self.slots[id.0 as usize].content
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut BlockContent {
        &mut self.slots[id.0 as usize].content
    }

    pub fn refcount(&self, id: BlockId) -> u32 {
        self.slots[id.0 as usize].refcount
    }

    pub fn primary(&self, id: BlockId) -> Option<&PrimaryBlockData> {
        match self.get(id) {
            BlockContent::Primary(p) => Some(p),
            _ => None,
        }
    }

    pub fn primary_mut(&mut self, id: BlockId) -> Option<&mut PrimaryBlockData> {
        match self.get_mut(id) {
            BlockContent::Primary(p) => Some(p),
            _ => None,
        }
    }

    pub fn canonical(&self, id: BlockId) -> Option<&CanonicalBlockData> {
        match self.get(id) {
            BlockContent::Canonical(c) => Some(c),
            _ => None,
        }
    }

    pub fn canonical_mut(&mut self, id: BlockId) -> Option<&mut CanonicalBlockData> {
        match self.get_mut(id) {
            BlockContent::Canonical(c) => Some(c),
            _ => None,
        }
    }

    pub fn cbor_chunk(&self, id: BlockId) -> Option<&CborChunk> {
        match self.get(id) {
            BlockContent::Cbor(c) => Some(c),
            _ => None,
        }
    }

    pub fn cbor_chunk_mut(&mut self, id: BlockId) -> Option<&mut CborChunk> {
        match self.get_mut(id) {
            BlockContent::Cbor(c) => Some(c),
            _ => None,
        }
    }

    pub fn flow(&self, id: BlockId) -> Option<&Flow> {
        match self.get(id) {
            BlockContent::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn flow_mut(&mut self, id: BlockId) -> Option<&mut Flow> {
        match self.get_mut(id) {
            BlockContent::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn generic(&self, id: BlockId, magic: Magic) -> Option<&dyn Any> {
        match self.get(id) {
            BlockContent::Generic(g) | BlockContent::Api(g) if g.magic == magic => {
                Some(g.data.as_ref())
            }
            _ => None,
        }
    }

    pub fn generic_mut(&mut self, id: BlockId, magic: Magic) -> Option<&mut (dyn Any + Send)> {
        match self.get_mut(id) {
            BlockContent::Generic(g) | BlockContent::Api(g) if g.magic == magic => {
                Some(g.data.as_mut())
            }
            _ => None,
        }
    }

    /// Resolves through ref blocks to the underlying content block.
    pub fn base_block(&self, mut id: BlockId) -> BlockId {
        while let BlockContent::Ref(r) = self.get(id) {
            id = r.target;
        }
        id
    }

    /// Creates an owned reference to the base content block behind `id`,
    /// raising its refcount.
    pub fn ref_create(&mut self, id: BlockId) -> Ref {
        let target = self.base_block(id);
        self.slots[target.0 as usize].refcount += 1;
        Ref { target }
    }

    pub fn ref_duplicate(&mut self, r: &Ref) -> Ref {
        self.slots[r.target.0 as usize].refcount += 1;
        Ref { target: r.target }
    }

    /// Releases a reference; the block is recycled when the count reaches
    /// zero.
    pub fn ref_release(&mut self, r: Ref) {
        let slot = &mut self.slots[r.target.0 as usize];
        debug_assert!(slot.refcount > 0);
        slot.refcount -= 1;
        if slot.refcount == 0 && slot.state == SlotState::Alloced {
            self.recycle_block(r.target);
        }
    }

    /// Wraps a reference in a queueable ref block so a bundle can be placed
    /// onto a subq without copying it. High priority: refs are what drain
    /// storage under memory pressure.
    pub fn ref_make_block(&mut self, r: &Ref, notice: Option<RecycleNotice>) -> Option<BlockId> {
        let target = r.target;
        let blk = self.alloc_slot(
            AllocPriority::High,
            BlockContent::Ref(RefBlock { target, notice }),
        )?;
        self.slots[target.0 as usize].refcount += 1;
        Some(blk)
    }

    /// Moves a block onto the recycle list; destruction happens during
    /// [`Pool::maintain`]. The caller must already have detached the block
    /// from any list it was on. A block with outstanding references is
    /// not touched; it is recycled when the last reference is released.
    pub fn recycle_block(&mut self, id: BlockId) {
        let slot = &mut self.slots[id.0 as usize];
        if slot.state != SlotState::Alloced || slot.refcount > 0 {
            return;
        }
        slot.state = SlotState::Recycled;
        self.recycle.push_back(id.0);
    }

    /// Drains pending ref-recycle notices.
    pub fn take_notices(&mut self) -> Vec<RecycleNotice> {
        self.notice_rx.try_iter().collect()
    }

    /// Destroys up to the batch bound of recycled blocks, recursively
    /// recycling owned sub-objects, releasing ref targets, and posting
    /// recycle notices. Returns the number of blocks returned to the free
    /// list.
    pub fn maintain(&mut self) -> usize {
        let mut destroyed = 0;
        while destroyed < MAINTAIN_BATCH {
            let Some(i) = self.recycle.pop_front() else {
                break;
            };
            let content = core::mem::replace(
                &mut self.slots[i as usize].content,
                BlockContent::Undefined,
            );
            match content {
                BlockContent::Primary(p) => {
                    for c in p.chunks {
                        self.recycle_block(c);
                    }
                    for c in p.cblocks {
                        self.recycle_block(c);
                    }
                }
                BlockContent::Canonical(c) => {
                    for chunk in c.chunks {
                        self.recycle_block(chunk);
                    }
                }
                BlockContent::Flow(mut f) => {
                    for blk in f.ingress.drain() {
                        self.recycle_block(blk);
                    }
                    for blk in f.egress.drain() {
                        self.recycle_block(blk);
                    }
                }
                BlockContent::Ref(r) => {
                    if let Some(notice) = r.notice {
                        // receiver is pool-owned, the send cannot fail
                        let _ = self.notice_tx.send(notice);
                    }
                    let slot = &mut self.slots[r.target.0 as usize];
                    debug_assert!(slot.refcount > 0);
                    slot.refcount -= 1;
                    if slot.refcount == 0 && slot.state == SlotState::Alloced {
                        self.recycle_block(r.target);
                    }
                }
                BlockContent::Undefined
                | BlockContent::Api(_)
                | BlockContent::Generic(_)
                | BlockContent::Cbor(_) => {}
            }

            let slot = &mut self.slots[i as usize];
            slot.state = SlotState::Free;
            slot.refcount = 0;
            self.free.push(i);
            destroyed += 1;
        }
        destroyed
    }

    /// Runs maintenance until the recycle list is empty.
    pub fn maintain_to_empty(&mut self) {
        while self.maintain() > 0 {}
    }

    pub(crate) fn mark_flow_active(&mut self, flow_id: BlockId) {
        let is_active = match self.flow_mut(flow_id) {
            Some(f) => {
                let was = f.active;
                f.active = true;
                was
            }
            None => return,
        };
        if !is_active {
            self.active_flows.push_back(flow_id);
        }
    }

    /// Pops the next flow needing scheduler attention.
    pub fn next_active_flow(&mut self) -> Option<BlockId> {
        while let Some(id) = self.active_flows.pop_front() {
            if let Some(f) = self.flow_mut(id) {
                f.active = false;
                return Some(id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn population_accounting() {
        let mut pool = Pool::new(16);
        let c = pool.counts();
        assert_eq!((c.total, c.free, c.alloced, c.recycled), (16, 16, 0, 0));

        let blk = pool.alloc_cbor(AllocPriority::High).unwrap();
        let c = pool.counts();
        assert_eq!((c.free, c.alloced, c.recycled), (15, 1, 0));

        pool.recycle_block(blk);
        let c = pool.counts();
        assert_eq!((c.free, c.alloced, c.recycled), (15, 0, 1));

        pool.maintain();
        let c = pool.counts();
        assert_eq!((c.total, c.free, c.alloced, c.recycled), (16, 16, 0, 0));
    }

    #[test]
    fn priority_thresholds_gate_allocation() {
        let mut pool = Pool::new(16);
        // Low priority refuses at 1/4 reserve (4 blocks)
        let mut taken = Vec::new();
        while let Some(b) = pool.alloc_cbor(AllocPriority::Low) {
            taken.push(b);
        }
        assert_eq!(pool.counts().free, 4);
        // Medium digs into the reserve down to 1/8 (2 blocks)
        while let Some(b) = pool.alloc_cbor(AllocPriority::Medium) {
            taken.push(b);
        }
        assert_eq!(pool.counts().free, 2);
        // High drains the pool completely
        while let Some(b) = pool.alloc_cbor(AllocPriority::High) {
            taken.push(b);
        }
        assert_eq!(pool.counts().free, 0);
        assert!(pool.alloc_cbor(AllocPriority::High).is_none());
    }

    #[test]
    fn refcount_lifecycle() {
        let mut pool = Pool::new(8);
        let blk = pool.alloc_primary(AllocPriority::High).unwrap();

        let r1 = pool.ref_create(blk);
        let r2 = pool.ref_duplicate(&r1);
        assert_eq!(pool.refcount(blk), 2);

        pool.ref_release(r1);
        assert_eq!(pool.refcount(blk), 1);
        assert_eq!(pool.counts().recycled, 0);

        pool.ref_release(r2);
        assert_eq!(pool.counts().recycled, 1);
        pool.maintain();
        assert_eq!(pool.counts().free, 8);
    }

    #[test]
    fn ref_block_destruction_posts_notice() {
        let mut pool = Pool::new(8);
        let blk = pool.alloc_primary(AllocPriority::High).unwrap();
        let r = pool.ref_create(blk);

        let notice = RecycleNotice {
            intf_id: Handle::new(1, 7),
            token: 42,
        };
        let rblk = pool.ref_make_block(&r, Some(notice)).unwrap();
        assert_eq!(pool.refcount(blk), 2);

        pool.recycle_block(rblk);
        pool.maintain();
        let notices = pool.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].token, 42);
        assert_eq!(pool.refcount(blk), 1);

        pool.ref_release(r);
        pool.maintain();
        assert_eq!(pool.counts().free, 8);
    }

    #[test]
    fn duplicate_blocktype_registration() {
        let mut pool = Pool::new(4);
        pool.register_blocktype(0xf223fff9, 64).unwrap();
        assert!(pool.register_blocktype(0xf223fff9, 64).is_err());
        // and an unregistered signature cannot be allocated
        assert!(
            pool.alloc_generic(0xdeadbeef, Box::new(0u32), AllocPriority::High)
                .is_none()
        );
    }

    #[test]
    fn primary_recycle_is_recursive() {
        let mut pool = Pool::new(16);
        let pblk = pool.alloc_primary(AllocPriority::High).unwrap();
        let cblk = pool.alloc_canonical(AllocPriority::High).unwrap();
        let chunk = pool.alloc_cbor(AllocPriority::High).unwrap();
        pool.canonical_mut(cblk).unwrap().chunks.push(chunk);
        let p = pool.primary_mut(pblk).unwrap();
        p.cblocks.push(cblk);

        pool.recycle_block(pblk);
        pool.maintain_to_empty();
        assert_eq!(pool.counts().free, 16);
    }
}
