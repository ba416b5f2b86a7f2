/*!
The store-and-forward cache.

One cache instance is bound to a service address and registered as the
storage-capable interface for its node. Bundles headed INTO storage arrive
on its egress subq; retained bundles are re-emitted on its ingress subq
toward the routing engine when their moment comes. The state machine runs
off three inputs: timer polls, interface/route events, and ref-recycle
notices posted by the pool when a queued copy of a bundle is destroyed.

Retained entries are indexed three ways:
- by destination node number, so a route coming up can wake exactly the
  bundles it can now carry;
- by bucketed next-evaluation time, so the timer poll touches only the
  buckets that have come due;
- by a custody hash of (salt, source EID, custodian EID), so incoming
  custody acknowledgements and DACS appends find their entry without a
  scan.

Because tree keys are unique, each index node holds a small FIFO of
entries sharing the key; the node is discarded when its last entry leaves.
*/

use crate::codec;
use crate::core::Core;
use crate::route::{Event, IntfKind};
use crate::status::Status;
use std::collections::VecDeque;
use tern_bpv7::crc::CASTAGNOLI;
use tern_bpv7::{
    BlockType, BundleFlags, CanonicalBlock, CreationTimestamp, CrcType, CustodyAcceptPayload,
    DtnTime, Eid, ExtensionData,
};
use tern_mpool::rbtree::{NodeId, RbTree};
use tern_mpool::{
    AllocPriority, BlockId, DeliveryPolicy, Handle, Pool, RecycleNotice, flows::Dir,
};
use tracing::{debug, warn};

const SALT_DACS: u64 = 0x3126_c0cf;
const SALT_BUNDLE: u64 = 0x7739_ae76;

const FLAG_WITHIN_LIFETIME: u8 = 0x01;
const FLAG_AWAITING_CUSTODY: u8 = 0x02;
const FLAG_AWAITING_TRANSMIT: u8 = 0x04;
const FLAG_LOCALLY_QUEUED: u8 = 0x08;

/// If any of these becomes unset, retention of the entry is no longer
/// required.
const FLAGS_RETENTION_REQUIRED: u8 = FLAG_WITHIN_LIFETIME | FLAG_AWAITING_CUSTODY;
/// While any of these is set, (re)transmission is blocked.
const FLAGS_TRANSMIT_WAIT_STATE: u8 = FLAG_LOCALLY_QUEUED | FLAG_AWAITING_TRANSMIT;

const DACS_LIFETIME_MS: u64 = 86_400_000;
const DACS_OPEN_TIME_MS: u64 = 2_500;
const IDLE_RETRY_MS: u64 = 3_600_000;
const FAST_RETRY_MS: u64 = 2_000;

/// Nearby evaluation times share one tree node; this mask sets the bucket
/// width.
const TIME_BUCKET_MASK: u64 = 0x3FF;
const TIME_INFINITE: u64 = u64::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum EntryType {
    NormalBundle,
    PendingDacs,
}

/// Which of the cache's three entry lists an entry currently belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ListTag {
    Pending,
    Expired,
    Idle,
}

pub(crate) struct CacheEntry {
    entry_type: EntryType,
    flags: u8,
    refptr: Option<tern_mpool::Ref>,
    last_eval_time: u64,
    next_eval_time: u64,
    expire_time: u64,
    transmit_time: u64,
    list: ListTag,
    hash_link: Option<NodeId>,
    time_link: Option<NodeId>,
    dest_link: Option<NodeId>,
}

type IndexQueue = VecDeque<u32>;

pub(crate) struct CacheState {
    pub intf_id: Handle,
    pub flow_block: BlockId,
    self_ref: Option<tern_mpool::Ref>,
    service_addr: (u64, u64),
    entries: Vec<Option<CacheEntry>>,
    free_entries: Vec<u32>,
    pending: VecDeque<u32>,
    expired: VecDeque<u32>,
    hash_index: RbTree<IndexQueue>,
    dest_index: RbTree<IndexQueue>,
    time_index: RbTree<IndexQueue>,
    generated_dacs_seq: u64,
}

impl CacheState {
    fn new(service_addr: (u64, u64), flow_block: BlockId) -> Self {
        Self {
            intf_id: Handle::INVALID,
            flow_block,
            self_ref: None,
            service_addr,
            entries: Vec::new(),
            free_entries: Vec::new(),
            pending: VecDeque::new(),
            expired: VecDeque::new(),
            hash_index: RbTree::new(),
            dest_index: RbTree::new(),
            time_index: RbTree::new(),
            generated_dacs_seq: 0,
        }
    }

    fn self_eid(&self) -> Eid {
        Eid::Ipn {
            node: self.service_addr.0,
            service: self.service_addr.1,
        }
    }

    fn alloc_entry(&mut self, now: u64) -> u32 {
        let entry = CacheEntry {
            entry_type: EntryType::NormalBundle,
            flags: 0,
            refptr: None,
            last_eval_time: now,
            next_eval_time: TIME_INFINITE,
            expire_time: TIME_INFINITE,
            transmit_time: 0,
            list: ListTag::Pending,
            hash_link: None,
            time_link: None,
            dest_link: None,
        };
        if let Some(idx) = self.free_entries.pop() {
            self.entries[idx as usize] = Some(entry);
            idx
        } else {
            self.entries.push(Some(entry));
            (self.entries.len() - 1) as u32
        }
    }

    fn entry(&self, idx: u32) -> &CacheEntry {
        self.entries[idx as usize].as_ref().expect("stale cache entry")
    }

    fn entry_mut(&mut self, idx: u32) -> &mut CacheEntry {
        self.entries[idx as usize].as_mut().expect("stale cache entry")
    }

    fn entry_exists(&self, idx: u32) -> bool {
        self.entries
            .get(idx as usize)
            .is_some_and(|e| e.is_some())
    }

    /// Number of retained entries whose destination node matches.
    #[cfg(test)]
    pub(crate) fn dest_index_count(&self, node: u64) -> usize {
        self.dest_index
            .search_unique(node)
            .map(|n| self.dest_index.get(n).len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn live_entry_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn time_index_is_empty(&self) -> bool {
        self.time_index.is_empty()
    }
}

/// Custody hash: a CRC-32/C over the salt and the two EIDs, used as the
/// key for both ACK matching and DACS coalescing.
fn custody_hash(salt: u64, flow_source: &Eid, custodian: &Eid) -> u64 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(&salt.to_le_bytes());
    for eid in [flow_source, custodian] {
        digest.update(&eid.node_number().to_le_bytes());
        digest.update(&eid.service_number().to_le_bytes());
    }
    digest.finalize() as u64
}

fn index_insert(tree: &mut RbTree<IndexQueue>, key: u64, idx: u32) -> NodeId {
    if let Some(node) = tree.search_unique(key) {
        tree.get_mut(node).push_back(idx);
        node
    } else {
        match tree.insert_unique(key, VecDeque::from([idx])) {
            Ok(node) => node,
            Err(_) => unreachable!("key vanished between search and insert"),
        }
    }
}

fn index_remove(tree: &mut RbTree<IndexQueue>, node: NodeId, idx: u32) {
    let queue = tree.get_mut(node);
    if let Some(pos) = queue.iter().position(|&e| e == idx) {
        queue.remove(pos);
    }
    if queue.is_empty() {
        tree.extract(node);
    }
}

/// Moves an entry to the pending list after applying flag changes; the
/// next flush re-evaluates and reclassifies it.
fn make_pending(cache: &mut CacheState, idx: u32, set_flags: u8, clear_flags: u8) {
    if !cache.entry_exists(idx) {
        return;
    }
    let entry = cache.entry_mut(idx);
    entry.flags = (entry.flags | set_flags) & !clear_flags;
    if entry.list != ListTag::Pending {
        entry.list = ListTag::Pending;
        cache.pending.push_back(idx);
    }
}

/// Evaluates a normal bundle that still requires retention: due for
/// (re)transmission, or confirming a completed egress.
fn evaluate_bundle_status(pool: &mut Pool, cache: &mut CacheState, idx: u32) -> Option<BlockId> {
    let target = cache.entry(idx).refptr.as_ref()?.target();
    pool.primary(target)?;

    // A queued copy that died without reaching an egress interface means
    // the transmission did not happen; clear the wait state so the next
    // pass can try again.
    let flags = cache.entry(idx).flags;
    if flags & FLAG_LOCALLY_QUEUED == 0 && flags & FLAG_AWAITING_TRANSMIT != 0 {
        let (egress_valid, egress_time, policy, retx) = {
            let p = pool.primary(target)?;
            (
                p.delivery.egress_intf_id.is_valid(),
                p.delivery.egress_time,
                p.delivery.delivery_policy,
                p.delivery.local_retx_interval,
            )
        };
        let entry = cache.entry_mut(idx);
        if egress_valid {
            // confirmed fetched by a downstream CLA
            if policy != DeliveryPolicy::CustodyTracking {
                // the egress CLA is now the implicit custodian
                entry.flags &= !FLAG_AWAITING_CUSTODY;
            }
            entry.transmit_time = egress_time.saturating_add(retx);
        } else {
            entry.flags &= !FLAG_AWAITING_TRANSMIT;
        }
    }

    if cache.entry(idx).flags & FLAGS_TRANSMIT_WAIT_STATE != 0 {
        return None;
    }

    // Mark the egress interface invalid; it turns valid again only when a
    // CLA actually takes the bundle, so a stuck copy is distinguishable.
    {
        let p = pool.primary_mut(target)?;
        p.delivery.egress_intf_id = Handle::INVALID;
        p.delivery.egress_time = 0;
    }

    let r = cache.entries[idx as usize].as_ref()?.refptr.as_ref()?;
    let notice = RecycleNotice {
        intf_id: cache.intf_id,
        token: idx as u64,
    };
    let rblk = pool.ref_make_block(r, Some(notice));
    if rblk.is_none() {
        warn!("no pool headroom for storage ref block");
    }
    rblk
}

/// Evaluates an open DACS whose collection window has closed: promote it
/// to a normal bundle, stop accepting appends, and send it out.
fn evaluate_pending_dacs_status(
    pool: &mut Pool,
    cache: &mut CacheState,
    idx: u32,
) -> Option<BlockId> {
    if cache.entry(idx).flags & FLAGS_TRANSMIT_WAIT_STATE != 0 {
        return None;
    }
    let target = cache.entry(idx).refptr.as_ref()?.target();
    {
        let p = pool.primary_mut(target)?;
        p.delivery.egress_intf_id = Handle::INVALID;
        p.delivery.egress_time = 0;
    }

    // from here on the entry is an ordinary bundle; leaving the hash
    // index prevents any further appends
    {
        let entry = cache.entry_mut(idx);
        entry.entry_type = EntryType::NormalBundle;
        if let Some(node) = entry.hash_link.take() {
            index_remove(&mut cache.hash_index, node, idx);
        }
    }

    let r = cache.entries[idx as usize].as_ref()?.refptr.as_ref()?;
    let notice = RecycleNotice {
        intf_id: cache.intf_id,
        token: idx as u64,
    };
    pool.ref_make_block(r, Some(notice))
}

/// Chooses the next time-index visit for a retained entry and files it
/// into the bucketed time index.
fn schedule_next_visit(cache: &mut CacheState, idx: u32) {
    let entry = cache.entry(idx);
    let retry = if entry.flags & FLAGS_TRANSMIT_WAIT_STATE == 0 {
        // pending transmit but blocked externally; retry aggressively
        FAST_RETRY_MS
    } else {
        IDLE_RETRY_MS
    };
    let mut ref_time = entry.last_eval_time.saturating_add(retry);
    ref_time = ref_time.min(entry.transmit_time).min(entry.expire_time);
    let bucket = ref_time | TIME_BUCKET_MASK;

    if bucket != cache.entry(idx).next_eval_time {
        if let Some(node) = cache.entry_mut(idx).time_link.take() {
            index_remove(&mut cache.time_index, node, idx);
        }
        let node = index_insert(&mut cache.time_index, bucket, idx);
        let entry = cache.entry_mut(idx);
        entry.time_link = Some(node);
        entry.next_eval_time = bucket;
    }
}

/// The per-entry state machine: refresh the timers, give the entry its
/// chance to (re)transmit, then reclassify it onto the idle or expired
/// list.
fn evaluate_pending_entry(pool: &mut Pool, cache: &mut CacheState, now: u64, idx: u32) {
    if !cache.entry_exists(idx) {
        return;
    }
    {
        let entry = cache.entry_mut(idx);
        entry.last_eval_time = now;
        if now >= entry.expire_time {
            entry.flags &= !FLAG_WITHIN_LIFETIME;
            entry.expire_time = TIME_INFINITE;
        }
        if now >= entry.transmit_time {
            entry.flags &= !FLAG_AWAITING_TRANSMIT;
            entry.transmit_time = TIME_INFINITE;
        }
    }

    let mut retention_required =
        cache.entry(idx).flags & FLAGS_RETENTION_REQUIRED == FLAGS_RETENTION_REQUIRED;

    if retention_required {
        let rblk = match cache.entry(idx).entry_type {
            EntryType::NormalBundle => evaluate_bundle_status(pool, cache, idx),
            EntryType::PendingDacs => evaluate_pending_dacs_status(pool, cache, idx),
        };

        if let Some(rblk) = rblk {
            if pool.subq_try_push(cache.flow_block, Dir::Ingress, rblk) {
                // in transit: locally queued, and held back from another
                // send until the retransmit timer
                cache.entry_mut(idx).flags |= FLAGS_TRANSMIT_WAIT_STATE;
            } else {
                pool.recycle_block(rblk);
            }
        }

        retention_required =
            cache.entry(idx).flags & FLAGS_RETENTION_REQUIRED == FLAGS_RETENTION_REQUIRED;
    }

    if retention_required {
        schedule_next_visit(cache, idx);
        cache.entry_mut(idx).list = ListTag::Idle;
    } else {
        cache.entry_mut(idx).list = ListTag::Expired;
        cache.expired.push_back(idx);
    }
}

/// Removes an expired entry from every index and releases its hold on the
/// bundle.
fn cleanup_expired_entry(pool: &mut Pool, cache: &mut CacheState, idx: u32) {
    let entry = cache.entry_mut(idx);
    let hash = entry.hash_link.take();
    let time = entry.time_link.take();
    let dest = entry.dest_link.take();
    let refptr = entry.refptr.take();

    if let Some(node) = hash {
        index_remove(&mut cache.hash_index, node, idx);
    }
    if let Some(node) = time {
        index_remove(&mut cache.time_index, node, idx);
    }
    if let Some(node) = dest {
        index_remove(&mut cache.dest_index, node, idx);
    }
    if let Some(r) = refptr {
        pool.ref_release(r);
    }

    cache.entries[idx as usize] = None;
    cache.free_entries.push(idx);
}

/// Re-evaluates everything on the pending list until it stays empty,
/// sweeping the expired list between passes.
fn flush_pending(pool: &mut Pool, cache: &mut CacheState, now: u64) {
    loop {
        while let Some(idx) = cache.pending.pop_front() {
            if cache.entry_exists(idx) && cache.entry(idx).list == ListTag::Pending {
                evaluate_pending_entry(pool, cache, now, idx);
            }
        }
        while let Some(idx) = cache.expired.pop_front() {
            if cache.entry_exists(idx) && cache.entry(idx).list == ListTag::Expired {
                cleanup_expired_entry(pool, cache, idx);
            }
        }
        if cache.pending.is_empty() {
            break;
        }
    }
}

/// Timer poll: wake every time bucket that has come due.
fn do_poll(cache: &mut CacheState, now: u64) {
    while let Some(node) = cache.time_index.iter_max_le(now) {
        let woken: Vec<u32> = cache.time_index.get(node).iter().copied().collect();
        cache.time_index.extract(node);
        for idx in woken {
            if cache.entry_exists(idx) {
                let entry = cache.entry_mut(idx);
                entry.time_link = None;
                entry.next_eval_time = TIME_INFINITE;
            }
            make_pending(cache, idx, 0, 0);
        }
    }
}

/// Route-up: wake every retained entry whose destination the new route
/// can carry.
fn do_route_up(cache: &mut CacheState, dest: u64, mask: u64) {
    let mut it = cache.dest_index.iter_min_ge(dest);
    while let Some(node) = it {
        let key = cache.dest_index.key_of(node);
        if key & mask != dest & mask {
            break;
        }
        let woken: Vec<u32> = cache.dest_index.get(node).iter().copied().collect();
        it = cache.dest_index.iter_next(node);
        for idx in woken {
            make_pending(cache, idx, 0, 0);
        }
    }
}

/// Looks up a stored custody-tracked bundle by acknowledgement identity
/// and clears its awaiting-custody flag.
fn do_ack_bundle(
    pool: &Pool,
    cache: &mut CacheState,
    prev_custodian: &Eid,
    flow_source: &Eid,
    sequence_num: u64,
) {
    let hash = custody_hash(SALT_BUNDLE ^ sequence_num, flow_source, prev_custodian);
    let Some(node) = cache.hash_index.search_unique(hash & tern_mpool::rbtree::KEY_MASK) else {
        return;
    };
    let candidates: Vec<u32> = cache.hash_index.get(node).iter().copied().collect();
    for idx in candidates {
        if !cache.entry_exists(idx)
            || cache.entry(idx).entry_type != EntryType::NormalBundle
        {
            continue;
        }
        let Some(target) = cache.entry(idx).refptr.as_ref().map(|r| r.target()) else {
            continue;
        };
        let Some(p) = pool.primary(target) else {
            continue;
        };
        if p.logical.timestamp.sequence_number == sequence_num && p.logical.source == *flow_source
        {
            debug!("custody acknowledged for sequence {sequence_num}");
            make_pending(cache, idx, 0, FLAG_AWAITING_CUSTODY);
            break;
        }
    }
}

/// Finds the open DACS collecting acknowledgements for this
/// previous-custodian/flow-source pair, if one exists.
fn find_pending_dacs(
    pool: &Pool,
    cache: &CacheState,
    hash: u64,
    prev_custodian: &Eid,
    flow_source: &Eid,
) -> Option<u32> {
    let node = cache
        .hash_index
        .search_unique(hash & tern_mpool::rbtree::KEY_MASK)?;
    for &idx in cache.hash_index.get(node) {
        if !cache.entry_exists(idx) || cache.entry(idx).entry_type != EntryType::PendingDacs {
            continue;
        }
        let target = cache.entry(idx).refptr.as_ref()?.target();
        let p = pool.primary(target)?;
        if p.logical.destination != *prev_custodian {
            continue;
        }
        let payload_blk = codec::locate_canonical(pool, target, BlockType::CustodyAcceptPayload)?;
        if let Some(c) = pool.canonical(payload_blk) {
            if let ExtensionData::CustodyAccept(payload) = &c.extension {
                if payload.flow_source_eid == *flow_source {
                    return Some(idx);
                }
            }
        }
    }
    None
}

/// Opens a new DACS collector: a skeletal admin-record bundle addressed
/// to the previous custodian, plus a pending-dacs cache entry that keeps
/// it discoverable for further appends.
fn open_dacs(
    pool: &mut Pool,
    cache: &mut CacheState,
    now: u64,
    hash: u64,
    prev_custodian: &Eid,
    flow_source: &Eid,
) -> Option<u32> {
    let pblk = pool.alloc_primary(AllocPriority::Medium)?;
    let Some(cblk) = pool.alloc_canonical(AllocPriority::Medium) else {
        pool.recycle_block(pblk);
        return None;
    };

    let seq = cache.generated_dacs_seq;
    cache.generated_dacs_seq += 1;

    {
        let p = pool.primary_mut(pblk)?;
        p.logical = tern_bpv7::PrimaryBlock {
            flags: BundleFlags {
                is_admin_record: true,
                must_not_fragment: true,
                ..Default::default()
            },
            crc_type: CrcType::Crc16X25,
            destination: *prev_custodian,
            source: cache.self_eid(),
            report_to: cache.self_eid(),
            timestamp: CreationTimestamp {
                time: DtnTime::new(now),
                sequence_number: seq,
            },
            lifetime: DACS_LIFETIME_MS,
            fragment_info: None,
            crc_value: 0,
        };
        p.delivery.delivery_policy = DeliveryPolicy::LocalAck;
        p.delivery.local_retx_interval = FAST_RETRY_MS;
        p.delivery.ingress_intf_id = cache.intf_id;
        p.delivery.ingress_time = now;
        p.delivery.storage_intf_id = cache.intf_id;
        p.cblocks.push(cblk);
    }
    {
        let c = pool.canonical_mut(cblk)?;
        c.logical = CanonicalBlock {
            block_type: BlockType::CustodyAcceptPayload,
            block_num: 1,
            crc_type: CrcType::Crc16X25,
            ..Default::default()
        };
        c.extension = ExtensionData::CustodyAccept(CustodyAcceptPayload {
            flow_source_eid: *flow_source,
            sequence_nums: Default::default(),
        });
        c.parent = Some(pblk);
    }

    let idx = cache.alloc_entry(now);
    {
        let r = pool.ref_create(pblk);
        let entry = cache.entry_mut(idx);
        entry.entry_type = EntryType::PendingDacs;
        entry.refptr = Some(r);
        entry.expire_time = now + DACS_LIFETIME_MS;
        entry.transmit_time = now + DACS_OPEN_TIME_MS;
        entry.flags = FLAG_WITHIN_LIFETIME | FLAG_AWAITING_TRANSMIT;
    }
    if let Some(p) = pool.primary_mut(pblk) {
        p.delivery.committed_storage_id = idx as u64;
    }

    let node = index_insert(&mut cache.hash_index, hash & tern_mpool::rbtree::KEY_MASK, idx);
    cache.entry_mut(idx).hash_link = Some(node);
    make_pending(cache, idx, FLAGS_RETENTION_REQUIRED, 0);
    Some(idx)
}

/// Appends one acknowledged sequence number to an open DACS; a full
/// payload closes the collection window immediately.
fn append_dacs(pool: &mut Pool, cache: &mut CacheState, idx: u32, sequence_num: u64) {
    let Some(target) = cache.entry(idx).refptr.as_ref().map(|r| r.target()) else {
        return;
    };
    let Some(payload_blk) = codec::locate_canonical(pool, target, BlockType::CustodyAcceptPayload)
    else {
        return;
    };
    let mut now_full = false;
    if let Some(c) = pool.canonical_mut(payload_blk) {
        if let ExtensionData::CustodyAccept(payload) = &mut c.extension {
            if !payload.is_full() {
                payload.sequence_nums.push(sequence_num);
            }
            now_full = payload.is_full();
        }
    }
    if now_full {
        make_pending(cache, idx, 0, FLAG_AWAITING_TRANSMIT);
    }
}

/// Generates or extends the DACS acknowledging this bundle toward its
/// previous custodian.
fn ack_custody_tracking_block(
    pool: &mut Pool,
    cache: &mut CacheState,
    now: u64,
    prev_custodian: &Eid,
    flow_source: &Eid,
    sequence_num: u64,
) {
    let hash = custody_hash(SALT_DACS, flow_source, prev_custodian);
    let idx = match find_pending_dacs(pool, cache, hash, prev_custodian, flow_source) {
        Some(idx) => Some(idx),
        None => open_dacs(pool, cache, now, hash, prev_custodian, flow_source),
    };
    match idx {
        Some(idx) => append_dacs(pool, cache, idx, sequence_num),
        None => warn!("no pool headroom to open a DACS, custody signal lost"),
    }
}

/// Custody bookkeeping when a custody-tracked bundle is accepted: thank
/// the previous custodian (if any), take over the custody-tracking block,
/// and register for the acknowledgement that will release us.
fn do_custody_tracking(pool: &mut Pool, cache: &mut CacheState, now: u64, idx: u32, pblk: BlockId) {
    let existing = codec::locate_canonical(pool, pblk, BlockType::CustodyTracking);

    let cblk = match existing {
        Some(cblk) => {
            let prev_custodian = match pool.canonical(cblk).map(|c| &c.extension) {
                Some(ExtensionData::CustodyTracking(custodian)) => *custodian,
                _ => return,
            };
            let (flow_source, sequence_num) = match pool.primary(pblk) {
                Some(p) => (p.logical.source, p.logical.timestamp.sequence_number),
                None => return,
            };
            ack_custody_tracking_block(
                pool,
                cache,
                now,
                &prev_custodian,
                &flow_source,
                sequence_num,
            );
            Some(cblk)
        }
        None => {
            // no previous custodian; this storage entity is the first,
            // which is the case for locally generated bundles
            insert_custody_tracking_block(pool, pblk)
        }
    };

    let Some(cblk) = cblk else {
        warn!("no pool headroom for a custody tracking block");
        return;
    };

    // this service becomes the custodian of record; the block re-encodes
    // with the new custodian on the way out
    if let Some(c) = pool.canonical_mut(cblk) {
        c.extension = ExtensionData::CustodyTracking(cache.self_eid());
    }
    codec::invalidate_canonical(pool, cblk);

    let (flow_source, sequence_num) = match pool.primary(pblk) {
        Some(p) => (p.logical.source, p.logical.timestamp.sequence_number),
        None => return,
    };
    let hash = custody_hash(
        SALT_BUNDLE ^ sequence_num,
        &flow_source,
        &cache.self_eid(),
    );
    let node = index_insert(&mut cache.hash_index, hash & tern_mpool::rbtree::KEY_MASK, idx);
    cache.entry_mut(idx).hash_link = Some(node);
}

fn insert_custody_tracking_block(pool: &mut Pool, pblk: BlockId) -> Option<BlockId> {
    let cblk = pool.alloc_canonical(AllocPriority::Medium)?;
    let (crc_type, next_num) = {
        let p = pool.primary(pblk)?;
        let next_num = p
            .cblocks
            .iter()
            .filter_map(|&c| pool.canonical(c))
            .map(|c| c.logical.block_num)
            .max()
            .unwrap_or(1)
            + 1;
        (p.logical.crc_type, next_num)
    };
    {
        let c = pool.canonical_mut(cblk)?;
        c.logical = CanonicalBlock {
            block_type: BlockType::CustodyTracking,
            block_num: next_num,
            crc_type,
            ..Default::default()
        };
        c.parent = Some(pblk);
    }
    pool.primary_mut(pblk)?.cblocks.push(cblk);
    Some(cblk)
}

/// If the bundle is a custody acknowledgement, process and consume it.
fn check_dacs(pool: &Pool, cache: &mut CacheState, base: BlockId) -> bool {
    let Some(payload_blk) = codec::locate_canonical(pool, base, BlockType::CustodyAcceptPayload)
    else {
        return false;
    };
    let Some(ExtensionData::CustodyAccept(payload)) =
        pool.canonical(payload_blk).map(|c| c.extension.clone())
    else {
        return false;
    };
    let Some(prev_custodian) = pool.primary(base).map(|p| p.logical.destination) else {
        return false;
    };
    for seq in &payload.sequence_nums {
        do_ack_bundle(pool, cache, &prev_custodian, &payload.flow_source_eid, *seq);
    }
    true
}

/// Accepts everything waiting on the cache's egress subq into storage.
/// Custody acknowledgements are processed and dropped; data bundles get a
/// cache entry, the destination index, and (when requested) custody
/// tracking.
fn egress_impl(pool: &mut Pool, cache: &mut CacheState, now: u64) -> u32 {
    let mut forward_count = 0;
    while let Some(qblk) = pool.subq_try_pull(cache.flow_block, Dir::Egress) {
        forward_count += 1;
        let base = pool.base_block(qblk);

        if check_dacs(pool, cache, base) {
            // an acceptance signal; these are not stored
            pool.recycle_block(qblk);
            continue;
        }

        let Some((dest_node, policy, created, lifetime)) = pool.primary(base).map(|p| {
            (
                p.logical.destination.node_number(),
                p.delivery.delivery_policy,
                p.logical.timestamp.time.millisecs(),
                p.logical.lifetime,
            )
        }) else {
            pool.recycle_block(qblk);
            continue;
        };

        let idx = cache.alloc_entry(now);
        {
            let r = pool.ref_create(base);
            let entry = cache.entry_mut(idx);
            entry.refptr = Some(r);
            entry.flags = FLAG_WITHIN_LIFETIME;
            if policy != DeliveryPolicy::None {
                entry.flags |= FLAG_AWAITING_CUSTODY;
            }
            entry.expire_time = created.saturating_add(lifetime);
        }
        if let Some(p) = pool.primary_mut(base) {
            p.delivery.storage_intf_id = cache.intf_id;
            p.delivery.committed_storage_id = idx as u64;
        }

        let node = index_insert(&mut cache.dest_index, dest_node, idx);
        cache.entry_mut(idx).dest_link = Some(node);

        if policy == DeliveryPolicy::CustodyTracking {
            do_custody_tracking(pool, cache, now, idx, base);
        }

        // this files the entry into the right spot for future holding
        evaluate_pending_entry(pool, cache, now, idx);

        pool.recycle_block(qblk);
    }
    forward_count
}

impl Core {
    /// Creates a cache bound to `service_addr` and attaches it as the
    /// storage service of that node's base interface. The cache keeps a
    /// reference to its own flow block; only [`Core::detach_cache`]
    /// breaks that cycle.
    pub(crate) fn attach_cache(&mut self, service_addr: (u64, u64)) -> Result<Handle, Status> {
        let flow_block = self
            .pool
            .alloc_flow(AllocPriority::Medium)
            .ok_or(Status::ResourceExhausted)?;

        let ci = self.caches.len();
        self.caches
            .push(Some(CacheState::new(service_addr, flow_block)));

        let handle =
            match self.attach_service(service_addr, flow_block, true, IntfKind::Cache(ci)) {
                Ok(handle) => handle,
                Err(e) => {
                    self.caches[ci] = None;
                    self.pool.recycle_block(flow_block);
                    return Err(e);
                }
            };

        let self_ref = self.pool.ref_create(flow_block);
        let cache = self.caches[ci].as_mut().unwrap();
        cache.intf_id = handle;
        cache.self_ref = Some(self_ref);
        Ok(handle)
    }

    /// Detaches and dismantles the cache at `service_addr`: every retained
    /// entry is released, and the deliberate self-reference cycle is
    /// broken so the flow block can be reclaimed.
    pub(crate) fn detach_cache(&mut self, service_addr: (u64, u64)) -> Result<(), Status> {
        let flow_block = self.detach_service(service_addr)?;
        let ci = self
            .caches
            .iter()
            .position(|c| c.as_ref().is_some_and(|c| c.flow_block == flow_block))
            .ok_or(Status::NotFound)?;

        let Core { pool, caches, .. } = self;
        let cache = caches[ci].as_mut().unwrap();
        for idx in 0..cache.entries.len() as u32 {
            if cache.entry_exists(idx) {
                cleanup_expired_entry(pool, cache, idx);
            }
        }
        let intf_id = cache.intf_id;
        if let Some(r) = cache.self_ref.take() {
            pool.ref_release(r);
        }
        self.caches[ci] = None;
        self.del_intf(intf_id)?;
        Ok(())
    }

    pub(crate) fn cache_handle_event(&mut self, ci: usize, event: Event) {
        let now = self.now();
        let Core { pool, caches, .. } = self;
        let Some(cache) = caches[ci].as_mut() else {
            return;
        };

        match event {
            Event::PollInterval => do_poll(cache, now),
            Event::RouteUp { dest, mask } => do_route_up(cache, dest, mask),
            Event::InterfaceUp { intf_id } if intf_id == cache.intf_id => {
                if let Some(flow) = pool.flow_mut(cache.flow_block) {
                    flow.ingress.current_depth_limit = tern_mpool::flows::MAX_SUBQ_DEPTH;
                    flow.egress.current_depth_limit = tern_mpool::flows::MAX_SUBQ_DEPTH;
                }
            }
            Event::InterfaceDown { intf_id } if intf_id == cache.intf_id => {
                if let Some(flow) = pool.flow_mut(cache.flow_block) {
                    flow.ingress.current_depth_limit = 0;
                    flow.egress.current_depth_limit = 0;
                }
            }
            _ => {}
        }

        // any of the above may have made entries actionable
        flush_pending(pool, cache, now);
    }

    pub(crate) fn cache_egress_impl(&mut self, ci: usize) -> u32 {
        let now = self.now();
        let Core { pool, caches, .. } = self;
        let Some(cache) = caches[ci].as_mut() else {
            return 0;
        };
        egress_impl(pool, cache, now)
    }

    /// A queued copy of a stored bundle was destroyed; re-evaluate its
    /// entry. This is the one state transition driven by pool lifecycle
    /// rather than by timer or event.
    pub(crate) fn cache_note_wrapper_recycled(&mut self, ci: usize, token: u64) {
        let Some(cache) = self.caches[ci].as_mut() else {
            return;
        };
        make_pending(cache, token as u32, 0, FLAG_LOCALLY_QUEUED);
    }

    pub(crate) fn cache_flush_pending(&mut self, ci: usize) {
        let now = self.now();
        let Core { pool, caches, .. } = self;
        let Some(cache) = caches[ci].as_mut() else {
            return;
        };
        flush_pending(pool, cache, now);
    }

    #[cfg(test)]
    pub(crate) fn cache_state(&self, ci: usize) -> &CacheState {
        self.caches[ci].as_ref().unwrap()
    }
}
