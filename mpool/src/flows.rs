/*!
Flows and their bounded sub-queues.

A flow pairs an ingress and an egress FIFO of block references and belongs
to exactly one interface. The queue counters are monotonically increasing
`u32`s; depth is the wrapping difference, so the arithmetic stays correct
across counter wrap. A configured depth limit of zero disables pushes
entirely (the DOWN state); lowering the limit below the current depth keeps
the queued entries but refuses new pushes until the queue drains.

Pushing onto either subq marks the owning flow active on the pool-wide
scheduler list.
*/

use crate::handle::Handle;
use crate::pool::{BlockId, Pool};
use std::collections::VecDeque;

/// The maximum usable subq depth; used as the "unlimited" setting when an
/// interface comes up.
pub const MAX_SUBQ_DEPTH: u32 = 0x1000_0000;

/// Which of a flow's two queues an operation addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Dir {
    Ingress,
    Egress,
}

/// A bounded FIFO of block references.
#[derive(Debug, Default)]
pub struct Subq {
    queue: VecDeque<BlockId>,
    push_count: u32,
    pull_count: u32,
    pub current_depth_limit: u32,
}

impl Subq {
    /// Queue depth as the wrapping counter difference.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.push_count.wrapping_sub(self.pull_count)
    }

    #[inline]
    pub fn may_pull(&self) -> bool {
        self.depth() != 0
    }

    #[inline]
    pub fn may_push(&self) -> bool {
        self.depth() < self.current_depth_limit
    }

    pub fn push_count(&self) -> u32 {
        self.push_count
    }

    pub fn pull_count(&self) -> u32 {
        self.pull_count
    }

    fn push(&mut self, blk: BlockId) {
        self.queue.push_back(blk);
        self.push_count = self.push_count.wrapping_add(1);
    }

    fn pull(&mut self) -> Option<BlockId> {
        let blk = self.queue.pop_front()?;
        self.pull_count = self.pull_count.wrapping_add(1);
        Some(blk)
    }

    pub(crate) fn drain(&mut self) -> Vec<BlockId> {
        let drained: Vec<BlockId> = self.queue.drain(..).collect();
        self.pull_count = self.pull_count.wrapping_add(drained.len() as u32);
        drained
    }
}

/// An interface's flow record: external handle, optional parent flow, and
/// the paired sub-queues.
#[derive(Debug, Default)]
pub struct Flow {
    pub external_id: Handle,
    pub parent: Option<BlockId>,
    pub ingress: Subq,
    pub egress: Subq,
    pub(crate) active: bool,
}

impl Flow {
    pub fn subq(&self, dir: Dir) -> &Subq {
        match dir {
            Dir::Ingress => &self.ingress,
            Dir::Egress => &self.egress,
        }
    }

    pub fn subq_mut(&mut self, dir: Dir) -> &mut Subq {
        match dir {
            Dir::Ingress => &mut self.ingress,
            Dir::Egress => &mut self.egress,
        }
    }
}

impl Pool {
    /// Attempts to push a block onto a flow's subq; succeeds iff
    /// `depth < limit`. On success the flow is marked active for the
    /// scheduler.
    pub fn subq_try_push(&mut self, flow_id: BlockId, dir: Dir, blk: BlockId) -> bool {
        let Some(flow) = self.flow_mut(flow_id) else {
            return false;
        };
        let q = flow.subq_mut(dir);
        if !q.may_push() {
            return false;
        }
        q.push(blk);
        self.mark_flow_active(flow_id);
        true
    }

    /// Removes and returns the head of a flow's subq.
    pub fn subq_try_pull(&mut self, flow_id: BlockId, dir: Dir) -> Option<BlockId> {
        self.flow_mut(flow_id)?.subq_mut(dir).pull()
    }

    /// Splices the entire source subq onto the destination. The move is
    /// admitted as a whole when the destination can accept a push at all;
    /// returns the number of entries moved.
    pub fn subq_move_all(
        &mut self,
        dst_flow: BlockId,
        dst_dir: Dir,
        src_flow: BlockId,
        src_dir: Dir,
    ) -> u32 {
        let moved = {
            let Some(src) = self.flow_mut(src_flow) else {
                return 0;
            };
            let src_q = src.subq_mut(src_dir);
            if !src_q.may_pull() {
                return 0;
            }
            // check the destination before disturbing the source
            match self.flow(dst_flow) {
                Some(dst) if dst.subq(dst_dir).may_push() => {}
                _ => return 0,
            }
            let src_q = self.flow_mut(src_flow).unwrap().subq_mut(src_dir);
            src_q.drain()
        };

        let count = moved.len() as u32;
        let dst = self.flow_mut(dst_flow).unwrap().subq_mut(dst_dir);
        for blk in moved {
            dst.push(blk);
        }
        self.mark_flow_active(dst_flow);
        count
    }

    /// Empties a subq, recycling every queued block. Used when an
    /// interface goes down.
    pub fn subq_drop_all(&mut self, flow_id: BlockId, dir: Dir) -> u32 {
        let Some(flow) = self.flow_mut(flow_id) else {
            return 0;
        };
        let drained = flow.subq_mut(dir).drain();
        let count = drained.len() as u32;
        for blk in drained {
            self.recycle_block(blk);
        }
        count
    }
}
