/*!
The agent core: one coherent state object holding the pool, the routing
table, and every attached service. The public API wraps the whole core in
a single lock (the coarse lock of the concurrency model); each subsystem
module in this crate extends `Core` with its own `impl` block.
*/

use crate::cache::CacheState;
use crate::clock::Clock;
use crate::config::Config;
use crate::dataservice::{BaseIntfState, SocketState};
use crate::route::{Event, IntfKind, IntfSlot};
use crate::route::RouteEntry;
use tern_mpool::{BlockId, Pool, flows::Dir};

pub(crate) struct Core {
    pub(crate) pool: Pool,
    pub(crate) routes: Vec<RouteEntry>,
    pub(crate) max_routes: usize,
    pub(crate) intfs: Vec<Option<IntfSlot>>,
    /// Serial counters persist across slot reuse so stale handles fail.
    pub(crate) intf_serials: Vec<u32>,
    pub(crate) bases: Vec<Option<BaseIntfState>>,
    pub(crate) caches: Vec<Option<CacheState>>,
    pub(crate) sockets: Vec<Option<SocketState>>,
    pub(crate) clock: Box<dyn Clock>,
}

impl Core {
    pub(crate) fn new(config: &Config, clock: Box<dyn Clock>) -> Self {
        let mut intfs = Vec::new();
        intfs.resize_with(config.max_intfs, || None);
        Self {
            pool: Pool::new(config.pool_blocks),
            routes: Vec::new(),
            max_routes: config.max_routes,
            intfs,
            intf_serials: vec![0; config.max_intfs],
            bases: Vec::new(),
            caches: Vec::new(),
            sockets: Vec::new(),
            clock,
        }
    }

    #[inline]
    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// The single external trigger that drives everything: deliver a poll
    /// event to every interface, run the active-flow scheduler to
    /// fixpoint, then reclaim recycled blocks and hand their notices to
    /// the storage services.
    pub(crate) fn do_maintenance(&mut self) {
        self.fan_out_event(Event::PollInterval);

        while let Some(flow_id) = self.pool.next_active_flow() {
            self.forward_flow(flow_id);
        }

        self.pool.maintain();
        self.deliver_recycle_notices();
    }

    /// Queues an event to every registered interface and then runs the
    /// dispatch loop until all event queues drain.
    pub(crate) fn fan_out_event(&mut self, event: Event) {
        for slot in self.intfs.iter().flatten() {
            // the paired receiver lives in the same slot, sends cannot fail
            let _ = slot.events_tx.send(event);
        }
        self.dispatch_events();
    }

    pub(crate) fn dispatch_events(&mut self) {
        loop {
            let mut batch = Vec::new();
            for (idx, slot) in self.intfs.iter().enumerate() {
                if let Some(slot) = slot {
                    while let Ok(ev) = slot.events_rx.try_recv() {
                        batch.push((idx, ev));
                    }
                }
            }
            if batch.is_empty() {
                break;
            }
            for (idx, ev) in batch {
                self.handle_intf_event(idx, ev);
            }
        }
    }

    fn handle_intf_event(&mut self, idx: usize, event: Event) {
        let Some(slot) = &self.intfs[idx] else {
            return;
        };
        let kind = slot.kind;
        let self_id = slot.handle;
        let flow_block = slot.flow_block;

        match kind {
            IntfKind::Cache(ci) => self.cache_handle_event(ci, event),
            IntfKind::Cla | IntfKind::Base(_) | IntfKind::Socket(_) => match event {
                Event::InterfaceUp { intf_id } if intf_id == self_id => {
                    if let Some(flow) = self.pool.flow_mut(flow_block) {
                        flow.ingress.current_depth_limit = tern_mpool::flows::MAX_SUBQ_DEPTH;
                        flow.egress.current_depth_limit = tern_mpool::flows::MAX_SUBQ_DEPTH;
                    }
                }
                Event::InterfaceDown { intf_id } if intf_id == self_id => {
                    if let Some(flow) = self.pool.flow_mut(flow_block) {
                        flow.ingress.current_depth_limit = 0;
                        flow.egress.current_depth_limit = 0;
                    }
                    self.pool.subq_drop_all(flow_block, Dir::Ingress);
                    self.pool.subq_drop_all(flow_block, Dir::Egress);
                }
                _ => {}
            },
        }
    }

    /// Runs one scheduler step for a flow: its egress forwarder, then its
    /// ingress forwarder, selected by the owning interface kind.
    fn forward_flow(&mut self, flow_id: BlockId) {
        let Some(flow) = self.pool.flow(flow_id) else {
            return;
        };
        let intf_id = flow.external_id;
        let Some(idx) = self.intf_index(intf_id) else {
            return;
        };
        let kind = self.intfs[idx].as_ref().map(|s| s.kind);

        match kind {
            Some(IntfKind::Base(bi)) => {
                self.ds_forward_egress(bi, flow_id);
                self.baseintf_forward_service_ingress(bi, flow_id);
            }
            Some(IntfKind::Cla) => {
                // egress is drained externally through cla_egress()
                self.baseintf_forward_ingress(flow_id);
            }
            Some(IntfKind::Cache(ci)) => {
                self.cache_egress_impl(ci);
                self.ingress_to_parent(flow_id);
            }
            Some(IntfKind::Socket(_)) => {
                // egress is drained by the application through recv()
                self.ingress_to_parent(flow_id);
            }
            None => {}
        }
    }

    /// Funnels a sub-interface's ingress into its parent's ingress.
    pub(crate) fn ingress_to_parent(&mut self, flow_id: BlockId) -> u32 {
        let Some(parent) = self.pool.flow(flow_id).and_then(|f| f.parent) else {
            return 0;
        };
        self.pool
            .subq_move_all(parent, Dir::Ingress, flow_id, Dir::Ingress)
    }

    /// Hands ref-recycle notices to the storage service each one names,
    /// then flushes the affected caches.
    pub(crate) fn deliver_recycle_notices(&mut self) {
        let notices = self.pool.take_notices();
        if notices.is_empty() {
            return;
        }

        let mut touched = Vec::new();
        for notice in notices {
            let Some(idx) = self.intf_index(notice.intf_id) else {
                continue;
            };
            if let Some(IntfKind::Cache(ci)) = self.intfs[idx].as_ref().map(|s| s.kind) {
                self.cache_note_wrapper_recycled(ci, notice.token);
                if !touched.contains(&ci) {
                    touched.push(ci);
                }
            }
        }
        for ci in touched {
            self.cache_flush_pending(ci);
        }
    }
}
