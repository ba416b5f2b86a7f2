/*!
Routing: longest-mask destination matching over a small sequential route
table, an interface registry addressed by generational handles, and the
state-change event fan-out that wakes storage when links come up.

Routes are kept sorted most-specific-mask first, so lookup is a linear
first-match scan. Interface state changes and route changes are delivered
to every registered interface as messages on per-interface event queues;
a failing handler cannot wedge the others.
*/

use crate::core::Core;
use crate::status::Status;
use tern_mpool::{BlockId, Handle, flows::Dir};
use tracing::debug;

pub(crate) const INTF_STATE_ADMIN_UP: u32 = 0x01;
pub(crate) const INTF_STATE_OPER_UP: u32 = 0x02;
pub(crate) const INTF_STATE_STORAGE: u32 = 0x04;
pub(crate) const INTF_AVAILABLE_FLAGS: u32 = INTF_STATE_ADMIN_UP | INTF_STATE_OPER_UP;

/// A state-change notification fanned out to every interface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    InterfaceUp { intf_id: Handle },
    InterfaceDown { intf_id: Handle },
    RouteUp { dest: u64, mask: u64 },
    RouteDown { dest: u64, mask: u64 },
    PollInterval,
}

/// Which subsystem owns an interface; selects its forwarders and event
/// handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum IntfKind {
    Cla,
    Base(usize),
    Cache(usize),
    Socket(usize),
}

pub(crate) struct IntfSlot {
    pub handle: Handle,
    pub state_flags: u32,
    pub flow_block: BlockId,
    pub flow_ref: tern_mpool::Ref,
    pub kind: IntfKind,
    pub events_tx: flume::Sender<Event>,
    pub events_rx: flume::Receiver<Event>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RouteEntry {
    pub dest: u64,
    pub mask: u64,
    pub intf_id: Handle,
}

/// Mask bits must be contiguous from the MSB down.
fn mask_is_valid(mask: u64) -> bool {
    let inv = !mask;
    (inv.wrapping_add(1) & inv) == 0
}

impl Core {
    /// Registers a flow block as an interface, assigning a generational
    /// handle. `parent` links the flow under an existing interface for
    /// ingress funnelling.
    pub(crate) fn register_intf(
        &mut self,
        parent: Handle,
        flow_block: BlockId,
        kind: IntfKind,
    ) -> Result<Handle, Status> {
        let idx = self
            .intfs
            .iter()
            .position(|s| s.is_none())
            .ok_or(Status::ResourceExhausted)?;

        let serial = {
            let s = &mut self.intf_serials[idx];
            *s = s.wrapping_add(1) & 0x00FF_FFFF;
            if *s == 0 {
                *s = 1;
            }
            *s
        };
        let handle = Handle::new(idx, serial);

        let parent_flow = if parent.is_valid() {
            Some(
                self.intfs[parent.index()]
                    .as_ref()
                    .filter(|s| s.handle == parent)
                    .ok_or(Status::NotFound)?
                    .flow_block,
            )
        } else {
            None
        };

        {
            let flow = self.pool.flow_mut(flow_block).ok_or(Status::InvalidArgument)?;
            flow.external_id = handle;
            flow.parent = parent_flow;
        }
        let flow_ref = self.pool.ref_create(flow_block);

        let (events_tx, events_rx) = flume::unbounded();
        self.intfs[idx] = Some(IntfSlot {
            handle,
            state_flags: 0,
            flow_block,
            flow_ref,
            kind,
            events_tx,
            events_rx,
        });
        Ok(handle)
    }

    /// Resolves a handle to its slot index, checking the serial so a
    /// stale handle cannot alias a reused slot.
    pub(crate) fn intf_index(&self, intf_id: Handle) -> Option<usize> {
        if !intf_id.is_valid() {
            return None;
        }
        let idx = intf_id.index();
        self.intfs
            .get(idx)?
            .as_ref()
            .filter(|s| s.handle == intf_id)
            .map(|_| idx)
    }

    pub(crate) fn intf_flow_block(&self, intf_id: Handle) -> Option<BlockId> {
        self.intf_index(intf_id)
            .and_then(|i| self.intfs[i].as_ref())
            .map(|s| s.flow_block)
    }

    /// Removes an interface; any routes over it remain but stop
    /// matching flag-qualified lookups.
    pub(crate) fn del_intf(&mut self, intf_id: Handle) -> Result<(), Status> {
        let idx = self.intf_index(intf_id).ok_or(Status::NotFound)?;
        let slot = self.intfs[idx].take().ok_or(Status::NotFound)?;
        self.pool.ref_release(slot.flow_ref);
        Ok(())
    }

    /// Adds a route. The table stays ordered most-specific-mask first;
    /// exact duplicates are rejected, as are masks with non-contiguous
    /// bits.
    pub(crate) fn route_add(&mut self, dest: u64, mask: u64, intf_id: Handle) -> Result<(), Status> {
        if self.routes.len() >= self.max_routes {
            return Err(Status::ResourceExhausted);
        }
        if !mask_is_valid(mask) {
            return Err(Status::InvalidArgument);
        }

        let mut insert_pos = 0;
        for rp in &self.routes {
            if rp.mask == mask && rp.dest == dest && rp.intf_id == intf_id {
                return Err(Status::Duplicate);
            }
            if (rp.mask & mask) == mask {
                // existing route is at least as specific; new one goes after
                insert_pos += 1;
            }
        }

        self.routes.insert(
            insert_pos,
            RouteEntry {
                dest,
                mask,
                intf_id,
            },
        );
        debug!("route added: {dest:#x}/{mask:#x} via {intf_id:?}");

        if self
            .intf_index(intf_id)
            .and_then(|i| self.intfs[i].as_ref())
            .is_some_and(|s| s.state_flags & INTF_AVAILABLE_FLAGS == INTF_AVAILABLE_FLAGS)
        {
            self.fan_out_event(Event::RouteUp { dest, mask });
        }
        Ok(())
    }

    pub(crate) fn route_del(&mut self, dest: u64, mask: u64, intf_id: Handle) -> Result<(), Status> {
        let pos = self
            .routes
            .iter()
            .position(|rp| rp.mask == mask && rp.dest == dest && rp.intf_id == intf_id)
            .ok_or(Status::NotFound)?;
        self.routes.remove(pos);
        self.fan_out_event(Event::RouteDown { dest, mask });
        Ok(())
    }

    /// First route whose destination matches and whose interface's state
    /// flags satisfy `(flags & flag_mask) == req_flags`.
    pub(crate) fn get_next_intf_with_flags(
        &self,
        dest: u64,
        req_flags: u32,
        flag_mask: u32,
    ) -> Option<Handle> {
        for rp in &self.routes {
            if (rp.dest ^ dest) & rp.mask != 0 {
                continue;
            }
            let intf_flags = if flag_mask != 0 {
                match self.intf_index(rp.intf_id) {
                    Some(i) => self.intfs[i].as_ref().map(|s| s.state_flags).unwrap_or(0),
                    None => continue,
                }
            } else {
                !req_flags
            };
            if intf_flags & flag_mask == req_flags {
                return Some(rp.intf_id);
            }
        }
        None
    }

    /// Raises interface state flags; a down-to-up transition of the
    /// availability flags fans out interface-up and route-up events.
    pub(crate) fn intf_set_flags(&mut self, intf_id: Handle, flags: u32) -> Result<(), Status> {
        let idx = self.intf_index(intf_id).ok_or(Status::NotFound)?;
        let slot = self.intfs[idx].as_mut().ok_or(Status::NotFound)?;
        let was_down = !slot.state_flags & INTF_AVAILABLE_FLAGS != 0;
        slot.state_flags |= flags;
        let now_up = !slot.state_flags & INTF_AVAILABLE_FLAGS == 0;
        if was_down && now_up {
            self.handle_intf_statechange(intf_id, true);
        }
        Ok(())
    }

    pub(crate) fn intf_unset_flags(&mut self, intf_id: Handle, flags: u32) -> Result<(), Status> {
        let idx = self.intf_index(intf_id).ok_or(Status::NotFound)?;
        let slot = self.intfs[idx].as_mut().ok_or(Status::NotFound)?;
        let was_up = !slot.state_flags & INTF_AVAILABLE_FLAGS == 0;
        slot.state_flags &= !flags;
        let now_down = !slot.state_flags & INTF_AVAILABLE_FLAGS != 0;
        if was_up && now_down {
            self.handle_intf_statechange(intf_id, false);
        }
        Ok(())
    }

    fn handle_intf_statechange(&mut self, intf_id: Handle, is_up: bool) {
        self.fan_out_event(if is_up {
            Event::InterfaceUp { intf_id }
        } else {
            Event::InterfaceDown { intf_id }
        });

        let affected: Vec<RouteEntry> = self
            .routes
            .iter()
            .copied()
            .filter(|rp| rp.intf_id == intf_id)
            .collect();
        for rp in affected {
            self.fan_out_event(if is_up {
                Event::RouteUp {
                    dest: rp.dest,
                    mask: rp.mask,
                }
            } else {
                Event::RouteDown {
                    dest: rp.dest,
                    mask: rp.mask,
                }
            });
        }
    }

    pub(crate) fn push_egress_bundle(&mut self, intf_id: Handle, blk: BlockId) -> Result<(), Status> {
        let flow_block = self.intf_flow_block(intf_id).ok_or(Status::NotFound)?;
        if self.pool.subq_try_push(flow_block, Dir::Egress, blk) {
            Ok(())
        } else {
            Err(Status::ResourceExhausted)
        }
    }

    /// Routes one bundle toward its destination. A bundle that is not yet
    /// stored but wants acknowledgement is steered to a storage-capable
    /// interface; a stored bundle skips storage. Unroutable bundles go to
    /// the recycle bin.
    pub(crate) fn route_ingress_single_bundle(&mut self, qblk: BlockId) {
        let base = self.pool.base_block(qblk);
        let routed = match self.pool.primary(base) {
            None => false,
            Some(p) => {
                let dest_node = p.logical.destination.node_number();
                let mut req_flags = INTF_AVAILABLE_FLAGS;
                let mut flag_mask = INTF_AVAILABLE_FLAGS;
                if p.delivery.storage_intf_id.is_valid() {
                    // already stored; the next hop must not be storage
                    flag_mask |= INTF_STATE_STORAGE;
                } else if p.delivery.delivery_policy != tern_mpool::DeliveryPolicy::None {
                    // not yet stored and needs to be
                    flag_mask |= INTF_STATE_STORAGE;
                    req_flags |= INTF_STATE_STORAGE;
                }

                let stored = p.delivery.storage_intf_id.is_valid();
                let next_hop = self
                    .get_next_intf_with_flags(dest_node, req_flags, flag_mask)
                    .or_else(|| {
                        // a stored bundle addressed to a local node is
                        // delivered through that node's base interface,
                        // even though the base is storage-capable
                        if stored {
                            self.base_for_node(dest_node)
                                .and_then(|bi| self.bases[bi].as_ref())
                                .map(|b| b.intf_id)
                                .filter(|&id| {
                                    self.intf_index(id)
                                        .and_then(|i| self.intfs[i].as_ref())
                                        .is_some_and(|s| {
                                            s.state_flags & INTF_AVAILABLE_FLAGS
                                                == INTF_AVAILABLE_FLAGS
                                        })
                                })
                        } else {
                            None
                        }
                    });
                match next_hop {
                    Some(next_hop) => self.push_egress_bundle(next_hop, qblk).is_ok(),
                    None => false,
                }
            }
        };

        if !routed {
            debug!("unroutable bundle discarded");
            self.pool.recycle_block(qblk);
        }
    }

    /// The ingress forwarder shared by CLAs and base interfaces: pull
    /// every waiting bundle and route it. Returns the number of bundles
    /// moved.
    pub(crate) fn baseintf_forward_ingress(&mut self, flow_id: BlockId) -> u32 {
        let mut forward_count = 0;
        while let Some(qblk) = self.pool.subq_try_pull(flow_id, Dir::Ingress) {
            forward_count += 1;
            self.route_ingress_single_bundle(qblk);
        }
        forward_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::clock::SystemClock;
    use tern_mpool::AllocPriority;

    fn core() -> Core {
        Core::new(&Config::default(), Box::new(SystemClock))
    }

    fn new_intf(core: &mut Core) -> Handle {
        let flow = core.pool.alloc_flow(AllocPriority::High).unwrap();
        core.register_intf(Handle::INVALID, flow, IntfKind::Cla)
            .unwrap()
    }

    #[test]
    fn mask_validation() {
        assert!(mask_is_valid(0));
        assert!(mask_is_valid(u64::MAX));
        assert!(mask_is_valid(0xFFFF_FF00_0000_0000));
        assert!(!mask_is_valid(0x0000_00FF));
        assert!(!mask_is_valid(0xFF00_FF00_0000_0000));
    }

    #[test]
    fn routes_order_most_specific_first() {
        let mut core = core();
        let a = new_intf(&mut core);
        let b = new_intf(&mut core);

        core.route_add(0, 0, a).unwrap();
        core.route_add(200, u64::MAX, b).unwrap();

        // inserted after the wildcard chronologically, but matched first
        assert_eq!(core.routes[0].intf_id, b);
        assert_eq!(
            core.get_next_intf_with_flags(200, 0, 0),
            Some(b)
        );
        assert_eq!(core.get_next_intf_with_flags(77, 0, 0), Some(a));
    }

    #[test]
    fn duplicate_and_invalid_routes_rejected() {
        let mut core = core();
        let a = new_intf(&mut core);
        core.route_add(200, u64::MAX, a).unwrap();
        assert_eq!(
            core.route_add(200, u64::MAX, a).unwrap_err(),
            Status::Duplicate
        );
        assert_eq!(
            core.route_add(200, 0x00FF, a).unwrap_err(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn flag_qualified_lookup() {
        let mut core = core();
        let a = new_intf(&mut core);
        core.route_add(200, u64::MAX, a).unwrap();

        // down: no available interface
        assert_eq!(
            core.get_next_intf_with_flags(200, INTF_AVAILABLE_FLAGS, INTF_AVAILABLE_FLAGS),
            None
        );
        core.intf_set_flags(a, INTF_AVAILABLE_FLAGS).unwrap();
        assert_eq!(
            core.get_next_intf_with_flags(200, INTF_AVAILABLE_FLAGS, INTF_AVAILABLE_FLAGS),
            Some(a)
        );
    }

    #[test]
    fn stale_handle_fails_lookup() {
        let mut core = core();
        let a = new_intf(&mut core);
        assert!(core.intf_index(a).is_some());
        core.del_intf(a).unwrap();
        assert!(core.intf_index(a).is_none());

        // slot reuse bumps the serial, so the old handle stays dead
        let b = new_intf(&mut core);
        assert_eq!(b.index(), a.index());
        assert_ne!(b, a);
        assert!(core.intf_index(a).is_none());
        assert!(core.intf_index(b).is_some());
    }

    #[test]
    fn statechange_fans_route_events() {
        let mut core = core();
        let a = new_intf(&mut core);
        let b = new_intf(&mut core);
        core.route_add(200, u64::MAX, a).unwrap();

        core.intf_set_flags(a, INTF_AVAILABLE_FLAGS).unwrap();

        // b's event queue saw interface-up and route-up for a
        let slot = core.intfs[core.intf_index(b).unwrap()].as_ref().unwrap();
        // events were dispatched (drained) by fan_out_event
        assert!(slot.events_rx.try_recv().is_err());
    }
}
