/*!
Dataservices: the per-node base interface and the application sockets
beneath it.

A base interface owns the local node number and an ordered index of
service-number sub-flows. Its ingress forwarder captures not-yet-stored
bundles into the attached storage service and routes everything else; its
egress forwarder does the same capture check and then demuxes deliverable
bundles to the matching service's egress queue.

A socket is a flow subordinate to the base interface for the local node:
`send` wraps an application payload into a primary+payload bundle and
pushes it onto the socket's ingress; `recv` pulls delivered bundles off
the socket's egress and unwraps the payload.
*/

use crate::codec;
use crate::core::Core;
use crate::route::IntfKind;
use crate::status::Status;
use tern_bpv7::{
    BlockType, BundleFlags, CanonicalBlock, CreationTimestamp, CrcType, DtnTime, Eid,
};
use tern_mpool::rbtree::RbTree;
use tern_mpool::{AllocPriority, BlockId, DeliveryPolicy, Handle, flows::Dir};
use tracing::debug;

/// A bound dataservice endpoint under a base interface.
pub(crate) struct ServiceEntry {
    pub flow_block: BlockId,
    pub is_storage: bool,
}

/// Base interface state for one local node number.
pub(crate) struct BaseIntfState {
    pub node_number: u64,
    pub intf_id: Handle,
    /// Service-number index of attached sub-flows.
    pub services: RbTree<ServiceEntry>,
    /// Flow block of the attached storage service, if any.
    pub storage_service: Option<BlockId>,
}

/// Identifies an application socket created on this agent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SocketId(pub(crate) usize);

/// Per-socket parameters applied to locally generated bundles.
#[derive(Debug, Clone)]
pub struct SocketParams {
    /// Bundle lifetime in milliseconds.
    pub lifetime: u64,
    pub crc_type: CrcType,
    pub delivery_policy: DeliveryPolicy,
    /// Local retransmit interval in milliseconds.
    pub local_retx_interval: u64,
    pub is_admin_service: bool,
    pub allow_fragmentation: bool,
}

impl Default for SocketParams {
    fn default() -> Self {
        Self {
            lifetime: 3_600_000,
            crc_type: CrcType::Crc16X25,
            delivery_policy: DeliveryPolicy::LocalAck,
            local_retx_interval: 5_000,
            is_admin_service: false,
            allow_fragmentation: false,
        }
    }
}

pub(crate) struct SocketState {
    pub flow_block: Option<BlockId>,
    pub intf_id: Handle,
    pub params: SocketParams,
    pub local_addr: Option<(u64, u64)>,
    pub remote_addr: Option<(u64, u64)>,
    pub last_bundle_seq: u64,
}

impl Core {
    /// Creates the base interface for a local node number. The caller
    /// normally adds a route for the node (and brings the interface up)
    /// afterwards.
    pub(crate) fn add_base_intf(&mut self, node_number: u64) -> Result<Handle, Status> {
        let flow_block = self
            .pool
            .alloc_flow(AllocPriority::Medium)
            .ok_or(Status::ResourceExhausted)?;
        let bi = self.bases.len();
        self.bases.push(Some(BaseIntfState {
            node_number,
            intf_id: Handle::INVALID,
            services: RbTree::new(),
            storage_service: None,
        }));
        let handle = match self.register_intf(Handle::INVALID, flow_block, IntfKind::Base(bi)) {
            Ok(handle) => handle,
            Err(e) => {
                self.bases[bi] = None;
                self.pool.recycle_block(flow_block);
                return Err(e);
            }
        };
        self.bases[bi].as_mut().unwrap().intf_id = handle;
        Ok(handle)
    }

    pub(crate) fn base_for_node(&self, node_number: u64) -> Option<usize> {
        self.bases
            .iter()
            .position(|b| b.as_ref().is_some_and(|b| b.node_number == node_number))
    }

    /// Attaches a sub-flow as a dataservice endpoint at `(node, service)`.
    /// A storage attachment also marks the base interface storage-capable.
    pub(crate) fn attach_service(
        &mut self,
        addr: (u64, u64),
        flow_block: BlockId,
        is_storage: bool,
        kind: IntfKind,
    ) -> Result<Handle, Status> {
        let bi = self.base_for_node(addr.0).ok_or(Status::Unroutable)?;
        let base_intf_id = self.bases[bi].as_ref().unwrap().intf_id;

        {
            let base = self.bases[bi].as_mut().unwrap();
            base.services
                .insert_unique(
                    addr.1,
                    ServiceEntry {
                        flow_block,
                        is_storage,
                    },
                )
                .map_err(|_| Status::Duplicate)?;
        }

        let handle = match self.register_intf(base_intf_id, flow_block, kind) {
            Ok(handle) => handle,
            Err(e) => {
                let base = self.bases[bi].as_mut().unwrap();
                if let Some(node) = base.services.search_unique(addr.1) {
                    base.services.extract(node);
                }
                return Err(e);
            }
        };

        if is_storage {
            self.bases[bi].as_mut().unwrap().storage_service = Some(flow_block);
            self.intf_set_flags(base_intf_id, crate::route::INTF_STATE_STORAGE)?;
        }
        Ok(handle)
    }

    /// Detaches the dataservice endpoint at `addr`, returning its flow
    /// block.
    pub(crate) fn detach_service(&mut self, addr: (u64, u64)) -> Result<BlockId, Status> {
        let bi = self.base_for_node(addr.0).ok_or(Status::NotFound)?;
        let base = self.bases[bi].as_mut().unwrap();
        let node = base.services.search_unique(addr.1).ok_or(Status::NotFound)?;
        let entry = base.services.extract(node);
        if entry.is_storage {
            base.storage_service = None;
        }
        let base_intf_id = base.intf_id;
        if entry.is_storage {
            self.intf_unset_flags(base_intf_id, crate::route::INTF_STATE_STORAGE)?;
        }
        Ok(entry.flow_block)
    }

    /// The base interface's ingress forwarder: capture not-yet-stored
    /// bundles into storage, route the rest.
    pub(crate) fn baseintf_forward_service_ingress(&mut self, bi: usize, flow_id: BlockId) -> u32 {
        let mut forward_count = 0;
        while let Some(qblk) = self.pool.subq_try_pull(flow_id, Dir::Ingress) {
            forward_count += 1;

            let storage_flow = self.bases[bi].as_ref().and_then(|b| b.storage_service);
            let base = self.pool.base_block(qblk);
            let needs_capture = match (self.pool.primary(base), storage_flow) {
                (Some(p), Some(_)) => !p.delivery.storage_intf_id.is_valid(),
                _ => false,
            };

            if needs_capture {
                let storage_flow = storage_flow.unwrap();
                if self.pool.subq_try_push(storage_flow, Dir::Egress, qblk) {
                    continue;
                }
            }
            self.route_ingress_single_bundle(qblk);
        }
        forward_count
    }

    /// The base interface's egress forwarder: capture not-yet-stored
    /// bundles, then demux deliverable bundles to the matching service.
    pub(crate) fn ds_forward_egress(&mut self, bi: usize, flow_id: BlockId) -> u32 {
        let now = self.now();
        let base_intf_id = self.bases[bi].as_ref().map(|b| b.intf_id);
        let mut forward_count = 0;
        while let Some(qblk) = self.pool.subq_try_pull(flow_id, Dir::Egress) {
            forward_count += 1;

            let base_blk = self.pool.base_block(qblk);
            let Some(p) = self.pool.primary(base_blk) else {
                self.pool.recycle_block(qblk);
                continue;
            };
            let stored = p.delivery.storage_intf_id.is_valid();
            let dest_service = p.logical.destination.service_number();

            let (target, is_local_delivery) = {
                let base = self.bases[bi].as_ref().unwrap();
                if !stored && base.storage_service.is_some() {
                    (base.storage_service, false)
                } else {
                    (
                        base.services
                            .search_unique(dest_service)
                            .map(|n| base.services.get(n).flow_block),
                        true,
                    )
                }
            };

            if is_local_delivery && target.is_some() {
                // local delivery completes the bundle's journey; stamp the
                // egress so storage stops retaining it
                if let (Some(p), Some(intf_id)) = (self.pool.primary_mut(base_blk), base_intf_id) {
                    p.delivery.egress_intf_id = intf_id;
                    p.delivery.egress_time = now;
                }
            }

            match target {
                Some(flow) if self.pool.subq_try_push(flow, Dir::Egress, qblk) => {}
                _ => {
                    debug!("undeliverable bundle discarded");
                    self.pool.recycle_block(qblk);
                }
            }
        }
        forward_count
    }

    pub(crate) fn create_socket(&mut self, params: SocketParams) -> SocketId {
        let sid = self.sockets.len();
        self.sockets.push(Some(SocketState {
            flow_block: None,
            intf_id: Handle::INVALID,
            params,
            local_addr: None,
            remote_addr: None,
            last_bundle_seq: 0,
        }));
        SocketId(sid)
    }

    fn socket(&self, sid: SocketId) -> Result<&SocketState, Status> {
        self.sockets
            .get(sid.0)
            .and_then(|s| s.as_ref())
            .ok_or(Status::InvalidArgument)
    }

    fn socket_mut(&mut self, sid: SocketId) -> Result<&mut SocketState, Status> {
        self.sockets
            .get_mut(sid.0)
            .and_then(|s| s.as_mut())
            .ok_or(Status::InvalidArgument)
    }

    /// Binds a socket to a local `(node, service)` address, attaching its
    /// flow under the node's base interface.
    pub(crate) fn socket_bind(&mut self, sid: SocketId, addr: (u64, u64)) -> Result<(), Status> {
        if self.socket(sid)?.local_addr.is_some() {
            return Err(Status::InvalidArgument);
        }
        let flow_block = self
            .pool
            .alloc_flow(AllocPriority::Medium)
            .ok_or(Status::ResourceExhausted)?;

        let intf_id = match self.attach_service(addr, flow_block, false, IntfKind::Socket(sid.0)) {
            Ok(handle) => handle,
            Err(e) => {
                self.pool.recycle_block(flow_block);
                return Err(e);
            }
        };
        self.intf_set_flags(intf_id, crate::route::INTF_AVAILABLE_FLAGS)?;

        let sock = self.socket_mut(sid)?;
        sock.flow_block = Some(flow_block);
        sock.intf_id = intf_id;
        sock.local_addr = Some(addr);
        Ok(())
    }

    pub(crate) fn socket_connect(&mut self, sid: SocketId, addr: (u64, u64)) -> Result<(), Status> {
        let sock = self.socket_mut(sid)?;
        if sock.local_addr.is_none() {
            return Err(Status::InvalidArgument);
        }
        sock.remote_addr = Some(addr);
        Ok(())
    }

    pub(crate) fn socket_close(&mut self, sid: SocketId) {
        let Ok(sock) = self.socket_mut(sid) else {
            return;
        };
        let local_addr = sock.local_addr.take();
        let intf_id = sock.intf_id;
        self.sockets[sid.0] = None;

        if let Some(addr) = local_addr {
            let _ = self.detach_service(addr);
            let _ = self.del_intf(intf_id);
        }
    }

    /// Builds a bundle around an application payload, per the socket's
    /// parameters, pre-encoding both blocks. Returns the primary block.
    fn bundleize_payload(&mut self, sid: SocketId, payload: &[u8]) -> Result<BlockId, Status> {
        let sock = self.socket(sid)?;
        let (local, remote) = match (sock.local_addr, sock.remote_addr) {
            (Some(l), Some(r)) => (l, r),
            _ => return Err(Status::InvalidArgument),
        };
        let params = sock.params.clone();

        let pblk = self
            .pool
            .alloc_primary(AllocPriority::Low)
            .ok_or(Status::ResourceExhausted)?;

        let result = (|| -> Result<(), Status> {
            let now = self.now();
            let seq = {
                let sock = self.socket_mut(sid)?;
                let seq = sock.last_bundle_seq;
                sock.last_bundle_seq += 1;
                seq
            };
            {
                let p = self.pool.primary_mut(pblk).ok_or(Status::InvalidArgument)?;
                p.logical = tern_bpv7::PrimaryBlock {
                    flags: BundleFlags {
                        is_admin_record: params.is_admin_service,
                        must_not_fragment: !params.allow_fragmentation,
                        ..Default::default()
                    },
                    crc_type: params.crc_type,
                    destination: Eid::Ipn {
                        node: remote.0,
                        service: remote.1,
                    },
                    source: Eid::Ipn {
                        node: local.0,
                        service: local.1,
                    },
                    report_to: Eid::Ipn {
                        node: local.0,
                        service: local.1,
                    },
                    timestamp: CreationTimestamp {
                        time: DtnTime::new(now),
                        sequence_number: seq,
                    },
                    lifetime: params.lifetime,
                    fragment_info: None,
                    crc_value: 0,
                };
                p.delivery.delivery_policy = params.delivery_policy;
                p.delivery.local_retx_interval = params.local_retx_interval;
            }
            codec::encode_primary(&mut self.pool, pblk)?;

            let cblk = self
                .pool
                .alloc_canonical(AllocPriority::Low)
                .ok_or(Status::ResourceExhausted)?;
            self.pool
                .primary_mut(pblk)
                .ok_or(Status::InvalidArgument)?
                .cblocks
                .push(cblk);
            {
                let c = self.pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?;
                c.logical = CanonicalBlock {
                    block_type: BlockType::Payload,
                    block_num: 1,
                    crc_type: params.crc_type,
                    ..Default::default()
                };
                c.parent = Some(pblk);
            }
            codec::encode_canonical(&mut self.pool, cblk, Some(payload))?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(pblk),
            Err(e) => {
                self.pool.recycle_block(pblk);
                Err(e)
            }
        }
    }

    /// One send attempt: bundleize and push onto the socket's ingress.
    /// The blocking loop with the caller's deadline lives in the public
    /// API layer.
    pub(crate) fn socket_send_once(&mut self, sid: SocketId, payload: &[u8]) -> Result<(), Status> {
        let sock = self.socket(sid)?;
        let flow_block = sock.flow_block.ok_or(Status::InvalidArgument)?;
        let remote = sock.remote_addr.ok_or(Status::InvalidArgument)?;

        // a locally generated bundle with no route at all fails up front
        if self.get_next_intf_with_flags(remote.0, 0, 0).is_none() {
            return Err(Status::Unroutable);
        }

        let pblk = self.bundleize_payload(sid, payload)?;
        let r = self.pool.ref_create(pblk);
        let Some(rblk) = self.pool.ref_make_block(&r, None) else {
            self.pool.ref_release(r);
            return Err(Status::ResourceExhausted);
        };

        let pushed = self.pool.subq_try_push(flow_block, Dir::Ingress, rblk);
        if !pushed {
            self.pool.recycle_block(rblk);
        }
        self.pool.ref_release(r);
        if pushed {
            Ok(())
        } else {
            Err(Status::Timeout)
        }
    }

    /// One receive attempt: pull a delivered bundle off the socket's
    /// egress and copy its payload out. `Ok(None)` when nothing waits.
    pub(crate) fn socket_recv_once(
        &mut self,
        sid: SocketId,
        buf: &mut [u8],
    ) -> Result<Option<usize>, Status> {
        let flow_block = self.socket(sid)?.flow_block.ok_or(Status::InvalidArgument)?;
        let Some(qblk) = self.pool.subq_try_pull(flow_block, Dir::Egress) else {
            return Ok(None);
        };

        let base = self.pool.base_block(qblk);
        let result = match codec::locate_canonical(&self.pool, base, BlockType::Payload) {
            Some(payload_blk) => codec::export_content(&self.pool, payload_blk, buf).map(Some),
            None => Err(Status::FormatError),
        };
        self.pool.recycle_block(qblk);
        result
    }

}
