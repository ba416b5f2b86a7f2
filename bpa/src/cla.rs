/*!
The convergence-layer adapter contract.

A CLA registers as an interface and then moves flat wire bytes across it:
`cla_ingress` decodes a received bundle into pool blocks and queues it for
routing; `cla_egress` pops one bundle headed for the CLA and writes its
full encoded form into the caller's buffer. Link state is reported through
the interface flag calls, which the routing table fans out as events.
*/

use crate::codec;
use crate::core::Core;
use crate::route::IntfKind;
use crate::status::Status;
use tern_bpv7::BlockType;
use tern_mpool::{AllocPriority, BlockId, DeliveryPolicy, Handle, flows::Dir};

/// Retransmit interval applied to custody-tracked bundles accepted from a
/// CLA, until the local policy layer says otherwise.
const CLA_DEFAULT_RETX_MS: u64 = 5_000;

impl Core {
    /// Registers a CLA interface. Its queues open when the CLA reports
    /// ADMIN_UP and OPER_UP.
    pub(crate) fn create_cla_intf(&mut self) -> Result<Handle, Status> {
        let flow_block = self
            .pool
            .alloc_flow(AllocPriority::Medium)
            .ok_or(Status::ResourceExhausted)?;
        match self.register_intf(Handle::INVALID, flow_block, IntfKind::Cla) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.pool.recycle_block(flow_block);
                Err(e)
            }
        }
    }

    fn cla_flow(&self, intf_id: Handle) -> Result<BlockId, Status> {
        let idx = self.intf_index(intf_id).ok_or(Status::NotFound)?;
        let slot = self.intfs[idx].as_ref().ok_or(Status::NotFound)?;
        if slot.kind != IntfKind::Cla {
            return Err(Status::InvalidArgument);
        }
        Ok(slot.flow_block)
    }

    /// One ingress attempt: decode the wire bytes and queue the bundle
    /// for routing. `Ok(None)` means the queue cannot accept right now
    /// (back-pressure or interface down); the caller decides whether to
    /// wait.
    pub(crate) fn cla_ingress_once(
        &mut self,
        intf_id: Handle,
        data: &[u8],
    ) -> Result<Option<()>, Status> {
        let flow_block = self.cla_flow(intf_id)?;
        if !self
            .pool
            .flow(flow_block)
            .ok_or(Status::NotFound)?
            .ingress
            .may_push()
        {
            return Ok(None);
        }

        let (pblk, consumed) = match codec::copy_full_bundle_in(&mut self.pool, data) {
            Ok(v) => v,
            Err(Status::ResourceExhausted) => return Ok(None),
            Err(e) => return Err(e),
        };
        if consumed != data.len() {
            self.pool.recycle_block(pblk);
            return Err(Status::FormatError);
        }

        let now = self.now();
        let custody_tracked =
            codec::locate_canonical(&self.pool, pblk, BlockType::CustodyTracking).is_some();
        {
            let p = self.pool.primary_mut(pblk).ok_or(Status::FormatError)?;
            p.delivery.ingress_intf_id = intf_id;
            p.delivery.ingress_time = now;
            if custody_tracked {
                // a custody-tracking block makes this node a candidate
                // custodian; storage will take it from here
                p.delivery.delivery_policy = DeliveryPolicy::CustodyTracking;
                p.delivery.local_retx_interval = CLA_DEFAULT_RETX_MS;
            }
        }

        let r = self.pool.ref_create(pblk);
        let Some(rblk) = self.pool.ref_make_block(&r, None) else {
            self.pool.ref_release(r);
            return Ok(None);
        };

        let pushed = self.pool.subq_try_push(flow_block, Dir::Ingress, rblk);
        if !pushed {
            self.pool.recycle_block(rblk);
        }
        self.pool.ref_release(r);
        if pushed { Ok(Some(())) } else { Ok(None) }
    }

    /// One egress attempt: pop the next bundle bound for this CLA and
    /// write its wire form into `out`. `Ok(None)` when nothing waits.
    pub(crate) fn cla_egress_once(
        &mut self,
        intf_id: Handle,
        out: &mut [u8],
    ) -> Result<Option<usize>, Status> {
        let flow_block = self.cla_flow(intf_id)?;
        let Some(qblk) = self.pool.subq_try_pull(flow_block, Dir::Egress) else {
            return Ok(None);
        };

        let base = self.pool.base_block(qblk);
        let result = (|| {
            if self.pool.primary(base).is_none() {
                return Err(Status::FormatError);
            }
            let size = codec::compute_full_bundle_size(&mut self.pool, base)?;
            if size > out.len() {
                return Err(Status::ResourceExhausted);
            }
            let n = codec::copy_full_bundle_out(&mut self.pool, base, out)?;

            // mark the bundle as actually taken by this CLA; storage uses
            // this to schedule the retransmit timer
            let now = self.now();
            let p = self.pool.primary_mut(base).ok_or(Status::FormatError)?;
            p.delivery.egress_intf_id = intf_id;
            p.delivery.egress_time = now;
            Ok(n)
        })();

        // pass or fail, the pulled copy has to go somewhere
        self.pool.recycle_block(qblk);
        result.map(Some)
    }
}
