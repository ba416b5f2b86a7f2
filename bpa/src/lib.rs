/*!
A BPv7 bundle processing agent for delay/disruption-tolerant networks.

The agent accepts application payloads over a socket-style API, wraps them
in bundles, retains them in a store-and-forward cache while they await a
transmission opportunity, and moves them toward their destination over
convergence-layer adapters. Bundles arriving from a CLA are decoded and
either delivered to a locally bound socket or forwarded onward, with
custody-transfer acknowledgement along the way.

All core state lives behind one coarse lock; the three blocking
operations (send, recv, CLA transfer) wait on a condition variable with a
caller-supplied timeout. A single external trigger, [`BpAgent::do_maintenance`],
drives timers, forwarding and memory reclamation; the embedding
application decides how often to call it.
*/

mod cache;
mod cla;
mod clock;
mod codec;
mod config;
mod core;
mod dataservice;
mod offload;
mod route;
mod status;

#[cfg(test)]
mod tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dataservice::{SocketId, SocketParams};
pub use offload::OffloadBackend;
pub use status::Status;

pub use codec::{
    compute_full_bundle_size, copy_full_bundle_in, copy_full_bundle_out, encode_canonical,
    encode_primary, export_content, locate_canonical,
};

pub use tern_mpool::{DeliveryPolicy, Handle, Pool, PoolCounts};

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Interface state flags reported by CLAs (and applied to base
/// interfaces) through [`BpAgent::intf_set_flags`].
pub mod intf_flags {
    /// Administratively enabled.
    pub const ADMIN_UP: u32 = crate::route::INTF_STATE_ADMIN_UP;
    /// Operationally up (link established).
    pub const OPER_UP: u32 = crate::route::INTF_STATE_OPER_UP;
}

/// The agent instance: a coarse-locked core plus the condition variable
/// the blocking operations wait on.
pub struct BpAgent {
    core: Mutex<core::Core>,
    wakeup: Condvar,
}

impl BpAgent {
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    /// Builds an agent with an explicit time source; simulations pass a
    /// [`ManualClock`] handle.
    pub fn with_clock(config: Config, clock: Box<dyn Clock>) -> Self {
        Self {
            core: Mutex::new(core::Core::new(&config, clock)),
            wakeup: Condvar::new(),
        }
    }

    fn with_core<T>(&self, f: impl FnOnce(&mut core::Core) -> T) -> T {
        let mut core = self.core.lock().unwrap();
        let out = f(&mut core);
        drop(core);
        self.wakeup.notify_all();
        out
    }

    /// Retries `attempt` until it produces a value or the timeout lapses.
    /// `Ok(None)` from the attempt means "would block".
    fn block_on<T>(
        &self,
        timeout_ms: u64,
        mut attempt: impl FnMut(&mut core::Core) -> Result<Option<T>, Status>,
    ) -> Result<T, Status> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut core = self.core.lock().unwrap();
        loop {
            match attempt(&mut core)? {
                Some(v) => {
                    drop(core);
                    self.wakeup.notify_all();
                    return Ok(v);
                }
                None => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Status::Timeout);
            }
            let (guard, _) = self.wakeup.wait_timeout(core, deadline - now).unwrap();
            core = guard;
        }
    }

    /// Drives timers, forwarding and memory reclamation once. The caller
    /// owns the cadence.
    pub fn do_maintenance(&self) {
        self.with_core(|c| c.do_maintenance());
    }

    // --- routing & interfaces -------------------------------------------

    pub fn route_add(&self, dest: u64, mask: u64, intf_id: Handle) -> Result<(), Status> {
        self.with_core(|c| c.route_add(dest, mask, intf_id))
    }

    pub fn route_del(&self, dest: u64, mask: u64, intf_id: Handle) -> Result<(), Status> {
        self.with_core(|c| c.route_del(dest, mask, intf_id))
    }

    pub fn create_cla_intf(&self) -> Result<Handle, Status> {
        self.with_core(|c| c.create_cla_intf())
    }

    pub fn intf_set_flags(&self, intf_id: Handle, flags: u32) -> Result<(), Status> {
        let allowed = intf_flags::ADMIN_UP | intf_flags::OPER_UP;
        self.with_core(|c| c.intf_set_flags(intf_id, flags & allowed))
    }

    pub fn intf_unset_flags(&self, intf_id: Handle, flags: u32) -> Result<(), Status> {
        let allowed = intf_flags::ADMIN_UP | intf_flags::OPER_UP;
        self.with_core(|c| c.intf_unset_flags(intf_id, flags & allowed))
    }

    // --- dataservices ---------------------------------------------------

    /// Creates the base interface for a local node number; add a route
    /// for the node and bring the interface up to activate it.
    pub fn add_base_intf(&self, node_number: u64) -> Result<Handle, Status> {
        self.with_core(|c| c.add_base_intf(node_number))
    }

    /// Attaches a store-and-forward cache at `(node, service)` as the
    /// node's storage service.
    pub fn attach_cache(&self, node: u64, service: u64) -> Result<Handle, Status> {
        self.with_core(|c| c.attach_cache((node, service)))
    }

    pub fn detach_cache(&self, node: u64, service: u64) -> Result<(), Status> {
        self.with_core(|c| c.detach_cache((node, service)))
    }

    // --- sockets --------------------------------------------------------

    pub fn create_socket(&self, params: SocketParams) -> SocketId {
        self.with_core(|c| c.create_socket(params))
    }

    pub fn bind(&self, socket: SocketId, node: u64, service: u64) -> Result<(), Status> {
        self.with_core(|c| c.socket_bind(socket, (node, service)))
    }

    pub fn connect(&self, socket: SocketId, node: u64, service: u64) -> Result<(), Status> {
        self.with_core(|c| c.socket_connect(socket, (node, service)))
    }

    /// Wraps `payload` in a bundle and queues it for forwarding, waiting
    /// up to `timeout_ms` for queue space and pool headroom.
    pub fn send(&self, socket: SocketId, payload: &[u8], timeout_ms: u64) -> Result<(), Status> {
        self.block_on(timeout_ms, |c| match c.socket_send_once(socket, payload) {
            Ok(()) => Ok(Some(())),
            Err(Status::Timeout | Status::ResourceExhausted) => Ok(None),
            Err(e) => Err(e),
        })
    }

    /// Receives the payload of the next bundle delivered to this socket,
    /// waiting up to `timeout_ms`.
    pub fn recv(&self, socket: SocketId, buf: &mut [u8], timeout_ms: u64) -> Result<usize, Status> {
        self.block_on(timeout_ms, |c| c.socket_recv_once(socket, buf))
    }

    pub fn close(&self, socket: SocketId) {
        self.with_core(|c| c.socket_close(socket));
    }

    // --- CLA transfer ---------------------------------------------------

    /// Delivers a received wire bundle into the agent.
    pub fn cla_ingress(&self, intf_id: Handle, data: &[u8], timeout_ms: u64) -> Result<(), Status> {
        self.block_on(timeout_ms, |c| c.cla_ingress_once(intf_id, data))
    }

    /// Pops one bundle destined for this CLA into `out`, returning the
    /// number of bytes written.
    pub fn cla_egress(&self, intf_id: Handle, out: &mut [u8], timeout_ms: u64) -> Result<usize, Status> {
        self.block_on(timeout_ms, |c| c.cla_egress_once(intf_id, out))
    }

    // --- introspection --------------------------------------------------

    pub fn pool_counts(&self) -> PoolCounts {
        self.with_core(|c| c.pool.counts())
    }
}
