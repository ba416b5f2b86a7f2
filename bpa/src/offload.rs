use crate::status::Status;
use tern_mpool::{BlockId, Pool};

/// A backend that persists a bundle's decoded-and-re-encoded form to
/// external media, keyed by a monotonically increasing storage id.
///
/// Implementations are constructed by their own crate (instantiate),
/// configured with string key/value pairs, then started. The only
/// recognized configuration key is `base-dir`, the directory under which
/// records are kept; unknown keys report [`Status::InvalidArgument`].
pub trait OffloadBackend: Send {
    fn configure(&mut self, key: &str, value: &str) -> Result<(), Status>;

    fn start(&mut self) -> Result<(), Status>;

    fn stop(&mut self) -> Result<(), Status>;

    /// Persists the bundle rooted at `bundle` and returns its storage id.
    fn offload(&mut self, pool: &mut Pool, bundle: BlockId) -> Result<u64, Status>;

    /// Reconstructs a previously offloaded bundle into pool blocks and
    /// returns the primary block. A corrupt record reports
    /// [`Status::FormatError`] and leaves no allocations behind.
    fn restore(&mut self, pool: &mut Pool, sid: u64) -> Result<BlockId, Status>;

    /// Discards the record for `sid`.
    fn release(&mut self, sid: u64) -> Result<(), Status>;
}
