use thiserror::Error;

/// Status codes surfaced by the agent's public API.
///
/// Every recoverable condition maps onto one of these; invariant violations
/// are programmer bugs and panic instead of being reported.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Null/malformed address, bad flag combination, or an argument that
    /// cannot be acted on.
    #[error("Invalid argument")]
    InvalidArgument,

    /// Pool allocation refused, queue full, or storage full.
    #[error("Resource exhausted")]
    ResourceExhausted,

    /// A blocking operation did not complete before its deadline.
    #[error("Timed out")]
    Timeout,

    /// Insert of a key that already exists in a unique index.
    #[error("Duplicate")]
    Duplicate,

    /// Malformed CBOR, unknown scheme, unsupported version, or CRC
    /// mismatch.
    #[error("Format error")]
    FormatError,

    /// No interface matches the destination given current flags.
    #[error("Destination unroutable")]
    Unroutable,

    /// A handle or key lookup missed.
    #[error("Not found")]
    NotFound,
}
