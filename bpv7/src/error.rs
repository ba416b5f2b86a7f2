use thiserror::Error;

/// Errors produced while encoding or decoding BPv7 structures.
#[derive(Error, Debug)]
pub enum Error {
    /// The primary block carries a protocol version other than 7.
    #[error("Unsupported bundle protocol version {0}")]
    UnsupportedVersion(u64),

    /// An EID used a scheme number the agent does not implement.
    #[error("Unsupported EID scheme {0}")]
    UnsupportedScheme(u64),

    /// An ipn SSP was not the expected 2-element array.
    #[error("Malformed ipn scheme-specific part")]
    MalformedSsp,

    /// A bundle did not start with the indefinite-length array opener.
    #[error("Bundle is not an indefinite-length CBOR array")]
    NotABundle,

    /// An administrative record carried a record type the agent does not
    /// implement.
    #[error("Unsupported administrative record type {0}")]
    UnsupportedAdminRecord(u64),

    /// A structured extension block whose interior did not parse.
    #[error("Malformed {0} extension block content")]
    MalformedExtension(&'static str),

    #[error(transparent)]
    InvalidCrc(#[from] crate::crc::CrcError),

    #[error(transparent)]
    InvalidCbor(#[from] tern_cbor::decode::Error),
}
