use super::*;
use thiserror::Error;

/// The primary error type for the `bpv6` crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A block or primary field could not be parsed from the wire.
    #[error("Unintelligible block: {0}")]
    Unintelligible(&'static str),

    /// A block declares a data length beyond the 32-bit wire limit.
    #[error("Block data length {0} exceeds 2^32-1")]
    DataTooLong(u64),

    /// The bundle protocol version is unsupported.
    #[error("Unsupported bundle protocol version {0}")]
    InvalidVersion(u8),

    /// A dictionary offset does not point at a string in the dictionary.
    #[error("Dictionary offset {0} out of range")]
    BadDictionaryOffset(u64),

    /// An operation expected a block the bundle does not contain.
    #[error("Bundle has no {0:?} block")]
    MissingBlock(BlockType),

    /// A security operation failed: the bundle must be deleted with
    /// reason SECURITY_FAILED.
    #[error(transparent)]
    Security(#[from] bsp::Error),

    /// An error in SDNV encoding or decoding.
    #[error(transparent)]
    Sdnv(#[from] perigee_sdnv::Error),

    /// An error related to endpoint-ID processing.
    #[error(transparent)]
    Eid(#[from] eid::EidError),
}
