//! A library to read, write and index
//! [CAR](https://ipld.io/specs/transport/car/) files, in both the
//! [v1](https://ipld.io/specs/transport/car/carv1/) and
//! [v2](https://ipld.io/specs/transport/car/carv2/) formats.
//!
//! The main entry points are:
//! * [`BlockReader`] — single-pass streaming reads over either version,
//!   with automatic version detection and multihash verification.
//! * [`IndexedReader`] — random access by CID over a seekable backing,
//!   driven by the embedded (or regenerated) index.
//! * [`ReadWrite`] — a transactional append-only writer that patches the
//!   CARv2 envelope and serializes its index on finalize.
//! * [`inspect`] — a validating single pass producing [`Stats`].
//!
//! Every decoder takes a [`Config`]; the size ceilings in it are what keep
//! parsing bounded when the bytes are hostile.

#![warn(unused_crate_dependencies)]

mod async_varint;
mod block_reader;
mod cid;
mod config;
mod convert;
mod inspect;
mod multicodec;
mod stores;
#[cfg(test)]
mod test_utils;
mod v1;
mod v2;

pub use block_reader::{read_version, BlockLocation, BlockReader};
pub use config::{
    Config, IndexCodec, DEFAULT_MAX_ALLOWED_HEADER_SIZE, DEFAULT_MAX_ALLOWED_INDEX_SIZE,
    DEFAULT_MAX_ALLOWED_SECTION_SIZE, DEFAULT_MAX_INDEX_CID_SIZE,
};
pub use convert::{extract_v1, replace_roots_in_file, wrap_v1};
pub use inspect::{inspect, Stats};
pub use stores::{generate_index, IndexedReader, ReadWrite, WriteOnly};
pub use v1::{Header as CarV1Header, Reader as CarV1Reader, Writer as CarV1Writer};
pub use v2::{
    Characteristics, Header as CarV2Header, Index, IndexEntry, IndexSorted, InsertionIndex,
    LazyIndex, MultihashIndexSorted, Reader as CarV2Reader, SingleWidthIndex,
    Writer as CarV2Writer, INDEX_SORTED_CODE, MULTIHASH_INDEX_SORTED_CODE, PRAGMA,
};

// We need to expose this because `read_block` returns `(Cid, Vec<u8>)`.
pub use ipld_core::cid::Cid;

/// CAR handling errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when a version was expected, but another was received.
    ///
    /// For example, when reading CARv1 files, the only valid version is 1,
    /// otherwise, this error should be returned.
    #[error("expected version {expected}, but received version {received} instead")]
    VersionMismatchError {
        /// Expected version.
        expected: u8,
        /// Received version.
        received: u8,
    },

    /// According to the [specification](https://ipld.io/specs/transport/car/carv1/#constraints)
    /// CAR files MUST have **one or more** [`Cid`] roots.
    #[error("CAR file must have roots")]
    EmptyRootsError,

    /// According to the [specification](https://ipld.io/specs/transport/car/carv2/#pragma)
    /// the pragma is composed of a pre-defined list of bytes,
    /// if the received pragma is not the same, we return an error.
    #[error("received an invalid pragma: {0:?}")]
    InvalidPragmaError(Vec<u8>),

    /// The CARv1 header frame declares a length past the configured ceiling.
    /// Returned before any allocation of that size happens.
    #[error("header frame of {size} bytes exceeds the maximum of {maximum} bytes")]
    HeaderTooLargeError {
        /// Declared frame length.
        size: u64,
        /// Configured ceiling.
        maximum: u64,
    },

    /// A section frame declares a length past the configured ceiling.
    /// Returned before any allocation of that size happens.
    #[error("section frame of {size} bytes exceeds the maximum of {maximum} bytes")]
    SectionTooLargeError {
        /// Declared frame length.
        size: u64,
        /// Configured ceiling.
        maximum: u64,
    },

    /// A decoded index would occupy more bytes than the configured ceiling.
    #[error("index of {size} bytes exceeds the maximum of {maximum} bytes")]
    IndexTooLargeError {
        /// Declared index length.
        size: u64,
        /// Configured ceiling.
        maximum: u64,
    },

    /// An index bucket declares an entry width outside the valid
    /// digest range of 1 to 128 bytes (plus the 8 byte offset).
    #[error("invalid index entry width: {0}")]
    InvalidIndexWidthError(u32),

    /// A section that cannot be decoded: zero length, shorter than its own
    /// CID, or carrying an undecodable CID.
    #[error("malformed section: {0}")]
    MalformedSectionError(String),

    /// An index whose structure is inconsistent with itself or with the
    /// stream that holds it.
    #[error("malformed index: {0}")]
    MalformedIndexError(String),

    /// The recomputed multihash of a block does not equal the digest in its
    /// CID. Only checked when the CAR is not [trusted](Config::trusted).
    #[error("block multihash mismatch: expected {expected}, got {received}")]
    ContentIntegrityError {
        /// Digest carried by the CID, hex-encoded.
        expected: String,
        /// Digest computed from the block bytes, hex-encoded.
        received: String,
    },

    /// Replacement roots must encode to the same header length as the ones
    /// they replace; the header slot cannot grow or shrink in place.
    #[error("header of {expected} bytes cannot be replaced by one of {received} bytes")]
    HeaderSizeMismatchError {
        /// Length of the header being replaced.
        expected: u64,
        /// Length the replacement would need.
        received: u64,
    },

    /// Random access on a store whose sink cannot be re-read.
    #[error("the store is write-only, blocks cannot be read back")]
    WriteOnlyError,

    /// The CID is absent from the index or store.
    #[error("block not found: {0}")]
    NotFoundError(Cid),

    /// Unknown type of index. Supported indexes are
    /// [`IndexSorted`] and [`MultihashIndexSorted`].
    #[error("unknown index type {0}")]
    UnknownIndexError(u64),

    /// The [specification](https://ipld.io/specs/transport/car/carv2/#characteristics)
    /// does not discuss how to handle unknown characteristics
    /// — i.e. if we should ignore them, truncate them or return an error —
    /// we decided to return an error when there are unknown bits set.
    #[error("unknown characteristics were set: {0}")]
    UnknownCharacteristicsError(u128),

    /// Digest does not match the expected length.
    #[error("digest has length {received}, instead of {expected}")]
    NonMatchingDigestError {
        /// Expected digest length.
        expected: usize,
        /// Received digest length.
        received: usize,
    },

    /// Cannot know width or count from an empty vector.
    #[error("cannot create an index out of an empty `Vec`")]
    EmptyIndexError,

    /// A CARv2 header whose fields break the envelope invariants.
    #[error("invalid CARv2 header: {0}")]
    InvalidHeaderError(String),

    /// A CID longer than [`Config::max_index_cid_size`] was passed to `put`.
    #[error("CID of {size} bytes exceeds the maximum of {maximum} bytes")]
    CidTooLargeError {
        /// Encoded CID length.
        size: u64,
        /// Configured ceiling.
        maximum: u64,
    },

    /// A multihash code this library cannot compute. Verification supports
    /// SHA2-256, SHA2-512 and IDENTITY.
    #[error("unsupported multihash code: {0}")]
    UnsupportedHashError(u64),

    /// See [`CodecError`](serde_ipld_dagcbor::error::CodecError) for more information.
    #[error(transparent)]
    CodecError(#[from] serde_ipld_dagcbor::error::CodecError),

    /// See [`IoError`](tokio::io::Error) for more information.
    #[error(transparent)]
    IoError(#[from] tokio::io::Error),

    /// See [`CidError`](ipld_core::cid::Error) for more information.
    #[error(transparent)]
    CidError(#[from] ipld_core::cid::Error),

    /// See [`MultihashError`](ipld_core::cid::multihash::Error) for more information.
    #[error(transparent)]
    MultihashError(#[from] ipld_core::cid::multihash::Error),
}
