//! Decode and store configuration.
//!
//! Every reader, writer and store in this crate carries a [`Config`] —
//! there is no process-wide mutable state. The size ceilings exist to keep
//! decoding bounded when the input is hostile: a length prefix is checked
//! against its ceiling *before* any allocation happens.

/// Ceiling on the CARv1 header frame, 32 MiB.
pub const DEFAULT_MAX_ALLOWED_HEADER_SIZE: u64 = 32 << 20;

/// Ceiling on a single section frame, 8 MiB — the interoperable IPLD block limit.
pub const DEFAULT_MAX_ALLOWED_SECTION_SIZE: u64 = 8 << 20;

/// Ceiling on a decoded index, 1 GiB.
pub const DEFAULT_MAX_ALLOWED_INDEX_SIZE: u64 = 1 << 30;

/// Ceiling on the byte length of a CID accepted by the stores, 2 KiB.
pub const DEFAULT_MAX_INDEX_CID_SIZE: u64 = 2 << 10;

/// On-disk index format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexCodec {
    /// `IndexSorted`: digests grouped by width, without multihash codes.
    Sorted,
    /// `MultihashIndexSorted`: digests grouped by multihash code, then width.
    /// This is the default, and the only format that supports mixing hash functions.
    #[default]
    MultihashSorted,
}

/// Options for reading, writing and indexing CAR files.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum length of the CARv1 header frame.
    pub max_allowed_header_size: u64,
    /// Maximum length of a single section frame.
    pub max_allowed_section_size: u64,
    /// Maximum number of bytes a decoded index may occupy.
    pub max_allowed_index_size: u64,
    /// Maximum byte length of a CID accepted by `put`.
    pub max_index_cid_size: u64,
    /// Treat a zero-length section as a clean end of data.
    pub zero_length_section_as_eof: bool,
    /// Skip multihash verification when reading blocks.
    pub trusted: bool,
    /// Index format written by the stores.
    pub index_codec: IndexCodec,
    /// Write and index blocks whose CID uses the IDENTITY multihash.
    ///
    /// Setting this also sets the fully-indexed characteristic on finalize.
    pub store_identity_cids: bool,
    /// Do not suppress duplicate puts.
    pub allow_duplicate_puts: bool,
    /// Deduplicate and match blocks by whole CID bytes instead of digest alone.
    pub use_whole_cids: bool,
    /// Zero padding between the CARv2 header and the CARv1 payload.
    pub data_padding: u64,
    /// Zero padding between the CARv1 payload and the index.
    pub index_padding: u64,
    /// Omit the CARv2 envelope entirely; the output is a bare CARv1.
    pub write_as_car_v1: bool,
    /// Link budget hint for DAG traversal engines. Not interpreted by this crate.
    pub max_traversal_links: u64,
}

impl Config {
    /// Set the ceiling on the CARv1 header frame.
    pub fn with_max_allowed_header_size(mut self, limit: u64) -> Self {
        self.max_allowed_header_size = limit;
        self
    }

    /// Set the ceiling on a single section frame.
    pub fn with_max_allowed_section_size(mut self, limit: u64) -> Self {
        self.max_allowed_section_size = limit;
        self
    }

    /// Set the ceiling on a decoded index.
    pub fn with_max_allowed_index_size(mut self, limit: u64) -> Self {
        self.max_allowed_index_size = limit;
        self
    }

    /// Set the ceiling on the byte length of a CID accepted by `put`.
    pub fn with_max_index_cid_size(mut self, limit: u64) -> Self {
        self.max_index_cid_size = limit;
        self
    }

    /// Treat a zero-length section as a clean end of data.
    pub fn with_zero_length_section_as_eof(mut self, enable: bool) -> Self {
        self.zero_length_section_as_eof = enable;
        self
    }

    /// Skip multihash verification when reading blocks.
    pub fn with_trusted_car(mut self, trusted: bool) -> Self {
        self.trusted = trusted;
        self
    }

    /// Select the index format written by the stores.
    pub fn with_index_codec(mut self, codec: IndexCodec) -> Self {
        self.index_codec = codec;
        self
    }

    /// Write and index blocks whose CID uses the IDENTITY multihash.
    pub fn with_store_identity_cids(mut self, enable: bool) -> Self {
        self.store_identity_cids = enable;
        self
    }

    /// Do not suppress duplicate puts.
    pub fn with_allow_duplicate_puts(mut self, enable: bool) -> Self {
        self.allow_duplicate_puts = enable;
        self
    }

    /// Deduplicate and match blocks by whole CID bytes instead of digest alone.
    pub fn with_use_whole_cids(mut self, enable: bool) -> Self {
        self.use_whole_cids = enable;
        self
    }

    /// Pad the space between the CARv2 header and the CARv1 payload.
    pub fn with_data_padding(mut self, padding: u64) -> Self {
        self.data_padding = padding;
        self
    }

    /// Pad the space between the CARv1 payload and the index.
    pub fn with_index_padding(mut self, padding: u64) -> Self {
        self.index_padding = padding;
        self
    }

    /// Omit the CARv2 envelope entirely; the output is a bare CARv1.
    pub fn with_write_as_car_v1(mut self, enable: bool) -> Self {
        self.write_as_car_v1 = enable;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_allowed_header_size: DEFAULT_MAX_ALLOWED_HEADER_SIZE,
            max_allowed_section_size: DEFAULT_MAX_ALLOWED_SECTION_SIZE,
            max_allowed_index_size: DEFAULT_MAX_ALLOWED_INDEX_SIZE,
            max_index_cid_size: DEFAULT_MAX_INDEX_CID_SIZE,
            zero_length_section_as_eof: false,
            trusted: false,
            index_codec: IndexCodec::default(),
            store_identity_cids: false,
            allow_duplicate_puts: false,
            use_whole_cids: false,
            data_padding: 0,
            index_padding: 0,
            write_as_car_v1: false,
            max_traversal_links: u64::MAX,
        }
    }
}
