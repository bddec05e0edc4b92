use std::{
    collections::BTreeMap,
    io::SeekFrom,
    path::Path,
};

use ipld_core::cid::Cid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

use crate::{
    async_varint::{read_varint, write_varint},
    multicodec::IDENTITY_CODE,
    v1,
    Config, Error, IndexCodec,
};

/// `IndexSorted` code format value, as defined in the
/// [specification](https://ipld.io/specs/transport/car/carv2/#format-0x0400-indexsorted).
pub const INDEX_SORTED_CODE: u64 = 0x0400;

/// `MultihashIndexSorted` code format value, as defined in the
/// [specification](https://ipld.io/specs/transport/car/carv2/#format-0x0401-multihashindexsorted).
pub const MULTIHASH_INDEX_SORTED_CODE: u64 = 0x0401;

/// Entry widths carry the digest plus its 8 byte offset; digests themselves
/// are limited to 1..=128 bytes.
const MIN_ENTRY_WIDTH: u32 = 1 + 8;
const MAX_ENTRY_WIDTH: u32 = 128 + 8;

// Basically, everything that does not have explicit endianness in the specification
// is little-endian, as made evident by the go-car source code:
// https://github.com/ipld/go-car/blob/45b81c1cc5117b3340dfdb025afeca90bfbe8d86/v2/index/mhindexsorted.go#L45-L53

/// A index entry for a data block inside the CARv1.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    /// Hash digest of the data.
    pub digest: Vec<u8>,

    /// Offset to the first byte of the varint that prefix the CID:Bytes pair within the CARv1 payload.
    ///
    /// See the [data section in the CARv1 specification](https://ipld.io/specs/transport/car/carv1/#data)
    /// for details on block encoding.
    pub offset: u64,
}

impl IndexEntry {
    /// Construct a new [`IndexEntry`].
    pub fn new(digest: Vec<u8>, offset: u64) -> Self {
        Self { digest, offset }
    }
}

/// An index containing a single digest length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleWidthIndex {
    /// The hash digest and the respective offset length.
    pub width: u32,

    /// The number of index entries.
    /// It is serialized as the length of all entries in bytes
    /// (i.e. `self.count * self.width`).
    ///
    /// See `go-car`'s source code for more information:
    /// <https://github.com/ipld/go-car/blob/45b81c1cc5117b3340dfdb025afeca90bfbe8d86/v2/index/indexsorted.go#L29>
    pub count: u64,

    /// The index entries.
    pub entries: Vec<IndexEntry>,
}

impl SingleWidthIndex {
    /// Construct a new [`SingleWidthIndex`].
    ///
    /// Notes:
    /// * The `digest_width` should not account for the offset length.
    /// * This function sorts the `entries`.
    pub fn new(digest_width: u32, count: u64, mut entries: Vec<IndexEntry>) -> Self {
        entries.sort_by(|fst, snd| fst.digest.cmp(&snd.digest));
        Self {
            width: digest_width + 8, // digest_width + offset len
            count,
            entries,
        }
    }

    fn digest_length(&self) -> usize {
        (self.width - 8) as usize
    }

    /// Visit every entry whose digest equals `digest`.
    ///
    /// Returns `(found, keep_going)`; `keep_going` turns false when the
    /// visitor short-circuits.
    fn visit_matches(
        &self,
        digest: &[u8],
        visit: &mut impl FnMut(u64) -> bool,
    ) -> (bool, bool) {
        if digest.len() != self.digest_length() {
            return (false, true);
        }
        let Ok(position) = self
            .entries
            .binary_search_by(|entry| entry.digest.as_slice().cmp(digest))
        else {
            return (false, true);
        };
        // Duplicates are legal; widen to the first match.
        let mut start = position;
        while start > 0 && self.entries[start - 1].digest.as_slice() == digest {
            start -= 1;
        }
        let mut found = false;
        for entry in &self.entries[start..] {
            if entry.digest.as_slice() != digest {
                break;
            }
            found = true;
            if !visit(entry.offset) {
                return (true, false);
            }
        }
        (found, true)
    }
}

impl From<IndexEntry> for SingleWidthIndex {
    fn from(value: IndexEntry) -> Self {
        SingleWidthIndex::new(value.digest.len() as u32, 1, vec![value])
    }
}

impl TryFrom<Vec<IndexEntry>> for SingleWidthIndex {
    type Error = Error;

    /// Performs the conversion, validating that all the [`IndexEntry`] have the same width.
    fn try_from(value: Vec<IndexEntry>) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(Error::EmptyIndexError);
        }
        let width = value[0].digest.len();
        let count = value.len();
        for entry in &value[1..] {
            if entry.digest.len() != width {
                return Err(Error::NonMatchingDigestError {
                    expected: width,
                    received: entry.digest.len(),
                });
            }
        }
        Ok(Self::new(width as u32, count as u64, value))
    }
}

/// An index containing hash digests of multiple lengths.
///
/// To find a given index entry, first find the right index width,
/// and then find the hash to the data block.
///
/// For more details, read the [`Format 0x0400: IndexSorted`](https://ipld.io/specs/transport/car/carv2/#format-0x0400-indexsorted) section in the CARv2 specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSorted(pub Vec<SingleWidthIndex>);

impl IndexSorted {
    /// Visit every entry whose digest equals `digest`; returns whether any matched.
    pub fn get_all(&self, digest: &[u8], mut visit: impl FnMut(u64) -> bool) -> bool {
        let mut found = false;
        for bucket in &self.0 {
            let (matched, keep_going) = bucket.visit_matches(digest, &mut visit);
            found |= matched;
            if !keep_going {
                break;
            }
        }
        found
    }

    fn for_each<F>(&self, code: u64, f: &mut F) -> Result<(), Error>
    where
        F: FnMut(u64, &[u8], u64) -> Result<(), Error>,
    {
        for bucket in &self.0 {
            for entry in &bucket.entries {
                f(code, &entry.digest, entry.offset)?;
            }
        }
        Ok(())
    }
}

impl From<IndexEntry> for IndexSorted {
    fn from(value: IndexEntry) -> Self {
        Self(vec![SingleWidthIndex::from(value)])
    }
}

impl From<SingleWidthIndex> for IndexSorted {
    fn from(value: SingleWidthIndex) -> Self {
        Self(vec![value])
    }
}

impl From<Vec<SingleWidthIndex>> for IndexSorted {
    fn from(value: Vec<SingleWidthIndex>) -> Self {
        Self(value)
    }
}

/// An index mapping Multihash codes to [`IndexSorted`].
///
/// For more details, read the [`Format 0x0401: MultihashIndexSorted`](https://ipld.io/specs/transport/car/carv2/#format-0x0401-multihashindexsorted) section in the CARv2 specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultihashIndexSorted(pub BTreeMap<u64, IndexSorted>);

impl MultihashIndexSorted {
    /// Create a [`MultihashIndexSorted`] from a [digest code](https://github.com/multiformats/multicodec/blob/c954a787dc6a17d099653e5f90d26fbd177d2074/table.csv) and an [`IndexSorted`].
    pub fn from_single_width(code: u64, index: IndexSorted) -> Self {
        let mut map = BTreeMap::new();
        map.insert(code, index);
        Self(map)
    }
}

impl From<BTreeMap<u64, IndexSorted>> for MultihashIndexSorted {
    fn from(value: BTreeMap<u64, IndexSorted>) -> Self {
        Self(value)
    }
}

/// CARv2 index.
///
/// Both on-disk formats key their entries by hash digest — not by CID — so a
/// lookup matches a block regardless of the codec its CID carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Index {
    IndexSorted(IndexSorted),
    MultihashIndexSorted(MultihashIndexSorted),
}

impl Index {
    /// Construct a [`Index::MultihashIndexSorted`] variant.
    pub fn multihash(index: BTreeMap<u64, IndexSorted>) -> Self {
        Self::MultihashIndexSorted(index.into())
    }

    /// The multicodec code of the on-disk format.
    pub fn codec(&self) -> u64 {
        match self {
            Self::IndexSorted(_) => INDEX_SORTED_CODE,
            Self::MultihashIndexSorted(_) => MULTIHASH_INDEX_SORTED_CODE,
        }
    }

    /// Visit the payload offset of every entry matching `cid`'s digest.
    ///
    /// The visitor returns whether to keep going; the function returns
    /// whether any entry matched.
    pub fn get_all(&self, cid: &Cid, visit: impl FnMut(u64) -> bool) -> bool {
        let digest = cid.hash().digest();
        match self {
            Self::IndexSorted(index) => index.get_all(digest, visit),
            Self::MultihashIndexSorted(index) => index
                .0
                .get(&cid.hash().code())
                .map(|sorted| sorted.get_all(digest, visit))
                .unwrap_or(false),
        }
    }

    /// Visit every record in the index.
    ///
    /// The multihash code is 0 for [`Index::IndexSorted`], which does not
    /// record codes.
    pub fn for_each<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(u64, &[u8], u64) -> Result<(), Error>,
    {
        match self {
            Self::IndexSorted(index) => index.for_each(0, &mut f),
            Self::MultihashIndexSorted(index) => {
                for (code, sorted) in &index.0 {
                    sorted.for_each(*code, &mut f)?;
                }
                Ok(())
            }
        }
    }

    /// Number of records in the index.
    pub fn len(&self) -> u64 {
        let mut total = 0;
        let _ = self.for_each(|_, _, _| {
            total += 1;
            Ok(())
        });
        total
    }

    /// Whether the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build an index by scanning a CARv1 stream: header, then sections.
    ///
    /// The reader must be positioned at the v1 header (for a CARv2 payload,
    /// seek to `data_offset` and limit the reader to `data_size` first).
    /// Offsets record the position of each section's length prefix relative
    /// to the payload start. Identity CIDs are indexed only when
    /// [`Config::store_identity_cids`] is set.
    pub async fn from_car<R>(reader: &mut R, config: &Config) -> Result<Self, Error>
    where
        R: AsyncRead + Unpin,
    {
        let (_, header_frame_length) = v1::read_header(reader, config).await?;
        let mut insertion = InsertionIndex::new();
        let mut offset = header_frame_length;
        while let Some((cid, frame_length, _)) = v1::skip_block(reader, config).await? {
            if cid.hash().code() != IDENTITY_CODE || config.store_identity_cids {
                insertion.insert(&cid, offset);
            }
            offset += frame_length;
        }
        Ok(insertion.into_index(config.index_codec))
    }

    /// Read an index from a sidecar file.
    pub async fn read_from_file<P>(path: P, config: &Config) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let mut file = tokio::fs::File::open(path).await?;
        read_index(&mut file, config).await
    }

    /// Write the index to a sidecar file.
    pub async fn write_to_file<P>(&self, path: P) -> Result<(), Error>
    where
        P: AsRef<Path>,
    {
        let mut file = tokio::fs::File::create(path).await?;
        write_index(&mut file, self).await?;
        file.flush().await?;
        Ok(())
    }
}

/// In-memory index used while a read-write store is open.
///
/// An ordered map from multihash code to digest to payload offsets. Every
/// occurrence of a digest keeps its own offset, so duplicate puts (when
/// allowed) are all resolvable. Flattened into an on-disk [`Index`] at
/// finalize.
#[derive(Debug, Default)]
pub struct InsertionIndex {
    entries: BTreeMap<u64, BTreeMap<Vec<u8>, Vec<u64>>>,
    records: u64,
}

impl InsertionIndex {
    /// Construct an empty [`InsertionIndex`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cid`'s digest at `offset`.
    pub fn insert(&mut self, cid: &Cid, offset: u64) {
        self.entries
            .entry(cid.hash().code())
            .or_default()
            .entry(cid.hash().digest().to_vec())
            .or_default()
            .push(offset);
        self.records += 1;
    }

    /// Whether any record matches `cid`'s digest.
    pub fn contains(&self, cid: &Cid) -> bool {
        self.entries
            .get(&cid.hash().code())
            .is_some_and(|digests| digests.contains_key(cid.hash().digest()))
    }

    /// Visit the offset of every record matching `cid`'s digest.
    pub fn get_all(&self, cid: &Cid, mut visit: impl FnMut(u64) -> bool) -> bool {
        let Some(offsets) = self
            .entries
            .get(&cid.hash().code())
            .and_then(|digests| digests.get(cid.hash().digest()))
        else {
            return false;
        };
        for offset in offsets {
            if !visit(*offset) {
                break;
            }
        }
        !offsets.is_empty()
    }

    /// Number of records.
    pub fn len(&self) -> u64 {
        self.records
    }

    /// Whether the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Flatten into an on-disk index of the chosen format.
    pub fn into_index(self, codec: IndexCodec) -> Index {
        match codec {
            IndexCodec::MultihashSorted => {
                let mut map = BTreeMap::new();
                for (code, digests) in self.entries {
                    map.insert(code, Self::width_buckets(digests));
                }
                Index::MultihashIndexSorted(MultihashIndexSorted(map))
            }
            IndexCodec::Sorted => {
                let mut merged: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
                for digests in self.entries.into_values() {
                    for (digest, mut offsets) in digests {
                        merged.entry(digest).or_default().append(&mut offsets);
                    }
                }
                Index::IndexSorted(Self::width_buckets(merged))
            }
        }
    }

    fn width_buckets(digests: BTreeMap<Vec<u8>, Vec<u64>>) -> IndexSorted {
        let mut by_width: BTreeMap<u32, Vec<IndexEntry>> = BTreeMap::new();
        for (digest, offsets) in digests {
            for offset in offsets {
                by_width
                    .entry(digest.len() as u32)
                    .or_default()
                    .push(IndexEntry::new(digest.clone(), offset));
            }
        }
        IndexSorted(
            by_width
                .into_iter()
                .map(|(width, entries)| {
                    let count = entries.len() as u64;
                    SingleWidthIndex::new(width, count, entries)
                })
                .collect(),
        )
    }
}

pub(crate) async fn write_index<W>(writer: &mut W, index: &Index) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    match index {
        Index::IndexSorted(index) => {
            written += write_varint(writer, INDEX_SORTED_CODE).await?;
            written += write_index_sorted(writer, index).await?;
        }
        Index::MultihashIndexSorted(index) => {
            written += write_varint(writer, MULTIHASH_INDEX_SORTED_CODE).await?;
            written += write_multihash_index_sorted(writer, index).await?;
        }
    }
    Ok(written)
}

pub(crate) async fn write_multihash_index_sorted<W>(
    writer: &mut W,
    index: &MultihashIndexSorted,
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 4;
    writer.write_i32_le(index.0.len() as i32).await?;
    for (hash_code, index) in index.0.iter() {
        writer.write_u64_le(*hash_code).await?;
        written += 8;
        written += write_index_sorted(writer, index).await?;
    }
    Ok(written)
}

pub(crate) async fn write_index_sorted<W>(
    writer: &mut W,
    index: &IndexSorted,
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 4;
    writer.write_i32_le(index.0.len() as i32).await?;
    for bucket in &index.0 {
        written += write_single_width_index(writer, bucket).await?;
    }
    Ok(written)
}

pub(crate) async fn write_single_width_index<W>(
    writer: &mut W,
    index: &SingleWidthIndex,
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32_le(index.width).await?;
    // Serialized as the total length in bytes, not the entry count.
    writer
        .write_u64_le(index.count * (index.width as u64))
        .await?;
    let mut written = 4 + 8;
    for entry in &index.entries {
        written += write_index_entry(writer, entry).await?;
    }
    Ok(written)
}

pub(crate) async fn write_index_entry<W>(
    writer: &mut W,
    entry: &IndexEntry,
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&entry.digest).await?;
    writer.write_u64_le(entry.offset).await?;
    Ok(entry.digest.len() + 8)
}

pub(crate) async fn read_index<R>(reader: &mut R, config: &Config) -> Result<Index, Error>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = config.max_allowed_index_size;
    let index_type: u64 = read_varint(reader).await?;
    match index_type {
        INDEX_SORTED_CODE => Ok(Index::IndexSorted(
            read_index_sorted(reader, config, &mut remaining).await?,
        )),
        MULTIHASH_INDEX_SORTED_CODE => Ok(Index::MultihashIndexSorted(
            read_multihash_index_sorted(reader, config, &mut remaining).await?,
        )),
        other => Err(Error::UnknownIndexError(other)),
    }
}

pub(crate) async fn read_multihash_index_sorted<R>(
    reader: &mut R,
    config: &Config,
    remaining: &mut u64,
) -> Result<MultihashIndexSorted, Error>
where
    R: AsyncRead + Unpin,
{
    let n_indexes = reader.read_i32_le().await?;
    if n_indexes < 0 {
        return Err(Error::MalformedIndexError(format!(
            "negative index count: {n_indexes}"
        )));
    }
    let mut indexes = BTreeMap::new();
    for _ in 0..n_indexes {
        let multihash_code = reader.read_u64_le().await?;
        let index = read_index_sorted(reader, config, remaining).await?;
        indexes.insert(multihash_code, index);
    }
    Ok(MultihashIndexSorted(indexes))
}

pub(crate) async fn read_index_sorted<R>(
    reader: &mut R,
    config: &Config,
    remaining: &mut u64,
) -> Result<IndexSorted, Error>
where
    R: AsyncRead + Unpin,
{
    let n_buckets = reader.read_i32_le().await?;
    if n_buckets < 0 {
        return Err(Error::MalformedIndexError(format!(
            "negative bucket count: {n_buckets}"
        )));
    }
    // No `with_capacity` here: the count is untrusted.
    let mut buckets = Vec::new();
    for _ in 0..n_buckets {
        let index = read_single_width_index(reader, config, remaining).await?;
        buckets.push(index);
    }
    Ok(IndexSorted(buckets))
}

pub(crate) async fn read_single_width_index<R>(
    reader: &mut R,
    config: &Config,
    remaining: &mut u64,
) -> Result<SingleWidthIndex, Error>
where
    R: AsyncRead + Unpin,
{
    let width = reader.read_u32_le().await?;
    if !(MIN_ENTRY_WIDTH..=MAX_ENTRY_WIDTH).contains(&width) {
        return Err(Error::InvalidIndexWidthError(width));
    }
    // Because someone decided that "total number of hash digests" means their length in bytes...
    // https://github.com/ipld/go-car/blob/45b81c1cc5117b3340dfdb025afeca90bfbe8d86/v2/index/indexsorted.go#L29
    let length = reader.read_u64_le().await?;
    if length % (width as u64) != 0 {
        return Err(Error::MalformedIndexError(format!(
            "bucket length {length} is not a multiple of its width {width}"
        )));
    }
    if length > *remaining {
        return Err(Error::IndexTooLargeError {
            size: length,
            maximum: config.max_allowed_index_size,
        });
    }
    *remaining -= length;
    let count = length / (width as u64);

    // The claimed count is within budget but still untrusted; let the
    // buffer grow as entries actually arrive instead of pre-reserving.
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        // The offset is always 8 bytes
        // https://github.com/ipld/go-car/blob/45b81c1cc5117b3340dfdb025afeca90bfbe8d86/v2/index/indexsorted.go#L176
        let entry = read_index_entry(reader, width - 8).await?;
        entries.push(entry);
    }

    // Sorting by the digest only because it should be enough (famous last words)
    // > ... and finally within those buckets ordered by a simple byte-wise sorting.
    // — https://ipld.io/specs/transport/car/carv2/#format-0x0401-multihashindexsorted
    entries.sort_by(|fst, snd| fst.digest.cmp(&snd.digest));

    Ok(SingleWidthIndex {
        width,
        count,
        entries,
    })
}

pub(crate) async fn read_index_entry<R>(reader: &mut R, length: u32) -> Result<IndexEntry, Error>
where
    R: AsyncRead + Unpin,
{
    let mut digest = vec![0; length as usize];
    reader.read_exact(&mut digest).await?;
    let offset = reader.read_u64_le().await?;
    Ok(IndexEntry { digest, offset })
}

/// A lazily-loaded on-disk index.
///
/// Only the structure — codec, bucket widths, counts and byte ranges — is
/// materialized; lookups binary-search the entry arrays in place with
/// `O(log n)` seeks. This is the default way to read a CARv2 index footer,
/// which can be large relative to memory.
#[derive(Debug)]
pub struct LazyIndex {
    codec: u64,
    buckets: Vec<LazyBucket>,
}

#[derive(Debug, Clone)]
struct LazyBucket {
    /// Multihash code; 0 under [`INDEX_SORTED_CODE`], which does not record codes.
    code: u64,
    width: u32,
    count: u64,
    entries_offset: u64,
}

impl LazyIndex {
    /// Load the index structure starting at `index_offset`, seeking past the
    /// entry arrays. Each bucket's byte range is validated against the end
    /// of the stream before it is accepted.
    pub async fn from_reader<R>(reader: &mut R, index_offset: u64) -> Result<Self, Error>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        let stream_end = reader.seek(SeekFrom::End(0)).await?;
        reader.seek(SeekFrom::Start(index_offset)).await?;

        let codec: u64 = read_varint(reader).await?;
        let mut buckets = Vec::new();
        match codec {
            INDEX_SORTED_CODE => {
                Self::load_buckets(reader, 0, stream_end, &mut buckets).await?;
            }
            MULTIHASH_INDEX_SORTED_CODE => {
                let n_indexes = reader.read_i32_le().await?;
                if n_indexes < 0 {
                    return Err(Error::MalformedIndexError(format!(
                        "negative index count: {n_indexes}"
                    )));
                }
                for _ in 0..n_indexes {
                    let code = reader.read_u64_le().await?;
                    Self::load_buckets(reader, code, stream_end, &mut buckets).await?;
                }
            }
            other => return Err(Error::UnknownIndexError(other)),
        }
        Ok(Self { codec, buckets })
    }

    async fn load_buckets<R>(
        reader: &mut R,
        code: u64,
        stream_end: u64,
        buckets: &mut Vec<LazyBucket>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        let n_buckets = reader.read_i32_le().await?;
        if n_buckets < 0 {
            return Err(Error::MalformedIndexError(format!(
                "negative bucket count: {n_buckets}"
            )));
        }
        for _ in 0..n_buckets {
            let width = reader.read_u32_le().await?;
            if !(MIN_ENTRY_WIDTH..=MAX_ENTRY_WIDTH).contains(&width) {
                return Err(Error::InvalidIndexWidthError(width));
            }
            let length = reader.read_u64_le().await?;
            if length % (width as u64) != 0 {
                return Err(Error::MalformedIndexError(format!(
                    "bucket length {length} is not a multiple of its width {width}"
                )));
            }
            let entries_offset = reader.stream_position().await?;
            if length > stream_end.saturating_sub(entries_offset) {
                return Err(Error::MalformedIndexError(format!(
                    "bucket of {length} bytes at {entries_offset} extends past the end of the stream"
                )));
            }
            buckets.push(LazyBucket {
                code,
                width,
                count: length / (width as u64),
                entries_offset,
            });
            reader.seek(SeekFrom::Current(length as i64)).await?;
        }
        Ok(())
    }

    /// The multicodec code of the on-disk format.
    pub fn codec(&self) -> u64 {
        self.codec
    }

    /// Visit the payload offset of every entry matching `cid`'s digest.
    ///
    /// Entries are binary-searched on disk through `reader`, which must be
    /// the same stream the index was loaded from.
    pub async fn get_all<R>(
        &self,
        reader: &mut R,
        cid: &Cid,
        mut visit: impl FnMut(u64) -> bool,
    ) -> Result<bool, Error>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        let digest = cid.hash().digest();
        let code = cid.hash().code();
        let mut found = false;
        for bucket in &self.buckets {
            if self.codec == MULTIHASH_INDEX_SORTED_CODE && bucket.code != code {
                continue;
            }
            if (bucket.width - 8) as usize != digest.len() {
                continue;
            }
            let (matched, keep_going) = bucket.visit_matches(reader, digest, &mut visit).await?;
            found |= matched;
            if !keep_going {
                break;
            }
        }
        Ok(found)
    }

    /// Visit every record in the index, streaming each bucket in order.
    pub async fn for_each<R, F>(&self, reader: &mut R, mut f: F) -> Result<(), Error>
    where
        R: AsyncRead + AsyncSeek + Unpin,
        F: FnMut(u64, &[u8], u64) -> Result<(), Error>,
    {
        for bucket in &self.buckets {
            reader.seek(SeekFrom::Start(bucket.entries_offset)).await?;
            for _ in 0..bucket.count {
                let entry = read_index_entry(reader, bucket.width - 8).await?;
                f(bucket.code, &entry.digest, entry.offset)?;
            }
        }
        Ok(())
    }
}

impl LazyBucket {
    async fn entry_at<R>(&self, reader: &mut R, position: u64) -> Result<IndexEntry, Error>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        reader
            .seek(SeekFrom::Start(
                self.entries_offset + position * self.width as u64,
            ))
            .await?;
        read_index_entry(reader, self.width - 8).await
    }

    async fn visit_matches<R>(
        &self,
        reader: &mut R,
        digest: &[u8],
        visit: &mut impl FnMut(u64) -> bool,
    ) -> Result<(bool, bool), Error>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        // Lower bound: first entry whose digest is not less than the probe.
        let (mut low, mut high) = (0, self.count);
        while low < high {
            let mid = low + (high - low) / 2;
            let entry = self.entry_at(reader, mid).await?;
            if entry.digest.as_slice() < digest {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        let mut found = false;
        let mut position = low;
        while position < self.count {
            let entry = self.entry_at(reader, position).await?;
            if entry.digest.as_slice() != digest {
                break;
            }
            found = true;
            if !visit(entry.offset) {
                return Ok((true, false));
            }
            position += 1;
        }
        Ok((found, true))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io::Cursor};

    use ipld_core::cid::Cid;
    use rand::{random, Rng};
    use sha2::{Digest, Sha256, Sha512};

    use super::{
        read_index, write_index, Index, IndexEntry, IndexSorted, InsertionIndex, LazyIndex,
        MultihashIndexSorted, SingleWidthIndex,
    };
    use crate::{
        multicodec::{generate_multihash, MultihashCode, RAW_CODE, SHA_256_CODE, SHA_512_CODE},
        Config, Error, IndexCodec,
    };

    fn generate_single_width_index<H>(count: u64) -> SingleWidthIndex
    where
        H: Digest,
    {
        let mut entries = vec![];
        let mut data = vec![0u8; <H as Digest>::output_size()];
        for idx in 0..count {
            data.fill_with(random);
            let digest = H::digest(&data).to_vec();
            entries.push(IndexEntry::new(digest, idx));
        }
        SingleWidthIndex::try_from(entries).unwrap()
    }

    fn cid_for(data: &[u8]) -> Cid {
        Cid::new_v1(RAW_CODE, generate_multihash::<Sha256, _>(data))
    }

    async fn roundtrip(index: &Index) -> Index {
        let mut buffer = vec![];
        write_index(&mut buffer, index).await.unwrap();
        let mut reader = Cursor::new(buffer);
        read_index(&mut reader, &Config::default()).await.unwrap()
    }

    #[tokio::test]
    async fn roundtrip_multihash_index() {
        let mut mapping = BTreeMap::new();
        mapping.insert(SHA_256_CODE, generate_single_width_index::<Sha256>(5).into());
        mapping.insert(SHA_512_CODE, generate_single_width_index::<Sha512>(5).into());
        let index = Index::multihash(mapping);
        assert_eq!(roundtrip(&index).await, index);
    }

    #[tokio::test]
    async fn roundtrip_index_sorted() {
        let index = Index::IndexSorted(IndexSorted(vec![
            generate_single_width_index::<Sha256>(5),
            generate_single_width_index::<Sha512>(5),
        ]));
        assert_eq!(roundtrip(&index).await, index);
    }

    #[tokio::test]
    async fn unknown_index_code() {
        let mut buffer = vec![];
        crate::async_varint::write_varint(&mut buffer, 0x0999_u64)
            .await
            .unwrap();
        let mut reader = Cursor::new(buffer);
        assert!(matches!(
            read_index(&mut reader, &Config::default()).await,
            Err(Error::UnknownIndexError(0x0999))
        ));
    }

    #[tokio::test]
    async fn zero_width_bucket_is_rejected() {
        // width 0 would divide by zero when deriving the entry count
        let mut buffer = vec![];
        crate::async_varint::write_varint(&mut buffer, super::INDEX_SORTED_CODE)
            .await
            .unwrap();
        buffer.extend_from_slice(&1_i32.to_le_bytes());
        buffer.extend_from_slice(&0_u32.to_le_bytes());
        buffer.extend_from_slice(&40_u64.to_le_bytes());

        let mut reader = Cursor::new(buffer);
        assert!(matches!(
            read_index(&mut reader, &Config::default()).await,
            Err(Error::InvalidIndexWidthError(0))
        ));
    }

    #[tokio::test]
    async fn absurd_bucket_length_is_rejected_before_allocation() {
        let mut buffer = vec![];
        crate::async_varint::write_varint(&mut buffer, super::INDEX_SORTED_CODE)
            .await
            .unwrap();
        buffer.extend_from_slice(&1_i32.to_le_bytes());
        buffer.extend_from_slice(&40_u32.to_le_bytes());
        // A width-aligned but absurd entry array: 40 TiB, allegedly.
        buffer.extend_from_slice(&(40_u64 << 40).to_le_bytes());

        let mut reader = Cursor::new(buffer);
        assert!(matches!(
            read_index(&mut reader, &Config::default()).await,
            Err(Error::IndexTooLargeError { .. })
        ));
    }

    #[tokio::test]
    async fn ragged_bucket_length_is_rejected() {
        let mut buffer = vec![];
        crate::async_varint::write_varint(&mut buffer, super::INDEX_SORTED_CODE)
            .await
            .unwrap();
        buffer.extend_from_slice(&1_i32.to_le_bytes());
        buffer.extend_from_slice(&40_u32.to_le_bytes());
        buffer.extend_from_slice(&41_u64.to_le_bytes());

        let mut reader = Cursor::new(buffer);
        assert!(matches!(
            read_index(&mut reader, &Config::default()).await,
            Err(Error::MalformedIndexError(_))
        ));
    }

    #[test]
    fn get_all_visits_duplicates() {
        let cid = cid_for(b"duplicated");
        let other = cid_for(b"other");
        let entries = vec![
            IndexEntry::new(cid.hash().digest().to_vec(), 59),
            IndexEntry::new(cid.hash().digest().to_vec(), 1024),
            IndexEntry::new(other.hash().digest().to_vec(), 2048),
        ];
        let index = Index::MultihashIndexSorted(MultihashIndexSorted::from_single_width(
            SHA_256_CODE,
            SingleWidthIndex::try_from(entries).unwrap().into(),
        ));

        let mut offsets = vec![];
        assert!(index.get_all(&cid, |offset| {
            offsets.push(offset);
            true
        }));
        offsets.sort();
        assert_eq!(offsets, vec![59, 1024]);

        // Short-circuiting stops after the first match.
        let mut visited = 0;
        index.get_all(&cid, |_| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);

        assert!(!index.get_all(&cid_for(b"absent"), |_| true));
    }

    #[test]
    fn get_all_requires_matching_code() {
        let data = b"same digest, other code";
        let sha_cid = cid_for(data);
        let index = Index::MultihashIndexSorted(MultihashIndexSorted::from_single_width(
            SHA_512_CODE,
            generate_single_width_index::<Sha512>(3).into(),
        ));
        assert!(!index.get_all(&sha_cid, |_| true));
    }

    #[test]
    fn insertion_index_keeps_duplicates() {
        let cid = cid_for(b"a block");
        let mut insertion = InsertionIndex::new();
        insertion.insert(&cid, 59);
        insertion.insert(&cid, 1024);
        assert_eq!(insertion.len(), 2);
        assert!(insertion.contains(&cid));

        let index = insertion.into_index(IndexCodec::MultihashSorted);
        let mut offsets = vec![];
        index.get_all(&cid, |offset| {
            offsets.push(offset);
            true
        });
        offsets.sort();
        assert_eq!(offsets, vec![59, 1024]);
    }

    #[test]
    fn insertion_index_sorted_codec_merges_codes() {
        let sha256 = cid_for(b"one");
        let sha512 = Cid::new_v1(RAW_CODE, generate_multihash::<Sha512, _>(b"two"));
        let mut insertion = InsertionIndex::new();
        insertion.insert(&sha256, 59);
        insertion.insert(&sha512, 1024);

        let index = insertion.into_index(IndexCodec::Sorted);
        assert_eq!(index.codec(), super::INDEX_SORTED_CODE);
        assert_eq!(index.len(), 2);
        assert!(index.get_all(&sha256, |offset| {
            assert_eq!(offset, 59);
            true
        }));
        assert!(index.get_all(&sha512, |offset| {
            assert_eq!(offset, 1024);
            true
        }));
    }

    #[tokio::test]
    async fn lazy_index_agrees_with_eager() {
        let mut rng = rand::thread_rng();
        let mut insertion = InsertionIndex::new();
        let mut cids = vec![];
        for _ in 0..64 {
            let mut data = [0u8; 16];
            rng.fill(&mut data);
            let cid = cid_for(&data);
            insertion.insert(&cid, rng.gen_range(0..1_u64 << 20));
            cids.push(cid);
        }
        let eager = insertion.into_index(IndexCodec::MultihashSorted);

        let mut buffer = vec![];
        write_index(&mut buffer, &eager).await.unwrap();
        let mut reader = Cursor::new(buffer);
        let lazy = LazyIndex::from_reader(&mut reader, 0).await.unwrap();
        assert_eq!(lazy.codec(), eager.codec());

        for cid in &cids {
            let mut eager_offsets = vec![];
            eager.get_all(cid, |offset| {
                eager_offsets.push(offset);
                true
            });
            let mut lazy_offsets = vec![];
            lazy.get_all(&mut reader, cid, |offset| {
                lazy_offsets.push(offset);
                true
            })
            .await
            .unwrap();
            assert_eq!(eager_offsets, lazy_offsets);
        }

        let absent = cid_for(b"definitely not indexed");
        assert!(!lazy.get_all(&mut reader, &absent, |_| true).await.unwrap());

        let mut lazy_records = 0;
        lazy.for_each(&mut reader, |code, digest, _| {
            assert_eq!(code, Sha256::CODE);
            assert_eq!(digest.len(), 32);
            lazy_records += 1;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(lazy_records, eager.len());
    }

    #[tokio::test]
    async fn lazy_index_rejects_overhanging_bucket() {
        let index = Index::MultihashIndexSorted(MultihashIndexSorted::from_single_width(
            SHA_256_CODE,
            generate_single_width_index::<Sha256>(4).into(),
        ));
        let mut buffer = vec![];
        write_index(&mut buffer, &index).await.unwrap();
        // Claim the bucket holds more entries than the stream has bytes.
        buffer.truncate(buffer.len() - 16);

        let mut reader = Cursor::new(buffer);
        assert!(matches!(
            LazyIndex::from_reader(&mut reader, 0).await,
            Err(Error::MalformedIndexError(_))
        ));
    }

    #[tokio::test]
    async fn sidecar_file_roundtrip() {
        let index = Index::MultihashIndexSorted(MultihashIndexSorted::from_single_width(
            SHA_256_CODE,
            generate_single_width_index::<Sha256>(8).into(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.car.idx");
        index.write_to_file(&path).await.unwrap();
        let read = Index::read_from_file(&path, &Config::default()).await.unwrap();
        assert_eq!(read, index);
    }
}
