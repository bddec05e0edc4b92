//! Structural validation and statistics over a CAR stream.

use std::collections::{BTreeMap, HashSet};

use ipld_core::cid::Cid;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    async_varint::{discard_exact, read_varint},
    multicodec::verify_block_integrity,
    v1, v2,
    v2::PRAGMA,
    Config, Error,
};

/// What a single pass over a CAR stream found.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// CAR version, 1 or 2.
    pub version: u8,
    /// The CARv2 envelope header, when present.
    pub header_v2: Option<v2::Header>,
    /// Roots declared by the (inner) CARv1 header.
    pub roots: Vec<Cid>,
    /// How many distinct roots also appear as blocks.
    pub roots_present: u64,
    /// Total number of sections.
    pub block_count: u64,
    /// Section count per block codec.
    pub codec_counts: BTreeMap<u64, u64>,
    /// Section count per multihash code.
    pub multihash_counts: BTreeMap<u64, u64>,
    /// Smallest encoded CID length seen.
    pub min_cid_length: u64,
    /// Largest encoded CID length seen.
    pub max_cid_length: u64,
    /// Sum of encoded CID lengths.
    pub total_cid_length: u64,
    /// Smallest block payload seen.
    pub min_block_length: u64,
    /// Largest block payload seen.
    pub max_block_length: u64,
    /// Sum of block payload lengths.
    pub total_block_length: u64,
    /// Codec code of the trailing index, when one is present.
    pub index_codec: Option<u64>,
}

impl Stats {
    /// Mean encoded CID length, 0 when the archive holds no blocks.
    pub fn mean_cid_length(&self) -> u64 {
        if self.block_count == 0 {
            0
        } else {
            self.total_cid_length / self.block_count
        }
    }

    /// Mean block payload length, 0 when the archive holds no blocks.
    pub fn mean_block_length(&self) -> u64 {
        if self.block_count == 0 {
            0
        } else {
            self.total_block_length / self.block_count
        }
    }

    fn record(&mut self, cid: &Cid, block_length: u64, roots: &HashSet<Cid>, seen: &mut HashSet<Cid>) {
        let cid_length = cid.encoded_len() as u64;
        if self.block_count == 0 {
            self.min_cid_length = cid_length;
            self.max_cid_length = cid_length;
            self.min_block_length = block_length;
            self.max_block_length = block_length;
        } else {
            self.min_cid_length = self.min_cid_length.min(cid_length);
            self.max_cid_length = self.max_cid_length.max(cid_length);
            self.min_block_length = self.min_block_length.min(block_length);
            self.max_block_length = self.max_block_length.max(block_length);
        }
        self.block_count += 1;
        self.total_cid_length += cid_length;
        self.total_block_length += block_length;
        *self.codec_counts.entry(cid.codec()).or_default() += 1;
        *self.multihash_counts.entry(cid.hash().code()).or_default() += 1;
        if roots.contains(cid) && seen.insert(*cid) {
            self.roots_present += 1;
        }
    }
}

/// Walk the whole stream once, validating its structure and tallying
/// [`Stats`]. With `validate_hashes` every block's multihash is recomputed
/// and compared against its CID.
///
/// The first error encountered halts the pass.
pub async fn inspect<R>(
    mut reader: R,
    validate_hashes: bool,
    config: &Config,
) -> Result<Stats, Error>
where
    R: AsyncRead + Unpin,
{
    let mut stats = Stats::default();
    let (frame, _) =
        v1::read_header_frame(&mut reader, config.max_allowed_header_size).await?;

    if frame == PRAGMA[1..] {
        let header = v2::read_header(&mut reader).await?;
        discard_exact(&mut reader, header.data_offset - v2::Header::SIZE as u64).await?;

        let mut limited = reader.take(header.data_size);
        let (v1_header, _) = v1::read_header(&mut limited, config).await?;
        stats.version = 2;
        stats.roots = v1_header.roots.clone();
        walk(&mut limited, validate_hashes, config, &mut stats).await?;

        // Position at the end of the payload regardless of how the walk
        // terminated, then sniff the index codec.
        let remaining = limited.limit();
        discard_exact(&mut limited, remaining).await?;
        let mut reader = limited.into_inner();
        if header.index_offset != 0 {
            discard_exact(&mut reader, header.index_offset - header.data_end()).await?;
            stats.index_codec = Some(read_varint(&mut reader).await?);
        }
        stats.header_v2 = Some(header);
    } else {
        let v1_header = v1::decode_header(&frame)?;
        stats.version = 1;
        stats.roots = v1_header.roots.clone();
        walk(&mut reader, validate_hashes, config, &mut stats).await?;
    }

    Ok(stats)
}

async fn walk<R>(
    reader: &mut R,
    validate_hashes: bool,
    config: &Config,
    stats: &mut Stats,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let roots: HashSet<Cid> = stats.roots.iter().copied().collect();
    let mut seen = HashSet::new();
    if validate_hashes {
        while let Some((cid, data, _)) = v1::read_block_frame(reader, config).await? {
            verify_block_integrity(&cid, &data)?;
            stats.record(&cid, data.len() as u64, &roots, &mut seen);
        }
    } else {
        while let Some((cid, _, data_length)) = v1::skip_block(reader, config).await? {
            stats.record(&cid, data_length, &roots, &mut seen);
        }
    }
    Ok(())
}
