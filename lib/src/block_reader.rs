//! Version-agnostic streaming access to a CAR file.
//!
//! [`BlockReader`] sniffs the leading header frame, dispatches between
//! CARv1 and CARv2, and then hands out sections one by one. For CARv2 the
//! reads are confined to the declared payload range, so a trailing index —
//! or trailing garbage — is never misread as a section.

use ipld_core::cid::Cid;
use tokio::io::{AsyncRead, AsyncReadExt, Take};

use crate::{
    async_varint::discard_exact,
    multicodec::verify_block_integrity,
    v1, v2,
    v2::PRAGMA,
    Config, Error,
};

/// Where a section sits inside the CARv1 payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    /// The section's CID.
    pub cid: Cid,
    /// Offset of the section's length prefix, relative to the start of the
    /// CARv1 payload (the byte where the v1 header frame begins).
    pub offset: u64,
    /// Length of the block data, CID and length prefix excluded.
    pub size: u64,
}

/// A single-pass, forward-only reader over the blocks of a CARv1 or CARv2
/// stream.
///
/// Construction performs version detection. Once the reader has returned a
/// clean end of data — or any error — it stays finished: every further call
/// reports `Ok(None)`.
pub struct BlockReader<R> {
    reader: Take<R>,
    config: Config,
    version: u8,
    roots: Vec<Cid>,
    header_v2: Option<v2::Header>,
    payload_offset: u64,
    done: bool,
}

impl<R> BlockReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Open a reader with the default [`Config`].
    pub async fn new(reader: R) -> Result<Self, Error> {
        Self::with_config(reader, Config::default()).await
    }

    /// Open a reader with the given [`Config`].
    ///
    /// Reads the leading header frame and, for CARv2, the envelope header
    /// and the inner CARv1 header. The stream ends up positioned at the
    /// first section.
    pub async fn with_config(mut reader: R, config: Config) -> Result<Self, Error> {
        let (frame, frame_length) =
            v1::read_header_frame(&mut reader, config.max_allowed_header_size).await?;

        if frame == PRAGMA[1..] {
            let header = v2::read_header(&mut reader).await?;
            // The envelope is fully consumed at this point; anything
            // between it and the payload is padding.
            discard_exact(&mut reader, header.data_offset - v2::Header::SIZE as u64).await?;

            let mut limited = reader.take(header.data_size);
            let (v1_header, v1_frame_length) = v1::read_header(&mut limited, &config).await?;
            Ok(Self {
                reader: limited,
                config,
                version: 2,
                roots: v1_header.roots,
                header_v2: Some(header),
                payload_offset: v1_frame_length,
                done: false,
            })
        } else {
            let header = v1::decode_header(&frame)?;
            Ok(Self {
                reader: reader.take(u64::MAX),
                config,
                version: 1,
                roots: header.roots,
                header_v2: None,
                payload_offset: frame_length,
                done: false,
            })
        }
    }

    /// The CAR version, 1 or 2.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The roots declared by the (inner) CARv1 header.
    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// The CARv2 envelope header, when the stream is a CARv2.
    pub fn header_v2(&self) -> Option<&v2::Header> {
        self.header_v2.as_ref()
    }

    /// Read the next block.
    ///
    /// Unless [`Config::trusted`] is set, the block's multihash is
    /// recomputed with the hash function named by its CID and compared
    /// against the CID's digest.
    ///
    /// Returns `Ok(None)` on a clean end of data, and keeps returning it.
    pub async fn next(&mut self) -> Result<Option<(Cid, Vec<u8>)>, Error> {
        if self.done {
            return Ok(None);
        }
        match v1::read_block_frame(&mut self.reader, &self.config).await {
            Ok(Some((cid, data, frame_length))) => {
                if !self.config.trusted {
                    if let Err(error) = verify_block_integrity(&cid, &data) {
                        self.done = true;
                        return Err(error);
                    }
                }
                self.payload_offset += frame_length;
                Ok(Some((cid, data)))
            }
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }

    /// Read the next section's CID and discard its payload, reporting where
    /// the section sits so offsets can be mapped later.
    ///
    /// Returns `Ok(None)` on a clean end of data, and keeps returning it.
    pub async fn skip_next(&mut self) -> Result<Option<BlockLocation>, Error> {
        if self.done {
            return Ok(None);
        }
        let offset = self.payload_offset;
        match v1::skip_block(&mut self.reader, &self.config).await {
            Ok(Some((cid, frame_length, data_length))) => {
                self.payload_offset += frame_length;
                Ok(Some(BlockLocation {
                    cid,
                    offset,
                    size: data_length,
                }))
            }
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(error) => {
                self.done = true;
                Err(error)
            }
        }
    }
}

/// Detect the CAR version of a stream.
///
/// Returns 2 iff the stream opens with the exact CARv2 pragma, 1 iff the
/// first frame is a valid CARv1 header, and an error otherwise.
pub async fn read_version<R>(mut reader: R) -> Result<u8, Error>
where
    R: AsyncRead + Unpin,
{
    let config = Config::default();
    let (frame, _) = v1::read_header_frame(&mut reader, config.max_allowed_header_size).await?;
    if frame == PRAGMA[1..] {
        return Ok(2);
    }
    Ok(v1::decode_header(&frame)?.version())
}
