use std::{collections::HashSet, io::SeekFrom};

use ipld_core::cid::Cid;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{
    async_varint::read_varint,
    cid::read_cid,
    multicodec::IDENTITY_CODE,
    v1, v2,
    v2::{Characteristics, InsertionIndex},
    Config, Error,
};

/// A transactional, append-only CAR writer.
///
/// Opening writes the CARv2 pragma, a placeholder header, and the CARv1
/// header for the declared roots; every [`put`](ReadWrite::put) appends a
/// section and records it in an in-memory insertion index. Nothing before
/// the payload is final until [`finalize`](ReadWrite::finalize) patches the
/// envelope with the true sizes and serializes the index after the payload.
///
/// The store reads its own writes: [`has`](ReadWrite::has),
/// [`get`](ReadWrite::get) and [`get_size`](ReadWrite::get_size) answer
/// from the insertion index before finalize.
///
/// With [`Config::write_as_car_v1`] the envelope and the index are omitted
/// and finalize only flushes.
pub struct ReadWrite<S> {
    stream: S,
    config: Config,
    roots: Vec<Cid>,
    /// Absolute offset of the CARv1 payload (0 when writing a bare CARv1).
    data_offset: u64,
    /// Frame length of the reserved CARv1 header; replacements must match it.
    v1_header_length: u64,
    /// Payload-relative append position.
    position: u64,
    index: InsertionIndex,
    whole_cids: HashSet<Cid>,
}

impl<S> ReadWrite<S>
where
    S: AsyncRead + AsyncWrite + AsyncSeek + Unpin,
{
    /// Open a store over `stream` with the default [`Config`].
    ///
    /// The stream should be empty (a freshly created or truncated file);
    /// writing starts at offset 0.
    pub async fn new(stream: S, roots: Vec<Cid>) -> Result<Self, Error> {
        Self::with_config(stream, roots, Config::default()).await
    }

    /// Open a store over `stream` with the given [`Config`].
    pub async fn with_config(
        mut stream: S,
        roots: Vec<Cid>,
        config: Config,
    ) -> Result<Self, Error> {
        if roots.is_empty() {
            return Err(Error::EmptyRootsError);
        }

        stream.seek(SeekFrom::Start(0)).await?;
        let data_offset = if config.write_as_car_v1 {
            0
        } else {
            // Pragma, placeholder header, padding. The characteristics are
            // known up-front; the offsets are patched at finalize.
            let placeholder = v2::Header {
                characteristics: Characteristics::new(config.store_identity_cids),
                data_offset: 0,
                data_size: 0,
                index_offset: 0,
            };
            v2::write_header(&mut stream, &placeholder).await?;
            v2::write_padding(&mut stream, config.data_padding as usize).await?;
            v2::Header::SIZE as u64 + config.data_padding
        };

        let v1_header = v1::Header::new(roots.clone());
        let v1_header_length = v1::write_header(&mut stream, &v1_header).await? as u64;

        Ok(Self {
            stream,
            config,
            roots,
            data_offset,
            v1_header_length,
            position: v1_header_length,
            index: InsertionIndex::new(),
            whole_cids: HashSet::new(),
        })
    }

    /// The store's roots.
    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Number of sections written so far.
    pub fn len(&self) -> u64 {
        self.index.len()
    }

    /// Whether no section has been written yet.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Append a block.
    ///
    /// * CIDs longer than [`Config::max_index_cid_size`] are rejected.
    /// * Identity CIDs are silently skipped unless
    ///   [`Config::store_identity_cids`] is set — their payload already
    ///   lives in the CID.
    /// * Duplicates are suppressed unless [`Config::allow_duplicate_puts`]
    ///   is set; equality is by digest, or by whole CID under
    ///   [`Config::use_whole_cids`].
    pub async fn put<D>(&mut self, cid: &Cid, data: &D) -> Result<(), Error>
    where
        D: AsRef<[u8]>,
    {
        let cid_length = cid.encoded_len() as u64;
        if cid_length > self.config.max_index_cid_size {
            return Err(Error::CidTooLargeError {
                size: cid_length,
                maximum: self.config.max_index_cid_size,
            });
        }
        if cid.hash().code() == IDENTITY_CODE && !self.config.store_identity_cids {
            trace!(%cid, "skipping identity CID");
            return Ok(());
        }
        if !self.config.allow_duplicate_puts {
            let duplicate = if self.config.use_whole_cids {
                self.whole_cids.contains(cid)
            } else {
                self.index.contains(cid)
            };
            if duplicate {
                trace!(%cid, "skipping duplicate put");
                return Ok(());
            }
        }

        // Self-reads may have moved the cursor; always append at the end.
        self.stream
            .seek(SeekFrom::Start(self.data_offset + self.position))
            .await?;
        let frame_length = v1::write_block(&mut self.stream, cid, data).await? as u64;
        self.index.insert(cid, self.position);
        if self.config.use_whole_cids {
            self.whole_cids.insert(*cid);
        }
        self.position += frame_length;
        Ok(())
    }

    /// Whether a block matching `cid` has been put (and not suppressed).
    pub fn has(&self, cid: &Cid) -> bool {
        if self.config.use_whole_cids {
            self.whole_cids.contains(cid)
        } else {
            self.index.contains(cid)
        }
    }

    /// Read back a block this store wrote.
    pub async fn get(&mut self, cid: &Cid) -> Result<Vec<u8>, Error> {
        let mut offsets = vec![];
        self.index.get_all(cid, |offset| {
            offsets.push(offset);
            true
        });
        for offset in offsets {
            self.stream
                .seek(SeekFrom::Start(self.data_offset + offset))
                .await?;
            let Some((stored, data, _)) =
                v1::read_block_frame(&mut self.stream, &self.config).await?
            else {
                continue;
            };
            if self.cid_matches(cid, &stored) {
                return Ok(data);
            }
        }
        Err(Error::NotFoundError(*cid))
    }

    /// Size of a block this store wrote, without reading its payload.
    pub async fn get_size(&mut self, cid: &Cid) -> Result<u64, Error> {
        let mut offsets = vec![];
        self.index.get_all(cid, |offset| {
            offsets.push(offset);
            true
        });
        for offset in offsets {
            self.stream
                .seek(SeekFrom::Start(self.data_offset + offset))
                .await?;
            let frame_length: u64 = read_varint(&mut self.stream).await?;
            let (stored, cid_length) = read_cid(&mut self.stream).await?;
            if cid_length <= frame_length && self.cid_matches(cid, &stored) {
                return Ok(frame_length - cid_length);
            }
        }
        Err(Error::NotFoundError(*cid))
    }

    /// Replace the roots in the already-written CARv1 header.
    ///
    /// The header slot was sized at open time, so the replacement must
    /// encode to exactly the same length; otherwise the file is left
    /// untouched and [`Error::HeaderSizeMismatchError`] is returned.
    pub async fn replace_roots(&mut self, roots: Vec<Cid>) -> Result<(), Error> {
        if roots.is_empty() {
            return Err(Error::EmptyRootsError);
        }
        let header = v1::Header::new(roots.clone());
        let received = header.encoded_len()?;
        if received != self.v1_header_length {
            return Err(Error::HeaderSizeMismatchError {
                expected: self.v1_header_length,
                received,
            });
        }
        self.stream.seek(SeekFrom::Start(self.data_offset)).await?;
        v1::write_header(&mut self.stream, &header).await?;
        self.roots = roots;
        Ok(())
    }

    /// Commit the store: serialize the index after the payload, patch the
    /// CARv2 header with the true sizes, flush, and return the stream.
    ///
    /// In [`Config::write_as_car_v1`] mode this only flushes.
    pub async fn finalize(mut self) -> Result<S, Error> {
        if self.config.write_as_car_v1 {
            self.stream.flush().await?;
            return Ok(self.stream);
        }

        let data_size = self.position;
        let index_offset = self.data_offset + data_size + self.config.index_padding;

        self.stream
            .seek(SeekFrom::Start(self.data_offset + data_size))
            .await?;
        v2::write_padding(&mut self.stream, self.config.index_padding as usize).await?;
        let index = std::mem::take(&mut self.index).into_index(self.config.index_codec);
        v2::write_index(&mut self.stream, &index).await?;

        let header = v2::Header {
            characteristics: Characteristics::new(self.config.store_identity_cids),
            data_offset: self.data_offset,
            data_size,
            index_offset,
        };
        self.stream.seek(SeekFrom::Start(0)).await?;
        v2::write_header(&mut self.stream, &header).await?;
        self.stream.flush().await?;
        debug!(
            data_offset = header.data_offset,
            data_size = header.data_size,
            index_offset = header.index_offset,
            "finalized CARv2"
        );
        Ok(self.stream)
    }

    /// Abandon the store: rewrite the pragma and a zeroed placeholder
    /// header, leaving the file detectably unfinalized, and return the
    /// stream. File-backed callers may simply delete the file instead.
    pub async fn discard(mut self) -> Result<S, Error> {
        if !self.config.write_as_car_v1 {
            self.stream.seek(SeekFrom::Start(0)).await?;
            v2::write_header(&mut self.stream, &v2::Header::default()).await?;
        }
        self.stream.flush().await?;
        debug!("discarded CAR under construction");
        Ok(self.stream)
    }

    fn cid_matches(&self, requested: &Cid, stored: &Cid) -> bool {
        if self.config.use_whole_cids {
            stored == requested
        } else {
            stored.hash().code() == requested.hash().code()
                && stored.hash().digest() == requested.hash().digest()
        }
    }
}
