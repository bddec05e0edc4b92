use std::{io::SeekFrom, path::Path};

use futures::Stream;
use ipld_core::cid::Cid;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt},
    sync::Mutex,
};
use tracing::debug;

use crate::{
    async_varint::read_varint,
    cid::read_cid,
    v1, v2,
    v2::{Index, LazyIndex, PRAGMA},
    Config, Error,
};

/// The file layout discovered at open time.
struct Layout {
    version: u8,
    roots: Vec<Cid>,
    header_v2: Option<v2::Header>,
    /// Absolute offset of the CARv1 payload.
    data_offset: u64,
    /// Length of the CARv1 payload.
    data_size: u64,
    /// Absolute offset of the first section (past the v1 header).
    data_start: u64,
}

enum StoreIndex {
    Eager(Index),
    Lazy(LazyIndex),
}

/// A read-only block store over a seekable CARv1 or CARv2 backing.
///
/// Lookups go index → payload offset → bounded section read. When the
/// backing is a CARv2 with an index footer, the index is loaded lazily and
/// probed on disk; otherwise a single payload scan builds one in memory.
///
/// All read methods take `&self`: the backing reader sits behind a
/// [`tokio::sync::Mutex`], so any number of tasks may call concurrently
/// while the actual I/O serializes on the lock. There are no mutating
/// methods — the read-only contract is part of the type.
pub struct IndexedReader<R> {
    inner: Mutex<R>,
    index: StoreIndex,
    layout: Layout,
    config: Config,
}

impl IndexedReader<tokio::fs::File> {
    /// Open a CAR file from `path` with the default [`Config`].
    pub async fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::from_path_with_config(path, Config::default()).await
    }

    /// Open a CAR file from `path` with the given [`Config`].
    pub async fn from_path_with_config<P: AsRef<Path>>(
        path: P,
        config: Config,
    ) -> Result<Self, Error> {
        let file = tokio::fs::File::open(path).await?;
        Self::with_config(file, config).await
    }
}

impl<R> IndexedReader<R>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    /// Open a store over `reader` with the default [`Config`].
    pub async fn new(reader: R) -> Result<Self, Error> {
        Self::with_config(reader, Config::default()).await
    }

    /// Open a store over `reader` with the given [`Config`].
    ///
    /// A CARv2 backing with an index footer gets a lazy on-disk index;
    /// anything else is scanned once to build an eager one.
    pub async fn with_config(mut reader: R, config: Config) -> Result<Self, Error> {
        let layout = Self::read_layout(&mut reader, &config).await?;

        let index = match layout.header_v2.as_ref() {
            Some(header) if header.index_offset != 0 => {
                StoreIndex::Lazy(LazyIndex::from_reader(&mut reader, header.index_offset).await?)
            }
            _ => {
                debug!("no embedded index, scanning the payload");
                reader.seek(SeekFrom::Start(layout.data_offset)).await?;
                let mut limited = (&mut reader).take(layout.data_size);
                StoreIndex::Eager(Index::from_car(&mut limited, &config).await?)
            }
        };

        Ok(Self {
            inner: Mutex::new(reader),
            index,
            layout,
            config,
        })
    }

    /// Open a store over `reader` using an already-loaded [`Index`],
    /// skipping any scan.
    pub async fn with_index(mut reader: R, index: Index, config: Config) -> Result<Self, Error> {
        let layout = Self::read_layout(&mut reader, &config).await?;
        Ok(Self {
            inner: Mutex::new(reader),
            index: StoreIndex::Eager(index),
            layout,
            config,
        })
    }

    async fn read_layout(reader: &mut R, config: &Config) -> Result<Layout, Error> {
        reader.seek(SeekFrom::Start(0)).await?;
        let (frame, frame_length) =
            v1::read_header_frame(reader, config.max_allowed_header_size).await?;

        if frame == PRAGMA[1..] {
            let header = v2::read_header(reader).await?;
            reader.seek(SeekFrom::Start(header.data_offset)).await?;
            let mut limited = (&mut *reader).take(header.data_size);
            let (v1_header, v1_frame_length) = v1::read_header(&mut limited, config).await?;
            Ok(Layout {
                version: 2,
                roots: v1_header.roots,
                data_offset: header.data_offset,
                data_size: header.data_size,
                data_start: header.data_offset + v1_frame_length,
                header_v2: Some(header),
            })
        } else {
            let header = v1::decode_header(&frame)?;
            let file_end = reader.seek(SeekFrom::End(0)).await?;
            Ok(Layout {
                version: 1,
                roots: header.roots,
                header_v2: None,
                data_offset: 0,
                data_size: file_end,
                data_start: frame_length,
            })
        }
    }

    /// The roots declared by the (inner) CARv1 header, cached at open time.
    pub fn roots(&self) -> &[Cid] {
        &self.layout.roots
    }

    /// The CAR version, 1 or 2.
    pub fn version(&self) -> u8 {
        self.layout.version
    }

    /// The CARv2 envelope header, when the backing is a CARv2.
    pub fn header_v2(&self) -> Option<&v2::Header> {
        self.layout.header_v2.as_ref()
    }

    /// Whether a block matching `cid`'s digest is indexed.
    pub async fn has(&self, cid: &Cid) -> Result<bool, Error> {
        match &self.index {
            StoreIndex::Eager(index) => Ok(index.get_all(cid, |_| false)),
            StoreIndex::Lazy(lazy) => {
                let mut inner = self.inner.lock().await;
                lazy.get_all(&mut *inner, cid, |_| false).await
            }
        }
    }

    /// Read the block addressed by `cid`.
    ///
    /// Every candidate offset is tried in index order; the stored CID must
    /// match the request (by digest, or by whole CID under
    /// [`Config::use_whole_cids`]). [`Error::NotFoundError`] when nothing
    /// matches.
    pub async fn get(&self, cid: &Cid) -> Result<Vec<u8>, Error> {
        let offsets = self.offsets_for(cid).await?;
        let mut inner = self.inner.lock().await;
        for offset in offsets {
            if offset >= self.layout.data_size {
                continue;
            }
            inner
                .seek(SeekFrom::Start(self.layout.data_offset + offset))
                .await?;
            // Never read past the payload, no matter what the index says.
            let mut limited = (&mut *inner).take(self.layout.data_size - offset);
            let Some((stored, data, _)) =
                v1::read_block_frame(&mut limited, &self.config).await?
            else {
                continue;
            };
            if self.cid_matches(cid, &stored) {
                return Ok(data);
            }
        }
        Err(Error::NotFoundError(*cid))
    }

    /// Size of the block addressed by `cid`, without reading its payload.
    pub async fn get_size(&self, cid: &Cid) -> Result<u64, Error> {
        let offsets = self.offsets_for(cid).await?;
        let mut inner = self.inner.lock().await;
        for offset in offsets {
            if offset >= self.layout.data_size {
                continue;
            }
            inner
                .seek(SeekFrom::Start(self.layout.data_offset + offset))
                .await?;
            let mut limited = (&mut *inner).take(self.layout.data_size - offset);
            let frame_length: u64 = read_varint(&mut limited).await?;
            let (stored, cid_length) = read_cid(&mut limited).await?;
            if cid_length <= frame_length && self.cid_matches(cid, &stored) {
                return Ok(frame_length - cid_length);
            }
        }
        Err(Error::NotFoundError(*cid))
    }

    /// Stream every section's CID by scanning the payload in order.
    ///
    /// The reader lock is held only while a section is being decoded, so
    /// `get`/`has` calls interleave freely. Dropping the stream cancels the
    /// scan.
    pub fn all_keys(&self) -> impl Stream<Item = Result<Cid, Error>> + '_ {
        async_stream::try_stream! {
            let mut position = self.layout.data_start;
            let end = self.layout.data_offset + self.layout.data_size;
            while position < end {
                let mut inner = self.inner.lock().await;
                inner.seek(SeekFrom::Start(position)).await?;
                let mut limited = (&mut *inner).take(end - position);
                match v1::skip_block(&mut limited, &self.config).await? {
                    Some((cid, frame_length, _)) => {
                        position += frame_length;
                        drop(inner);
                        yield cid;
                    }
                    None => break,
                }
            }
        }
    }

    async fn offsets_for(&self, cid: &Cid) -> Result<Vec<u64>, Error> {
        let mut offsets = vec![];
        match &self.index {
            StoreIndex::Eager(index) => {
                index.get_all(cid, |offset| {
                    offsets.push(offset);
                    true
                });
            }
            StoreIndex::Lazy(lazy) => {
                let mut inner = self.inner.lock().await;
                lazy.get_all(&mut *inner, cid, |offset| {
                    offsets.push(offset);
                    true
                })
                .await?;
            }
        }
        Ok(offsets)
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

/// Scan a CAR file and build an [`Index`] for it, e.g. to persist as a
/// sidecar with [`Index::write_to_file`].
pub async fn generate_index<P>(path: P, config: &Config) -> Result<Index, Error>
where
    P: AsRef<Path>,
{
    let mut file = tokio::fs::File::open(path).await?;
    let (frame, _) = v1::read_header_frame(&mut file, config.max_allowed_header_size).await?;

    if frame == PRAGMA[1..] {
        let header = v2::read_header(&mut file).await?;
        file.seek(SeekFrom::Start(header.data_offset)).await?;
        let mut limited = (&mut file).take(header.data_size);
        Index::from_car(&mut limited, config).await
    } else {
        file.seek(SeekFrom::Start(0)).await?;
        Index::from_car(&mut file, config).await
    }
}
