use std::collections::HashMap;

use indexmap::IndexMap;
use ipld_core::cid::Cid;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::{multicodec::IDENTITY_CODE, v1, Config, Error};

/// A streaming CAR writer over a non-seekable sink.
///
/// The CARv1 header goes out immediately — without seek there is no way to
/// patch an envelope afterwards, so this store cannot produce a CARv2.
/// Enough bookkeeping is kept in memory for [`has`](WriteOnly::has),
/// [`get_size`](WriteOnly::get_size) and [`all_keys`](WriteOnly::all_keys)
/// to answer for the store's own puts; [`get`](WriteOnly::get) would need
/// to re-read the sink and reports [`Error::WriteOnlyError`].
pub struct WriteOnly<W> {
    writer: W,
    config: Config,
    roots: Vec<Cid>,
    /// Every stored CID with its block size, in insertion order.
    blocks: IndexMap<Cid, u64>,
    /// Multihash (code, digest) to block size, for digest-keyed lookups.
    sizes: HashMap<(u64, Vec<u8>), u64>,
}

impl<W> WriteOnly<W>
where
    W: AsyncWrite + Unpin,
{
    /// Open a store over `writer` with the default [`Config`].
    pub async fn new(writer: W, roots: Vec<Cid>) -> Result<Self, Error> {
        Self::with_config(writer, roots, Config::default()).await
    }

    /// Open a store over `writer` with the given [`Config`].
    ///
    /// Writes the CARv1 header before returning.
    pub async fn with_config(
        mut writer: W,
        roots: Vec<Cid>,
        config: Config,
    ) -> Result<Self, Error> {
        if roots.is_empty() {
            return Err(Error::EmptyRootsError);
        }
        v1::write_header(&mut writer, &v1::Header::new(roots.clone())).await?;
        Ok(Self {
            writer,
            config,
            roots,
            blocks: IndexMap::new(),
            sizes: HashMap::new(),
        })
    }

    /// The store's roots.
    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }

    /// Append a block, with the same gate, identity and dedup rules as the
    /// read-write store.
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
                self.blocks.contains_key(cid)
            } else {
                self.sizes.contains_key(&Self::digest_key(cid))
            };
            if duplicate {
                trace!(%cid, "skipping duplicate put");
                return Ok(());
            }
        }

        let data = data.as_ref();
        v1::write_block(&mut self.writer, cid, data).await?;
        self.blocks.insert(*cid, data.len() as u64);
        self.sizes.insert(Self::digest_key(cid), data.len() as u64);
        Ok(())
    }

    /// Whether a block matching `cid` has been put (and not suppressed).
    pub fn has(&self, cid: &Cid) -> bool {
        if self.config.use_whole_cids {
            self.blocks.contains_key(cid)
        } else {
            self.sizes.contains_key(&Self::digest_key(cid))
        }
    }

    /// Size of a block this store wrote, answered from memory.
    pub fn get_size(&self, cid: &Cid) -> Result<u64, Error> {
        let size = if self.config.use_whole_cids {
            self.blocks.get(cid).copied()
        } else {
            self.sizes.get(&Self::digest_key(cid)).copied()
        };
        size.ok_or(Error::NotFoundError(*cid))
    }

    /// Random access is unsupported: the sink cannot be re-read.
    pub async fn get(&self, _cid: &Cid) -> Result<Vec<u8>, Error> {
        Err(Error::WriteOnlyError)
    }

    /// Every stored CID, in insertion order.
    pub fn all_keys(&self) -> impl Iterator<Item = &Cid> {
        self.blocks.keys()
    }

    /// Flush and return the sink.
    pub async fn finalize(mut self) -> Result<W, Error> {
        self.writer.flush().await?;
        Ok(self.writer)
    }

    fn digest_key(cid: &Cid) -> (u64, Vec<u8>) {
        (cid.hash().code(), cid.hash().digest().to_vec())
    }
}
