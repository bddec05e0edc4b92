use ipld_core::{cid::Cid, codec::Codec};
use serde_ipld_dagcbor::codec::DagCborCodec;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{async_varint::write_varint, v1::Header, Error};

/// Write a [`Header`] to the given writer.
///
/// Returns the number of bytes written.
pub(crate) async fn write_header<W>(writer: &mut W, header: &Header) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let encoded_header = DagCborCodec::encode_to_vec(header)?;
    let varint_length = write_varint(writer, encoded_header.len() as u64).await?;
    writer.write_all(&encoded_header).await?;
    Ok(varint_length + encoded_header.len())
}

/// Write a [`Cid`] and data block to the given writer.
///
/// The length prefix covers the CID and the data as a single frame.
///
/// Returns the number of bytes written.
pub(crate) async fn write_block<W, Block>(
    writer: &mut W,
    cid: &Cid,
    block: Block,
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
    Block: AsRef<[u8]>,
{
    let data = block.as_ref();
    let length = cid.encoded_len() + data.len();

    let varint_length = write_varint(writer, length as u64).await?;
    writer.write_all(&cid.to_bytes()).await?;
    writer.write_all(data).await?;
    Ok(varint_length + length)
}

/// Low-level CARv1 writer.
///
/// This writer appends to a forward-only stream — it is the streaming
/// (non-seekable) write path; nothing it emits is ever patched afterwards.
pub struct Writer<W> {
    writer: W,
}

impl<W> Writer<W> {
    /// Construct a new [`Writer`].
    ///
    /// Takes a writer into which the data will be written.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W> Writer<W>
where
    W: AsyncWrite + Unpin,
{
    /// Write a [`Header`].
    ///
    /// Returns the number of bytes written.
    pub async fn write_header(&mut self, header: &Header) -> Result<usize, Error> {
        write_header(&mut self.writer, header).await
    }

    /// Write a [`Cid`] and the respective data block.
    ///
    /// Returns the number of bytes written.
    pub async fn write_block<D>(&mut self, cid: &Cid, data: &D) -> Result<usize, Error>
    where
        D: AsRef<[u8]>,
    {
        write_block(&mut self.writer, cid, data).await
    }

    /// Flushes and returns the inner writer.
    pub async fn finish(mut self) -> Result<W, Error> {
        self.writer.flush().await?;
        Ok(self.writer)
    }

    /// Get a mutable reference to the inner writer.
    pub fn get_inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }
}
