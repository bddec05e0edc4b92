use byteorder::{LittleEndian, WriteBytesExt};
use ipld_core::cid::Cid;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{
    v2::{index::write_index, Header, Index, PRAGMA},
    Error,
};

/// Write the pragma and the 40 byte CARv2 header.
///
/// Returns the number of bytes written.
pub(crate) async fn write_header<W>(writer: &mut W, header: &Header) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&PRAGMA).await?;

    let mut buffer = [0; 40];
    let mut handle = &mut buffer[..];
    WriteBytesExt::write_u128::<LittleEndian>(&mut handle, header.characteristics.bits())?;
    WriteBytesExt::write_u64::<LittleEndian>(&mut handle, header.data_offset)?;
    WriteBytesExt::write_u64::<LittleEndian>(&mut handle, header.data_size)?;
    WriteBytesExt::write_u64::<LittleEndian>(&mut handle, header.index_offset)?;

    writer.write_all(&buffer).await?;
    Ok(PRAGMA.len() + buffer.len())
}

/// Write `length` zero bytes.
pub(crate) async fn write_padding<W>(writer: &mut W, length: usize) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    const ZEROES: [u8; 1024] = [0; 1024];
    let mut remaining = length;
    while remaining > 0 {
        let chunk = remaining.min(ZEROES.len());
        writer.write_all(&ZEROES[..chunk]).await?;
        remaining -= chunk;
    }
    Ok(length)
}

/// Low-level CARv2 writer.
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

    /// Write a [`crate::v1::Header`].
    ///
    /// Returns the number of bytes written.
    pub async fn write_v1_header(&mut self, v1_header: &crate::v1::Header) -> Result<usize, Error> {
        crate::v1::write_header(&mut self.writer, v1_header).await
    }

    /// Write a [`Cid`] and the respective data block.
    ///
    /// Returns the number of bytes written.
    pub async fn write_block<Block>(&mut self, cid: &Cid, block: &Block) -> Result<usize, Error>
    where
        Block: AsRef<[u8]>,
    {
        crate::v1::write_block(&mut self.writer, cid, block).await
    }

    /// Write an [`Index`].
    ///
    /// Returns the number of bytes written.
    pub async fn write_index(&mut self, index: &Index) -> Result<usize, Error> {
        write_index(&mut self.writer, index).await
    }

    /// Write padding (`0x0` bytes).
    ///
    /// Returns the number of bytes written.
    pub async fn write_padding(&mut self, length: usize) -> Result<usize, Error> {
        write_padding(&mut self.writer, length).await
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

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use ipld_core::cid::Cid;
    use sha2::Sha256;

    use crate::{
        multicodec::{generate_multihash, RAW_CODE},
        v2::{Header, Reader, Writer},
    };

    #[tokio::test]
    async fn padding_is_zeroed() {
        let mut writer = Writer::new(Vec::new());
        let written = writer.write_padding(2048 + 3).await.unwrap();
        let buffer = writer.finish().await.unwrap();
        assert_eq!(written, 2048 + 3);
        assert!(buffer.iter().all(|byte| *byte == 0));
    }

    #[tokio::test]
    async fn envelope_roundtrip() {
        let data = b"padded payload".to_vec();
        let cid = Cid::new_v1(RAW_CODE, generate_multihash::<Sha256, _>(&data));
        let v1_header = crate::v1::Header::new(vec![cid]);

        let mut writer = Writer::new(Vec::new());
        let mut position = 0;
        let header_v1_size = v1_header.encoded_len().unwrap();
        let block_frame_size = 1 + cid.encoded_len() as u64 + data.len() as u64;
        let data_size = header_v1_size + block_frame_size;
        let header = Header::new(false, Header::SIZE as u64, data_size, 0);

        position += writer.write_header(&header).await.unwrap();
        position += writer.write_v1_header(&v1_header).await.unwrap();
        position += writer.write_block(&cid, &data).await.unwrap();
        let buffer = writer.finish().await.unwrap();
        assert_eq!(position, buffer.len());
        assert_eq!(position as u64, Header::SIZE as u64 + data_size);

        let mut reader = Reader::new(Cursor::new(buffer));
        reader.read_pragma().await.unwrap();
        let read_header = reader.read_header().await.unwrap();
        assert_eq!(read_header, header);
        let read_v1_header = reader.read_v1_header().await.unwrap();
        assert_eq!(read_v1_header.roots, vec![cid]);
        let (read_cid, read_data) = reader.read_block().await.unwrap().unwrap();
        assert_eq!(read_cid, cid);
        assert_eq!(read_data, data);
    }
}
