//! Whole-file transformations: wrapping a CARv1 into a CARv2 envelope,
//! extracting the CARv1 payload back out, and replacing roots in place.

use std::{io::SeekFrom, path::Path};

use ipld_core::cid::Cid;
use tokio::{
    fs::OpenOptions,
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt},
};

use crate::{
    async_varint::discard_exact,
    v1, v2,
    v2::{Index, PRAGMA},
    Config, Error,
};

/// Wrap a CARv1 stream into a CARv2.
///
/// The input is scanned once to measure the payload and build the index,
/// then rewound and copied verbatim into the envelope. Paddings come from
/// the [`Config`].
///
/// Returns the number of bytes written.
pub async fn wrap_v1<R, W>(mut reader: R, mut writer: W, config: &Config) -> Result<u64, Error>
where
    R: AsyncRead + AsyncSeek + Unpin,
    W: AsyncWrite + Unpin,
{
    reader.seek(SeekFrom::Start(0)).await?;
    let index = Index::from_car(&mut reader, config).await?;
    let data_size = reader.stream_position().await?;
    reader.seek(SeekFrom::Start(0)).await?;

    let data_offset = v2::Header::SIZE as u64 + config.data_padding;
    let index_offset = data_offset + data_size + config.index_padding;
    let header = v2::Header::new(false, data_offset, data_size, index_offset);

    let mut written = v2::write_header(&mut writer, &header).await? as u64;
    written += v2::write_padding(&mut writer, config.data_padding as usize).await? as u64;
    written += tokio::io::copy(&mut reader, &mut writer).await?;
    written += v2::write_padding(&mut writer, config.index_padding as usize).await? as u64;
    written += v2::write_index(&mut writer, &index).await? as u64;
    writer.flush().await?;
    Ok(written)
}

/// Extract the CARv1 payload out of a CARv2 stream.
///
/// The index (when present) is dropped — it holds offsets into the
/// envelope's payload and would be meaningless next to a bare CARv1.
///
/// Returns the number of bytes written.
pub async fn extract_v1<R, W>(mut reader: R, mut writer: W) -> Result<u64, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pragma_buffer = vec![0; PRAGMA.len()];
    reader.read_exact(&mut pragma_buffer).await?;
    if pragma_buffer != PRAGMA {
        return Err(Error::InvalidPragmaError(pragma_buffer));
    }
    let header = v2::read_header(&mut reader).await?;
    discard_exact(&mut reader, header.data_offset - v2::Header::SIZE as u64).await?;

    let mut limited = reader.take(header.data_size);
    let copied = tokio::io::copy(&mut limited, &mut writer).await?;
    if copied < header.data_size {
        return Err(Error::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "payload ended before its declared size",
        )));
    }
    writer.flush().await?;
    Ok(copied)
}

/// Replace the roots of the CAR file at `path`, in place.
///
/// Works on both CARv1 and CARv2 files. The header slot cannot move, so the
/// replacement roots must encode to exactly the same header length;
/// otherwise the file is left untouched and
/// [`Error::HeaderSizeMismatchError`] is returned.
pub async fn replace_roots_in_file<P>(path: P, roots: &[Cid], config: &Config) -> Result<(), Error>
where
    P: AsRef<Path>,
{
    if roots.is_empty() {
        return Err(Error::EmptyRootsError);
    }
    let mut file = OpenOptions::new().read(true).write(true).open(path).await?;

    let (frame, frame_length) =
        v1::read_header_frame(&mut file, config.max_allowed_header_size).await?;
    let (data_offset, existing_length) = if frame == PRAGMA[1..] {
        let header = v2::read_header(&mut file).await?;
        file.seek(SeekFrom::Start(header.data_offset)).await?;
        let (_, existing_length) = v1::read_header(&mut file, config).await?;
        (header.data_offset, existing_length)
    } else {
        v1::decode_header(&frame)?;
        (0, frame_length)
    };

    let header = v1::Header::new(roots.to_vec());
    let received = header.encoded_len()?;
    if received != existing_length {
        return Err(Error::HeaderSizeMismatchError {
            expected: existing_length,
            received,
        });
    }

    file.seek(SeekFrom::Start(data_offset)).await?;
    v1::write_header(&mut file, &header).await?;
    file.flush().await?;
    Ok(())
}
