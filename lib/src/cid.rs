//! Incremental [`Cid`] decoding from an async stream.
//!
//! [`Cid::read_bytes`] wants a synchronous reader, which is fine when the
//! whole section is already in memory. The skip paths read the CID straight
//! off the stream instead, so a section's payload never has to be buffered
//! just to be thrown away. The decoder reports how many bytes it consumed —
//! the caller needs that to know how much of the section frame is left, and
//! the count must reflect the bytes actually read (a non-canonical varint
//! encoding is longer than the value it decodes to suggests).

use ipld_core::cid::{multihash::Multihash, Cid};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{async_varint::read_varint_counted, Error};

/// A CIDv0 is a bare SHA2-256 multihash: `0x12 0x20 <32 bytes>`.
const CIDV0_PREFIX: (u64, u64) = (0x12, 0x20);

async fn next_varint<R>(reader: &mut R) -> Result<(u64, u64), Error>
where
    R: AsyncRead + Unpin,
{
    read_varint_counted(reader).await?.ok_or_else(|| {
        Error::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Reached EOF",
        ))
    })
}

/// Read a [`Cid`] from the stream, returning it along with the number of
/// bytes consumed.
pub(crate) async fn read_cid<R>(reader: &mut R) -> Result<(Cid, u64), Error>
where
    R: AsyncRead + Unpin,
{
    let (version, version_length) = next_varint(reader).await?;

    if version == CIDV0_PREFIX.0 {
        let (digest_length, length_length) = next_varint(reader).await?;
        if digest_length != CIDV0_PREFIX.1 {
            return Err(Error::MalformedSectionError(format!(
                "CIDv0 must carry a 32 byte SHA2-256 digest, got length {digest_length}"
            )));
        }
        let mut digest = [0_u8; 32];
        reader.read_exact(&mut digest).await?;
        let multihash = Multihash::wrap(CIDV0_PREFIX.0, &digest)?;
        return Ok((Cid::new_v0(multihash)?, version_length + length_length + 32));
    }

    if version != 1 {
        return Err(Error::MalformedSectionError(format!(
            "unknown CID version {version}"
        )));
    }

    let (codec, codec_length) = next_varint(reader).await?;
    let (multihash_code, code_length) = next_varint(reader).await?;
    let (digest_length, length_length) = next_varint(reader).await?;
    if digest_length > 64 {
        return Err(Error::MalformedSectionError(format!(
            "multihash digest of {digest_length} bytes is not supported"
        )));
    }
    let mut digest = vec![0_u8; digest_length as usize];
    reader.read_exact(&mut digest).await?;

    let multihash = Multihash::wrap(multihash_code, &digest)?;
    let cid = Cid::new_v1(codec, multihash);

    let consumed =
        version_length + codec_length + code_length + length_length + digest_length;
    Ok((cid, consumed))
}
