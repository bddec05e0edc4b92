//! Async unsigned-varint support. The decoding core was mostly borrowed
//! from <https://github.com/dermesser/integer-encoding-rs>.
//!
//! The original issue why we needed to borrow the implementation of the
//! reader and writer is
//! <https://github.com/dermesser/integer-encoding-rs/blob/4f57046ae90b6b923ff235a91f0729d3cf868d72/src/writer.rs#L20>.
//! The `Send` bound is optional there, with the side effect that all
//! futures using the reader or writer are non-`Send`.
//!
//! On top of the borrowed core, this module adds two things every frame
//! decoder in this crate needs: an EOF-tolerant read (a CAR payload ends
//! exactly where its last section ends, so "no more varints" is a clean
//! stop) and byte-accounting (index generation records the offset of the
//! length prefix itself, so the decoder must know how many bytes the
//! varint occupied).

use std::{io, mem::size_of};

use integer_encoding::VarInt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Write a varint to an asynchronous writer, returning the number of bytes written.
///
/// Borrowed from:
/// <https://github.com/dermesser/integer-encoding-rs/blob/4f57046ae90b6b923ff235a91f0729d3cf868d72/src/writer.rs#L29>
pub(crate) async fn write_varint<W, VI>(writer: &mut W, n: VI) -> Result<usize, io::Error>
where
    W: AsyncWrite + Unpin,
    VI: VarInt,
{
    let mut buf = [0_u8; 10];
    let b = n.encode_var(&mut buf);
    writer.write_all(&buf[0..b]).await?;
    Ok(b)
}

/// Read a varint from an asynchronous reader.
///
/// On EOF, an [`io::Error`] with [`io::ErrorKind::UnexpectedEof`] is returned.
pub(crate) async fn read_varint<R, VI>(reader: &mut R) -> Result<VI, io::Error>
where
    R: AsyncRead + Unpin,
    VI: VarInt,
{
    match read_varint_counted(reader).await? {
        Some((value, _)) => Ok(value),
        None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Reached EOF")),
    }
}

/// Read a varint, reporting the number of bytes it occupied.
///
/// Returns `None` when the reader is exhausted *before the first byte* —
/// i.e. a clean end of stream. EOF in the middle of a varint is an
/// [`io::ErrorKind::UnexpectedEof`] error.
///
/// The decoding loop is borrowed from:
/// <https://github.com/dermesser/integer-encoding-rs/blob/4f57046ae90b6b923ff235a91f0729d3cf868d72/src/reader.rs#L70>
pub(crate) async fn read_varint_counted<R, VI>(
    reader: &mut R,
) -> Result<Option<(VI, u64)>, io::Error>
where
    R: AsyncRead + Unpin,
    VI: VarInt,
{
    let mut buf = [0_u8; 1];
    let mut p = VarIntProcessor::new::<VI>();

    while !p.finished() {
        let read = reader.read(&mut buf).await?;

        if read == 0 && p.i == 0 {
            return Ok(None);
        }
        if read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "Reached EOF"));
        }

        p.push(buf[0])?;
    }

    let consumed = p.i as u64;
    p.decode()
        .map(|value| Some((value, consumed)))
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "Reached EOF"))
}

/// Most-significant byte, == 0x80
const MSB: u8 = 0b1000_0000;

/// VarIntProcessor encapsulates the logic for decoding a VarInt byte-by-byte.
///
/// Borrowed from
/// <https://github.com/dermesser/integer-encoding-rs/blob/4f57046ae90b6b923ff235a91f0729d3cf868d72/src/reader.rs#L35>
#[derive(Default)]
struct VarIntProcessor {
    buf: [u8; 10],
    maxsize: usize,
    i: usize,
}

impl VarIntProcessor {
    fn new<VI: VarIntMaxSize>() -> VarIntProcessor {
        VarIntProcessor {
            maxsize: VI::varint_max_size(),
            ..VarIntProcessor::default()
        }
    }

    fn push(&mut self, b: u8) -> Result<(), io::Error> {
        if self.i >= self.maxsize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Unterminated varint",
            ));
        }
        self.buf[self.i] = b;
        self.i += 1;
        Ok(())
    }

    fn finished(&self) -> bool {
        self.i > 0 && (self.buf[self.i - 1] & MSB == 0)
    }

    fn decode<VI: VarInt>(&self) -> Option<VI> {
        Some(VI::decode_var(&self.buf[0..self.i])?.0)
    }
}

/// Borrowed from
/// <https://github.com/dermesser/integer-encoding-rs/blob/4f57046ae90b6b923ff235a91f0729d3cf868d72/src/varint.rs#L69>
pub(crate) trait VarIntMaxSize {
    fn varint_max_size() -> usize;
}

impl<VI: VarInt> VarIntMaxSize for VI {
    fn varint_max_size() -> usize {
        (size_of::<VI>() * 8 + 7) / 7
    }
}

/// Discard exactly `n` bytes from the reader.
///
/// A short stream yields [`io::ErrorKind::UnexpectedEof`].
pub(crate) async fn discard_exact<R>(reader: &mut R, n: u64) -> Result<(), io::Error>
where
    R: AsyncRead + Unpin,
{
    let mut limited = reader.take(n);
    let copied = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
    if copied < n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "Reached EOF while skipping",
        ));
    }
    Ok(())
}
