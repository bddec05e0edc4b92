use std::io::Cursor;

use ipld_core::{cid::Cid, codec::Codec};
use serde_ipld_dagcbor::codec::DagCborCodec;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    async_varint::{discard_exact, read_varint_counted},
    cid::read_cid,
    v1::{Header, HeaderOrPragma},
    v2::PRAGMA,
    Config, Error,
};

/// Read the raw bytes of the first length-prefixed frame.
///
/// The length prefix is checked against `max_allowed` *before* the frame
/// buffer is allocated; a hostile prefix costs nothing but the varint read.
///
/// Returns the frame bytes and the total frame length (varint included).
pub(crate) async fn read_header_frame<R>(
    reader: &mut R,
    max_allowed: u64,
) -> Result<(Vec<u8>, u64), Error>
where
    R: AsyncRead + Unpin,
{
    let (header_length, varint_length): (u64, u64) = read_varint_counted(reader)
        .await?
        .ok_or_else(|| {
            Error::IoError(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Reached EOF",
            ))
        })?;
    if header_length > max_allowed {
        return Err(Error::HeaderTooLargeError {
            size: header_length,
            maximum: max_allowed,
        });
    }
    let mut header_buffer = vec![0; header_length as usize];
    reader.read_exact(&mut header_buffer).await?;
    Ok((header_buffer, varint_length + header_length))
}

/// Read and validate a CARv1 [`Header`].
///
/// As defined in the [specification constraints](https://ipld.io/specs/transport/car/carv1/#constraints),
/// this function will return an error if:
/// * The read header does not have version 1.
/// * The read header does not have roots.
///
/// Returns the header and its total frame length (varint included).
pub(crate) async fn read_header<R>(
    reader: &mut R,
    config: &Config,
) -> Result<(Header, u64), Error>
where
    R: AsyncRead + Unpin,
{
    let (header_buffer, frame_length) =
        read_header_frame(reader, config.max_allowed_header_size).await?;
    Ok((decode_header(&header_buffer)?, frame_length))
}

/// Decode and validate a CARv1 [`Header`] from its frame bytes.
pub(crate) fn decode_header(header_buffer: &[u8]) -> Result<Header, Error> {
    // From the V2 specification:
    // > This 11 byte string remains fixed and may be matched using a
    // > simple byte comparison and does not require a varint or CBOR
    // > decode since it does not vary for the CARv2 format.
    // We're skipping the first byte because we already read the length.
    if header_buffer == &PRAGMA[1..] {
        return Err(Error::VersionMismatchError {
            expected: 1,
            received: 2,
        });
    }

    let header: HeaderOrPragma = DagCborCodec::decode_from_slice(header_buffer)?;
    if header.version != 1 {
        return Err(Error::VersionMismatchError {
            expected: 1,
            received: header.version,
        });
    }
    let roots = header.roots.unwrap_or_default();
    if roots.is_empty() {
        return Err(Error::EmptyRootsError);
    }
    Ok(Header::new(roots))
}

/// Read one section, returning the CID, the block payload, and the total
/// frame length (varint included). `Ok(None)` is a clean end of data.
pub(crate) async fn read_block_frame<R>(
    reader: &mut R,
    config: &Config,
) -> Result<Option<(Cid, Vec<u8>, u64)>, Error>
where
    R: AsyncRead + Unpin,
{
    let Some((full_block_length, varint_length)): Option<(u64, u64)> =
        read_varint_counted(reader).await?
    else {
        return Ok(None);
    };
    if full_block_length == 0 {
        if config.zero_length_section_as_eof {
            return Ok(None);
        }
        return Err(Error::MalformedSectionError(
            "zero-length section".to_string(),
        ));
    }
    if full_block_length > config.max_allowed_section_size {
        return Err(Error::SectionTooLargeError {
            size: full_block_length,
            maximum: config.max_allowed_section_size,
        });
    }

    let mut full_block_buffer = vec![0; full_block_length as usize];
    reader.read_exact(&mut full_block_buffer).await?;

    // We're cheating to get Seek
    let mut full_block_cursor = Cursor::new(full_block_buffer);
    let cid = Cid::read_bytes(&mut full_block_cursor)?;

    let data_start_position = full_block_cursor.position() as usize;
    let mut full_block_buffer = full_block_cursor.into_inner();
    let data = full_block_buffer.split_off(data_start_position);

    Ok(Some((cid, data, varint_length + full_block_length)))
}

/// Read one section's CID and discard its payload without buffering it.
///
/// Returns the CID, the total frame length (varint included), and the
/// payload length. `Ok(None)` is a clean end of data.
pub(crate) async fn skip_block<R>(
    reader: &mut R,
    config: &Config,
) -> Result<Option<(Cid, u64, u64)>, Error>
where
    R: AsyncRead + Unpin,
{
    let Some((full_block_length, varint_length)): Option<(u64, u64)> =
        read_varint_counted(reader).await?
    else {
        return Ok(None);
    };
    if full_block_length == 0 {
        if config.zero_length_section_as_eof {
            return Ok(None);
        }
        return Err(Error::MalformedSectionError(
            "zero-length section".to_string(),
        ));
    }
    if full_block_length > config.max_allowed_section_size {
        return Err(Error::SectionTooLargeError {
            size: full_block_length,
            maximum: config.max_allowed_section_size,
        });
    }

    let (cid, cid_length) = read_cid(reader).await?;
    if cid_length > full_block_length {
        return Err(Error::MalformedSectionError(format!(
            "section of {full_block_length} bytes is shorter than its {cid_length} byte CID"
        )));
    }
    let data_length = full_block_length - cid_length;
    discard_exact(reader, data_length).await?;

    Ok(Some((cid, varint_length + full_block_length, data_length)))
}

/// Low-level CARv1 reader.
pub struct Reader<R> {
    reader: R,
    config: Config,
}

impl<R> Reader<R> {
    /// Constructs a new [`Reader`] with the default [`Config`].
    pub fn new(reader: R) -> Self {
        Self::with_config(reader, Config::default())
    }

    /// Constructs a new [`Reader`] with the given [`Config`].
    pub fn with_config(reader: R, config: Config) -> Self {
        Self { reader, config }
    }
}

impl<R> Reader<R>
where
    R: AsyncRead + Unpin,
{
    /// Read a [`Header`].
    ///
    /// For more information, check the [header specification](https://ipld.io/specs/transport/car/carv1/#header).
    pub async fn read_header(&mut self) -> Result<Header, Error> {
        read_header(&mut self.reader, &self.config)
            .await
            .map(|(header, _)| header)
    }

    /// Reads a [`Cid`] and a data block.
    ///
    /// A block is composed of a CID (either version 0 or 1) and data, it is prefixed with the data length.
    /// ```text
    /// ┌──────────────────────┬─────┬────────────────────────┐
    /// │ Data length (varint) │ CID │ Data block (raw bytes) │
    /// └──────────────────────┴─────┴────────────────────────┘
    /// ```
    /// *The data block is returned AS IS, callers should use the codec field of the [`Cid`] to parse it.*
    ///
    /// Returns `Ok(None)` on a clean end of data.
    ///
    /// For more information, check the [block specification](https://ipld.io/specs/transport/car/carv1/#data).
    pub async fn read_block(&mut self) -> Result<Option<(Cid, Vec<u8>)>, Error> {
        read_block_frame(&mut self.reader, &self.config)
            .await
            .map(|block| block.map(|(cid, data, _)| (cid, data)))
    }

    /// Reads a section's [`Cid`] and discards its payload.
    ///
    /// Returns the CID and the payload length, or `Ok(None)` on a clean end
    /// of data.
    pub async fn skip_block(&mut self) -> Result<Option<(Cid, u64)>, Error> {
        skip_block(&mut self.reader, &self.config)
            .await
            .map(|block| block.map(|(cid, _, data_length)| (cid, data_length)))
    }

    /// Get a mutable reference to the inner reader.
    pub fn get_inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use integer_encoding::VarInt;
    use ipld_core::cid::Cid;

    use crate::{
        test_utils::{cid_for, write_car_v1},
        v1::Reader,
        Config, Error,
    };

    #[tokio::test]
    async fn header_and_blocks() {
        let blocks: Vec<(Cid, Vec<u8>)> = [&b"first block"[..], &b"second block"[..]]
            .iter()
            .map(|data| (cid_for(data), data.to_vec()))
            .collect();
        let buffer = write_car_v1(&[blocks[0].0], &blocks).await;

        let mut reader = Reader::new(Cursor::new(buffer));
        let header = reader.read_header().await.unwrap();
        assert_eq!(header.version(), 1);
        assert_eq!(header.roots, vec![blocks[0].0]);

        for (cid, data) in &blocks {
            let (read_cid, read_data) = reader.read_block().await.unwrap().unwrap();
            assert_eq!(read_cid, *cid);
            assert_eq!(read_data, *data);
        }
        assert!(reader.read_block().await.unwrap().is_none());
        // EOF stays EOF
        assert!(reader.read_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skip_block_reports_payload_length() {
        let data = b"some payload to be skipped".to_vec();
        let cid = cid_for(&data);
        let buffer = write_car_v1(&[cid], &[(cid, data.clone())]).await;

        let mut reader = Reader::new(Cursor::new(buffer));
        reader.read_header().await.unwrap();
        let (skipped, length) = reader.skip_block().await.unwrap().unwrap();
        assert_eq!(skipped, cid);
        assert_eq!(length, data.len() as u64);
        assert!(reader.skip_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn v2_pragma_is_rejected() {
        let mut buffer = vec![];
        buffer.extend_from_slice(&crate::v2::PRAGMA);
        let mut reader = Reader::new(Cursor::new(buffer));
        assert!(matches!(
            reader.read_header().await,
            Err(Error::VersionMismatchError {
                expected: 1,
                received: 2
            })
        ));
    }

    #[tokio::test]
    async fn header_over_limit() {
        let cid = cid_for(b"root");
        let roots = vec![cid; 5];
        let buffer = write_car_v1(&roots, &[]).await;

        let (header_length, _) = u64::decode_var(&buffer).unwrap();

        let config = Config::default().with_max_allowed_header_size(header_length - 3);
        let mut reader = Reader::with_config(Cursor::new(buffer.clone()), config);
        assert!(matches!(
            reader.read_header().await,
            Err(Error::HeaderTooLargeError { .. })
        ));

        // With the default limit the same header parses and keeps all roots.
        let mut reader = Reader::new(Cursor::new(buffer));
        let header = reader.read_header().await.unwrap();
        assert_eq!(header.roots.len(), 5);
    }

    #[tokio::test]
    async fn section_length_bomb() {
        let cid = cid_for(b"root");
        let mut buffer = write_car_v1(&[cid], &[]).await;
        // A section claiming 0xFFFFFFFF bytes.
        buffer.extend_from_slice(&0xFFFF_FFFF_u64.encode_var_vec());

        let mut reader = Reader::new(Cursor::new(buffer));
        reader.read_header().await.unwrap();
        assert!(matches!(
            reader.read_block().await,
            Err(Error::SectionTooLargeError {
                size: 0xFFFF_FFFF,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn zero_length_section() {
        let cid = cid_for(b"root");
        let mut buffer = write_car_v1(&[cid], &[(cid, b"root".to_vec())]).await;
        buffer.push(0x00);

        // Without the option a zero length is a decode error.
        let mut reader = Reader::new(Cursor::new(buffer.clone()));
        reader.read_header().await.unwrap();
        reader.read_block().await.unwrap();
        assert!(matches!(
            reader.read_block().await,
            Err(Error::MalformedSectionError(_))
        ));

        // With the option it is a clean EOF.
        let config = Config::default().with_zero_length_section_as_eof(true);
        let mut reader = Reader::with_config(Cursor::new(buffer), config);
        reader.read_header().await.unwrap();
        reader.read_block().await.unwrap();
        assert!(reader.read_block().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_section() {
        let data = b"complete block".to_vec();
        let cid = cid_for(&data);
        let mut buffer = write_car_v1(&[cid], &[(cid, data)]).await;
        buffer.truncate(buffer.len() - 4);

        let mut reader = Reader::new(Cursor::new(buffer));
        reader.read_header().await.unwrap();
        match reader.read_block().await {
            Err(Error::IoError(error)) => {
                assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof)
            }
            other => panic!("expected an unexpected EOF, got {other:?}"),
        }
    }
}
