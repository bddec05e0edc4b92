use ipld_core::cid::Cid;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    v2::{index::read_index, Characteristics, Header, Index, PRAGMA},
    Config, Error,
};

/// Read the 40 byte CARv2 header that follows the pragma.
///
/// The field values are validated against the envelope invariants.
pub(crate) async fn read_header<R>(reader: &mut R) -> Result<Header, Error>
where
    R: AsyncRead + Unpin,
{
    // Even though the standard doesn't explicitly state endianness, go-car does
    // https://github.com/ipld/go-car/blob/45b81c1cc5117b3340dfdb025afeca90bfbe8d86/v2/car.go#L51-L69
    let characteristics_bitfield = reader.read_u128_le().await?;
    let characteristics = Characteristics::from_bits(characteristics_bitfield)
        .ok_or(Error::UnknownCharacteristicsError(characteristics_bitfield))?;

    let data_offset = reader.read_u64_le().await?;
    let data_size = reader.read_u64_le().await?;
    let index_offset = reader.read_u64_le().await?;

    let header = Header {
        characteristics,
        data_offset,
        data_size,
        index_offset,
    };
    header.validate()?;
    Ok(header)
}

/// Low-level CARv2 reader.
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
    /// Read the CARv2 pragma.
    ///
    /// This function fails if the pragma does not match the one defined in the
    /// [specification](https://ipld.io/specs/transport/car/carv2/#pragma).
    pub async fn read_pragma(&mut self) -> Result<(), Error> {
        let mut pragma_buffer = vec![0; PRAGMA.len()];
        self.reader.read_exact(&mut pragma_buffer).await?;
        if pragma_buffer != PRAGMA {
            return Err(Error::InvalidPragmaError(pragma_buffer));
        }
        // Since we validate the pragma, there's no point in returning it.
        Ok(())
    }

    /// Read the [`Header`].
    ///
    /// This function fails if there are set bits that are not covered in the
    /// [characteristics specification](https://ipld.io/specs/transport/car/carv2/#characteristics),
    /// or if the offsets break the envelope invariants.
    ///
    /// For more information check the [header specification](https://ipld.io/specs/transport/car/carv2/#header).
    pub async fn read_header(&mut self) -> Result<Header, Error> {
        read_header(&mut self.reader).await
    }

    /// Read the inner [`crate::v1::Header`].
    ///
    /// See [`crate::v1::Reader`] for more information.
    pub async fn read_v1_header(&mut self) -> Result<crate::v1::Header, Error> {
        crate::v1::read_header(&mut self.reader, &self.config)
            .await
            .map(|(header, _)| header)
    }

    /// Read a [`Cid`] and data block.
    ///
    /// See [`crate::v1::Reader`] for more information.
    pub async fn read_block(&mut self) -> Result<Option<(Cid, Vec<u8>)>, Error> {
        crate::v1::read_block_frame(&mut self.reader, &self.config)
            .await
            .map(|block| block.map(|(cid, data, _)| (cid, data)))
    }

    /// Read an [`Index`].
    pub async fn read_index(&mut self) -> Result<Index, Error> {
        read_index(&mut self.reader, &self.config).await
    }

    /// Get a mutable reference to the inner reader.
    ///
    /// This is useful to skip padding or perform other operations the
    /// [`Reader`] does not natively support.
    pub fn get_inner_mut(&mut self) -> &mut R {
        &mut self.reader
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::{v2::Reader, Error};

    #[tokio::test]
    async fn bad_pragma() {
        let mut bad_pragma = vec![0u8; 11];
        bad_pragma.fill_with(rand::random);
        let mut reader = Reader::new(Cursor::new(bad_pragma));
        let pragma = reader.read_pragma().await;
        assert!(matches!(pragma, Err(Error::InvalidPragmaError(_))));
    }

    #[tokio::test]
    async fn truncated_pragma() {
        let mut reader = Reader::new(Cursor::new(&crate::v2::PRAGMA[..7]));
        let pragma = reader.read_pragma().await;
        assert!(matches!(pragma, Err(Error::IoError(_))));
    }

    #[tokio::test]
    async fn unknown_characteristics() {
        let mut buffer = crate::v2::PRAGMA.to_vec();
        // A characteristics field with a low bit set, which no specification defines.
        buffer.extend_from_slice(&1u128.to_le_bytes());
        buffer.extend_from_slice(&51u64.to_le_bytes());
        buffer.extend_from_slice(&1u64.to_le_bytes());
        buffer.extend_from_slice(&0u64.to_le_bytes());

        let mut reader = Reader::new(Cursor::new(buffer));
        reader.read_pragma().await.unwrap();
        assert!(matches!(
            reader.read_header().await,
            Err(Error::UnknownCharacteristicsError(1))
        ));
    }
}
