mod index;
mod reader;
mod writer;

use bitflags::bitflags;

pub use index::{
    Index, IndexEntry, IndexSorted, InsertionIndex, LazyIndex, MultihashIndexSorted,
    SingleWidthIndex, INDEX_SORTED_CODE, MULTIHASH_INDEX_SORTED_CODE,
};
pub use reader::Reader;
pub use writer::Writer;

pub(crate) use index::write_index;
pub(crate) use reader::read_header;
pub(crate) use writer::{write_header, write_padding};

use crate::Error;

/// The pragma for a CARv2. This is also a valid CARv1 header, with version 2 and no root CIDs.
///
/// For more information, check the specification: <https://ipld.io/specs/transport/car/carv2/#pragma>
pub const PRAGMA: [u8; 11] = [
    0x0a, // unit(10)
    0xa1, // map(1)
    0x67, // string(7)
    0x76, 0x65, 0x72, 0x73, 0x69, 0x6f, 0x6e, // "version"
    0x02, // uint(2)
];

bitflags! {
    /// Characteristics of the enclosed data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Characteristics: u128 {
        /// No characteristics were set.
        const EMPTY = 0;
        /// When this characteristic is set (1), the index includes
        /// a complete catalog of the section CIDs regardless of
        /// whether they are identity CIDs or not.
        const FULLY_INDEXED = 1 << 127;
    }
}

impl Characteristics {
    /// Create a new [`Characteristics`].
    pub fn new(fully_indexed: bool) -> Self {
        if fully_indexed {
            Self::FULLY_INDEXED
        } else {
            Self::EMPTY
        }
    }

    /// Check whether the `fully-indexed` characteristic is set.
    #[inline]
    pub const fn is_fully_indexed(&self) -> bool {
        self.intersects(Self::FULLY_INDEXED)
    }
}

impl Default for Characteristics {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Low-level CARv2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Describes certain features of the enclosed data.
    pub characteristics: Characteristics,
    /// Byte-offset from the beginning of the CARv2 pragma to the first byte of the CARv1 data payload.
    pub data_offset: u64,
    /// Byte-length of the CARv1 data payload.
    pub data_size: u64,
    /// Byte-offset from the beginning of the CARv2 pragma to the first byte of the index payload.
    /// This value may be 0 to indicate the absence of index data.
    pub index_offset: u64,
}

impl Header {
    /// The [`Header`] size in bytes (includes the pragma).
    ///
    /// As defined in the [specification](https://ipld.io/specs/transport/car/carv2/#header).
    pub const SIZE: usize = PRAGMA.len() + 40;

    /// Construct a new [`Header`].
    pub fn new(fully_indexed: bool, data_offset: u64, data_size: u64, index_offset: u64) -> Self {
        Self {
            characteristics: Characteristics::new(fully_indexed),
            data_offset,
            data_size,
            index_offset,
        }
    }

    /// Check the header fields against the envelope invariants:
    /// the payload must start after the envelope, must not be empty,
    /// and the index (when present) must start after the payload ends.
    pub fn validate(&self) -> Result<(), Error> {
        if self.data_offset < Self::SIZE as u64 {
            return Err(Error::InvalidHeaderError(format!(
                "data offset {} overlaps the envelope",
                self.data_offset
            )));
        }
        if self.data_size == 0 {
            return Err(Error::InvalidHeaderError(
                "data payload is empty".to_string(),
            ));
        }
        let data_end = self
            .data_offset
            .checked_add(self.data_size)
            .ok_or_else(|| {
                Error::InvalidHeaderError("data offset and size overflow".to_string())
            })?;
        if self.index_offset != 0 && self.index_offset < data_end {
            return Err(Error::InvalidHeaderError(format!(
                "index offset {} overlaps the data payload ending at {}",
                self.index_offset, data_end
            )));
        }
        Ok(())
    }

    /// The first byte past the CARv1 data payload.
    pub fn data_end(&self) -> u64 {
        self.data_offset + self.data_size
    }
}

impl Default for Header {
    /// Creates a "placeholder" [`Header`].
    ///
    /// This is what a file under construction carries until finalize
    /// learns the data size and index offset; a header that still looks
    /// like this marks the file as unfinalized.
    fn default() -> Self {
        Self {
            characteristics: Characteristics::empty(),
            data_offset: 0,
            data_size: 0,
            index_offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{Header, PRAGMA};
    use crate::{
        v2::{Reader, Writer},
        Error,
    };

    #[tokio::test]
    async fn header_roundtrip() {
        let written = Header::new(false, 51, 7661, 7712);

        let mut writer = Writer::new(Vec::new());
        let bytes = writer.write_header(&written).await.unwrap();
        assert_eq!(bytes, Header::SIZE);

        let buffer = writer.finish().await.unwrap();
        assert_eq!(&buffer[..11], &PRAGMA);

        let mut reader = Reader::new(Cursor::new(buffer));
        reader.read_pragma().await.unwrap();
        let read = reader.read_header().await.unwrap();
        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn fully_indexed_bit_roundtrip() {
        let written = Header::new(true, 51, 100, 151);

        let mut writer = Writer::new(Vec::new());
        writer.write_header(&written).await.unwrap();
        let buffer = writer.finish().await.unwrap();

        let mut reader = Reader::new(Cursor::new(buffer));
        reader.read_pragma().await.unwrap();
        let read = reader.read_header().await.unwrap();
        assert!(read.characteristics.is_fully_indexed());
    }

    #[test]
    fn validation() {
        assert!(Header::new(false, 51, 1, 0).validate().is_ok());
        assert!(Header::new(false, 51, 1, 52).validate().is_ok());
        // Payload overlapping the envelope.
        assert!(matches!(
            Header::new(false, 50, 1, 0).validate(),
            Err(Error::InvalidHeaderError(_))
        ));
        // Empty payload (the placeholder shape).
        assert!(matches!(
            Header::default().validate(),
            Err(Error::InvalidHeaderError(_))
        ));
        // Index inside the payload.
        assert!(matches!(
            Header::new(false, 51, 100, 150).validate(),
            Err(Error::InvalidHeaderError(_))
        ));
    }
}
