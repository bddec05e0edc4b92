mod reader;
mod writer;

use integer_encoding::VarInt;
use ipld_core::{cid::Cid, codec::Codec};
use serde::{Deserialize, Serialize};
use serde_ipld_dagcbor::codec::DagCborCodec;

pub use crate::v1::{reader::Reader, writer::Writer};
pub(crate) use crate::v1::{
    reader::{decode_header, read_block_frame, read_header, read_header_frame, skip_block},
    writer::{write_block, write_header},
};
use crate::Error;

/// Low-level CARv1 header.
///
/// The field order matters: `roots` before `version` is the canonical
/// DAG-CBOR map order (shorter key first), which is what the serializer
/// emits and what every other implementation produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Root [`Cid`]s for the contained data.
    pub roots: Vec<Cid>,

    /// CAR file version.
    ///
    /// It is always 1, as defined in the
    /// [specification](https://ipld.io/specs/transport/car/carv1/#constraints).
    version: u8,
}

impl Header {
    /// Construct a new [`Header`].
    ///
    /// The version will always be 1, as defined in the
    /// [specification](https://ipld.io/specs/transport/car/carv1/#constraints).
    pub fn new(roots: Vec<Cid>) -> Self {
        Self { roots, version: 1 }
    }

    /// The header's version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The exact number of bytes [`Writer::write_header`] would produce for
    /// this header — length prefix included — without producing them.
    ///
    /// The read-write store uses this to reserve the header slot it will
    /// patch on finalize, and root replacement uses it to check that the
    /// replacement fits.
    pub fn encoded_len(&self) -> Result<u64, Error> {
        let encoded = DagCborCodec::encode_to_vec(self)?;
        let length = encoded.len() as u64;
        Ok(length.required_space() as u64 + length)
    }

    /// Whether two headers describe the same archive: equal versions and
    /// equal root multisets, ignoring order. Diagnostics only.
    pub fn matches(&self, other: &Header) -> bool {
        if self.version != other.version || self.roots.len() != other.roots.len() {
            return false;
        }
        let mut ours: Vec<_> = self.roots.iter().map(Cid::to_bytes).collect();
        let mut theirs: Vec<_> = other.roots.iter().map(Cid::to_bytes).collect();
        ours.sort();
        theirs.sort();
        ours == theirs
    }
}

/// Pragma-tolerant view of the first frame: roots may be absent and the
/// version is not constrained. Only version detection uses this.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct HeaderOrPragma {
    #[serde(default)]
    pub roots: Option<Vec<Cid>>,
    pub version: u8,
}

#[cfg(test)]
mod tests {
    use ipld_core::cid::Cid;
    use sha2::{Sha256, Sha512};

    use super::Header;
    use crate::multicodec::{generate_multihash, RAW_CODE};

    fn cid_for(data: &[u8]) -> Cid {
        Cid::new_v1(RAW_CODE, generate_multihash::<Sha256, _>(data))
    }

    #[test]
    fn encoded_len_single_root() {
        // A single CIDv1 with a SHA2-256 multihash yields the well-known
        // 58 byte header plus its single length byte.
        let header = Header::new(vec![cid_for(b"lorem")]);
        assert_eq!(header.encoded_len().unwrap(), 59);
    }

    #[test]
    fn encoded_len_grows_with_roots() {
        let one = Header::new(vec![cid_for(b"a")]);
        let two = Header::new(vec![cid_for(b"a"), cid_for(b"b")]);
        // Each additional 36 byte CID costs 37 bytes in the CBOR encoding.
        assert_eq!(two.encoded_len().unwrap(), one.encoded_len().unwrap() + 37);
    }

    #[test]
    fn matches_ignores_order() {
        let a = cid_for(b"a");
        let b = cid_for(b"b");
        assert!(Header::new(vec![a, b]).matches(&Header::new(vec![b, a])));
        assert!(!Header::new(vec![a, b]).matches(&Header::new(vec![a, a])));
        assert!(!Header::new(vec![a]).matches(&Header::new(vec![a, b])));
    }

    #[test]
    fn matches_compares_multisets() {
        let a = cid_for(b"a");
        let wide = Cid::new_v1(RAW_CODE, generate_multihash::<Sha512, _>(b"a"));
        assert!(!Header::new(vec![a, a]).matches(&Header::new(vec![a, wide])));
    }
}
