//! Multicodec utilities, such as the list of codes,
//! as per the [code table](https://github.com/multiformats/multicodec/blob/c954a787dc6a17d099653e5f90d26fbd177d2074/table.csv).

use digest::Digest;
use ipld_core::cid::{multihash::Multihash, Cid};

use crate::Error;

pub const IDENTITY_CODE: u64 = 0x00;
pub const SHA_256_CODE: u64 = 0x12;
pub const SHA_512_CODE: u64 = 0x13;
pub const RAW_CODE: u64 = 0x55;
pub const DAG_PB_CODE: u64 = 0x70;

/// Trait to ease implementing generic multihash generation.
pub(crate) trait MultihashCode {
    /// Multihash code as defined in the [specification](https://github.com/multiformats/multicodec/blob/c954a787dc6a17d099653e5f90d26fbd177d2074/table.csv).
    const CODE: u64;
}

impl MultihashCode for sha2::Sha256 {
    const CODE: u64 = SHA_256_CODE;
}

impl MultihashCode for sha2::Sha512 {
    const CODE: u64 = SHA_512_CODE;
}

/// Generate a multihash for a byte slice.
pub(crate) fn generate_multihash<H, B>(bytes: B) -> Multihash<64>
where
    H: Digest + MultihashCode,
    B: AsRef<[u8]>,
{
    let mut hasher = H::new();
    hasher.update(bytes.as_ref());
    let hashed_bytes = hasher.finalize();
    Multihash::wrap(H::CODE, &hashed_bytes)
        .expect("the digest should be valid (enforced by the type system)")
}

/// Hash `bytes` with the function identified by `code`.
///
/// The supported codes are the ones CAR files carry in practice:
/// SHA2-256, SHA2-512 and IDENTITY (whose "digest" is the payload itself).
pub(crate) fn digest_for_code(code: u64, bytes: &[u8]) -> Result<Vec<u8>, Error> {
    match code {
        SHA_256_CODE => Ok(sha2::Sha256::digest(bytes).to_vec()),
        SHA_512_CODE => Ok(sha2::Sha512::digest(bytes).to_vec()),
        IDENTITY_CODE => Ok(bytes.to_vec()),
        other => Err(Error::UnsupportedHashError(other)),
    }
}

/// Recompute the block's multihash and compare it against the one in its [`Cid`].
pub(crate) fn verify_block_integrity(cid: &Cid, bytes: &[u8]) -> Result<(), Error> {
    let expected = cid.hash().digest();
    let received = digest_for_code(cid.hash().code(), bytes)?;
    if expected != received {
        return Err(Error::ContentIntegrityError {
            expected: hex_digest(expected),
            received: hex_digest(&received),
        });
    }
    Ok(())
}

fn hex_digest(digest: &[u8]) -> String {
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use ipld_core::cid::Cid;
    use sha2::Sha256;

    use super::{generate_multihash, verify_block_integrity, IDENTITY_CODE, RAW_CODE};
    use crate::Error;

    #[test]
    fn verify_matching_block() {
        let data = b"aaaa";
        let cid = Cid::new_v1(RAW_CODE, generate_multihash::<Sha256, _>(data));
        assert!(verify_block_integrity(&cid, data).is_ok());
    }

    #[test]
    fn verify_corrupted_block() {
        let data = [0x00, 0x00, 0x00, 0x00, 0x00];
        let corrupted = [0x00, 0x00, 0xFF, 0x00, 0x00];
        let cid = Cid::new_v1(RAW_CODE, generate_multihash::<Sha256, _>(data));

        let error = verify_block_integrity(&cid, &corrupted).unwrap_err();
        let Error::ContentIntegrityError { expected, received } = error else {
            panic!("expected a content integrity error");
        };
        assert_eq!(expected.len(), 64);
        assert_ne!(expected, received);
    }

    #[test]
    fn verify_identity_block() {
        let data = b"inline";
        let multihash =
            ipld_core::cid::multihash::Multihash::<64>::wrap(IDENTITY_CODE, data).unwrap();
        let cid = Cid::new_v1(RAW_CODE, multihash);
        assert!(verify_block_integrity(&cid, data).is_ok());
        assert!(verify_block_integrity(&cid, b"not the inline data").is_err());
    }

    #[test]
    fn unknown_hash_code() {
        let multihash = ipld_core::cid::multihash::Multihash::<64>::wrap(0x1e, &[0u8; 32]).unwrap();
        let cid = Cid::new_v1(RAW_CODE, multihash);
        assert!(matches!(
            verify_block_integrity(&cid, b"whatever"),
            Err(Error::UnsupportedHashError(0x1e))
        ));
    }
}
