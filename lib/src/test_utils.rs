//! Helpers shared by the unit tests: CID construction and in-memory CAR
//! file assembly. Everything is generated programmatically; no fixture
//! files are checked in.

use ipld_core::cid::Cid;
use sha2::Sha256;

use crate::{
    multicodec::{generate_multihash, RAW_CODE},
    v1, v2, IndexCodec,
};

/// A raw-codec CIDv1 addressing `data` by its SHA2-256 multihash.
pub(crate) fn cid_for(data: &[u8]) -> Cid {
    Cid::new_v1(RAW_CODE, generate_multihash::<Sha256, _>(data))
}

/// Pair every payload with its raw-codec CID.
pub(crate) fn blocks_for(datas: &[&[u8]]) -> Vec<(Cid, Vec<u8>)> {
    datas
        .iter()
        .map(|data| (cid_for(data), data.to_vec()))
        .collect()
}

/// Total frame length of a section carrying `cid` and `data`.
pub(crate) fn frame_length(cid: &Cid, data: &[u8]) -> u64 {
    let length = (cid.encoded_len() + data.len()) as u64;
    integer_encoding::VarInt::required_space(length) as u64 + length
}

/// Build a CARv1 byte buffer out of roots and blocks.
pub(crate) async fn write_car_v1(roots: &[Cid], blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
    let mut writer = v1::Writer::new(Vec::new());
    writer
        .write_header(&v1::Header::new(roots.to_vec()))
        .await
        .unwrap();
    for (cid, data) in blocks {
        writer.write_block(cid, data).await.unwrap();
    }
    writer.finish().await.unwrap()
}

/// Build a CARv2 byte buffer with the given paddings, indexing every block.
pub(crate) async fn write_car_v2(
    roots: &[Cid],
    blocks: &[(Cid, Vec<u8>)],
    data_padding: u64,
    index_padding: u64,
) -> Vec<u8> {
    let v1_header = v1::Header::new(roots.to_vec());
    let v1_header_length = v1_header.encoded_len().unwrap();
    let data_size = v1_header_length
        + blocks
            .iter()
            .map(|(cid, data)| frame_length(cid, data))
            .sum::<u64>();
    let data_offset = v2::Header::SIZE as u64 + data_padding;
    let index_offset = data_offset + data_size + index_padding;

    let mut writer = v2::Writer::new(Vec::new());
    writer
        .write_header(&v2::Header::new(false, data_offset, data_size, index_offset))
        .await
        .unwrap();
    writer.write_padding(data_padding as usize).await.unwrap();
    writer.write_v1_header(&v1_header).await.unwrap();

    let mut insertion = v2::InsertionIndex::new();
    let mut offset = v1_header_length;
    for (cid, data) in blocks {
        insertion.insert(cid, offset);
        offset += frame_length(cid, data);
        writer.write_block(cid, data).await.unwrap();
    }

    writer.write_padding(index_padding as usize).await.unwrap();
    let index = insertion.into_index(IndexCodec::MultihashSorted);
    writer.write_index(&index).await.unwrap();
    writer.finish().await.unwrap()
}
