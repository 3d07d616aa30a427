use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use common::error::AppError;

use crate::index::VectorIndex;

const BLOB_MAGIC: &[u8; 4] = b"VIDX";
const BLOB_VERSION: u16 = 1;
const SIDECAR_VERSION: u16 = 1;
const DIGEST_LEN: usize = 32;

/// Slot-to-chunk mapping persisted next to the vector blob. Carries the
/// blob digest so a reader can detect a torn pair and retry.
#[derive(Debug, Serialize, Deserialize)]
pub struct Sidecar {
    pub version: u16,
    pub dimension: usize,
    pub blob_digest: String,
    pub slots: Vec<Option<String>>,
}

/// Serializes the vector data: magic, version, dimension, slot count,
/// little-endian f32 payload, sha256 digest trailer.
pub fn encode_blob(index: &VectorIndex) -> (Bytes, String) {
    let data = index.raw_data();
    let mut buf = BytesMut::with_capacity(4 + 2 + 4 + 8 + data.len() * 4 + DIGEST_LEN);
    buf.put_slice(BLOB_MAGIC);
    buf.put_u16_le(BLOB_VERSION);
    buf.put_u32_le(index.dimension() as u32);
    buf.put_u64_le(index.slot_count() as u64);
    for value in data {
        buf.put_f32_le(*value);
    }

    let digest = Sha256::digest(&buf);
    let digest_hex = format!("{digest:x}");
    buf.put_slice(&digest);

    (buf.freeze(), digest_hex)
}

/// Decodes and checksums a blob. Any structural or digest mismatch is a
/// fatal `Unavailable`: the caller quarantines the tenant index rather than
/// silently rebuilding.
pub fn decode_blob(bytes: &[u8]) -> Result<(usize, Vec<f32>, String), AppError> {
    let corrupt = |detail: &str| AppError::Unavailable(format!("vector index blob {detail}"));

    if bytes.len() < 4 + 2 + 4 + 8 + DIGEST_LEN {
        return Err(corrupt("is truncated"));
    }
    let (payload, trailer) = bytes.split_at(bytes.len() - DIGEST_LEN);

    let digest = Sha256::digest(payload);
    if digest.as_slice() != trailer {
        return Err(corrupt("failed checksum"));
    }

    if &payload[0..4] != BLOB_MAGIC {
        return Err(corrupt("has wrong magic"));
    }
    let version = u16::from_le_bytes([payload[4], payload[5]]);
    if version != BLOB_VERSION {
        return Err(corrupt("has unsupported version"));
    }
    let dimension = u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]]) as usize;
    let count = u64::from_le_bytes(
        payload[10..18]
            .try_into()
            .map_err(|_| corrupt("is truncated"))?,
    ) as usize;

    let float_bytes = &payload[18..];
    if float_bytes.len() != count * dimension * 4 {
        return Err(corrupt("length does not match header"));
    }

    let mut data = Vec::with_capacity(count * dimension);
    for chunk in float_bytes.chunks_exact(4) {
        data.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }

    Ok((dimension, data, format!("{digest:x}")))
}

pub fn encode_sidecar(index: &VectorIndex, blob_digest: &str) -> Result<Bytes, AppError> {
    let sidecar = Sidecar {
        version: SIDECAR_VERSION,
        dimension: index.dimension(),
        blob_digest: blob_digest.to_owned(),
        slots: index.raw_slots().to_vec(),
    };
    Ok(Bytes::from(serde_json::to_vec(&sidecar)?))
}

pub fn decode_sidecar(bytes: &[u8]) -> Result<Sidecar, AppError> {
    let sidecar: Sidecar = serde_json::from_slice(bytes)
        .map_err(|e| AppError::Unavailable(format!("vector index sidecar unreadable: {e}")))?;
    if sidecar.version != SIDECAR_VERSION {
        return Err(AppError::Unavailable(
            "vector index sidecar has unsupported version".into(),
        ));
    }
    Ok(sidecar)
}

/// Reassembles an index from a verified blob/sidecar pair.
pub fn assemble(blob: &[u8], sidecar: &Sidecar) -> Result<VectorIndex, AppError> {
    let (dimension, data, digest) = decode_blob(blob)?;
    if digest != sidecar.blob_digest {
        return Err(AppError::Unavailable(
            "vector index sidecar does not match blob".into(),
        ));
    }
    if dimension != sidecar.dimension {
        return Err(AppError::Unavailable(
            "vector index sidecar dimension does not match blob".into(),
        ));
    }
    VectorIndex::from_parts(dimension, data, sidecar.slots.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new(2);
        index
            .upsert(
                &[vec![1.0, 0.0], vec![0.6, 0.8]],
                &["alpha".into(), "beta".into()],
            )
            .expect("upsert");
        index.remove(&[0]);
        index
    }

    #[test]
    fn blob_round_trip_preserves_vectors_and_tombstones() {
        let index = sample_index();
        let (blob, digest) = encode_blob(&index);
        let sidecar_bytes = encode_sidecar(&index, &digest).expect("encode sidecar");
        let sidecar = decode_sidecar(&sidecar_bytes).expect("decode sidecar");

        let restored = assemble(&blob, &sidecar).expect("assemble");
        assert_eq!(restored.dimension(), 2);
        assert_eq!(restored.slot_count(), 2);
        assert_eq!(restored.live_count(), 1);
        assert_eq!(restored.chunk_id_at(0), None, "tombstone survives the trip");
        assert_eq!(restored.chunk_id_at(1), Some("beta"));

        let hits = restored.search(&[0.6, 0.8], 2).expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "beta");
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let index = sample_index();
        let (blob, _) = encode_blob(&index);
        let mut corrupted = blob.to_vec();
        corrupted[20] ^= 0xff;

        let result = decode_blob(&corrupted);
        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let result = decode_blob(b"VIDX");
        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }

    #[test]
    fn mismatched_sidecar_digest_is_rejected() {
        let index = sample_index();
        let (blob, _) = encode_blob(&index);
        let sidecar_bytes = encode_sidecar(&index, "deadbeef").expect("encode");
        let sidecar = decode_sidecar(&sidecar_bytes).expect("decode");

        let result = assemble(&blob, &sidecar);
        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }
}
