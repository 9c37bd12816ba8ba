//! Mission fragmentation and the per-fragment checksum.
//!
//! A mission is serialized once and cut into chunks of at most
//! [`FRAGMENT_PAYLOAD_SIZE`] bytes; every chunk carries the CRC32 (IEEE) of
//! its own payload so the rover can drop corrupted fragments individually.

use crate::protocol::{Mission, MissionFragment, ProtocolError, FRAGMENT_PAYLOAD_SIZE, MAX_FRAGMENTS};

/// CRC32 (IEEE 802.3) of one fragment payload.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Split raw bytes into checksummed fragments for `mission_id`.
pub fn fragment_payload(
    mission_id: u32,
    bytes: &[u8],
    chunk_size: usize,
) -> Result<alloc::vec::Vec<MissionFragment>, ProtocolError> {
    let chunk_size = chunk_size.clamp(1, FRAGMENT_PAYLOAD_SIZE);
    if bytes.is_empty() {
        return Err(ProtocolError::InvalidMission("empty mission payload"));
    }

    let total = bytes.len().div_ceil(chunk_size);
    if total > MAX_FRAGMENTS {
        return Err(ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: MAX_FRAGMENTS * chunk_size,
        });
    }

    let fragments = bytes
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| MissionFragment {
            mission_id,
            sequence: index as u16,
            total_fragments: total as u16,
            checksum: checksum(chunk),
            payload: chunk.to_vec(),
        })
        .collect();

    Ok(fragments)
}

/// Serialize a mission and split it into fragments.
pub fn fragment_mission(mission: &Mission, chunk_size: usize) -> Result<alloc::vec::Vec<MissionFragment>, ProtocolError> {
    mission.validate()?;
    let bytes = mission.to_bytes()?;
    fragment_payload(mission.id, &bytes, chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_vector() {
        // Standard CRC32 check value
        assert_eq!(checksum(b"123456789"), 0xCBF4_3926);
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn test_checksum_detects_single_bit_flip() {
        let mut data = vec![0x5Au8; FRAGMENT_PAYLOAD_SIZE];
        let original = checksum(&data);
        data[FRAGMENT_PAYLOAD_SIZE / 2] ^= 0x04;
        assert_ne!(checksum(&data), original);
    }

    #[test]
    fn test_fragment_sizes() {
        let bytes = vec![7u8; FRAGMENT_PAYLOAD_SIZE * 2 + 100];
        let fragments = fragment_payload(9, &bytes, FRAGMENT_PAYLOAD_SIZE).unwrap();

        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f.total_fragments == 3 && f.mission_id == 9));
        assert_eq!(fragments[0].payload.len(), FRAGMENT_PAYLOAD_SIZE);
        assert_eq!(fragments[2].payload.len(), 100);
        assert_eq!(fragments[1].sequence, 1);
        assert_eq!(fragments[2].checksum, checksum(&fragments[2].payload));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let bytes = vec![0u8; FRAGMENT_PAYLOAD_SIZE * MAX_FRAGMENTS + 1];
        assert!(matches!(
            fragment_payload(1, &bytes, FRAGMENT_PAYLOAD_SIZE),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_chunk_size_capped_at_wire_limit() {
        let bytes = vec![1u8; FRAGMENT_PAYLOAD_SIZE + 1];
        let fragments = fragment_payload(1, &bytes, 4096).unwrap();
        assert_eq!(fragments.len(), 2);
    }
}
