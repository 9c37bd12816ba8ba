use missionlink::fragment::{checksum, fragment_payload};
use missionlink::protocol::*;
use missionlink::reassembly::*;

fn mission_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn four_fragments() -> (Vec<u8>, Vec<MissionFragment>) {
    let bytes = mission_bytes(4 * FRAGMENT_PAYLOAD_SIZE);
    let fragments = fragment_payload(11, &bytes, FRAGMENT_PAYLOAD_SIZE).unwrap();
    assert_eq!(fragments.len(), 4);
    (bytes, fragments)
}

fn submit_in_order(fragments: &[MissionFragment], order: &[usize]) -> FragmentReassemblyBuffer {
    let mut buffer = FragmentReassemblyBuffer::new();
    for &index in order {
        buffer.submit_fragment(&fragments[index], 0).unwrap();
    }
    buffer
}

#[test]
fn test_out_of_order_matches_in_order() {
    let (bytes, fragments) = four_fragments();

    let mut shuffled = FragmentReassemblyBuffer::new();
    for (step, &index) in [2usize, 0, 3, 1].iter().enumerate() {
        assert!(!shuffled.is_complete());
        shuffled.submit_fragment(&fragments[index], step as u64).unwrap();
    }
    assert!(shuffled.is_complete());

    let mut ordered = submit_in_order(&fragments, &[0, 1, 2, 3]);
    let from_shuffled = shuffled.reassemble_payload().unwrap();
    let from_ordered = ordered.reassemble_payload().unwrap();

    assert_eq!(from_shuffled, from_ordered);
    assert_eq!(from_shuffled, bytes);
}

#[test]
fn test_duplicates_never_double_count() {
    let (bytes, fragments) = four_fragments();
    let mut buffer = FragmentReassemblyBuffer::new();

    assert_eq!(buffer.submit_fragment(&fragments[1], 0).unwrap(), SubmitOutcome::Accepted);
    assert_eq!(buffer.submit_fragment(&fragments[1], 1).unwrap(), SubmitOutcome::Duplicate);
    assert_eq!(buffer.received_count(), 1);

    for fragment in fragments.iter().chain(fragments.iter()) {
        buffer.submit_fragment(fragment, 2).unwrap();
    }
    assert_eq!(buffer.received_count(), 4);
    assert_eq!(buffer.reassemble_payload().unwrap(), bytes);
}

fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut all = Vec::new();
    for (i, &head) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head);
            all.push(tail);
        }
    }
    all
}

#[test]
fn test_every_order_with_a_duplicate_reassembles_identically() {
    let (bytes, fragments) = four_fragments();
    let orders = permutations(&[0, 1, 2, 3]);
    assert_eq!(orders.len(), 24);

    for order in &orders {
        for repeat_at in 0..order.len() {
            let mut submissions = order.clone();
            submissions.insert(repeat_at + 1, order[repeat_at]);

            let mut buffer = FragmentReassemblyBuffer::new();
            let mut duplicates = 0;
            for (step, &index) in submissions.iter().enumerate() {
                if buffer.submit_fragment(&fragments[index], step as u64).unwrap() == SubmitOutcome::Duplicate {
                    duplicates += 1;
                }
            }
            assert_eq!(duplicates, 1, "order {submissions:?}");
            assert_eq!(buffer.received_count(), 4);
            assert_eq!(buffer.reassemble_payload().unwrap(), bytes, "order {submissions:?}");
        }
    }
}

#[test]
fn test_corrupted_fragment_never_stored() {
    let (_, fragments) = four_fragments();
    let mut buffer = submit_in_order(&fragments, &[0, 1, 3]);

    let mut corrupted = fragments[2].clone();
    corrupted.payload[17] ^= 0xFF;
    let result = buffer.submit_fragment(&corrupted, 5);
    assert!(matches!(
        result,
        Err(ReassemblyError::Protocol(ProtocolError::ChecksumMismatch { sequence: 2, .. }))
    ));
    assert!(!buffer.is_complete());
    assert!(!buffer.has_received(2));
    assert_eq!(buffer.received_count(), 3);

    buffer.submit_fragment(&fragments[2], 6).unwrap();
    assert!(buffer.is_complete());
}

#[test]
fn test_incomplete_ack_lists_missing_ascending() {
    let bytes = mission_bytes(10 * 100);
    let fragments = fragment_payload(12, &bytes, 100).unwrap();
    let buffer = submit_in_order(&fragments, &[9, 0, 4, 5, 2]);

    let ack = buffer.build_acknowledgment().unwrap();
    assert_eq!(ack.status, AckStatus::Incomplete);
    assert_eq!(ack.mission_id, 12);
    assert_eq!(ack.total_fragments, 10);
    assert_eq!(ack.missing.as_slice(), &[1, 3, 6, 7, 8]);
    assert_eq!(ack.missing_total, 5);
    assert!(!ack.is_truncated());
}

#[test]
fn test_complete_ack_reports_total() {
    let (_, fragments) = four_fragments();
    let buffer = submit_in_order(&fragments, &[3, 2, 1, 0]);

    let ack = buffer.build_acknowledgment().unwrap();
    assert!(ack.is_complete());
    assert_eq!(ack.total_fragments, 4);
    assert!(ack.missing.is_empty());
}

#[test]
fn test_fragments_zero_and_two_of_three() {
    let bytes = mission_bytes(3 * FRAGMENT_PAYLOAD_SIZE - 10);
    let fragments = fragment_payload(13, &bytes, FRAGMENT_PAYLOAD_SIZE).unwrap();
    assert_eq!(fragments.len(), 3);

    let buffer = submit_in_order(&fragments, &[0, 2]);
    let ack = buffer.build_acknowledgment().unwrap();
    assert_eq!(ack.status, AckStatus::Incomplete);
    assert_eq!(ack.missing.as_slice(), &[1]);
}

#[test]
fn test_mission_survives_fragmentation() {
    let mission = Mission::new(21, Area { x1: -5.0, y1: 3.0, x2: 5.0, y2: 9.0 }, "rock-analysis", 45)
        .unwrap()
        .with_priority(1)
        .with_update_interval(3);
    let fragments = missionlink::fragment::fragment_mission(&mission, 32).unwrap();
    assert!(fragments.len() > 2);
    assert!(fragments.iter().all(|f| f.checksum == checksum(&f.payload)));

    let mut buffer = FragmentReassemblyBuffer::new();
    for fragment in fragments.iter().rev() {
        buffer.submit_fragment(fragment, 0).unwrap();
    }
    assert_eq!(buffer.reassemble().unwrap(), mission);
}

#[test]
fn test_undecodable_payload_reported() {
    let fragments = fragment_payload(30, b"not a mission", FRAGMENT_PAYLOAD_SIZE).unwrap();
    let mut buffer = FragmentReassemblyBuffer::new();
    buffer.submit_fragment(&fragments[0], 0).unwrap();

    assert_eq!(
        buffer.reassemble(),
        Err(ReassemblyError::Protocol(ProtocolError::InvalidJson))
    );
    assert_eq!(buffer.mission_id(), None);
}
