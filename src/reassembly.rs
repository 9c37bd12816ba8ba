use crate::fragment::checksum;
use crate::protocol::{
    AckStatus, Acknowledgment, Mission, MissionFragment, MissingList, ProtocolError, MAX_FRAGMENTS,
    MAX_MISSING_FRAGMENTS,
};
use alloc::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("Fragment rejected: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Mission incomplete: {received} of {expected} fragments")]
    Incomplete { received: u16, expected: u16 },
    #[error("No mission in flight")]
    NoMission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Index was already held; nothing changed.
    Duplicate,
}

/// Collects the fragments of one in-flight mission.
///
/// Only one mission id is tracked at a time. A fragment for a different
/// mission id abandons whatever was buffered (stale missions are dropped,
/// never merged), which is logged so the retry traffic stays explainable.
#[derive(Debug, Default)]
pub struct FragmentReassemblyBuffer {
    mission_id: Option<u32>,
    expected_total: u16,
    received_mask: u64,
    received_count: u16,
    payloads: BTreeMap<u16, alloc::vec::Vec<u8>>,
    started_at: u64,
}

impl FragmentReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_fragment(&mut self, fragment: &MissionFragment, current_time: u64) -> Result<SubmitOutcome, ReassemblyError> {
        let sequence = fragment.sequence;
        let total = fragment.total_fragments;

        if usize::from(sequence) >= MAX_FRAGMENTS || usize::from(total) > MAX_FRAGMENTS || sequence >= total {
            return Err(ProtocolError::SequenceOutOfRange { sequence, total }.into());
        }

        let computed = checksum(&fragment.payload);
        if computed != fragment.checksum {
            return Err(ProtocolError::ChecksumMismatch {
                sequence,
                carried: fragment.checksum,
                computed,
            }
            .into());
        }

        if self.mission_id != Some(fragment.mission_id) {
            if let Some(stale) = self.mission_id {
                if !self.is_complete() {
                    warn!(
                        "Abandoning mission {} ({}/{} fragments) for mission {}",
                        stale, self.received_count, self.expected_total, fragment.mission_id
                    );
                }
            }
            self.reset();
            self.mission_id = Some(fragment.mission_id);
            self.expected_total = total;
            self.started_at = current_time;
        } else if total != self.expected_total {
            // Same mission must keep one declared total
            return Err(ProtocolError::SequenceOutOfRange { sequence, total: self.expected_total }.into());
        }

        let bit = 1u64 << sequence;
        if self.received_mask & bit != 0 {
            debug!("Duplicate fragment {} of mission {}", sequence, fragment.mission_id);
            return Ok(SubmitOutcome::Duplicate);
        }

        self.payloads.insert(sequence, fragment.payload.clone());
        self.received_mask |= bit;
        self.received_count += 1;

        debug_assert_eq!(
            u32::from(self.received_count),
            self.received_mask.count_ones(),
            "received counter out of step with bitmap"
        );

        Ok(SubmitOutcome::Accepted)
    }

    pub fn is_complete(&self) -> bool {
        self.mission_id.is_some() && self.received_count == self.expected_total
    }

    pub fn mission_id(&self) -> Option<u32> {
        self.mission_id
    }

    pub fn received_count(&self) -> u16 {
        self.received_count
    }

    pub fn expected_total(&self) -> u16 {
        self.expected_total
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    /// An incomplete mission whose first fragment is at least `timeout_ms` old.
    pub fn is_stale(&self, current_time: u64, timeout_ms: u64) -> bool {
        self.mission_id.is_some()
            && !self.is_complete()
            && current_time.saturating_sub(self.started_at) >= timeout_ms
    }

    /// Drop a stale mission. Returns its id and how many fragments never came.
    pub fn expire(&mut self, current_time: u64, timeout_ms: u64) -> Option<(u32, u16)> {
        if !self.is_stale(current_time, timeout_ms) {
            return None;
        }
        let mission_id = self.mission_id?;
        let missing = self.expected_total - self.received_count;
        warn!(
            "⌛ Mission {} expired after {} ms with {}/{} fragments",
            mission_id,
            current_time.saturating_sub(self.started_at),
            self.received_count,
            self.expected_total
        );
        self.reset();
        Some((mission_id, missing))
    }

    pub fn has_received(&self, sequence: u16) -> bool {
        usize::from(sequence) < MAX_FRAGMENTS && self.received_mask & (1u64 << sequence) != 0
    }

    /// Every expected index not yet received, ascending.
    pub fn missing_indices(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.expected_total).filter(move |&i| !self.has_received(i))
    }

    pub fn build_acknowledgment(&self) -> Result<Acknowledgment, ReassemblyError> {
        let mission_id = self.mission_id.ok_or(ReassemblyError::NoMission)?;
        if self.is_complete() {
            return Ok(Acknowledgment::complete(mission_id, self.expected_total));
        }

        let missing_total = self.expected_total - self.received_count;
        if usize::from(missing_total) > MAX_MISSING_FRAGMENTS {
            return Err(ProtocolError::MissingListOverflow {
                missing: usize::from(missing_total),
                max: MAX_MISSING_FRAGMENTS,
            }
            .into());
        }
        Ok(self.incomplete_ack(mission_id, missing_total))
    }

    /// Like [`build_acknowledgment`](Self::build_acknowledgment) but never
    /// overflows: the first [`MAX_MISSING_FRAGMENTS`] gaps are listed and
    /// `missing_total` carries the real count.
    pub fn build_partial_acknowledgment(&self) -> Result<Acknowledgment, ReassemblyError> {
        let mission_id = self.mission_id.ok_or(ReassemblyError::NoMission)?;
        if self.is_complete() {
            return Ok(Acknowledgment::complete(mission_id, self.expected_total));
        }
        Ok(self.incomplete_ack(mission_id, self.expected_total - self.received_count))
    }

    fn incomplete_ack(&self, mission_id: u32, missing_total: u16) -> Acknowledgment {
        let mut missing = MissingList::new();
        for index in self.missing_indices().take(MAX_MISSING_FRAGMENTS) {
            // Bounded by take()
            let _ = missing.push(index);
        }
        Acknowledgment {
            mission_id,
            status: AckStatus::Incomplete,
            total_fragments: self.expected_total,
            missing,
            missing_total,
        }
    }

    /// Concatenate payloads in sequence order and clear the buffer.
    pub fn reassemble_payload(&mut self) -> Result<alloc::vec::Vec<u8>, ReassemblyError> {
        if self.mission_id.is_none() {
            return Err(ReassemblyError::NoMission);
        }
        if !self.is_complete() {
            return Err(ReassemblyError::Incomplete {
                received: self.received_count,
                expected: self.expected_total,
            });
        }

        let payloads = core::mem::take(&mut self.payloads);
        self.reset();

        // BTreeMap iterates in ascending sequence order
        Ok(payloads.into_values().flatten().collect())
    }

    /// Reassemble and decode the mission. The buffer is consumed even when
    /// the bytes fail to decode.
    pub fn reassemble(&mut self) -> Result<Mission, ReassemblyError> {
        let bytes = self.reassemble_payload()?;
        Ok(Mission::from_bytes(&bytes)?)
    }

    pub fn reset(&mut self) {
        self.mission_id = None;
        self.expected_total = 0;
        self.received_mask = 0;
        self.received_count = 0;
        self.payloads.clear();
        self.started_at = 0;
    }
}
