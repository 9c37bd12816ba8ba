//! Mission progress and completion reports sent from rover to mothership.
//!
//! Progress reports are fire-and-forget at the mission's update interval.
//! A final report (success or failure) is held until the mothership returns
//! a final [`ReportAck`], retransmitting every `retry_interval_ms` up to
//! `max_attempts` sends.

use crate::protocol::{MissionReport, ReportAck};
use tracing::{debug, warn};

/// A report ready to go out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReportDue {
    Fresh(MissionReport),
    Retransmit(MissionReport),
}

impl ReportDue {
    pub fn report(&self) -> MissionReport {
        match self {
            ReportDue::Fresh(report) | ReportDue::Retransmit(report) => *report,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingFinal {
    report: MissionReport,
    last_sent_ms: Option<u64>,
    attempts: u8,
}

#[derive(Debug, Clone)]
pub struct MissionReporter {
    next_sequence: u32,
    last_progress_ms: Option<u64>,
    pending_final: Option<PendingFinal>,
    retry_interval_ms: u64,
    max_attempts: u8,
    abandoned: u64,
}

impl MissionReporter {
    pub fn new(retry_interval_ms: u64, max_attempts: u8) -> Self {
        Self {
            next_sequence: 0,
            last_progress_ms: None,
            pending_final: None,
            retry_interval_ms,
            max_attempts,
            abandoned: 0,
        }
    }

    fn stamp(&mut self, mut report: MissionReport) -> MissionReport {
        report.sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        report
    }

    /// Queue a final report, replacing any final report still unacknowledged.
    pub fn finish(&mut self, report: MissionReport) {
        debug_assert!(report.is_final());
        let report = self.stamp(report);
        if let Some(previous) = self.pending_final.take() {
            warn!(
                "Final report for mission {} superseded before acknowledgment",
                previous.report.mission_id
            );
            self.abandoned += 1;
        }
        self.pending_final = Some(PendingFinal {
            report,
            last_sent_ms: None,
            attempts: 0,
        });
        self.last_progress_ms = None;
    }

    /// The pending final report when its first send or a retransmission is due.
    pub fn final_due(&mut self, current_time: u64) -> Option<ReportDue> {
        let pending = self.pending_final.as_mut()?;
        match pending.last_sent_ms {
            None => {
                pending.last_sent_ms = Some(current_time);
                pending.attempts = 1;
                Some(ReportDue::Fresh(pending.report))
            }
            Some(last) if current_time.saturating_sub(last) >= self.retry_interval_ms => {
                if pending.attempts >= self.max_attempts {
                    warn!(
                        "❌ Final report for mission {} never acknowledged after {} sends",
                        pending.report.mission_id, pending.attempts
                    );
                    self.pending_final = None;
                    self.abandoned += 1;
                    return None;
                }
                pending.last_sent_ms = Some(current_time);
                pending.attempts += 1;
                Some(ReportDue::Retransmit(pending.report))
            }
            Some(_) => None,
        }
    }

    /// Stamp `report` if the progress interval has elapsed since the last one.
    pub fn progress_due(&mut self, current_time: u64, interval_ms: u64, report: MissionReport) -> Option<ReportDue> {
        let due = match self.last_progress_ms {
            None => true,
            Some(last) => current_time.saturating_sub(last) >= interval_ms,
        };
        if !due {
            return None;
        }
        self.last_progress_ms = Some(current_time);
        Some(ReportDue::Fresh(self.stamp(report)))
    }

    /// Returns true when `ack` releases the pending final report.
    pub fn acknowledge(&mut self, ack: &ReportAck) -> bool {
        let Some(pending) = self.pending_final else {
            return false;
        };
        if !ack.final_ack || ack.mission_id != pending.report.mission_id || ack.sequence != pending.report.sequence {
            return false;
        }
        debug!("Final report {} for mission {} acknowledged", ack.sequence, ack.mission_id);
        self.pending_final = None;
        true
    }

    pub fn pending_final(&self) -> Option<MissionReport> {
        self.pending_final.map(|pending| pending.report)
    }

    /// Final reports dropped without an acknowledgment.
    pub fn abandoned(&self) -> u64 {
        self.abandoned
    }
}
