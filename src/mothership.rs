//! Mothership side of the link: mission dispatch with ack-driven resend,
//! the table of known rovers (telemetry and mission reports) and the
//! telemetry stream reader.

use crate::fragment::fragment_mission;
use crate::metrics::LinkMetrics;
use crate::protocol::{
    Acknowledgment, Datagram, Mission, MissionFragment, MissionOutcome, MissionReport, OperationalStatus,
    ProtocolError, TelemetryPayload, TelemetryRecord,
};
use crate::transport::TransportError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchAction {
    /// Rover holds the whole mission.
    Delivered,
    Resend(alloc::vec::Vec<Datagram>),
    /// Retry budget spent.
    GiveUp,
    /// Ack was for some other mission.
    Ignored,
}

/// One mission in flight to one rover.
#[derive(Debug, Clone)]
pub struct MissionDispatch {
    mothership_id: u32,
    rover_id: u32,
    mission_id: u32,
    fragments: alloc::vec::Vec<MissionFragment>,
    retries: u8,
    max_retries: u8,
    delivered: bool,
    metrics: Arc<LinkMetrics>,
}

impl MissionDispatch {
    pub fn new(
        mothership_id: u32,
        rover_id: u32,
        mission: &Mission,
        chunk_size: usize,
        max_retries: u8,
    ) -> Result<Self, ProtocolError> {
        let fragments = fragment_mission(mission, chunk_size)?;
        debug!("Mission {} split into {} fragments", mission.id, fragments.len());
        Ok(Self {
            mothership_id,
            rover_id,
            mission_id: mission.id,
            fragments,
            retries: 0,
            max_retries,
            delivered: false,
            metrics: Arc::new(LinkMetrics::new()),
        })
    }

    /// Count this dispatch's traffic into shared endpoint counters.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<LinkMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn initial_datagrams(&self) -> alloc::vec::Vec<Datagram> {
        let datagrams = self.datagrams();
        self.metrics.record_sent(datagrams.len() as u64);
        datagrams
    }

    fn datagrams(&self) -> alloc::vec::Vec<Datagram> {
        self.fragments.iter().map(|f| self.wrap(f)).collect()
    }

    pub fn on_ack(&mut self, ack: &Acknowledgment) -> DispatchAction {
        if ack.mission_id != self.mission_id {
            return DispatchAction::Ignored;
        }
        self.metrics.record_received();
        self.metrics.record_lost(u64::from(ack.missing_total));
        if self.delivered || ack.is_complete() {
            if !self.delivered {
                info!("✅ Mission {} delivered to rover {}", self.mission_id, self.rover_id);
            }
            self.delivered = true;
            return DispatchAction::Delivered;
        }
        if !self.spend_retry() {
            return DispatchAction::GiveUp;
        }

        if ack.is_truncated() {
            warn!(
                "⚠️  Rover {} reports {} missing fragments, ack lists {}",
                self.rover_id,
                ack.missing_total,
                ack.missing.len()
            );
        }
        let datagrams: alloc::vec::Vec<Datagram> = ack
            .missing
            .iter()
            .filter_map(|&index| self.fragments.get(usize::from(index)))
            .map(|f| self.wrap(f))
            .collect();
        info!(
            "🔁 Resending {} fragments of mission {} (attempt {}/{})",
            datagrams.len(),
            self.mission_id,
            self.retries,
            self.max_retries
        );
        self.metrics.record_retransmitted(datagrams.len() as u64);
        DispatchAction::Resend(datagrams)
    }

    /// No ack arrived in time: resend everything.
    pub fn on_timeout(&mut self) -> DispatchAction {
        if self.delivered {
            return DispatchAction::Delivered;
        }
        if !self.spend_retry() {
            return DispatchAction::GiveUp;
        }
        let datagrams = self.datagrams();
        self.metrics.record_retransmitted(datagrams.len() as u64);
        DispatchAction::Resend(datagrams)
    }

    fn spend_retry(&mut self) -> bool {
        if self.retries >= self.max_retries {
            warn!("❌ Giving up on mission {} for rover {}", self.mission_id, self.rover_id);
            return false;
        }
        self.retries += 1;
        true
    }

    fn wrap(&self, fragment: &MissionFragment) -> Datagram {
        Datagram::fragment(self.mothership_id, self.rover_id, fragment.clone())
    }

    pub fn mission_id(&self) -> u32 {
        self.mission_id
    }

    pub fn rover_id(&self) -> u32 {
        self.rover_id
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn metrics(&self) -> &LinkMetrics {
        &self.metrics
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoverRecord {
    pub rover_id: u32,
    pub addr: Option<SocketAddr>,
    pub last_seen_ms: u64,
    pub last_telemetry: Option<TelemetryPayload>,
    pub mission_id: Option<u32>,
    pub telemetry_count: u64,
    /// Progress from the latest mission report, percent.
    pub progress: Option<f32>,
    pub last_report_sequence: Option<u32>,
    pub last_outcome: Option<MissionOutcome>,
    pub missions_completed: u32,
    pub missions_failed: u32,
}

impl RoverRecord {
    fn new(rover_id: u32, now: u64) -> Self {
        Self {
            rover_id,
            addr: None,
            last_seen_ms: now,
            last_telemetry: None,
            mission_id: None,
            telemetry_count: 0,
            progress: None,
            last_report_sequence: None,
            last_outcome: None,
            missions_completed: 0,
            missions_failed: 0,
        }
    }

    /// Reachable and not reporting a mission.
    pub fn is_idle(&self) -> bool {
        if self.addr.is_none() {
            return false;
        }
        match self.last_telemetry {
            Some(telemetry) => telemetry.status == OperationalStatus::Active,
            None => true,
        }
    }
}

/// What [`ConnectionTable::record_report`] made of a mission report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    /// New report; `lost` counts sequence numbers skipped since the last one.
    Recorded { lost: u32 },
    /// Already seen, only the receipt needs repeating.
    Duplicate,
}

/// Rovers known to the mothership, shared by the UDP and TCP tasks.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<Mutex<HashMap<u32, RoverRecord>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a rover is heard from.
    pub async fn register_hello(&self, rover_id: u32, addr: SocketAddr, now: u64) -> bool {
        let mut table = self.inner.lock().await;
        let is_new = !table.contains_key(&rover_id);
        let record = table.entry(rover_id).or_insert_with(|| RoverRecord::new(rover_id, now));
        record.addr = Some(addr);
        record.last_seen_ms = now;
        if is_new {
            info!("🤝 Rover {} registered from {}", rover_id, addr);
        }
        is_new
    }

    pub async fn record_telemetry(&self, record: &TelemetryRecord, now: u64) {
        let mut table = self.inner.lock().await;
        let rover_id = record.envelope.sender_id;
        let entry = table.entry(rover_id).or_insert_with(|| RoverRecord::new(rover_id, now));
        entry.last_seen_ms = now;
        entry.last_telemetry = Some(record.payload);
        entry.mission_id = (record.envelope.mission_id != 0).then_some(record.envelope.mission_id);
        entry.telemetry_count += 1;
    }

    pub async fn record_report(&self, rover_id: u32, report: &MissionReport, now: u64) -> ReportDisposition {
        let mut table = self.inner.lock().await;
        let entry = table.entry(rover_id).or_insert_with(|| RoverRecord::new(rover_id, now));
        entry.last_seen_ms = now;

        let lost = match entry.last_report_sequence {
            Some(last) if report.sequence <= last => {
                debug!("Duplicate report {} from rover {}", report.sequence, rover_id);
                return ReportDisposition::Duplicate;
            }
            Some(last) => report.sequence - last - 1,
            None => 0,
        };
        if lost > 0 {
            warn!("⚠️  {} reports from rover {} never arrived", lost, rover_id);
        }

        entry.last_report_sequence = Some(report.sequence);
        entry.mission_id = Some(report.mission_id);
        entry.progress = Some(report.progress);
        match report.outcome {
            Some(MissionOutcome::Succeeded) => {
                info!("🏁 Rover {} completed mission {}", rover_id, report.mission_id);
                entry.missions_completed += 1;
                entry.last_outcome = report.outcome;
            }
            Some(MissionOutcome::Failed(code)) => {
                warn!("❌ Rover {} failed mission {}: {:?}", rover_id, report.mission_id, code);
                entry.missions_failed += 1;
                entry.last_outcome = report.outcome;
            }
            None => {}
        }
        ReportDisposition::Recorded { lost }
    }

    pub async fn get(&self, rover_id: u32) -> Option<RoverRecord> {
        self.inner.lock().await.get(&rover_id).cloned()
    }

    pub async fn idle_rovers(&self) -> alloc::vec::Vec<(u32, SocketAddr)> {
        let table = self.inner.lock().await;
        let mut idle: alloc::vec::Vec<(u32, SocketAddr)> = table
            .values()
            .filter(|r| r.is_idle())
            .filter_map(|r| r.addr.map(|addr| (r.rover_id, addr)))
            .collect();
        idle.sort_by_key(|(id, _)| *id);
        idle
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Read newline-delimited telemetry until EOF. Malformed lines are logged
/// and skipped. Returns the number of records accepted.
pub async fn handle_telemetry_stream<R, F>(
    reader: R,
    table: &ConnectionTable,
    mut on_record: F,
) -> Result<u64, TransportError>
where
    R: AsyncRead + Unpin,
    F: FnMut(&TelemetryRecord),
{
    let mut lines = BufReader::new(reader).lines();
    let mut accepted = 0;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match TelemetryRecord::decode_line(&line) {
            Ok(record) => {
                table.record_telemetry(&record, crate::protocol::unix_millis()).await;
                on_record(&record);
                accepted += 1;
            }
            Err(e) => warn!("⚠️  Dropping telemetry line: {}", e),
        }
    }
    Ok(accepted)
}
