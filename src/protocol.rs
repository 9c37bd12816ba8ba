use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;

/// Payload bytes carried by one mission fragment (the last one may be shorter).
pub const FRAGMENT_PAYLOAD_SIZE: usize = 512;
/// Highest number of fragments a single mission may be split into.
pub const MAX_FRAGMENTS: usize = 64;
/// Longest missing-fragment list an acknowledgment can carry.
pub const MAX_MISSING_FRAGMENTS: usize = 32;
pub const MAX_DATAGRAM_SIZE: usize = 4096;
pub const MAX_TELEMETRY_RECORD_SIZE: usize = 512;
pub const MAX_TASK_LEN: usize = 64;
pub const MAX_PRIORITY: u8 = 5;

pub const DEFAULT_MISSION_DURATION_S: u64 = 60;
pub const DEFAULT_UPDATE_INTERVAL_S: u64 = 2;

// The received bitmap is a u64
const_assert!(MAX_FRAGMENTS <= 64);
const_assert!(MAX_MISSING_FRAGMENTS <= MAX_FRAGMENTS);
// JSON renders each payload byte as at most "255,"
const_assert!(FRAGMENT_PAYLOAD_SIZE * 4 + 512 <= MAX_DATAGRAM_SIZE);

pub type TaskLabel = ArrayString<MAX_TASK_LEN>;
pub type MissingList = Vec<u16, MAX_MISSING_FRAGMENTS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Hello,     // rover -> mothership keepalive
    Response,  // mothership -> rover, answer to Hello
    Mission,   // mothership -> rover, one fragment per datagram
    Ack,       // fragment completeness (rover) or report receipt (mothership)
    Progress,  // rover -> mothership, periodic mission progress
    Completed, // rover -> mothership, mission finished or abandoned
    Telemetry, // rover -> mothership over the stream connection
}

/// Common header carried by every datagram and telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MessageKind,
    pub sender_id: u32,
    pub receiver_id: u32,
    pub mission_id: u32,
    pub timestamp: u64,
}

impl Envelope {
    pub fn new(kind: MessageKind, sender_id: u32, receiver_id: u32, mission_id: u32) -> Self {
        Self {
            kind,
            sender_id,
            receiver_id,
            mission_id,
            timestamp: unix_millis(),
        }
    }
}

/// Rectangular target area, corners in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Area {
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// A mission as assigned by the mothership.
///
/// Priority runs from 0 (most urgent) to [`MAX_PRIORITY`] (least urgent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub id: u32,
    pub area: Area,
    pub task: TaskLabel,
    pub duration_s: u64,
    /// Minimum telemetry interval requested while the mission runs.
    pub update_interval_s: u64,
    pub start_time: u64,
    pub priority: u8,
}

impl Mission {
    pub fn new(id: u32, area: Area, task: &str, duration_s: u64) -> Result<Self, ProtocolError> {
        let task = TaskLabel::from(task).map_err(|_| ProtocolError::InvalidMission("task label too long"))?;
        Ok(Self {
            id,
            area,
            task,
            duration_s,
            update_interval_s: DEFAULT_UPDATE_INTERVAL_S,
            start_time: 0,
            priority: 0,
        }
        .normalized())
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_update_interval(mut self, update_interval_s: u64) -> Self {
        self.update_interval_s = update_interval_s;
        self.normalized()
    }

    /// Zero durations are replaced by the protocol defaults.
    pub fn normalized(mut self) -> Self {
        if self.duration_s == 0 {
            self.duration_s = DEFAULT_MISSION_DURATION_S;
        }
        if self.update_interval_s == 0 {
            self.update_interval_s = DEFAULT_UPDATE_INTERVAL_S;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.priority > MAX_PRIORITY {
            return Err(ProtocolError::InvalidMission("priority out of range"));
        }
        let coords = [self.area.x1, self.area.y1, self.area.x2, self.area.y2];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(ProtocolError::InvalidMission("area is not finite"));
        }
        Ok(())
    }

    /// Byte representation that gets split into fragments.
    pub fn to_bytes(&self) -> Result<alloc::vec::Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|_| ProtocolError::SerializationError)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mission: Mission = serde_json::from_slice(bytes).map_err(|_| ProtocolError::InvalidJson)?;
        let mission = mission.normalized();
        mission.validate()?;
        Ok(mission)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionFragment {
    pub mission_id: u32,
    pub sequence: u16,
    pub total_fragments: u16,
    pub checksum: u32,
    #[serde(with = "serde_bytes")]
    pub payload: alloc::vec::Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Complete,
    Incomplete,
}

/// Rover's report on how much of a mission it holds.
///
/// `missing` lists at most [`MAX_MISSING_FRAGMENTS`] indices in ascending
/// order; `missing_total` is the real count, so `missing_total > missing.len()`
/// marks a list cut short by the wire limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub mission_id: u32,
    pub status: AckStatus,
    pub total_fragments: u16,
    pub missing: MissingList,
    pub missing_total: u16,
}

impl Acknowledgment {
    pub fn complete(mission_id: u32, total_fragments: u16) -> Self {
        Self {
            mission_id,
            status: AckStatus::Complete,
            total_fragments,
            missing: Vec::new(),
            missing_total: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == AckStatus::Complete
    }

    pub fn is_truncated(&self) -> bool {
        usize::from(self.missing_total) > self.missing.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    BatteryDepleted,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionOutcome {
    Succeeded,
    Failed(FailureCode),
}

/// Rover's account of a running or finished mission.
///
/// `sequence` increases by one per fresh report from a rover, so the
/// mothership can spot lost and repeated reports. A report with an
/// `outcome` is final and is retransmitted until acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissionReport {
    pub mission_id: u32,
    pub sequence: u32,
    pub elapsed_s: u64,
    pub progress: f32,
    pub battery: f32,
    pub x: f32,
    pub y: f32,
    pub outcome: Option<MissionOutcome>,
}

impl MissionReport {
    pub fn is_final(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Mothership's receipt for one report. `final_ack` releases the rover
/// from retransmitting a final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAck {
    pub mission_id: u32,
    pub sequence: u32,
    pub final_ack: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatagramPayload {
    Empty,
    Fragment(MissionFragment),
    Ack(Acknowledgment),
    Report(MissionReport),
    ReportAck(ReportAck),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datagram {
    pub envelope: Envelope,
    pub payload: DatagramPayload,
}

impl Datagram {
    pub fn hello(rover_id: u32, mothership_id: u32) -> Self {
        Self {
            envelope: Envelope::new(MessageKind::Hello, rover_id, mothership_id, 0),
            payload: DatagramPayload::Empty,
        }
    }

    pub fn response(mothership_id: u32, rover_id: u32) -> Self {
        Self {
            envelope: Envelope::new(MessageKind::Response, mothership_id, rover_id, 0),
            payload: DatagramPayload::Empty,
        }
    }

    pub fn fragment(mothership_id: u32, rover_id: u32, fragment: MissionFragment) -> Self {
        Self {
            envelope: Envelope::new(MessageKind::Mission, mothership_id, rover_id, fragment.mission_id),
            payload: DatagramPayload::Fragment(fragment),
        }
    }

    pub fn ack(rover_id: u32, mothership_id: u32, ack: Acknowledgment) -> Self {
        Self {
            envelope: Envelope::new(MessageKind::Ack, rover_id, mothership_id, ack.mission_id),
            payload: DatagramPayload::Ack(ack),
        }
    }

    /// `Progress` or `Completed` depending on whether the report is final.
    pub fn report(rover_id: u32, mothership_id: u32, report: MissionReport) -> Self {
        let kind = if report.is_final() { MessageKind::Completed } else { MessageKind::Progress };
        Self {
            envelope: Envelope::new(kind, rover_id, mothership_id, report.mission_id),
            payload: DatagramPayload::Report(report),
        }
    }

    pub fn report_ack(mothership_id: u32, rover_id: u32, ack: ReportAck) -> Self {
        Self {
            envelope: Envelope::new(MessageKind::Ack, mothership_id, rover_id, ack.mission_id),
            payload: DatagramPayload::ReportAck(ack),
        }
    }

    pub fn encode(&self) -> Result<alloc::vec::Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self).map_err(|_| ProtocolError::SerializationError)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }
        let datagram: Datagram = serde_json::from_slice(bytes).map_err(|_| ProtocolError::InvalidJson)?;

        // Kind and payload must agree
        let consistent = matches!(
            (&datagram.envelope.kind, &datagram.payload),
            (MessageKind::Hello | MessageKind::Response, DatagramPayload::Empty)
                | (MessageKind::Mission, DatagramPayload::Fragment(_))
                | (MessageKind::Ack, DatagramPayload::Ack(_) | DatagramPayload::ReportAck(_))
        ) || match (&datagram.envelope.kind, &datagram.payload) {
            (MessageKind::Progress, DatagramPayload::Report(report)) => !report.is_final(),
            (MessageKind::Completed, DatagramPayload::Report(report)) => report.is_final(),
            _ => false,
        };
        if !consistent {
            return Err(ProtocolError::UnexpectedPayload(datagram.envelope.kind));
        }
        Ok(datagram)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalStatus {
    Initial,
    Active,
    InMission,
    Success,
    Failure,
}

impl OperationalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalStatus::Initial => "INITIAL",
            OperationalStatus::Active => "ACTIVE",
            OperationalStatus::InMission => "IN_MISSION",
            OperationalStatus::Success => "SUCCESS",
            OperationalStatus::Failure => "FAILURE",
        }
    }
}

impl core::fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub x: f32,
    pub y: f32,
    pub status: OperationalStatus,
    pub battery: f32,
    pub speed: f32,
}

/// One line on the telemetry stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub envelope: Envelope,
    pub payload: TelemetryPayload,
}

impl TelemetryRecord {
    pub fn new(rover_id: u32, mothership_id: u32, mission_id: Option<u32>, payload: TelemetryPayload) -> Self {
        Self {
            envelope: Envelope::new(MessageKind::Telemetry, rover_id, mothership_id, mission_id.unwrap_or(0)),
            payload,
        }
    }

    /// Newline-terminated JSON line, bounded by [`MAX_TELEMETRY_RECORD_SIZE`].
    pub fn encode_line(&self) -> Result<alloc::vec::Vec<u8>, ProtocolError> {
        let mut bytes = serde_json::to_vec(self).map_err(|_| ProtocolError::SerializationError)?;
        bytes.push(b'\n');
        if bytes.len() > MAX_TELEMETRY_RECORD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_TELEMETRY_RECORD_SIZE,
            });
        }
        Ok(bytes)
    }

    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim();
        if trimmed.len() > MAX_TELEMETRY_RECORD_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: trimmed.len(),
                max: MAX_TELEMETRY_RECORD_SIZE,
            });
        }
        let record: TelemetryRecord = serde_json::from_str(trimmed).map_err(|_| ProtocolError::InvalidJson)?;
        if record.envelope.kind != MessageKind::Telemetry {
            return Err(ProtocolError::UnexpectedPayload(record.envelope.kind));
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Serialization failed")]
    SerializationError,
    #[error("Fragment sequence {sequence} out of range (declared total {total})")]
    SequenceOutOfRange { sequence: u16, total: u16 },
    #[error("Checksum mismatch on fragment {sequence}: carried {carried:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { sequence: u16, carried: u32, computed: u32 },
    #[error("{missing} fragments missing, acknowledgment holds at most {max}")]
    MissingListOverflow { missing: usize, max: usize },
    #[error("Invalid mission: {0}")]
    InvalidMission(&'static str),
    #[error("Payload does not match message kind {0:?}")]
    UnexpectedPayload(MessageKind),
}

/// Milliseconds since the UNIX epoch; envelopes use wall-clock stamps.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
