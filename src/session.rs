use crate::config::SessionConfig;
use crate::protocol::{
    FailureCode, Mission, MissionOutcome, MissionReport, OperationalStatus, ReportAck, TelemetryPayload,
};
use crate::report::{MissionReporter, ReportDue};
use crate::telemetry::{RoverEvent, TelemetryScheduler};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Progress percentages at which a checkpoint is recorded.
pub const CHECKPOINTS: [u8; CHECKPOINT_COUNT] = [25, 50, 75, 100];
const CHECKPOINT_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Initial,
    Available,
    ReceivingMission,
    InMission,
    Completed,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("{operation} not allowed in state {state:?}")]
    InvalidState { operation: &'static str, state: LifecycleState },
}

/// Mission-scoped part of the session. Dropping it drops progress,
/// start time and checkpoint history together.
#[derive(Debug, Clone)]
pub struct ActiveMission {
    pub mission: Mission,
    pub started_at_ms: u64,
    pub progress: f32,
    checkpoints: Vec<u8, CHECKPOINT_COUNT>,
}

impl ActiveMission {
    fn new(mission: Mission, started_at_ms: u64) -> Self {
        Self {
            mission,
            started_at_ms,
            progress: 0.0,
            checkpoints: Vec::new(),
        }
    }

    pub fn checkpoints(&self) -> &[u8] {
        &self.checkpoints
    }

    fn elapsed_s(&self, current_time: u64) -> u64 {
        current_time.saturating_sub(self.started_at_ms) / 1000
    }

    /// Record every boundary at or below the current progress that was not
    /// recorded yet. Returns whether anything new was recorded.
    fn record_checkpoints(&mut self) -> bool {
        let mut crossed = false;
        while let Some(&boundary) = CHECKPOINTS.get(self.checkpoints.len()) {
            if self.progress < f32::from(boundary) {
                break;
            }
            // Capacity matches CHECKPOINTS
            let _ = self.checkpoints.push(boundary);
            crossed = true;
        }
        crossed
    }
}

/// Read-only copy of the session taken under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub rover_id: u32,
    pub mother_id: u32,
    pub state: LifecycleState,
    pub previous_state: LifecycleState,
    pub mission_id: Option<u32>,
    pub progress: f32,
    pub telemetry: TelemetryPayload,
    pub last_event: RoverEvent,
}

/// Authoritative state of one rover.
///
/// Every mutating call is one scheduling step. A state change inside a step
/// latches [`RoverEvent::StateChanged`] only if no specific event was latched
/// earlier in that same step.
#[derive(Debug)]
pub struct RoverSession {
    rover_id: u32,
    mother_id: u32,
    config: SessionConfig,
    state: LifecycleState,
    previous_state: LifecycleState,
    scheduler: TelemetryScheduler,
    reporter: MissionReporter,
    mission: Option<ActiveMission>,
    receiving_mission_id: Option<u32>,
    x: f32,
    y: f32,
    battery: f32,
    speed: f32,
    status: OperationalStatus,
    battery_low_latched: bool,
    failure_since: Option<u64>,
    registered_at: Option<u64>,
    specific_event_in_step: bool,
}

impl RoverSession {
    pub fn new(rover_id: u32, mother_id: u32, x: f32, y: f32, config: SessionConfig) -> Self {
        let scheduler = TelemetryScheduler::new(config.telemetry_interval_ms, config.keepalive_interval_ms);
        let reporter = MissionReporter::new(config.report_retry_ms, config.report_max_attempts);
        Self {
            rover_id,
            mother_id,
            config,
            state: LifecycleState::Initial,
            previous_state: LifecycleState::Initial,
            scheduler,
            reporter,
            mission: None,
            receiving_mission_id: None,
            x,
            y,
            battery: 100.0,
            speed: 0.0,
            status: OperationalStatus::Initial,
            battery_low_latched: false,
            failure_since: None,
            registered_at: None,
            specific_event_in_step: false,
        }
    }

    pub fn tick(&mut self, current_time: u64) {
        self.specific_event_in_step = false;

        match self.state {
            LifecycleState::Initial => {
                self.status = OperationalStatus::Active;
                self.transition(LifecycleState::Available);
            }
            LifecycleState::Available | LifecycleState::ReceivingMission => {}
            LifecycleState::InMission => self.simulation_step(current_time),
            LifecycleState::Completed => {
                self.mission = None;
                self.speed = 0.0;
                self.status = OperationalStatus::Active;
                self.transition(LifecycleState::Available);
            }
            LifecycleState::Failure => {
                let since = self.failure_since.unwrap_or(current_time);
                if self.battery <= 0.0 {
                    // Stays down until recharged
                    debug!("Rover {} held in failure, battery depleted", self.rover_id);
                } else if current_time.saturating_sub(since) >= self.config.recovery_delay_ms {
                    self.failure_since = None;
                    self.status = OperationalStatus::Active;
                    info!("✅ Rover {} recovered from failure", self.rover_id);
                    self.transition(LifecycleState::Available);
                }
            }
        }

        debug_assert!(self.mission.is_some() || self.state != LifecycleState::InMission);
        debug_assert!((0.0..=100.0).contains(&self.battery));
    }

    /// First fragment of `mission_id` arrived.
    pub fn begin_receiving(&mut self, mission_id: u32) -> Result<(), SessionError> {
        self.specific_event_in_step = false;
        match self.state {
            LifecycleState::Available | LifecycleState::ReceivingMission => {
                self.receiving_mission_id = Some(mission_id);
                self.transition(LifecycleState::ReceivingMission);
                Ok(())
            }
            state => Err(SessionError::InvalidState {
                operation: "begin_receiving",
                state,
            }),
        }
    }

    /// Reassembly of `mission_id` was given up. Returns to `Available` if the
    /// session was still waiting for that mission.
    pub fn abandon_receiving(&mut self, mission_id: u32) -> bool {
        self.specific_event_in_step = false;
        if self.state != LifecycleState::ReceivingMission || self.receiving_mission_id != Some(mission_id) {
            return false;
        }
        warn!("Rover {} gave up receiving mission {}", self.rover_id, mission_id);
        self.receiving_mission_id = None;
        self.transition(LifecycleState::Available);
        true
    }

    /// Install a fully reassembled mission and start it.
    pub fn mission_received(&mut self, mission: Mission, current_time: u64) -> Result<(), SessionError> {
        if !matches!(self.state, LifecycleState::Available | LifecycleState::ReceivingMission) {
            return Err(SessionError::InvalidState {
                operation: "mission_received",
                state: self.state,
            });
        }
        self.specific_event_in_step = false;

        let mission = mission.normalized();
        info!(
            "🚀 Rover {} starting mission {} ({}, {}s, priority {})",
            self.rover_id, mission.id, mission.task, mission.duration_s, mission.priority
        );

        self.mission = Some(ActiveMission::new(mission, current_time));
        self.receiving_mission_id = None;
        self.status = OperationalStatus::InMission;
        self.latch_specific(RoverEvent::MissionStarted);

        self.transition(LifecycleState::ReceivingMission);
        self.transition(LifecycleState::InMission);
        Ok(())
    }

    /// Mothership answered a keepalive. Never changes the lifecycle state.
    pub fn handle_mission_ack(&mut self, current_time: u64) {
        if self.registered_at.is_none() {
            info!("🤝 Rover {} registered with mothership {}", self.rover_id, self.mother_id);
        }
        self.registered_at = Some(current_time);
    }

    /// Abandon any mission and hold in `Failure` until the recovery delay passes.
    pub fn enter_failure(&mut self, reason: &str, current_time: u64) {
        self.specific_event_in_step = false;
        if self.state == LifecycleState::Failure {
            return;
        }
        warn!("❌ Rover {} failure: {}", self.rover_id, reason);
        self.fail(current_time, FailureCode::Aborted);
    }

    fn fail(&mut self, current_time: u64, code: FailureCode) {
        if let Some(active) = self.mission.take() {
            warn!("Mission {} abandoned at {:.1}%", active.mission.id, active.progress);
            let report = self.report_for(&active, current_time, Some(MissionOutcome::Failed(code)));
            self.reporter.finish(report);
        }
        self.receiving_mission_id = None;
        self.speed = 0.0;
        self.status = OperationalStatus::Failure;
        self.failure_since = Some(current_time);
        self.latch_specific(RoverEvent::Error);
        self.transition(LifecycleState::Failure);
    }

    fn simulation_step(&mut self, current_time: u64) {
        let config = &self.config;
        let Some(active) = self.mission.as_mut() else {
            return;
        };

        let (target_x, target_y) = active.mission.area.center();
        let dx = target_x - self.x;
        let dy = target_y - self.y;
        let distance = (dx * dx + dy * dy).sqrt();
        if distance > config.arrival_threshold_m {
            self.x += dx / distance * config.step_m;
            self.y += dy / distance * config.step_m;
            self.speed = config.cruise_speed_mps;
        } else {
            self.speed = 0.0;
        }

        self.battery = (self.battery - config.battery_drain_per_tick).max(0.0);
        let mut battery_low = false;
        if self.battery < config.battery_low_percent {
            if !self.battery_low_latched {
                self.battery_low_latched = true;
                battery_low = true;
            }
        } else {
            self.battery_low_latched = false;
        }

        let elapsed_ms = current_time.saturating_sub(active.started_at_ms);
        let duration_ms = active.mission.duration_s.saturating_mul(1000).max(1);
        let progress = ((elapsed_ms as f64 / duration_ms as f64) * 100.0).min(100.0) as f32;
        active.progress = active.progress.max(progress);

        let checkpoint = active.record_checkpoints();
        let progress = active.progress;
        let mission_id = active.mission.id;

        if battery_low {
            warn!("🔋 Rover {} battery low: {:.1}%", self.rover_id, self.battery);
            self.latch_specific(RoverEvent::BatteryLow);
        }
        if checkpoint {
            info!("📍 Rover {} mission {} checkpoint at {:.0}%", self.rover_id, mission_id, progress);
            self.latch_specific(RoverEvent::Checkpoint);
        }

        if progress >= 100.0 {
            self.status = OperationalStatus::Success;
            self.speed = 0.0;
            info!("🏁 Rover {} completed mission {}", self.rover_id, mission_id);
            if let Some(active) = self.mission.as_ref() {
                let report = self.report_for(active, current_time, Some(MissionOutcome::Succeeded));
                self.reporter.finish(report);
            }
            self.latch_specific(RoverEvent::MissionEnded);
            self.transition(LifecycleState::Completed);
        } else if self.battery <= 0.0 {
            warn!("❌ Rover {} battery depleted during mission {}", self.rover_id, mission_id);
            self.fail(current_time, FailureCode::BatteryDepleted);
        }
    }

    fn latch_specific(&mut self, event: RoverEvent) {
        self.scheduler.latch(event);
        self.specific_event_in_step = true;
    }

    fn transition(&mut self, next: LifecycleState) {
        if next == self.state {
            return;
        }
        debug!("Rover {} {:?} -> {:?}", self.rover_id, self.state, next);
        self.previous_state = self.state;
        self.state = next;
        if !self.specific_event_in_step {
            self.scheduler.latch(RoverEvent::StateChanged);
        }
    }

    /// Check-and-clear, see [`TelemetryScheduler::should_send_telemetry`].
    /// A running mission's update interval shortens the base interval.
    pub fn should_send_telemetry(&mut self, current_time: u64) -> bool {
        let mission_interval = self
            .mission
            .as_ref()
            .filter(|_| self.state == LifecycleState::InMission)
            .map(|active| active.mission.update_interval_s.saturating_mul(1000));
        self.scheduler.should_send_telemetry(current_time, mission_interval)
    }

    pub fn telemetry_sent(&mut self, current_time: u64) {
        self.scheduler.telemetry_sent(current_time);
    }

    pub fn device_hello_due(&mut self, current_time: u64) -> bool {
        self.scheduler.device_hello_due(current_time)
    }

    fn report_for(&self, active: &ActiveMission, current_time: u64, outcome: Option<MissionOutcome>) -> MissionReport {
        MissionReport {
            mission_id: active.mission.id,
            sequence: 0,
            elapsed_s: active.elapsed_s(current_time),
            progress: active.progress,
            battery: self.battery,
            x: self.x,
            y: self.y,
            outcome,
        }
    }

    /// Next mission report to send, if any. A pending final report takes
    /// precedence; progress follows the mission's update interval.
    pub fn next_report(&mut self, current_time: u64) -> Option<ReportDue> {
        if let Some(due) = self.reporter.final_due(current_time) {
            return Some(due);
        }
        if self.state != LifecycleState::InMission {
            return None;
        }
        let active = self.mission.as_ref()?;
        let interval_ms = active.mission.update_interval_s.saturating_mul(1000);
        let report = self.report_for(active, current_time, None);
        self.reporter.progress_due(current_time, interval_ms, report)
    }

    pub fn report_acknowledged(&mut self, ack: &ReportAck) -> bool {
        self.reporter.acknowledge(ack)
    }

    /// Final report still waiting for the mothership's receipt.
    pub fn pending_final_report(&self) -> Option<MissionReport> {
        self.reporter.pending_final()
    }

    pub fn abandoned_reports(&self) -> u64 {
        self.reporter.abandoned()
    }

    pub fn rover_id(&self) -> u32 {
        self.rover_id
    }

    pub fn mother_id(&self) -> u32 {
        self.mother_id
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn previous_state(&self) -> LifecycleState {
        self.previous_state
    }

    pub fn mission(&self) -> Option<&ActiveMission> {
        self.mission.as_ref()
    }

    pub fn mission_id(&self) -> Option<u32> {
        self.mission.as_ref().map(|active| active.mission.id)
    }

    pub fn receiving_mission_id(&self) -> Option<u32> {
        self.receiving_mission_id
    }

    pub fn progress(&self) -> f32 {
        self.mission.as_ref().map_or(0.0, |active| active.progress)
    }

    pub fn checkpoints(&self) -> &[u8] {
        self.mission.as_ref().map_or(&[], |active| active.checkpoints())
    }

    pub fn position(&self) -> (f32, f32) {
        (self.x, self.y)
    }

    pub fn battery(&self) -> f32 {
        self.battery
    }

    pub fn is_registered(&self) -> bool {
        self.registered_at.is_some()
    }

    pub fn pending_event(&self) -> RoverEvent {
        self.scheduler.pending_event()
    }

    pub fn last_event(&self) -> RoverEvent {
        self.scheduler.last_event()
    }

    pub fn telemetry(&self) -> TelemetryPayload {
        TelemetryPayload {
            x: self.x,
            y: self.y,
            status: self.status,
            battery: self.battery,
            speed: self.speed,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            rover_id: self.rover_id,
            mother_id: self.mother_id,
            state: self.state,
            previous_state: self.previous_state,
            mission_id: self.mission_id(),
            progress: self.progress(),
            telemetry: self.telemetry(),
            last_event: self.scheduler.last_event(),
        }
    }
}
