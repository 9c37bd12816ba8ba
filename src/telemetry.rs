use serde::{Deserialize, Serialize};

pub const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 10_000;

/// Events that force a telemetry report ahead of the periodic interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoverEvent {
    #[default]
    None,
    MissionStarted,
    MissionEnded,
    BatteryLow,
    StateChanged,
    Error,
    Checkpoint,
}

impl RoverEvent {
    /// Everything except the generic state-change signal.
    pub fn is_specific(&self) -> bool {
        !matches!(self, RoverEvent::None | RoverEvent::StateChanged)
    }
}

/// Decides when telemetry and keepalives go out.
///
/// Holds a single pending-event slot: latching overwrites whatever was not
/// yet sent, so a consumer sees at most the latest event between two sends.
#[derive(Debug, Clone)]
pub struct TelemetryScheduler {
    base_interval_ms: u64,
    keepalive_interval_ms: u64,
    last_telemetry_ms: Option<u64>,
    last_hello_ms: Option<u64>,
    pending_event: RoverEvent,
    last_event: RoverEvent,
}

impl TelemetryScheduler {
    pub fn new(base_interval_ms: u64, keepalive_interval_ms: u64) -> Self {
        Self {
            base_interval_ms,
            keepalive_interval_ms,
            last_telemetry_ms: None,
            last_hello_ms: None,
            pending_event: RoverEvent::None,
            last_event: RoverEvent::None,
        }
    }

    pub fn latch(&mut self, event: RoverEvent) {
        if event != RoverEvent::None {
            self.pending_event = event;
        }
    }

    pub fn pending_event(&self) -> RoverEvent {
        self.pending_event
    }

    pub fn last_event(&self) -> RoverEvent {
        self.last_event
    }

    /// Check-and-clear: returns whether a report is due and, if an event was
    /// pending, moves it to [`last_event`](Self::last_event) and empties the
    /// slot. Calling it twice in a row only reports the event once.
    ///
    /// `interval_override_ms` shortens the base interval (a running mission's
    /// requested update rate); it never lengthens it.
    pub fn should_send_telemetry(&mut self, current_time: u64, interval_override_ms: Option<u64>) -> bool {
        let interval = interval_override_ms.map_or(self.base_interval_ms, |ms| ms.min(self.base_interval_ms));

        let mut due = match self.last_telemetry_ms {
            None => true,
            Some(last) => current_time.saturating_sub(last) >= interval,
        };

        if self.pending_event != RoverEvent::None {
            due = true;
            self.last_event = self.pending_event;
            self.pending_event = RoverEvent::None;
        }

        due
    }

    pub fn telemetry_sent(&mut self, current_time: u64) {
        self.last_telemetry_ms = Some(current_time);
    }

    /// Check-and-clear for keepalives: a `true` result records `current_time`
    /// as the last hello.
    pub fn device_hello_due(&mut self, current_time: u64) -> bool {
        let due = match self.last_hello_ms {
            None => true,
            Some(last) => current_time.saturating_sub(last) >= self.keepalive_interval_ms,
        };
        if due {
            self.last_hello_ms = Some(current_time);
        }
        due
    }

    pub fn last_telemetry_ms(&self) -> Option<u64> {
        self.last_telemetry_ms
    }

    pub fn last_hello_ms(&self) -> Option<u64> {
        self.last_hello_ms
    }
}

impl Default for TelemetryScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_TELEMETRY_INTERVAL_MS, DEFAULT_KEEPALIVE_INTERVAL_MS)
    }
}
