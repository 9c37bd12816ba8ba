//! Runtime configuration for the rover and mothership processes.
//!
//! Every field has a default, so a config file only needs the values it
//! changes. Files are JSON; CLI flags in the binaries override ids and
//! addresses on top of whatever the file says.

use crate::protocol::{Mission, FRAGMENT_PAYLOAD_SIZE};
use crate::telemetry::{DEFAULT_KEEPALIVE_INTERVAL_MS, DEFAULT_TELEMETRY_INTERVAL_MS};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_MOTHERSHIP_UDP: &str = "127.0.0.1:5000";
pub const DEFAULT_MOTHERSHIP_TCP: &str = "127.0.0.1:5001";
pub const DEFAULT_MOTHERSHIP_ID: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Simulation and scheduling constants for one rover session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub tick_period_ms: u64,
    /// Distance covered per tick while travelling.
    pub step_m: f32,
    pub arrival_threshold_m: f32,
    /// Reported speed while travelling.
    pub cruise_speed_mps: f32,
    pub battery_drain_per_tick: f32,
    pub battery_low_percent: f32,
    pub recovery_delay_ms: u64,
    pub telemetry_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    /// Wait between retransmissions of an unacknowledged final report.
    pub report_retry_ms: u64,
    pub report_max_attempts: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 100,
            step_m: 0.5,
            arrival_threshold_m: 0.5,
            cruise_speed_mps: 2.0,
            battery_drain_per_tick: 0.1,
            battery_low_percent: 20.0,
            recovery_delay_ms: 5000,
            telemetry_interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            report_retry_ms: 1000,
            report_max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoverConfig {
    pub rover_id: u32,
    pub mothership_id: u32,
    pub start_x: f32,
    pub start_y: f32,
    pub local_udp: SocketAddr,
    pub mothership_udp: SocketAddr,
    pub mothership_tcp: SocketAddr,
    pub receive_timeout_ms: u64,
    /// Wait after the last fragment before acknowledging, to absorb stragglers.
    pub completion_grace_ms: u64,
    pub telemetry_poll_ms: u64,
    /// A mission still incomplete this long after its first fragment is dropped.
    pub reassembly_timeout_ms: u64,
    pub session: SessionConfig,
}

impl Default for RoverConfig {
    fn default() -> Self {
        Self {
            rover_id: 1,
            mothership_id: DEFAULT_MOTHERSHIP_ID,
            start_x: 0.0,
            start_y: 0.0,
            local_udp: SocketAddr::from(([0, 0, 0, 0], 0)),
            mothership_udp: SocketAddr::from(([127, 0, 0, 1], 5000)),
            mothership_tcp: SocketAddr::from(([127, 0, 0, 1], 5001)),
            receive_timeout_ms: 2000,
            completion_grace_ms: 200,
            telemetry_poll_ms: 100,
            reassembly_timeout_ms: 30_000,
            session: SessionConfig::default(),
        }
    }
}

impl RoverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.tick_period_ms == 0 {
            return Err(ConfigError::Invalid("tick_period_ms must be positive"));
        }
        if self.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid("receive_timeout_ms must be positive"));
        }
        if self.telemetry_poll_ms == 0 {
            return Err(ConfigError::Invalid("telemetry_poll_ms must be positive"));
        }
        if self.reassembly_timeout_ms < self.receive_timeout_ms {
            return Err(ConfigError::Invalid("reassembly_timeout_ms must not be shorter than receive_timeout_ms"));
        }
        if self.session.report_max_attempts == 0 {
            return Err(ConfigError::Invalid("report_max_attempts must be positive"));
        }
        if !(0.0..=100.0).contains(&self.session.battery_low_percent) {
            return Err(ConfigError::Invalid("battery_low_percent must be within 0..=100"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MothershipConfig {
    pub mothership_id: u32,
    pub udp_listen: SocketAddr,
    pub tcp_listen: SocketAddr,
    pub fragment_size: usize,
    pub ack_timeout_ms: u64,
    pub max_retries: u8,
    /// Missions handed out, in order, to rovers that report in idle.
    pub missions: alloc::vec::Vec<Mission>,
}

impl Default for MothershipConfig {
    fn default() -> Self {
        Self {
            mothership_id: DEFAULT_MOTHERSHIP_ID,
            udp_listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            tcp_listen: SocketAddr::from(([0, 0, 0, 0], 5001)),
            fragment_size: FRAGMENT_PAYLOAD_SIZE,
            ack_timeout_ms: 3000,
            max_retries: 5,
            missions: alloc::vec::Vec::new(),
        }
    }
}

impl MothershipConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fragment_size == 0 || self.fragment_size > FRAGMENT_PAYLOAD_SIZE {
            return Err(ConfigError::Invalid("fragment_size must be within 1..=512"));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("ack_timeout_ms must be positive"));
        }
        for mission in &self.missions {
            mission
                .validate()
                .map_err(|_| ConfigError::Invalid("mission entry failed validation"))?;
        }
        Ok(())
    }
}

pub fn load_from_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
