//! # MissionLink
//!
//! Rover/mothership mission link: missions travel to rovers as checksummed
//! UDP fragments, rovers report telemetry back over TCP, and each rover runs
//! a lifecycle state machine that simulates the assigned mission.
//!
//! ## Quick Start
//!
//! ```rust
//! use missionlink::config::SessionConfig;
//! use missionlink::protocol::{Area, Mission};
//! use missionlink::session::{LifecycleState, RoverSession};
//!
//! let mut session = RoverSession::new(2, 1, 0.0, 0.0, SessionConfig::default());
//! session.tick(0);
//!
//! let mission = Mission::new(7, Area { x1: 0.0, y1: 0.0, x2: 10.0, y2: 10.0 }, "survey", 20).unwrap();
//! session.mission_received(mission, 0).unwrap();
//! assert_eq!(session.state(), LifecycleState::InMission);
//! ```
//!
//! ## Architecture
//!
//! - [`protocol`] - Wire messages and their JSON codec
//! - [`fragment`] - Mission fragmentation and CRC32
//! - [`reassembly`] - Fragment reassembly and acknowledgments
//! - [`session`] - Rover lifecycle and mission simulation
//! - [`telemetry`] - Telemetry and keepalive scheduling
//! - [`transport`] - Datagram/stream collaborators
//! - [`agent`] - The rover's tick, receive and telemetry loops
//! - [`mothership`] - Mission dispatch, report and telemetry intake
//! - [`report`] - Rover progress and completion reports
//! - [`metrics`] - Datagram link counters
//! - [`config`] - Configuration files and defaults

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![cfg_attr(test, allow(clippy::float_cmp))]

extern crate alloc;

pub mod agent;
pub mod config;
pub mod fragment;
pub mod metrics;
pub mod mothership;
pub mod protocol;
pub mod reassembly;
pub mod report;
pub mod session;
pub mod telemetry;
pub mod transport;

// Re-export main public types for convenience
pub use agent::RoverAgent;
pub use metrics::{LinkMetrics, LinkStats};
pub use protocol::{Datagram, Mission, MissionFragment, TelemetryRecord};
pub use reassembly::FragmentReassemblyBuffer;
pub use session::{LifecycleState, RoverSession};
