//! Shared types and message definitions for the OpenBACH scheduling engine.
//!
//! This crate contains the wire protocol spoken between the director and its
//! agents, the scenario model the director executes, and the error taxonomy
//! both sides report through.
//!
//! # Key Components
//!
//! * [`codec`] - Length-prefixed JSON frames
//! * [`client`] - Retrying request client over TCP or Unix sockets
//! * [`protocol`] - [`protocol::AgentCommand`] and [`protocol::DirectorCommand`] registries, replies
//! * [`scenario`] - Scenario definitions, failure policies and status enums
//! * [`scenario_json`] - JSON5 scenario loading and validation
//! * [`errors`] - [`errors::OpenbachError`] and [`errors::TransportError`]
//!
//! # Communication Patterns
//!
//! ```text
//! Client          Director (unix socket)          Agent (tcp/1112)
//!    │ ── start_scenario_instance ──► │                     │
//!    │ ◄──── {scenario_instance_id} ── │                     │
//!    │                                │ ─ check_connection ► │
//!    │                                │ ─ start_job_instance_agent ► │
//!    │                                │ ◄────── instance id ─ │
//!    │                                │ ─ status_job_instance_agent ► (every 2s)
//!    │                                │ ─ stop_job_instance_agent ► │
//! ```
//!
//! Every frame is a 4-byte big-endian length followed by UTF-8 JSON.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod client;
pub mod codec;
pub mod errors;
pub mod protocol;
pub mod scenario;
pub mod scenario_json;

/// Default TCP port of the agent job scheduler.
pub const DEFAULT_AGENT_PORT: u16 = 1112;

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
