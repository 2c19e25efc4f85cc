//! Probe definitions and the events they report.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default probing period when none is configured.
pub const DEFAULT_PROBE_PERIOD_SECONDS: i32 = 60;

/// Event code for a probe that met its success threshold.
pub const PROBE_SUCCESS_CODE: i32 = 0;

/// Event code for a probe that met its failure threshold.
pub const PROBE_FAILURE_CODE: i32 = -1;

/// A periodically invoked action debounced into a health signal.
///
/// The probe is named after the action it invokes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Probe {
    pub action: String,

    #[serde(default)]
    pub initial_delay_seconds: i32,

    #[serde(default)]
    pub period_seconds: i32,

    #[serde(default)]
    pub success_threshold: i32,

    #[serde(default)]
    pub failure_threshold: i32,

    /// Heartbeat period for re-sending the latest event; unset disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_period_seconds: Option<i32>,
}

impl Probe {
    pub fn name(&self) -> &str {
        &self.action
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_seconds.max(0) as u64)
    }

    pub fn period(&self) -> Duration {
        let secs = if self.period_seconds > 0 {
            self.period_seconds
        } else {
            DEFAULT_PROBE_PERIOD_SECONDS
        };
        Duration::from_secs(secs as u64)
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold.max(1) as u32
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.max(1) as u32
    }

    /// Heartbeat period, never shorter than the probing period.
    pub fn report_period(&self) -> Option<Duration> {
        match self.report_period_seconds {
            Some(secs) if secs > 0 => {
                Some(Duration::from_secs(secs as u64).max(self.period()))
            }
            _ => None,
        }
    }
}

/// Outcome of a probe reported to the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeEvent {
    pub instance: String,

    pub probe: String,

    pub code: i32,

    #[serde(
        default,
        with = "crate::base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub output: Vec<u8>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
