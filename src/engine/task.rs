//! Test case and result types exchanged with the controller.
//!
//! Field names follow the controller's camelCase JSON. Durations travel as integer
//! nanoseconds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// One assigned unit of load-test work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TestCase {
    #[serde(deserialize_with = "null_default")]
    pub request_body_list: Vec<RequestSpec>,
    #[serde(deserialize_with = "null_default")]
    pub env_variables: HashMap<String, String>,
    pub repeat: i64,
    pub concurrency_count: i64,
    pub qps: i64,
    /// Per-request timeout in seconds. Zero disables the timeout.
    pub timeout: u64,
    pub keep_alive: bool,
}

impl TestCase {
    /// Number of parallel workers, never less than one.
    pub fn workers(&self) -> usize {
        self.concurrency_count.max(1) as usize
    }

    /// Total batch iterations across all workers.
    pub fn iterations(&self) -> u64 {
        self.repeat.max(0) as u64
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    /// Workers that get at least one iteration. Only these are spawned.
    pub fn active_workers(&self) -> usize {
        usize::try_from(self.iterations()).map_or(self.workers(), |n| n.min(self.workers()))
    }

    /// Iterations assigned to `worker` when `iterations()` are spread over `workers()`.
    /// The first `iterations % workers` workers take one extra.
    pub fn share_of(&self, worker: usize) -> u64 {
        let workers = self.workers() as u64;
        let total = self.iterations();
        let base = total / workers;
        let extra = total % workers;
        base + u64::from((worker as u64) < extra)
    }
}

/// A templated HTTP request plus its assertion script.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestSpec {
    pub id: String,
    pub param: String,
    pub method: String,
    pub url: String,
    pub body: String,
    #[serde(deserialize_with = "null_default")]
    pub headers: HashMap<String, String>,
    #[serde(rename = "test", deserialize_with = "null_default")]
    pub tests: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunError {
    pub message: String,
}

/// Per-phase request timings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseDurations {
    #[serde(with = "nanos")]
    pub dns: Duration,
    #[serde(with = "nanos")]
    pub connect: Duration,
    /// Time to first response byte once the connection was available.
    #[serde(with = "nanos")]
    pub request: Duration,
}

impl PhaseDurations {
    pub fn total(&self) -> Duration {
        self.dns + self.connect + self.request
    }
}

/// Outcome of one executed request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunResult {
    pub id: String,
    pub success: bool,
    pub param: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub body: String,
    pub status: u16,
    pub status_message: String,
    pub duration: PhaseDurations,
    pub headers: HashMap<String, String>,
    pub tests: HashMap<String, bool>,
}

impl RunResult {
    pub fn new(spec: &RequestSpec) -> Self {
        Self {
            id: spec.id.clone(),
            param: spec.param.clone(),
            ..Default::default()
        }
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(RunError {
            message: message.into(),
        });
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}

// Controllers written against nil-able collections send `null` for empty ones.
fn null_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Option::unwrap_or_default)
}

mod nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let n = i64::deserialize(d)?;
        Ok(Duration::from_nanos(n.max(0) as u64))
    }
}
