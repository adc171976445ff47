//! Typed parameter records for the builtin api_classes. Each record is the
//! schema its api_class is validated against; unknown fields are rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstantParams {
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GreetMeParams {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalClientParams {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageParams {
    pub mailbox: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwaitMessageParams {
    pub mailbox: String,
    /// How long to park the node between mailbox polls.
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Zip2Params {}

/// Test-support function mirroring the knobs needed by failure and timing
/// scenarios: sleep, then either yield a value or fail with a chosen kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SleepyParams {
    #[serde(default)]
    pub sleep_ms: u64,
    #[serde(default)]
    pub fail: bool,
    /// "bad_input" or "upstream_unavailable"; anything else is internal.
    #[serde(default)]
    pub fail_kind: Option<String>,
    /// Value yielded on success.
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmitSeriesParams {
    pub count: u32,
    #[serde(default = "default_series_start")]
    pub start: i64,
    /// Optional pause between yields, for streaming tests.
    #[serde(default)]
    pub interval_ms: u64,
}

fn default_series_start() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SquareParams {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadModelDataParams {
    /// Point in time the frames are keyed by, e.g. "2024-01-01T00:00".
    pub time: String,
    #[serde(default = "default_frames")]
    pub frames: u32,
    /// Simulated load latency, so cache hits are observably faster.
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_frames() -> u32 {
    1
}
