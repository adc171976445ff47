use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::SleepyParams;

/// Test-support adapter that sleeps, then yields or fails as configured.
/// Failure, timeout, and cancellation scenarios are all built on this.
pub struct Sleepy {
    sleep: Duration,
    fail: bool,
    fail_kind: Option<String>,
    value: Value,
}

#[async_trait]
impl Adapter for Sleepy {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let params: SleepyParams = parse_record(params)?;
        Ok(Sleepy {
            sleep: Duration::from_millis(params.sleep_ms),
            fail: params.fail,
            fail_kind: params.fail_kind,
            value: params.value.unwrap_or_else(|| json!("Success!")),
        })
    }

    async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
        if !self.sleep.is_zero() {
            debug!(node_id = %ctx.node_id(), "sleeping for {:?}", self.sleep);
            tokio::time::sleep(self.sleep).await;
        }
        if self.fail {
            let message = "simulated failure as configured".to_string();
            return Err(match self.fail_kind.as_deref() {
                Some("bad_input") => AdapterError::BadInput(message),
                Some("upstream_unavailable") => AdapterError::UpstreamUnavailable(message),
                _ => AdapterError::Internal(message),
            });
        }
        ctx.emit(self.value.clone()).await
    }
}
