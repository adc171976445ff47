use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::LoadModelDataParams;
use crate::fingerprint;

/// Synthetic stand-in for an archive loader: deterministic frames keyed by
/// the requested time, behind a configurable latency. Real deployments bind
/// this api_class to a provider-specific loader instead.
pub struct LoadModelData {
    time: String,
    frames: u32,
    delay: Duration,
}

#[async_trait]
impl Adapter for LoadModelData {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let params: LoadModelDataParams = parse_record(params)?;
        if params.time.is_empty() {
            return Err(AdapterError::BadInput("time must not be empty".to_string()));
        }
        Ok(LoadModelData {
            time: params.time,
            frames: params.frames,
            delay: Duration::from_millis(params.delay_ms),
        })
    }

    async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        for frame in 0..self.frames {
            let checksum = fingerprint::digest_parts(&[&self.time, &frame.to_string()]);
            ctx.emit(json!({
                "time": self.time,
                "frame": frame,
                "checksum": &checksum[..16],
            }))
            .await?;
        }
        Ok(())
    }
}
