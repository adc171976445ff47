use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::EmitSeriesParams;

/// Yields `count` consecutive integers starting at `start`, optionally
/// pausing between yields so downstream streaming is observable.
pub struct EmitSeries {
    count: u32,
    start: i64,
    interval: Duration,
}

#[async_trait]
impl Adapter for EmitSeries {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let params: EmitSeriesParams = parse_record(params)?;
        Ok(EmitSeries {
            count: params.count,
            start: params.start,
            interval: Duration::from_millis(params.interval_ms),
        })
    }

    async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
        for offset in 0..self.count {
            ctx.emit(json!(self.start + i64::from(offset))).await?;
            if !self.interval.is_zero() && offset + 1 < self.count {
                tokio::time::sleep(self.interval).await;
            }
        }
        Ok(())
    }
}
