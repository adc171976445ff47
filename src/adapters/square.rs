use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::SquareParams;

/// Squares each integer its upstream yields, preserving order. Runs as the
/// upstream produces; nothing is batched.
pub struct Square;

#[async_trait]
impl Adapter for Square {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let _: SquareParams = parse_record(params)?;
        Ok(Square)
    }

    async fn body(&self, ctx: &AdapterCtx, inputs: Inputs) -> Result<(), AdapterError> {
        let mut upstream = inputs.into_one()?;
        while let Some(value) = upstream.next().await? {
            let n = value.as_i64().ok_or_else(|| {
                AdapterError::BadInput(format!("expected an integer, got {value}"))
            })?;
            ctx.emit(json!(n * n)).await?;
        }
        Ok(())
    }
}
