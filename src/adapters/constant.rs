use async_trait::async_trait;
use serde_json::Value;

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::ConstantParams;

/// Yields its configured literal exactly once.
pub struct Constant {
    value: Value,
}

#[async_trait]
impl Adapter for Constant {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let params: ConstantParams = parse_record(params)?;
        Ok(Constant { value: params.value })
    }

    async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
        ctx.emit(self.value.clone()).await
    }
}
