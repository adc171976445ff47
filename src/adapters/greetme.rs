use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::GreetMeParams;

/// The smoke-test function: greets the caller from this provider.
pub struct GreetMe {
    name: String,
}

#[async_trait]
impl Adapter for GreetMe {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let params: GreetMeParams = parse_record(params)?;
        if params.name.trim().is_empty() {
            return Err(AdapterError::BadInput("name must not be empty".to_string()));
        }
        Ok(GreetMe { name: params.name })
    }

    async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
        let greeting = format!("Hello {}, this is {}", self.name, ctx.provider().name);
        ctx.emit(json!(greeting)).await
    }
}
