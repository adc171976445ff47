use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::SignalClientParams;

/// Yields a message to the client. Combined with `after` edges this is the
/// usual way to signal that some part of the pipeline finished.
pub struct SignalClient {
    message: String,
}

#[async_trait]
impl Adapter for SignalClient {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let params: SignalClientParams = parse_record(params)?;
        Ok(SignalClient {
            message: params.message,
        })
    }

    async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
        ctx.emit(json!(self.message)).await
    }
}
