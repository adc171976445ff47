use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::SendMessageParams;

/// Writes a message into a request-scoped mailbox, where an AwaitMessage
/// node (typically ordered later via `after`) can pick it up.
pub struct SendMessage {
    mailbox: String,
    message: String,
}

#[async_trait]
impl Adapter for SendMessage {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let params: SendMessageParams = parse_record(params)?;
        Ok(SendMessage {
            mailbox: params.mailbox,
            message: params.message,
        })
    }

    async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
        ctx.request()
            .post_message(&self.mailbox, &self.message)
            .await
            .map_err(|e| AdapterError::Internal(e.to_string()))?;
        ctx.emit(json!({"mailbox": self.mailbox, "delivered": true}))
            .await
    }
}
