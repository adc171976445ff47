use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::AwaitMessageParams;

/// Waits for a mailbox message without holding a worker: each activation
/// checks the mailbox once and, if it is still empty, parks the node on the
/// delayed queue for another look later.
pub struct AwaitMessage {
    mailbox: String,
    poll_interval: Duration,
}

#[async_trait]
impl Adapter for AwaitMessage {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let params: AwaitMessageParams = parse_record(params)?;
        Ok(AwaitMessage {
            mailbox: params.mailbox,
            poll_interval: Duration::from_millis(params.poll_interval_ms),
        })
    }

    async fn body(&self, ctx: &AdapterCtx, _inputs: Inputs) -> Result<(), AdapterError> {
        let message = ctx
            .request()
            .read_message(&self.mailbox)
            .await
            .map_err(|e| AdapterError::Internal(e.to_string()))?;
        match message {
            Some(message) => ctx.emit(json!(message)).await,
            None => {
                let polls = ctx
                    .continuation()
                    .and_then(|c| c["polls"].as_u64())
                    .unwrap_or(0);
                ctx.schedule_after(self.poll_interval, json!({"polls": polls + 1}))
                    .await
            }
        }
    }
}
