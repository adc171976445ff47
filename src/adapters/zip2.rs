use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{parse_record, Adapter, AdapterCtx, AdapterError, Inputs};
use crate::api::params::Zip2Params;

/// Pairs up values from two upstream streams, ending when the shorter one
/// does.
pub struct Zip2;

#[async_trait]
impl Adapter for Zip2 {
    fn configure(_config: &Value, params: &Value) -> Result<Self, AdapterError> {
        let _: Zip2Params = parse_record(params)?;
        Ok(Zip2)
    }

    async fn body(&self, ctx: &AdapterCtx, inputs: Inputs) -> Result<(), AdapterError> {
        let mut streams = inputs.into_many()?;
        if streams.len() != 2 {
            return Err(AdapterError::BadInput(format!(
                "zip2 takes exactly two inputs, got {}",
                streams.len()
            )));
        }
        let mut right = streams.pop().expect("two streams");
        let mut left = streams.pop().expect("two streams");
        loop {
            let (a, b) = (left.next().await?, right.next().await?);
            match (a, b) {
                (Some(a), Some(b)) => ctx.emit(json!([a, b])).await?,
                _ => return Ok(()),
            }
        }
    }
}
