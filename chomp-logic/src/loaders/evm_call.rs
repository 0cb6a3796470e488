use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{Acquired, Loader};
use crate::{
    abi::MethodSig,
    config::CompiledIngester,
    context::Context,
    error::LoadError,
    model::{split_chain_addr, Params},
    transform::Payload,
    value::Value,
    vitals::VitalsTimer,
};

/// Read-only contract calls. Each field names a `chainId:address` target
/// and an ABI method signature; duplicate (target, selector) pairs are
/// called once. On endpoint failure the chain's pool rotates and retries
/// within the tick budget.
pub struct EvmCallLoader;

#[async_trait]
impl Loader for EvmCallLoader {
    async fn acquire(&self, ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError> {
        let timer = VitalsTimer::start();
        let mut values: BTreeMap<String, Value> = BTreeMap::new();
        let mut decoded_by_call: BTreeMap<(String, String), Value> = BTreeMap::new();

        for field in &ci.spec.fields {
            let (Some(target), Some(selector)) = (field.target.as_deref(), field.selector.as_deref())
            else {
                continue;
            };
            let call_key = (target.to_string(), selector.to_string());
            if let Some(done) = decoded_by_call.get(&call_key) {
                values.insert(field.name.clone(), done.clone());
                continue;
            }

            let (chain_id, address) = split_chain_addr(target)
                .map_err(|e| LoadError::Payload(e.to_string()))?;
            let signature = MethodSig::parse(selector)?;
            let call_params: Vec<serde_json::Value> = match &field.params {
                Params::List(list) => list.clone(),
                Params::Map(_) | Params::Text(_) => Vec::new(),
            };
            let data = signature.encode_call(&call_params)?;

            let pool = ctx.rpc.get(chain_id)?;
            let (result, endpoint_failures) = pool
                .request_counted(
                    "eth_call",
                    serde_json::json!([
                        {"to": address, "data": format!("0x{}", hex::encode(&data))},
                        "latest"
                    ]),
                    ctx.settings.max_retries,
                )
                .await?;
            if endpoint_failures > 0 {
                let counter = crate::cache::keys::counter(
                    &ctx.settings.namespace,
                    &ci.spec.name,
                    "retry",
                );
                if let Err(err) = ctx.cache.incr(&counter).await {
                    tracing::warn!(name = %ci.spec.name, error = %err, "retry counter update failed");
                }
            }

            let blob = result
                .as_str()
                .and_then(|s| s.strip_prefix("0x"))
                .map(hex::decode)
                .transpose()
                .map_err(|_| LoadError::Payload("eth_call returned invalid hex".to_string()))?
                .ok_or_else(|| LoadError::Payload("eth_call returned no data".to_string()))?;

            let tuple = signature.decode_output(&blob)?;
            let value = match tuple.len() {
                1 => tuple.into_iter().next().unwrap(),
                _ => Value::List(tuple),
            };
            decoded_by_call.insert(call_key, value.clone());
            values.insert(field.name.clone(), value);
        }

        let vitals = timer.stop(0, 0, values.len() as u32);
        Ok(Acquired {
            payload: Payload::PerField(values),
            vitals,
        })
    }
}
