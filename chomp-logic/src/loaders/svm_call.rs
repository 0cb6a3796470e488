use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{Acquired, Loader};
use crate::{
    config::CompiledIngester,
    context::Context,
    error::LoadError,
    model::{split_chain_addr, Params},
    select,
    transform::Payload,
    value::Value,
    vitals::VitalsTimer,
};

/// Solana read calls through the per-chain JSON-RPC pool. The field
/// selector names the RPC method (default `getAccountInfo`); the account
/// address from the target is injected as the first parameter. Selection
/// is implicit: each field receives its call's `result`, and a selector
/// starting with `.` picks into that document instead of naming a method.
pub struct SvmCallLoader;

#[async_trait]
impl Loader for SvmCallLoader {
    async fn acquire(&self, ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError> {
        acquire_jsonrpc(ctx, ci, "getAccountInfo").await
    }
}

/// Shared shape of the SVM and Sui callers: method from the selector,
/// address-first parameters, per-field values from the result JSON.
pub(super) async fn acquire_jsonrpc(
    ctx: &Context,
    ci: &CompiledIngester,
    default_method: &str,
) -> Result<Acquired, LoadError> {
    let timer = VitalsTimer::start();
    let mut result_by_call: BTreeMap<(String, String), serde_json::Value> = BTreeMap::new();
    let mut values: BTreeMap<String, Value> = BTreeMap::new();

    for field in &ci.spec.fields {
        let Some(target) = field.target.as_deref() else {
            continue;
        };
        let selector = field.selector.as_deref().unwrap_or("");
        let (method, path) = if let Some(path) = selector.strip_prefix(default_method) {
            (default_method, path)
        } else if selector.starts_with('.') || selector.is_empty() || selector == "root" {
            (default_method, selector)
        } else {
            // anything else is the method itself, optionally dotted:
            // `getBalance.value`
            match selector.split_once('.') {
                Some((method, _)) => (method, &selector[method.len()..]),
                None => (selector, ""),
            }
        };

        let call_key = (target.to_string(), method.to_string());
        let result = match result_by_call.get(&call_key) {
            Some(cached) => cached.clone(),
            None => {
                let (chain_id, address) =
                    split_chain_addr(target).map_err(|e| LoadError::Payload(e.to_string()))?;
                let mut params = vec![serde_json::Value::String(address)];
                if let Params::List(extra) = &field.params {
                    params.extend(extra.iter().cloned());
                }
                let pool = ctx.rpc.get(chain_id)?;
                let result = pool
                    .request(
                        method,
                        serde_json::Value::Array(params),
                        ctx.settings.max_retries,
                    )
                    .await?;
                result_by_call.insert(call_key, result.clone());
                result
            }
        };

        let selected = if path.is_empty() || path == "root" {
            Value::from_json(&result)
        } else {
            select::select_json(&result, path)
                .map(Value::from_json)
                .unwrap_or(Value::Null)
        };
        values.insert(field.name.clone(), selected);
    }

    if values.is_empty() {
        return Err(LoadError::Payload(format!(
            "{} declares no target",
            ci.spec.name
        )));
    }

    let vitals = timer.stop(0, 0, result_by_call.len() as u32);
    Ok(Acquired {
        payload: Payload::PerField(values),
        vitals,
    })
}
