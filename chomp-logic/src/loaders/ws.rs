use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{Acquired, Loader};
use crate::{
    config::CompiledIngester,
    context::Context,
    error::LoadError,
    select,
    transform::Payload,
    vitals::VitalsTimer,
};

/// Tick-side half of a ws_api ingester: message receipt is not claim
/// gated, so the only work here is flipping the epoch buffer and handing
/// the frozen epoch to the reducers.
pub struct WsTickLoader;

#[async_trait]
impl Loader for WsTickLoader {
    async fn acquire(&self, ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError> {
        let timer = VitalsTimer::start();
        let buffer = ctx.epoch_buffer(&ci.spec.name);
        let view = buffer.flip();
        if view.current.is_empty() {
            return Err(LoadError::Payload(format!(
                "{}: no stream data accumulated this tick",
                ci.spec.name
            )));
        }
        let count = view.current.len() as u32;
        let vitals = timer.stop(0, 0, count);
        Ok(Acquired {
            payload: Payload::Epochs(view),
            vitals,
        })
    }
}

/// Long-lived reader task, one per distinct target of the ingester. The
/// connection's lifetime spans many ticks; loss triggers reconnection with
/// exponential backoff capped at the ingester's interval.
pub async fn run_connection(ctx: Arc<Context>, ci: CompiledIngester, target: String) {
    let buffer = ctx.epoch_buffer(&ci.spec.name);
    let max_backoff = ci.spec.interval.period();
    let mut attempt: u32 = 0;

    loop {
        match connect_and_read(&ctx, &ci, &target, &buffer).await {
            Ok(()) => {
                // orderly close: reconnect promptly
                attempt = 0;
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                tracing::error!(
                    name = %ci.spec.name,
                    target = %target,
                    attempt,
                    error = %err,
                    "websocket connection lost, reconnecting"
                );
            }
        }
        let backoff = ctx
            .settings
            .retry_cooldown
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(max_backoff)
            .max(Duration::from_millis(100));
        tokio::time::sleep(backoff).await;
    }
}

async fn connect_and_read(
    ctx: &Context,
    ci: &CompiledIngester,
    target: &str,
    buffer: &crate::epoch::EpochBuffer,
) -> Result<(), LoadError> {
    let (stream, _) = connect_async(target).await?;
    let (mut sink, mut source) = stream.split();
    tracing::info!(name = %ci.spec.name, target, "websocket connected");

    // subscription parameters go out once per connection
    let params = ci
        .spec
        .fields
        .iter()
        .find(|f| f.target.as_deref() == Some(target) && !f.params.is_empty())
        .map(|f| f.params.to_json())
        .or_else(|| (!ci.spec.params.is_empty()).then(|| ci.spec.params.to_json()));
    if let Some(params) = params {
        sink.send(Message::Text(params.to_string())).await?;
    }

    // fields sharing a (handler, selector) pair handle each message once
    let routes: Vec<(String, Option<String>)> = {
        let mut seen = BTreeSet::new();
        ci.spec
            .fields
            .iter()
            .filter(|f| f.target.as_deref() == Some(target))
            .filter_map(|f| {
                let handler = f.handler.clone()?;
                let selector = f.selector.clone();
                seen.insert((handler.clone(), selector.clone()))
                    .then_some((handler, selector))
            })
            .collect()
    };

    while let Some(message) = source.next().await {
        let message = message?;
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            Message::Close(_) => return Ok(()),
        };
        let Ok(doc) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };

        for (handler_name, selector) in &routes {
            let Some(handler) = ctx.plugins.handler(handler_name) else {
                continue;
            };
            let fragment = match selector.as_deref() {
                Some(selector) => match select::select_json(&doc, selector) {
                    Some(fragment) => fragment,
                    None => continue,
                },
                None => &doc,
            };
            buffer.apply(|epoch| handler(fragment, epoch));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::config::tests_support::minimal_ingester;
    use crate::epoch::EpochView;
    use crate::model::IngesterKind;
    use crate::plugins::PluginRegistry;
    use crate::settings::CoreSettings;
    use crate::store::memory::MemoryTsdb;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    fn ws_context(plugins: PluginRegistry) -> Arc<Context> {
        Context::new(
            CoreSettings::default(),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryTsdb::new()),
            plugins,
        )
    }

    fn mid_price_reducer(view: &EpochView) -> Option<Value> {
        let mean = |key: &str| {
            let series = view.current.series(key)?;
            let values: Vec<f64> = series.iter().filter_map(|v| v.as_f64()).collect();
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };
        Some(Value::Float((mean("bids")? + mean("asks")?) / 2.0))
    }

    #[tokio::test]
    async fn tick_flip_reduces_and_clears() {
        let mut plugins = PluginRegistry::new();
        plugins.register_reducer("mid_price", mid_price_reducer);
        let ctx = ws_context(plugins);

        let mut spec = minimal_ingester("trades", &["mid"]);
        spec.kind = IngesterKind::WsApi;
        spec.fields[0].reducer = Some("mid_price".into());
        let ci = crate::config::tests_support::compile_with(spec, &ctx.plugins).unwrap();

        let buffer = ctx.epoch_buffer("trades");
        for price in [10.0, 12.0] {
            buffer.append("bids", Value::Float(price));
        }
        for price in [14.0, 16.0] {
            buffer.append("asks", Value::Float(price));
        }

        let acquired = WsTickLoader.acquire(&ctx, &ci).await.unwrap();
        let Payload::Epochs(view) = acquired.payload else {
            panic!("expected epochs payload");
        };
        let mid = mid_price_reducer(&view).unwrap();
        assert_eq!(mid, Value::Float(13.0));

        // epoch buffer is empty immediately after the flip
        assert_eq!(ctx.epoch_buffer("trades").live_len(), 0);
    }

    #[tokio::test]
    async fn empty_epoch_fails_the_tick() {
        let ctx = ws_context(PluginRegistry::new());
        let mut spec = minimal_ingester("quiet", &["mid"]);
        spec.kind = IngesterKind::WsApi;
        let ci = crate::config::tests_support::compile_one(spec).unwrap();
        assert!(WsTickLoader.acquire(&ctx, &ci).await.is_err());
    }
}
