//! WebSocket reduce scenario: trade messages accumulate in the epoch
//! buffer during a tick; at the boundary the reducer collapses the frozen
//! epoch into one row and the buffer starts empty.

use std::sync::Arc;

use chomp_logic::{
    cache::memory::MemoryCache,
    config::IngesterConfig,
    epoch::EpochView,
    pipeline,
    store::memory::MemoryTsdb,
    Context, CoreSettings, Interval, PluginRegistry, Value,
};
use chrono::Utc;
use pretty_assertions::assert_eq;

fn trades_handler(msg: &serde_json::Value, epoch: &mut chomp_logic::epoch::Epoch) {
    let Some(price) = msg.get("price").and_then(|p| p.as_f64()) else {
        return;
    };
    match msg.get("side").and_then(|s| s.as_str()) {
        Some("buy") => epoch.push("bids", Value::Float(price)),
        Some("sell") => epoch.push("asks", Value::Float(price)),
        _ => {}
    }
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
async fn epoch_reduces_to_one_row_and_clears() {
    let mut plugins = PluginRegistry::new();
    plugins.register_handler("trades", trades_handler);
    plugins.register_reducer("mid_price", mid_price_reducer);

    let yaml = r#"
ws_api:
  - name: book
    interval: s30
    resource_type: timeseries
    target: wss://stream.example.com/trades
    handler: trades
    fields:
      - name: mid
        type: float64
        reducer: mid_price
"#;
    let config = IngesterConfig::from_yaml(yaml, &plugins).unwrap();
    let tsdb = Arc::new(MemoryTsdb::new());
    let ctx = Context::new(
        CoreSettings::default(),
        Arc::new(MemoryCache::new()),
        tsdb.clone(),
        plugins,
    );

    // 18 messages during the tick: 10 buys, 8 sells
    let buffer = ctx.epoch_buffer("book");
    for i in 0..10 {
        let msg = serde_json::json!({"side": "buy", "price": 100.0 + i as f64});
        buffer.apply(|epoch| trades_handler(&msg, epoch));
    }
    for i in 0..8 {
        let msg = serde_json::json!({"side": "sell", "price": 110.0 + i as f64});
        buffer.apply(|epoch| trades_handler(&msg, epoch));
    }

    let tick = Interval::s30.floor_tick(Utc::now());
    let ci = Arc::new(config.ingesters[0].clone());
    pipeline::run_tick(&ctx, &ci, tick).await.unwrap();

    // one row at the boundary: (mean(bids) + mean(asks)) / 2
    let rows = tsdb.rows("book");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, tick);
    assert_eq!(rows[0].1, vec![Value::Float((104.5 + 113.5) / 2.0)]);

    // the epoch buffer is empty immediately after
    assert_eq!(ctx.epoch_buffer("book").live_len(), 0);
}

#[tokio::test]
async fn quiet_tick_fails_without_claiming_next() {
    let mut plugins = PluginRegistry::new();
    plugins.register_handler("trades", trades_handler);
    plugins.register_reducer("mid_price", mid_price_reducer);

    let yaml = r#"
ws_api:
  - name: quiet
    interval: s30
    target: wss://stream.example.com/trades
    handler: trades
    fields:
      - name: mid
        reducer: mid_price
"#;
    let config = IngesterConfig::from_yaml(yaml, &plugins).unwrap();
    let tsdb = Arc::new(MemoryTsdb::new());
    let ctx = Context::new(
        CoreSettings::default(),
        Arc::new(MemoryCache::new()),
        tsdb.clone(),
        plugins,
    );

    let tick = Interval::s30.floor_tick(Utc::now());
    let ci = Arc::new(config.ingesters[0].clone());
    assert!(pipeline::run_tick(&ctx, &ci, tick).await.is_err());
    assert_eq!(tsdb.row_count("quiet"), 0);
}
