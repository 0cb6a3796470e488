//! Per-tick field transformation: selection over the raw payload, the
//! compiled expression chain, then coercion into the declared type.
//! Cross-resource references resolve against the latest-value cache in one
//! batched read per tick.

use std::collections::BTreeMap;

use crate::{
    cache::{keys, Cache},
    config::CompiledIngester,
    epoch::EpochView,
    error::TransformError,
    expr::EvalCtx,
    model::IngesterKind,
    plugins::PluginRegistry,
    select,
    value::Value,
};

/// Raw acquisition result handed from a loader to the transformer.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Decoded JSON document (http_api, caller RPC envelopes).
    Json(serde_json::Value),
    /// Non-JSON response body.
    Text(String),
    /// Fetched page for CSS selection.
    Html(String),
    /// One pre-selected value per field (callers, monitor).
    PerField(BTreeMap<String, Value>),
    /// Independent payloads per target; each field selects from its own.
    ByTarget(BTreeMap<String, Box<Payload>>),
    /// Decoded positional tuples, one per event log; fields map by
    /// declaration order.
    Tuples(Vec<Vec<Value>>),
    /// Frozen epoch pair for reducer-driven kinds.
    Epochs(EpochView),
    /// Nothing was acquired; processors work purely from references.
    Empty,
}

/// Resolve every `{Ingester.Field}` reference of the tick in one `mget`.
pub async fn fetch_cross_refs(
    ci: &CompiledIngester,
    cache: &dyn Cache,
    ns: &str,
) -> Result<BTreeMap<String, Value>, TransformError> {
    let ingesters: Vec<&str> = {
        let mut seen = Vec::new();
        for (ingester, _) in &ci.cross_refs {
            if !seen.contains(&ingester.as_str()) {
                seen.push(ingester.as_str());
            }
        }
        seen
    };
    if ingesters.is_empty() {
        return Ok(BTreeMap::new());
    }

    let cache_keys: Vec<String> = ingesters.iter().map(|i| keys::latest(ns, i)).collect();
    let raw = cache.mget(&cache_keys).await?;

    let mut latest_by_ingester: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    for (name, value) in ingesters.iter().zip(raw) {
        if let Some(text) = value {
            if let Ok(parsed) = serde_json::from_str(&text) {
                latest_by_ingester.insert(name, parsed);
            }
        }
    }

    let mut out = BTreeMap::new();
    for (ingester, field) in &ci.cross_refs {
        let value = latest_by_ingester
            .get(ingester.as_str())
            .and_then(|doc| doc.get(field.as_str()))
            .map(Value::from_json)
            .ok_or_else(|| TransformError::UnresolvedRef(format!("{ingester}.{field}")))?;
        out.insert(format!("{ingester}.{field}"), value);
    }
    Ok(out)
}

/// Run selection, the transformer chains and coercion for one tick.
/// Returns the full row (transient fields included), keyed by field name.
pub async fn transform_tick(
    ci: &CompiledIngester,
    payload: &Payload,
    plugins: &PluginRegistry,
    cache: &dyn Cache,
    ns: &str,
) -> Result<BTreeMap<String, Value>, TransformError> {
    let cross = fetch_cross_refs(ci, cache, ns).await?;
    transform_with_cross(ci, payload, plugins, &cross)
}

/// Same as [`transform_tick`] with pre-fetched cross references; used by
/// the logger bucket flush where many rows share one fetch.
pub fn transform_with_cross(
    ci: &CompiledIngester,
    payload: &Payload,
    plugins: &PluginRegistry,
    cross: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, TransformError> {
    let mut locals: BTreeMap<String, Value> = BTreeMap::new();

    for &idx in &ci.eval_order {
        let field = &ci.spec.fields[idx];
        let mut current = select_field(ci, idx, payload, plugins, cross)?;

        for compiled in &ci.chains[idx] {
            let ctx = EvalCtx {
                current: &current,
                locals: &locals,
                cross,
            };
            current = compiled.eval(&ctx).map_err(|e| TransformError::Eval {
                field: field.name.clone(),
                message: e.to_string(),
            })?;
        }

        let coerced = current.coerce(field.field_type(), &field.name)?;
        locals.insert(field.name.clone(), coerced);
    }

    Ok(locals)
}

fn select_field(
    ci: &CompiledIngester,
    idx: usize,
    payload: &Payload,
    plugins: &PluginRegistry,
    cross: &BTreeMap<String, Value>,
) -> Result<Value, TransformError> {
    let field = &ci.spec.fields[idx];
    let selector = field.selector.as_deref().unwrap_or("root");
    let selection_err = || TransformError::Selection {
        field: field.name.clone(),
        selector: selector.to_string(),
    };

    match payload {
        Payload::Json(doc) => select::select_json(doc, selector)
            .map(Value::from_json)
            .filter(|v| !v.is_null())
            .ok_or_else(selection_err),
        Payload::Text(text) => {
            if text.is_empty() {
                return Err(selection_err());
            }
            match selector {
                "root" | "" | "." => Ok(Value::Str(text.clone())),
                _ => Err(selection_err()),
            }
        }
        Payload::Html(html) => {
            select::select_html(html, selector, &field.name).map(Value::Str)
        }
        Payload::PerField(values) => values
            .get(&field.name)
            .cloned()
            .filter(|v| !v.is_null())
            .ok_or_else(selection_err),
        Payload::ByTarget(by_target) => {
            let target = field.target.as_deref().ok_or_else(selection_err)?;
            let inner = by_target.get(target).ok_or_else(selection_err)?;
            select_field(ci, idx, inner.as_ref(), plugins, cross)
        }
        Payload::Tuples(rows) => {
            // the last tuple stands for the tick on the single-row path;
            // the bucket flush path maps every tuple separately
            let row = rows.last().ok_or_else(selection_err)?;
            row.get(idx).cloned().ok_or_else(selection_err)
        }
        Payload::Epochs(view) => {
            let reducer_name = field.reducer.as_deref().ok_or_else(selection_err)?;
            let reducer = plugins.reducer(reducer_name).ok_or_else(selection_err)?;
            reducer(view).ok_or_else(selection_err)
        }
        Payload::Empty => {
            // processor: selector `Ingester.Field` copies a latest value,
            // otherwise the chain computes everything from references
            if ci.spec.kind == IngesterKind::Processor {
                if let Some(sel) = field.selector.as_deref() {
                    if !sel.starts_with('.') && sel.contains('.') {
                        return cross
                            .get(sel)
                            .cloned()
                            .ok_or_else(|| TransformError::UnresolvedRef(sel.to_string()));
                    }
                }
                if !ci.chains[idx].is_empty() {
                    return Ok(Value::Null);
                }
            }
            Err(selection_err())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::MemoryCache;
    use crate::config::tests_support::{compile_one, minimal_ingester};
    use crate::value::FieldType;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn http_chain_with_cross_reference() {
        let cache = MemoryCache::new();

        // A stored earlier: 1/1.0012 rounded to 6 decimals
        cache
            .set(
                "chomp:latest:A",
                r#"{"ts":"2024-01-01T00:00:00+00:00","USDT":0.998801}"#,
                None,
            )
            .await
            .unwrap();

        let mut spec = minimal_ingester("B", &["BTC"]);
        spec.fields[0].selector = Some(".p".into());
        spec.fields[0].transformers = vec!["float({self})*{A.USDT}".into(), "round2".into()];
        let ci = compile_one(spec).unwrap();

        let payload = Payload::Json(serde_json::json!({"p": "40000.5"}));
        let row = transform_tick(&ci, &payload, &PluginRegistry::new(), &cache, "chomp")
            .await
            .unwrap();
        assert_eq!(row["BTC"], Value::Float(39952.54));
    }

    #[tokio::test]
    async fn dependency_order_feeds_final_values() {
        let cache = MemoryCache::new();
        let mut spec = minimal_ingester("deps", &["double", "base"]);
        spec.fields[0].selector = Some(".ignored".into());
        spec.fields[0].transformers = vec!["{base}*2".into()];
        spec.fields[1].selector = Some(".v".into());
        spec.fields[1].transformers = vec!["round2".into()];
        let ci = compile_one(spec).unwrap();

        let payload = Payload::Json(serde_json::json!({"v": 1.005, "ignored": 0}));
        let row = transform_tick(&ci, &payload, &PluginRegistry::new(), &cache, "chomp")
            .await
            .unwrap();
        // base is rounded before double consumes it
        assert_eq!(row["base"], Value::Float(1.0));
        assert_eq!(row["double"], Value::Float(2.0));
    }

    #[tokio::test]
    async fn empty_body_is_selection_failure() {
        let cache = MemoryCache::new();
        let mut spec = minimal_ingester("feed", &["v"]);
        spec.fields[0].field_type = Some(FieldType::String);
        let ci = compile_one(spec).unwrap();

        let err = transform_tick(
            &ci,
            &Payload::Text(String::new()),
            &PluginRegistry::new(),
            &cache,
            "chomp",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransformError::Selection { .. }));
    }

    #[tokio::test]
    async fn scalar_payload_with_root_selector() {
        let cache = MemoryCache::new();
        let mut spec = minimal_ingester("feed", &["v"]);
        spec.fields[0].selector = Some("root".into());
        let ci = compile_one(spec).unwrap();

        let row = transform_tick(
            &ci,
            &Payload::Json(serde_json::json!(1.25)),
            &PluginRegistry::new(),
            &cache,
            "chomp",
        )
        .await
        .unwrap();
        assert_eq!(row["v"], Value::Float(1.25));
    }

    #[tokio::test]
    async fn coercion_failure_is_reported_with_field() {
        let cache = MemoryCache::new();
        let mut spec = minimal_ingester("feed", &["v"]);
        spec.fields[0].selector = Some(".v".into());
        spec.fields[0].field_type = Some(FieldType::Uint32);
        let ci = compile_one(spec).unwrap();

        let err = transform_tick(
            &ci,
            &Payload::Json(serde_json::json!({"v": -5})),
            &PluginRegistry::new(),
            &cache,
            "chomp",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransformError::Coercion { field, .. } if field == "v"));
    }

    #[tokio::test]
    async fn missing_cross_reference_fails_tick() {
        let cache = MemoryCache::new();
        let mut spec = minimal_ingester("B", &["BTC"]);
        spec.fields[0].selector = Some(".p".into());
        spec.fields[0].transformers = vec!["float({self})*{A.USDT}".into()];
        let ci = compile_one(spec).unwrap();

        let err = transform_tick(
            &ci,
            &Payload::Json(serde_json::json!({"p": 1})),
            &PluginRegistry::new(),
            &cache,
            "chomp",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransformError::UnresolvedRef(r) if r == "A.USDT"));
    }

    #[tokio::test]
    async fn processor_copies_latest_via_selector() {
        let cache = MemoryCache::new();
        cache
            .set("chomp:latest:A", r#"{"USDT":0.99}"#, None)
            .await
            .unwrap();

        let mut spec = minimal_ingester("proc", &["copy"]);
        spec.kind = IngesterKind::Processor;
        spec.fields[0].selector = Some("A.USDT".into());
        let ci = compile_one(spec).unwrap();

        let row = transform_tick(&ci, &Payload::Empty, &PluginRegistry::new(), &cache, "chomp")
            .await
            .unwrap();
        assert_eq!(row["copy"], Value::Float(0.99));
    }
}
