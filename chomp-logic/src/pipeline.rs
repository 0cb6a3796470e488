//! One scheduled tick: probability gate, cluster claim, load → transform →
//! store+publish in strict order, registry bookkeeping. Transient errors
//! retry within the tick budget; the claim is never deleted, it expires.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    cache::keys,
    config::CompiledIngester,
    context::Context,
    error::TickError,
    loaders,
    model::IngesterKind,
    registry,
    transform::{self, Payload},
    value::Value,
};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ClaimRecord {
    owner: String,
    tick: i64,
}

/// Claim `(ingester, tick)` for this process. Ownership is exclusive per
/// tick; a leftover record from an older tick is taken over, and our own
/// record from a retry within the same tick passes.
async fn claim(ctx: &Context, ci: &CompiledIngester, tick: DateTime<Utc>) -> Result<(), TickError> {
    let key = keys::claim(&ctx.settings.namespace, &ci.spec.name);
    let tick_index = ci.spec.interval.tick_index(tick);
    let record = serde_json::to_string(&ClaimRecord {
        owner: ctx.settings.instance_id.clone(),
        tick: tick_index,
    })
    .expect("claim record serializes");
    let ttl = ci.spec.interval.deadline();

    if ctx
        .cache
        .set_if_absent(&key, &record, Some(ttl))
        .await
        .map_err(TickError::Cache)?
    {
        return Ok(());
    }

    let existing = ctx.cache.get(&key).await.map_err(TickError::Cache)?;
    match existing.and_then(|raw| serde_json::from_str::<ClaimRecord>(&raw).ok()) {
        Some(current) if current.owner == ctx.settings.instance_id && current.tick == tick_index => {
            Ok(())
        }
        Some(current) if current.tick < tick_index => {
            // stale claim from an earlier tick: take over
            ctx.cache
                .set(&key, &record, Some(ttl))
                .await
                .map_err(TickError::Cache)?;
            Ok(())
        }
        _ => Err(TickError::ClaimLost),
    }
}

/// Execute one tick end-to-end. Returns `Skipped`/`ClaimLost` as silent
/// no-ops; any other error counts as a failed attempt.
pub async fn run_tick(
    ctx: &Arc<Context>,
    ci: &CompiledIngester,
    tick: DateTime<Utc>,
) -> Result<(), TickError> {
    if ci.spec.probability < 1.0 {
        let draw: f64 = rand::thread_rng().gen();
        if draw >= ci.spec.probability {
            return Err(TickError::Skipped);
        }
    }

    claim(ctx, ci, tick).await?;

    let loader = loaders::loader_for(ci.spec.kind);
    let deadline = ci.spec.interval.deadline();
    let acquired = tokio::time::timeout(deadline, loader.acquire(ctx, ci))
        .await
        .map_err(|_| TickError::Load(crate::error::LoadError::Deadline(deadline)))??;

    ctx.vitals.insert(ci.spec.name.clone(), acquired.vitals.clone());

    match &acquired.payload {
        Payload::Tuples(rows) => store_tuples(ctx, ci, tick, rows).await?,
        payload => {
            let values =
                transform::transform_tick(ci, payload, &ctx.plugins, ctx.cache.as_ref(), &ctx.settings.namespace)
                    .await?;
            ctx.store.store_row(&ci.spec, tick, &values).await?;
        }
    }

    if ctx.settings.monitored && ci.spec.kind != IngesterKind::Monitor {
        store_monitor_row(ctx, ci, tick, &acquired.vitals).await?;
    }

    registry::mark_success(
        ctx.cache.as_ref(),
        &ctx.settings.namespace,
        &ci.spec,
        &ctx.settings.instance_id,
        tick,
    )
    .await
    .map_err(TickError::Cache)?;

    tracing::debug!(
        name = %ci.spec.name,
        interval = %ci.spec.interval,
        tick = %tick,
        "tick stored"
    );
    Ok(())
}

/// Logger payloads carry zero or more decoded tuples; each becomes one
/// transformed row at the tick boundary. An empty poll is a successful,
/// row-less tick.
async fn store_tuples(
    ctx: &Arc<Context>,
    ci: &CompiledIngester,
    tick: DateTime<Utc>,
    rows: &[Vec<Value>],
) -> Result<(), TickError> {
    if rows.is_empty() {
        return Ok(());
    }
    let cross =
        transform::fetch_cross_refs(ci, ctx.cache.as_ref(), &ctx.settings.namespace).await?;

    let mut transformed = Vec::with_capacity(rows.len());
    for row in rows {
        let per_field: BTreeMap<String, Value> = ci
            .spec
            .fields
            .iter()
            .enumerate()
            .filter_map(|(i, f)| row.get(i).map(|v| (f.name.clone(), v.clone())))
            .collect();
        let payload = Payload::PerField(per_field);
        transformed.push(transform::transform_with_cross(
            ci,
            &payload,
            &ctx.plugins,
            &cross,
        )?);
    }

    // series tables take every event; keyed resources keep one row per
    // tick, fed by the newest event
    if ci.spec.resource_type == crate::model::ResourceType::Series {
        ctx.store.store_rows(&ci.spec, tick, &transformed).await?;
    } else if let Some(last) = transformed.last() {
        ctx.store.store_row(&ci.spec, tick, last).await?;
    }
    Ok(())
}

async fn store_monitor_row(
    ctx: &Arc<Context>,
    ci: &CompiledIngester,
    tick: DateTime<Utc>,
    vitals: &crate::vitals::RequestVitals,
) -> Result<(), TickError> {
    let process = crate::vitals::process_vitals();
    ctx.store
        .store_sibling_monitor(&ci.spec.name, tick, vitals, &process)
        .await
        .map_err(TickError::Store)?;
    Ok(())
}

/// Tick entry point with the per-tick retry budget: transient failures
/// retry after a cooldown with jitter; exhaustion (or a terminal error)
/// marks the ingester unhealthy and abandons the tick. The ingester
/// resumes on its next tick.
pub async fn run_tick_with_retries(ctx: Arc<Context>, ci: Arc<CompiledIngester>, tick: DateTime<Utc>) {
    let budget = ctx.settings.max_retries.max(1);

    for attempt in 0..budget {
        match run_tick(&ctx, &ci, tick).await {
            Ok(()) => return,
            Err(TickError::Skipped) | Err(TickError::ClaimLost) => return,
            Err(err) => {
                tracing::error!(
                    name = %ci.spec.name,
                    tick = %tick,
                    attempt,
                    error = %err,
                    "tick attempt failed"
                );
                let fail = registry::mark_failure(
                    ctx.cache.as_ref(),
                    &ctx.settings.namespace,
                    &ci.spec,
                    &err.to_string(),
                )
                .await;
                if let Err(record_err) = fail {
                    tracing::warn!(name = %ci.spec.name, error = %record_err, "health record update failed");
                }

                if !err.is_transient() || attempt + 1 == budget {
                    tracing::warn!(name = %ci.spec.name, tick = %tick, "tick abandoned");
                    return;
                }
                let jitter = rand::thread_rng()
                    .gen_range(0..ctx.settings.retry_cooldown.as_millis().max(2) as u64 / 2);
                let cooldown = ctx.settings.retry_cooldown + std::time::Duration::from_millis(jitter);
                tokio::time::sleep(cooldown).await;
            }
        }
    }
}
