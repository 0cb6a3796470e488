//! Cluster registry of ingester specs and runtime health, kept in the
//! shared cache. Registration happens once at startup under the
//! `locks:ingesters` lock; the claim owner refreshes its record after
//! every successful store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    cache::{keys, with_lock, Cache},
    error::{CacheError, ConfigError},
    model::{Ingester, IngesterRecord, IngesterStatus},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub spec: Ingester,
    pub record: IngesterRecord,
}

/// Register the local namespace. A pre-existing record with the same name
/// but a different spec hash means two processes disagree on what the
/// ingester is; the operator must reconcile, so startup fails loudly.
pub async fn register_all(
    cache: &dyn Cache,
    ns: &str,
    instance_id: &str,
    ingesters: &[Ingester],
) -> Result<(), ConfigError> {
    let lock_key = keys::registry_lock(ns);
    with_lock(cache, &lock_key, instance_id, || async {
        for ingester in ingesters {
            let key = keys::registry(ns, &ingester.name);
            let ours = ingester.spec_hash();

            if let Some(existing) = cache.get(&key).await.map_err(ConfigError::from)? {
                if let Ok(entry) = serde_json::from_str::<RegistryEntry>(&existing) {
                    if entry.record.spec_hash != ours {
                        tracing::error!(
                            name = %ingester.name,
                            theirs = %entry.record.spec_hash,
                            ours = %ours,
                            "conflicting registration"
                        );
                        return Err(ConfigError::SpecConflict {
                            name: ingester.name.clone(),
                            theirs: entry.record.spec_hash.clone(),
                            ours,
                        });
                    }
                }
            }

            let entry = RegistryEntry {
                spec: ingester.clone(),
                record: IngesterRecord {
                    spec_hash: ours,
                    status: IngesterStatus::Pending,
                    owner: Some(instance_id.to_string()),
                    ..Default::default()
                },
            };
            let serialized = serde_json::to_string(&entry).map_err(CacheError::from)?;
            cache.set(&key, &serialized, None).await.map_err(ConfigError::from)?;
            tracing::info!(name = %ingester.name, interval = %ingester.interval, "registered ingester");
        }
        Ok(())
    })
    .await
}

/// Refresh the runtime half of a registry record after a tick.
pub async fn update_record(
    cache: &dyn Cache,
    ns: &str,
    ingester: &Ingester,
    apply: impl FnOnce(&mut IngesterRecord),
) -> Result<(), CacheError> {
    let key = keys::registry(ns, &ingester.name);
    let mut entry = match cache.get(&key).await? {
        Some(raw) => serde_json::from_str::<RegistryEntry>(&raw)?,
        None => RegistryEntry {
            spec: ingester.clone(),
            record: IngesterRecord {
                spec_hash: ingester.spec_hash(),
                ..Default::default()
            },
        },
    };
    apply(&mut entry.record);
    cache.set(&key, &serde_json::to_string(&entry)?, None).await
}

pub async fn mark_success(
    cache: &dyn Cache,
    ns: &str,
    ingester: &Ingester,
    instance_id: &str,
    tick: DateTime<Utc>,
) -> Result<(), CacheError> {
    update_record(cache, ns, ingester, |record| {
        record.status = IngesterStatus::Healthy;
        record.owner = Some(instance_id.to_string());
        record.last_tick = Some(tick);
        record.last_ingested = Some(Utc::now());
        record.last_error = None;
        record.consecutive_failures = 0;
    })
    .await?;
    cache
        .incr(&keys::counter(ns, &ingester.name, "success"))
        .await?;
    Ok(())
}

pub async fn mark_failure(
    cache: &dyn Cache,
    ns: &str,
    ingester: &Ingester,
    error: &str,
) -> Result<(), CacheError> {
    update_record(cache, ns, ingester, |record| {
        record.status = IngesterStatus::Unhealthy;
        record.last_error = Some(error.to_string());
        record.consecutive_failures += 1;
    })
    .await?;
    cache
        .incr(&keys::counter(ns, &ingester.name, "retry"))
        .await?;
    Ok(())
}

pub async fn read_record(
    cache: &dyn Cache,
    ns: &str,
    name: &str,
) -> Result<Option<RegistryEntry>, CacheError> {
    match cache.get(&keys::registry(ns, name)).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}
