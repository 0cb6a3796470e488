mod settings;

use std::sync::Arc;

use anyhow::Context as _;
use chomp_logic::{
    cache::{memory::MemoryCache, redis::RedisCache, Cache},
    store::{memory::MemoryTsdb, Tsdb},
    Context, IngesterConfig, PluginRegistry, Scheduler,
};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::settings::Settings;

fn init_logs(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();
}

async fn connect_cache(settings: &Settings) -> anyhow::Result<Arc<dyn Cache>> {
    if settings.redis_url == "memory" {
        return Ok(Arc::new(MemoryCache::new()));
    }
    let cache = RedisCache::connect(&settings.redis_url)
        .await
        .context("connecting cache")?;
    Ok(Arc::new(cache))
}

fn connect_tsdb(settings: &Settings) -> anyhow::Result<Arc<dyn Tsdb>> {
    match settings.tsdb_adapter.as_str() {
        "memory" => Ok(Arc::new(MemoryTsdb::new())),
        other => anyhow::bail!(
            "tsdb adapter '{other}' is not linked into this build; \
             provide it through the Tsdb seam"
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::build()?;
    init_logs(settings.verbose);

    let paths = settings.config_paths();
    let Some(first) = paths.first() else {
        anyhow::bail!("INGESTER_CONFIGS names no configuration file");
    };
    if paths.len() > 1 {
        tracing::warn!(
            extra = paths.len() - 1,
            "an instance serves one namespace; extra configuration paths ignored"
        );
    }

    let yaml = std::fs::read_to_string(first)
        .with_context(|| format!("reading ingester config {first}"))?;
    let plugins = PluginRegistry::new();
    let config = IngesterConfig::from_yaml(&yaml, &plugins)?;
    tracing::info!(
        path = %first,
        ingesters = config.ingesters.len(),
        "configuration loaded"
    );

    let cache = connect_cache(&settings).await?;
    let tsdb = connect_tsdb(&settings)?;
    let ctx = Context::new(settings.core(), cache, tsdb, plugins);

    let scheduler = Scheduler::new(ctx, config);
    tokio::select! {
        result = scheduler.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            scheduler.shutdown().await;
        }
    }
    Ok(())
}
