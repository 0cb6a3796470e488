//! Clustered tick scheduling: one loop per ingester over epoch-aligned
//! boundaries, a process-wide worker pool bounded by `max_jobs`, and the
//! long-lived side tasks (websocket readers, perpetual log subscriptions)
//! whose lifetime is independent of the tick pool.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::{
    config::{CompiledIngester, IngesterConfig},
    context::Context,
    error::ConfigError,
    interval::tick_stream,
    loaders,
    model::IngesterKind,
    pipeline, registry,
};

pub struct Scheduler {
    ctx: Arc<Context>,
    ingesters: Vec<Arc<CompiledIngester>>,
    jobs: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(ctx: Arc<Context>, config: IngesterConfig) -> Self {
        let jobs = Arc::new(Semaphore::new(ctx.settings.max_jobs.max(1)));
        Self {
            ctx,
            ingesters: config.ingesters.into_iter().map(Arc::new).collect(),
            jobs,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register the namespace and spawn every loop. Returns once all tasks
    /// are running; failures here are startup failures.
    pub async fn start(&self) -> Result<(), ConfigError> {
        let specs: Vec<_> = self.ingesters.iter().map(|ci| ci.spec.clone()).collect();
        registry::register_all(
            self.ctx.cache.as_ref(),
            &self.ctx.settings.namespace,
            &self.ctx.settings.instance_id,
            &specs,
        )
        .await?;

        let mut handles = self.handles.lock().await;
        for ci in &self.ingesters {
            match ci.spec.kind {
                IngesterKind::WsApi => {
                    // message receipt is connection-scoped, not tick-scoped
                    for target in ci.spec.distinct_targets() {
                        let task = loaders::ws::run_connection(
                            self.ctx.clone(),
                            ci.as_ref().clone(),
                            target.to_string(),
                        );
                        handles.push(tokio::spawn(task));
                    }
                }
                IngesterKind::EvmLogger if self.ctx.settings.perpetual_indexing => {
                    let task =
                        loaders::evm_log::run_perpetual(self.ctx.clone(), ci.as_ref().clone());
                    handles.push(tokio::spawn(task));
                }
                _ => {}
            }

            handles.push(tokio::spawn(tick_loop(
                self.ctx.clone(),
                ci.clone(),
                self.jobs.clone(),
            )));
            tracing::info!(
                name = %ci.spec.name,
                kind = ci.spec.kind.as_str(),
                interval = %ci.spec.interval,
                fields = ci.spec.fields.len(),
                "scheduled for ingestion"
            );
        }
        Ok(())
    }

    /// Run until externally cancelled; the binary selects this against a
    /// shutdown signal.
    pub async fn run(&self) -> Result<(), ConfigError> {
        self.start().await?;
        futures::future::pending::<()>().await;
        Ok(())
    }

    /// Cancel every loop and in-flight tick task.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        tracing::info!("scheduler stopped");
    }
}

async fn tick_loop(ctx: Arc<Context>, ci: Arc<CompiledIngester>, jobs: Arc<Semaphore>) {
    let mut ticks = Box::pin(tick_stream(ci.spec.interval));
    while let Some(tick) = ticks.next().await {
        let Ok(permit) = jobs.clone().acquire_owned().await else {
            return;
        };
        let ctx = ctx.clone();
        let ci = ci.clone();
        tokio::spawn(async move {
            let _permit = permit;
            pipeline::run_tick_with_retries(ctx, ci, tick).await;
        });
    }
}
