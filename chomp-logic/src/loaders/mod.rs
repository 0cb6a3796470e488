//! Kind-specific data acquisition. Every loader implements the same seam:
//! `acquire(ctx, ingester) -> (raw payload, request vitals)`; the scheduler
//! dispatches on the ingester kind.

mod evm_call;
pub mod evm_log;
mod http;
mod monitor;
mod process;
mod scrape;
mod sui_call;
mod svm_call;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::CompiledIngester,
    context::Context,
    error::LoadError,
    model::IngesterKind,
    transform::Payload,
    vitals::RequestVitals,
};

pub struct Acquired {
    pub payload: Payload,
    pub vitals: RequestVitals,
}

#[async_trait]
pub trait Loader: Send + Sync {
    async fn acquire(&self, ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError>;
}

pub fn loader_for(kind: IngesterKind) -> Arc<dyn Loader> {
    match kind {
        IngesterKind::HttpApi => Arc::new(http::HttpLoader),
        IngesterKind::Scraper => Arc::new(scrape::ScrapeLoader),
        IngesterKind::WsApi => Arc::new(ws::WsTickLoader),
        IngesterKind::EvmCaller => Arc::new(evm_call::EvmCallLoader),
        IngesterKind::EvmLogger => Arc::new(evm_log::EvmLogLoader),
        IngesterKind::SvmCaller => Arc::new(svm_call::SvmCallLoader),
        IngesterKind::SuiCaller => Arc::new(sui_call::SuiCallLoader),
        IngesterKind::Processor => Arc::new(process::ProcessorLoader),
        IngesterKind::Monitor => Arc::new(monitor::MonitorLoader),
    }
}
