use async_trait::async_trait;

use super::{Acquired, Loader};
use crate::{
    config::CompiledIngester,
    context::Context,
    error::LoadError,
    transform::Payload,
    vitals::VitalsTimer,
};

/// Processors acquire nothing: their dependency set is derived from the
/// `{Ingester.Field}` references in their transformers (and dotted
/// selectors), all read from the latest-value cache at transform time.
/// Target and selector paths are ignored.
pub struct ProcessorLoader;

#[async_trait]
impl Loader for ProcessorLoader {
    async fn acquire(&self, _ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError> {
        let timer = VitalsTimer::start();
        let vitals = timer.stop(0, 0, ci.spec.fields.len() as u32);
        Ok(Acquired {
            payload: Payload::Empty,
            vitals,
        })
    }
}
