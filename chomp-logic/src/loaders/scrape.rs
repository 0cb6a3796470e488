use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{Acquired, Loader};
use crate::{
    config::CompiledIngester,
    context::Context,
    error::LoadError,
    transform::Payload,
    vitals::VitalsTimer,
};

/// Static page scraper: one GET per distinct target, selectors applied per
/// field at transform time (CSS, or XPath by leading `/`).
pub struct ScrapeLoader;

#[async_trait]
impl Loader for ScrapeLoader {
    async fn acquire(&self, ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError> {
        let targets = ci.spec.distinct_targets();
        if targets.is_empty() {
            return Err(LoadError::Payload(format!(
                "{} declares no target",
                ci.spec.name
            )));
        }

        let timer = VitalsTimer::start();
        let mut total_bytes = 0u64;
        let mut last_status = 0u16;
        let mut by_target: BTreeMap<String, Box<Payload>> = BTreeMap::new();

        for target in &targets {
            let mut request = ctx.http.get(*target);
            for (key, value) in &ci.spec.headers {
                request = request.header(key, value);
            }
            let response = request.send().await?;
            let status = response.status().as_u16();
            if !response.status().is_success() {
                return Err(LoadError::Status {
                    status,
                    url: target.to_string(),
                });
            }
            let body = response.text().await?;
            total_bytes += body.len() as u64;
            last_status = status;
            by_target.insert(target.to_string(), Box::new(Payload::Html(body)));
        }

        let payload = if by_target.len() == 1 {
            *by_target.into_values().next().unwrap()
        } else {
            Payload::ByTarget(by_target)
        };
        let vitals = timer.stop(total_bytes, last_status, ci.spec.fields.len() as u32);
        Ok(Acquired { payload, vitals })
    }
}
