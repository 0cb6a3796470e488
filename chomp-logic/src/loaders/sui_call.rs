use async_trait::async_trait;

use super::{svm_call::acquire_jsonrpc, Acquired, Loader};
use crate::{config::CompiledIngester, context::Context, error::LoadError};

/// Sui object reads through the per-chain JSON-RPC pool, same discipline
/// as the SVM caller with `sui_getObject` as the default method.
pub struct SuiCallLoader;

#[async_trait]
impl Loader for SuiCallLoader {
    async fn acquire(&self, ctx: &Context, ci: &CompiledIngester) -> Result<Acquired, LoadError> {
        acquire_jsonrpc(ctx, ci, "sui_getObject").await
    }
}
