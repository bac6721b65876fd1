//! Closure-based unit of work
//!
//! Lets plain async closures act as a `WorkUnit` without declaring a type.

use async_trait::async_trait;
use std::future::Future;

use super::WorkUnit;
use crate::subtask::SubtaskContext;

/// Wrapper for closure-based units of work
pub struct FnWorkUnit<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnWorkUnit<F>
where
    F: Fn(SubtaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> WorkUnit for FnWorkUnit<F>
where
    F: Fn(SubtaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: SubtaskContext) -> anyhow::Result<String> {
        (self.func)(ctx).await
    }
}
