use std::time::Duration;

use crate::core::{
    domain::ToolchainHandle, errors::ResolutionError, languages::LanguageSpec,
    traits::resolver::ToolchainResolver,
};

/// Resolver answering every language with one fixed result after `delay`.
#[derive(Debug, Clone)]
pub struct ResolverStub {
    result: Result<ToolchainHandle, ResolutionError>,
    delay: Duration,
}

impl ResolverStub {
    pub fn new(result: Result<ToolchainHandle, ResolutionError>, delay: Duration) -> Self {
        Self { result, delay }
    }
}

#[async_trait::async_trait]
impl ToolchainResolver for ResolverStub {
    #[tracing::instrument]
    async fn resolve(&self, language: &LanguageSpec) -> Result<ToolchainHandle, ResolutionError> {
        tracing::debug!("Start resolution: language={:?}", language.name);
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Resolution result: {:?}", self.result);

        self.result.clone()
    }
}
