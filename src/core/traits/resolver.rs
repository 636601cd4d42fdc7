use crate::core::{domain::ToolchainHandle, errors::ResolutionError, languages::LanguageSpec};

#[mockall::automock]
#[async_trait::async_trait]
pub trait ToolchainResolver: std::fmt::Debug + Send + Sync {
    async fn resolve(&self, language: &LanguageSpec) -> Result<ToolchainHandle, ResolutionError>;
}
