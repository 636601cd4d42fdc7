use std::fs;
use std::path::{Path, PathBuf};

use crate::{
    config::ResolverConfig,
    core::{
        domain::ToolchainHandle, errors::ResolutionError, languages::LanguageSpec,
        traits::resolver::ToolchainResolver,
    },
};

/// Looks for toolchains in tool-cache directories first, then on the search path.
#[derive(Clone, Debug)]
pub struct NativeResolver {
    config: ResolverConfig,
}

impl NativeResolver {
    pub fn new(config: ResolverConfig) -> Self {
        NativeResolver { config }
    }

    pub fn from_env() -> Self {
        Self::new(ResolverConfig::from_env())
    }

    fn resolve_blocking(
        &self,
        language: &LanguageSpec,
    ) -> Result<ToolchainHandle, ResolutionError> {
        if !language.cache_candidates.is_empty() {
            for root in &self.config.cache_roots {
                if let Some(found) = search_cache(root, language) {
                    return Ok(found);
                }
            }
        }

        for dir in &self.config.search_path {
            if let Some(found) = usable_executable(&dir.join(&language.toolchain)) {
                return Ok(found);
            }
        }

        Err(ResolutionError::ToolNotFound {
            toolchain: language.toolchain.clone(),
        })
    }
}

#[async_trait::async_trait]
impl ToolchainResolver for NativeResolver {
    #[tracing::instrument(skip(self, language), fields(toolchain = %language.toolchain))]
    async fn resolve(&self, language: &LanguageSpec) -> Result<ToolchainHandle, ResolutionError> {
        let resolver = self.clone();
        let language = language.clone();
        let toolchain = language.toolchain.clone();

        let result = tokio::task::spawn_blocking(move || resolver.resolve_blocking(&language))
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Toolchain search task failed: {}", e);
                Err(ResolutionError::ToolNotFound { toolchain })
            });

        match &result {
            Ok(handle) => tracing::debug!("Resolved toolchain: {}", handle.path.display()),
            Err(e) => tracing::debug!("Resolution failed: {}", e),
        }
        result
    }
}

/// Depth-first walk of `root` for directories named after the toolchain.
fn search_cache(root: &Path, language: &LanguageSpec) -> Option<ToolchainHandle> {
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        if dir.file_name().is_some_and(|name| name == language.toolchain.as_str()) {
            for candidate in &language.cache_candidates {
                if let Some(found) = usable_executable(&dir.join(candidate)) {
                    return Some(found);
                }
            }
        }

        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.file_type().is_ok_and(|ft| ft.is_dir()))
            .map(|entry| entry.path())
            .collect();
        // Reverse so the stack pops children in name order.
        children.sort();
        children.reverse();
        pending.extend(children);
    }

    None
}

fn usable_executable(path: &Path) -> Option<ToolchainHandle> {
    if !path.is_file() {
        return None;
    }

    if !ensure_executable(path) {
        tracing::warn!("Skipping non-executable candidate: {}", path.display());
        return None;
    }

    // Not canonicalized: multi-call binaries dispatch on the invoked name.
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    Some(ToolchainHandle::new(path))
}

/// True when the current user may execute `path`. Missing execute bits are
/// added first; a file that stays inaccessible after that is rejected.
#[cfg(unix)]
fn ensure_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    use nix::unistd::{AccessFlags, access};

    if access(path, AccessFlags::X_OK).is_ok() {
        return true;
    }

    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let mut permissions = metadata.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    if let Err(e) = fs::set_permissions(path, permissions) {
        tracing::debug!("Cannot mark {} executable: {}", path.display(), e);
        return false;
    }

    access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> bool {
    true
}
