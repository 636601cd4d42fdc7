use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::fs;

use crate::{
    constants::WORKSPACE_PREFIX,
    core::{errors::WorkspaceError, languages::LanguageSpec},
};

#[derive(Clone, Debug, Default)]
pub struct WorkspaceManager {
    root: Option<PathBuf>,
}

impl WorkspaceManager {
    pub fn new(root: Option<PathBuf>) -> Self {
        WorkspaceManager { root }
    }

    /// Creates a fresh, uniquely named directory for one run.
    #[tracing::instrument(skip(self, language), fields(language = %language.name))]
    pub fn create(&self, language: &LanguageSpec) -> Result<Workspace, WorkspaceError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(WORKSPACE_PREFIX);

        let dir = match &self.root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(WorkspaceError::Create)?;

        let script_path = dir.path().join(language.script_file_name());
        tracing::debug!("Created workspace: {}", dir.path().display());

        Ok(Workspace {
            dir: Some(dir),
            script_path,
        })
    }
}

/// Temp directory owning one script file. Removed by [`Workspace::destroy`]
/// or, failing that, on drop.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    script_path: PathBuf,
}

impl Workspace {
    pub fn dir(&self) -> &Path {
        self.script_path.parent().unwrap_or(&self.script_path)
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub async fn write_script(&self, source: &str) -> Result<(), WorkspaceError> {
        fs::write(&self.script_path, source)
            .await
            .map_err(|source| WorkspaceError::Write {
                path: self.script_path.clone(),
                source,
            })
    }

    /// Best-effort removal; failures are logged and swallowed.
    pub fn destroy(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => tracing::debug!("Removed workspace: {}", path.display()),
            Err(e) => tracing::warn!("Failed to remove workspace {}: {}", path.display(), e),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.remove();
    }
}
