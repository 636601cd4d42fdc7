use std::path::Path;

use crate::{
    constants::{SCRIPT_FILE_STEM, SCRIPT_PLACEHOLDER},
    core::errors::LanguageError,
};

/// How to materialize and launch scripts of one language.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageSpec {
    pub name: String,
    /// Script file extension without the leading dot.
    pub extension: String,
    /// Canonical executable name, also the tool-cache directory name.
    pub toolchain: String,
    /// Executable paths tried inside a tool-cache directory named `toolchain`.
    pub cache_candidates: Vec<String>,
    /// Launch arguments; `{script}` is replaced with the script path.
    pub launch_args: Vec<String>,
}

impl LanguageSpec {
    pub fn new(name: &str, extension: &str, toolchain: &str) -> Self {
        LanguageSpec {
            name: name.to_string(),
            extension: extension.to_string(),
            toolchain: toolchain.to_string(),
            cache_candidates: Vec::new(),
            launch_args: vec![SCRIPT_PLACEHOLDER.to_string()],
        }
    }

    pub fn with_cache_candidates(mut self, candidates: &[&str]) -> Self {
        self.cache_candidates = candidates.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_launch_args(mut self, args: &[&str]) -> Self {
        self.launch_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn kotlin() -> Self {
        LanguageSpec::new("kotlin", "kts", "kotlinc")
            .with_cache_candidates(&["bin/kotlinc", "bin/kotlinc-jvm"])
            .with_launch_args(&["-script", SCRIPT_PLACEHOLDER])
    }

    pub fn swift() -> Self {
        LanguageSpec::new("swift", "swift", "swift")
    }

    pub fn script_file_name(&self) -> String {
        format!("{}.{}", SCRIPT_FILE_STEM, self.extension)
    }

    pub fn launch_args(&self, script: &Path) -> Vec<String> {
        let script = script.to_string_lossy();
        self.launch_args
            .iter()
            .map(|arg| arg.replace(SCRIPT_PLACEHOLDER, &script))
            .collect()
    }
}

/// Ordered table of supported languages.
#[derive(Clone, Debug)]
pub struct LanguageRegistry {
    languages: Vec<LanguageSpec>,
}

impl LanguageRegistry {
    pub fn empty() -> Self {
        LanguageRegistry {
            languages: Vec::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(LanguageSpec::kotlin());
        registry.register(LanguageSpec::swift());
        registry
    }

    /// Adds `spec`, replacing any language registered under the same name.
    pub fn register(&mut self, spec: LanguageSpec) {
        match self
            .languages
            .iter_mut()
            .find(|l| l.name.eq_ignore_ascii_case(&spec.name))
        {
            Some(existing) => *existing = spec,
            None => self.languages.push(spec),
        }
    }

    pub fn get(&self, name: &str) -> Result<&LanguageSpec, LanguageError> {
        self.languages
            .iter()
            .find(|l| l.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| LanguageError::Unsupported(name.to_string()))
    }

    pub fn by_extension(&self, extension: &str) -> Option<&LanguageSpec> {
        let extension = extension.trim_start_matches('.');
        self.languages.iter().find(|l| l.extension == extension)
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.languages.iter().map(|l| l.extension.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LanguageSpec> {
        self.languages.iter()
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
