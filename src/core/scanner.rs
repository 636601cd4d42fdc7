use itertools::Itertools;
use regex::Regex;

use crate::core::{domain::DiagnosticLocation, languages::LanguageRegistry};

/// Finds `<file>.<ext>:<line>:<col>:` locations in compiler output.
///
/// The pattern accepts the extension of every registered language. Extensions
/// are assumed to be disjoint, so a match is never ambiguous about which
/// language produced it; the scanner only reports the position anyway.
#[derive(Clone, Debug)]
pub struct DiagnosticScanner {
    pattern: Option<Regex>,
}

impl DiagnosticScanner {
    pub fn new<'a, I>(extensions: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let alternatives = extensions
            .into_iter()
            .filter(|ext| !ext.is_empty())
            .map(regex::escape)
            .join("|");

        if alternatives.is_empty() {
            return DiagnosticScanner { pattern: None };
        }

        // Built from escaped literals, so the pattern is always valid.
        let pattern = Regex::new(&format!(r"\.(?:{}):(\d+):(\d+):", alternatives)).ok();
        DiagnosticScanner { pattern }
    }

    pub fn from_registry(registry: &LanguageRegistry) -> Self {
        Self::new(registry.extensions())
    }

    /// Never fails: lines without a usable location yield `None`, including
    /// ones whose numbers are zero or do not fit in `u32`.
    pub fn scan(&self, line: &str) -> Option<DiagnosticLocation> {
        let pattern = self.pattern.as_ref()?;

        pattern.captures_iter(line).find_map(|caps| {
            let line = caps.get(1)?.as_str().parse::<u32>().ok()?;
            let column = caps.get(2)?.as_str().parse::<u32>().ok()?;
            (line > 0 && column > 0).then_some(DiagnosticLocation { line, column })
        })
    }
}

impl Default for DiagnosticScanner {
    fn default() -> Self {
        Self::from_registry(&LanguageRegistry::builtin())
    }
}
