//! The parser seam and glob filtering

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::delta::GraphDelta;
use crate::error::{IngestError, Result};

/// What a parser is asked to process
#[derive(Debug, Clone)]
pub struct ParseRequest {
    /// Absolute source root
    pub root: PathBuf,
    /// Include globs, relative to the root
    pub include: Vec<String>,
    /// Exclude globs, relative to the root
    pub exclude: Vec<String>,
    /// When set, restrict parsing to these files (absolute paths);
    /// when `None`, parse the whole root
    pub changed: Option<HashSet<PathBuf>>,
}

/// Turns source files into a graph delta
///
/// Implementations are adapters per source kind; the built-in
/// [`crate::ScopeParser`] handles code. A parser never touches the graph:
/// it only describes what the graph should contain for the files it saw.
#[async_trait]
pub trait SourceParser: Send + Sync {
    /// Adapter name, matched against `source.adapter` in the config
    fn name(&self) -> &str;

    /// Parse the requested files into a delta
    async fn parse(&self, request: &ParseRequest) -> Result<GraphDelta>;
}

/// Compiled include/exclude globs
pub struct GlobFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl GlobFilter {
    /// Compile the glob lists
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Glob` on any malformed pattern.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: Self::build(include)?,
            exclude: Self::build(exclude)?,
        })
    }

    fn build(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(
                Glob::new(pattern).map_err(|e| IngestError::Glob(format!("{pattern}: {e}")))?,
            );
        }
        builder
            .build()
            .map_err(|e| IngestError::Glob(e.to_string()))
    }

    /// Whether a root-relative path should be ingested
    #[must_use]
    pub fn matches(&self, relative: &Path) -> bool {
        if self.exclude.is_match(relative) {
            return false;
        }
        self.include.is_empty() || self.include.is_match(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_exclude_precedence() {
        let filter = GlobFilter::new(
            &["**/*.rs".to_string()],
            &["**/target/**".to_string()],
        )
        .unwrap();

        assert!(filter.matches(Path::new("src/main.rs")));
        assert!(!filter.matches(Path::new("target/debug/main.rs")));
        assert!(!filter.matches(Path::new("README.md")));
    }

    #[test]
    fn test_empty_include_matches_everything_not_excluded() {
        let filter = GlobFilter::new(&[], &["**/*.log".to_string()]).unwrap();
        assert!(filter.matches(Path::new("anything.txt")));
        assert!(!filter.matches(Path::new("daemon.log")));
    }

    #[test]
    fn test_bad_glob_is_rejected() {
        assert!(GlobFilter::new(&["[".to_string()], &[]).is_err());
    }
}
