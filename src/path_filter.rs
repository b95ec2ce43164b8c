//! Include/exclude glob filtering for file-based sources.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

/// Paths are kept when they match an include glob (or no include globs are
/// configured) and match no exclude glob. VCS and dependency directories are
/// always excluded.
#[derive(Debug, Clone)]
pub struct PathFilter {
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl PathFilter {
    pub fn new(include_globs: &[String], exclude_globs: &[String]) -> Result<Self> {
        let include = if include_globs.is_empty() {
            None
        } else {
            Some(build_globset(include_globs)?)
        };

        let mut excludes = vec!["**/.git/**".to_string(), "**/node_modules/**".to_string()];
        excludes.extend(exclude_globs.iter().cloned());

        Ok(Self {
            include,
            exclude: build_globset(&excludes)?,
        })
    }

    pub fn is_match(&self, path: &str) -> bool {
        let path = path.trim_start_matches('/');
        if self.exclude.is_match(path) {
            return false;
        }
        self.include.as_ref().map_or(true, |set| set.is_match(path))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
