// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Which absolute paths belong to the remote filesystem.

use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Ordered set of absolute path prefixes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    prefixes: Vec<PathBuf>,
}

impl Scope {
    pub fn new<I, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut scope = Scope::default();
        for prefix in prefixes {
            let prefix = prefix.as_ref();
            match normalize(prefix) {
                Some(normalized) => {
                    if !scope.prefixes.contains(&normalized) {
                        scope.prefixes.push(normalized);
                    }
                }
                None => warn!(prefix = %prefix.display(), "ignoring relative scope prefix"),
            }
        }
        scope
    }

    /// Parse a comma-separated prefix list such as `/app,/data`.
    pub fn parse(value: &str) -> Self {
        Self::new(value.split(',').map(str::trim).filter(|s| !s.is_empty()))
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn prefixes(&self) -> &[PathBuf] {
        &self.prefixes
    }

    /// Normalized form of `path` when it lies inside the scope.
    pub fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let normalized = normalize(path)?;
        self.prefixes
            .iter()
            .any(|prefix| normalized.starts_with(prefix))
            .then_some(normalized)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.resolve(path).is_some()
    }
}

/// Lexically normalize an absolute path: collapse repeated separators,
/// drop `.` and apply `..` without touching the filesystem. `..` at the root
/// stays at the root. Relative paths yield `None`.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Some(normalized)
}
