//! Identity registry derived from corpus filenames.
//!
//! Corpus files are named `<name>.<id>.<sequence>.<ext>`. The registry maps
//! each integer ID to its display name and is built once per run.

use crate::corpus::{self, ExtensionFilter};
use crate::types::IdentityId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed corpus filename {0:?}: expected <name>.<id>.<sequence>.<ext>")]
    MalformedFilename(String),
}

/// Name and ID recovered from one corpus filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub name: String,
    pub id: IdentityId,
}

/// Parse `<name>.<id>...` from a bare file name.
///
/// Only the first two dot-separated tokens matter; the name must be
/// non-empty and the ID must be an integer.
pub fn parse_file_name(file_name: &str) -> Result<ParsedName, IdentityError> {
    let malformed = || IdentityError::MalformedFilename(file_name.to_string());
    let mut tokens = file_name.split('.');
    let name = tokens.next().filter(|n| !n.is_empty()).ok_or_else(malformed)?;
    let id = tokens
        .next()
        .and_then(|t| t.parse::<IdentityId>().ok())
        .ok_or_else(malformed)?;
    Ok(ParsedName {
        name: name.to_string(),
        id,
    })
}

/// Parse the file-name component of `path`.
pub fn parse_path(path: &Path) -> Result<ParsedName, IdentityError> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| IdentityError::MalformedFilename(path.display().to_string()))?;
    parse_file_name(file_name)
}

/// Read-only map from identity ID to display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct IdentityRegistry {
    names: BTreeMap<IdentityId, String>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `dir` and register every well-formed corpus filename.
    ///
    /// Malformed names are skipped. Listing failures are returned.
    pub fn from_corpus(dir: &Path, filter: &ExtensionFilter) -> std::io::Result<Self> {
        let paths = corpus::list_images(dir, filter)?;
        let registry = Self::from_file_names(
            paths
                .iter()
                .filter_map(|p| p.file_name().and_then(|n| n.to_str())),
        );
        tracing::info!(
            dir = %dir.display(),
            files = paths.len(),
            identities = registry.len(),
            "built identity registry"
        );
        Ok(registry)
    }

    /// Like [`from_corpus`](Self::from_corpus), but a missing directory gives
    /// an empty registry so predictions fall back to `id_<id>` names.
    pub fn from_corpus_or_empty(dir: &Path, filter: &ExtensionFilter) -> std::io::Result<Self> {
        match Self::from_corpus(dir, filter) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(dir = %dir.display(), "corpus directory missing, identities will be unnamed");
                Ok(Self::new())
            }
            other => other,
        }
    }

    /// Register every well-formed name; malformed ones are logged and skipped.
    pub fn from_file_names<I, S>(file_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        for file_name in file_names {
            match parse_file_name(file_name.as_ref()) {
                Ok(parsed) => {
                    registry.insert(parsed.id, parsed.name);
                }
                Err(e) => tracing::debug!(error = %e, "skipping corpus entry"),
            }
        }
        registry
    }

    /// Register `name` for `id`, returning the name it replaced.
    pub fn insert(&mut self, id: IdentityId, name: impl Into<String>) -> Option<String> {
        let name = name.into();
        let previous = self.names.insert(id, name);
        if let Some(prev) = &previous {
            if prev != &self.names[&id] {
                tracing::warn!(id, previous = %prev, current = %self.names[&id], "identity renamed by later corpus entry");
            }
        }
        previous
    }

    pub fn get(&self, id: IdentityId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    /// Display name for `id`, or the `id_<id>` placeholder for unknown IDs.
    pub fn display_name(&self, id: IdentityId) -> String {
        self.get(id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("id_{id}"))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (IdentityId, &str)> {
        self.names.iter().map(|(id, name)| (*id, name.as_str()))
    }
}
