//! Series name registry
//!
//! Maps canonical series names (`metric tag=value ...`) to u64 ParamIds,
//! assigned on first sight. The registry backs the suggest and search
//! endpoints.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::ParamId;

use super::StorageError;

#[derive(Debug, Default)]
struct RegistryInner {
    ids: HashMap<String, ParamId>,
    /// Series names indexed by `paramid - 1`
    names: Vec<String>,
}

/// Thread-safe series registry. ParamIds start at 1 and never get reused.
#[derive(Debug, Default)]
pub struct SeriesRegistry {
    inner: RwLock<RegistryInner>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a series name to its ParamId, assigning one on first sight.
    ///
    /// The name is canonicalized first, so `cpu host=a core=0` and
    /// `cpu core=0 host=a` resolve to the same series.
    pub fn get_or_create(&self, name: &str) -> Result<ParamId, StorageError> {
        let canonical = canonical_series_name(name)?;
        if let Some(&id) = self.inner.read().ids.get(&canonical) {
            return Ok(id);
        }
        let mut inner = self.inner.write();
        if let Some(&id) = inner.ids.get(&canonical) {
            return Ok(id);
        }
        inner.names.push(canonical.clone());
        let id = inner.names.len() as ParamId;
        inner.ids.insert(canonical, id);
        Ok(id)
    }

    /// Look up the canonical name of a series.
    pub fn name_of(&self, id: ParamId) -> Option<String> {
        if id == 0 {
            return None;
        }
        self.inner.read().names.get(id as usize - 1).cloned()
    }

    /// All series names starting with `prefix`, sorted.
    pub fn suggest(&self, prefix: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .names
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// All series names containing `text`, sorted.
    pub fn search(&self, text: &str) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .names
            .iter()
            .filter(|name| name.contains(text))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Snapshot of `(id, name)` pairs ordered by id.
    pub fn snapshot(&self) -> Vec<(ParamId, String)> {
        let inner = self.inner.read();
        inner
            .names
            .iter()
            .enumerate()
            .map(|(idx, name)| (idx as ParamId + 1, name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonicalize a series name: a metric token followed by `tag=value` pairs
/// in sorted order, separated by single spaces.
pub fn canonical_series_name(name: &str) -> Result<String, StorageError> {
    let mut tokens = name.split_whitespace();
    let metric = tokens
        .next()
        .ok_or_else(|| StorageError::InvalidSeriesName(name.to_string()))?;
    if metric.contains('=') {
        return Err(StorageError::InvalidSeriesName(name.to_string()));
    }
    let mut tags: Vec<&str> = Vec::new();
    for token in tokens {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => tags.push(token),
            _ => return Err(StorageError::InvalidSeriesName(name.to_string())),
        }
    }
    tags.sort_unstable();
    let mut canonical = String::with_capacity(name.len());
    canonical.push_str(metric);
    for tag in tags {
        canonical.push(' ');
        canonical.push_str(tag);
    }
    Ok(canonical)
}

/// Split a canonical series name into its metric and tag pairs.
pub fn split_series_name(name: &str) -> (&str, Vec<(&str, &str)>) {
    let mut tokens = name.split(' ');
    let metric = tokens.next().unwrap_or("");
    let tags = tokens.filter_map(|t| t.split_once('=')).collect();
    (metric, tags)
}
