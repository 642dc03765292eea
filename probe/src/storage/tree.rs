use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;

/// In-process virtual filesystem holding one test's feature tree and its
/// evidence output. Paths are `/`-separated and relative to the tree root.
/// Shared between the BDD runner (writes evidence) and the feature loader
/// (reads it back for upload), so access is behind a lock.
#[derive(Default)]
pub struct FeatureTree {
    files: RwLock<BTreeMap<String, Bytes>>,
}

impl FeatureTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, contents: impl Into<Bytes>) {
        let mut files = self.files.write().expect("poisoned FeatureTree lock");
        files.insert(path.into(), contents.into());
    }

    pub fn read(&self, path: &str) -> Option<Bytes> {
        let files = self.files.read().expect("poisoned FeatureTree lock");
        files.get(path).cloned()
    }

    /// Paths under `prefix` (a directory name, no trailing slash), in
    /// lexicographic order.
    pub fn files_under(&self, prefix: &str) -> Vec<(String, Bytes)> {
        let wanted = format!("{prefix}/");
        let files = self.files.read().expect("poisoned FeatureTree lock");
        files
            .iter()
            .filter(|(path, _)| path.starts_with(&wanted))
            .map(|(path, contents)| (path.clone(), contents.clone()))
            .collect()
    }

    pub fn paths(&self) -> Vec<String> {
        let files = self.files.read().expect("poisoned FeatureTree lock");
        files.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.files.read().expect("poisoned FeatureTree lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
