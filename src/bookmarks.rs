use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Saved addresses keyed by label, persisted as a flat JSON object.
#[derive(Debug, Clone, Default)]
pub struct Bookmarks {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl Bookmarks {
    /// Reads `path`. A missing or unreadable file gives an empty set.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "ignoring malformed bookmarks file: {}", e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Bookmarks { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds or replaces `label`. Returns false for a blank label or url.
    pub fn add(&mut self, label: &str, url: &str) -> bool {
        let (label, url) = (label.trim(), url.trim());
        if label.is_empty() || url.is_empty() {
            return false;
        }
        self.entries.insert(label.to_string(), url.to_string());
        true
    }

    pub fn remove(&mut self, label: &str) -> Option<String> {
        self.entries.remove(label)
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.entries.get(label).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&self.path, json).with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }
}
