//! The metadata index persisted next to the content files.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tether_net::messages::ContentMetaData;

use crate::error::ContentError;

/// Metadata of every cached content entry of one project.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContentIndex {
    /// Project the cached content belongs to.
    pub project_name: String,
    /// Unix time of the last change, in seconds.
    pub last_time_updated: u64,
    /// One entry per content name.
    pub entries: Vec<ContentMetaData>,
}

impl ContentIndex {
    /// Empty index for `project_name`.
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            last_time_updated: now(),
            entries: Vec::new(),
        }
    }

    /// Read an index file.
    pub fn load(path: &Path) -> Result<Self, ContentError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ContentError::io(path, e))?;
        Self::parse(&contents)
    }

    /// Parse index text as produced by [`ContentIndex::to_ron`].
    pub fn parse(contents: &str) -> Result<Self, ContentError> {
        ron::from_str(contents).map_err(ContentError::Parse)
    }

    /// Serialize to pretty RON.
    pub fn to_ron(&self) -> Result<String, ContentError> {
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .enumerate_arrays(false);
        ron::ser::to_string_pretty(self, pretty).map_err(ContentError::Serialize)
    }

    /// Write the index file, creating its directory.
    pub fn save(&self, path: &Path) -> Result<(), ContentError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ContentError::io(parent, e))?;
        }
        let serialized = self.to_ron()?;
        std::fs::write(path, serialized).map_err(|e| ContentError::io(path, e))
    }

    /// Entry with this name, ignoring case.
    pub fn find(&self, name: &str) -> Option<&ContentMetaData> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    /// Insert or replace the entry with the same name.
    pub fn upsert(&mut self, entry: ContentMetaData) {
        self.remove(&entry.name);
        self.entries.push(entry);
        self.last_time_updated = now();
    }

    /// Remove the entry with this name.
    pub fn remove(&mut self, name: &str) -> Option<ContentMetaData> {
        let position = self
            .entries
            .iter()
            .position(|entry| entry.name.eq_ignore_ascii_case(name))?;
        self.last_time_updated = now();
        Some(self.entries.remove(position))
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
