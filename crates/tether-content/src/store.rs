//! Content directory maintained from service messages.

use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tether_net::messages::{
    CheckProjectContent, ContentMetaData, Message, ProjectPermissions, SetProject, UpdateContent,
};
use tether_net::{ObserverList, ServiceHandler, SubscriptionId};

use crate::error::ContentError;
use crate::index::ContentIndex;

/// Notification raised after the cache changed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentChange {
    /// An entry was written.
    Updated(String),
    /// An entry was removed.
    Deleted(String),
    /// Another project was selected and the old content discarded.
    ProjectChanged(String),
}

struct StoreState {
    index: ContentIndex,
    ready: bool,
}

/// Cached content of one project.
///
/// All operations on the directory are serialized by one lock. Change
/// handlers run after it is released.
pub struct ContentStore {
    directory: PathBuf,
    index_path: PathBuf,
    state: Mutex<StoreState>,
    changes: ObserverList<ContentChange>,
}

impl ContentStore {
    /// Open `directory`, reading `metadata_file` inside it if present.
    ///
    /// Without an index file the store starts empty for `project_name`.
    pub fn open(
        directory: impl Into<PathBuf>,
        metadata_file: &str,
        project_name: &str,
    ) -> Result<Self, ContentError> {
        let directory = directory.into();
        let index_path = directory.join(metadata_file);
        let index = if index_path.exists() {
            let index = ContentIndex::load(&index_path)?;
            tracing::info!(
                "Loaded {} cached content entries of {}",
                index.entries.len(),
                index.project_name
            );
            index
        } else {
            ContentIndex::new(project_name)
        };

        Ok(Self {
            directory,
            index_path,
            state: Mutex::new(StoreState {
                index,
                ready: false,
            }),
            changes: ObserverList::new(),
        })
    }

    /// Switch to the project selected by the server.
    ///
    /// Content cached for another project is deleted. Returns the message
    /// reporting the current metadata back to the server.
    pub fn set_project(&self, project: &SetProject) -> Result<CheckProjectContent, ContentError> {
        if project.permissions == ProjectPermissions::None {
            return Err(ContentError::NoPermission(project.project_name.clone()));
        }

        let mut state = self.lock();
        let switched = state.index.project_name != project.project_name;
        if switched {
            tracing::info!(
                "Switching content from {} to {}",
                state.index.project_name,
                project.project_name
            );
            if self.directory.exists() {
                std::fs::remove_dir_all(&self.directory)
                    .map_err(|e| ContentError::io(&self.directory, e))?;
            }
            state.index = ContentIndex::new(project.project_name.clone());
            state.ready = false;
        }

        let content_meta_data = if self.index_path.exists() {
            std::fs::read_to_string(&self.index_path)
                .map_err(|e| ContentError::io(&self.index_path, e))?
        } else {
            state.index.to_ron()?
        };
        drop(state);

        if switched {
            self.changes
                .emit(&ContentChange::ProjectChanged(project.project_name.clone()));
        }
        Ok(CheckProjectContent { content_meta_data })
    }

    /// Write the files of an entry and record its metadata.
    ///
    /// File names and the entry's local file path must stay inside the
    /// content directory; otherwise nothing is written.
    pub fn update_content(&self, update: &UpdateContent) -> Result<(), ContentError> {
        for file in &update.files {
            if !file.name.is_empty() {
                validate_file_name(&file.name)?;
            }
        }
        if let Some(local) = local_file(&update.meta_data) {
            validate_file_name(local)?;
        }

        let mut state = self.lock();
        std::fs::create_dir_all(&self.directory)
            .map_err(|e| ContentError::io(&self.directory, e))?;
        state.index.upsert(update.meta_data.clone());
        state.index.save(&self.index_path)?;
        for file in update.files.iter().filter(|file| !file.name.is_empty()) {
            let path = self.directory.join(&file.name);
            std::fs::write(&path, &file.data).map_err(|e| ContentError::io(&path, e))?;
        }
        drop(state);

        tracing::debug!(
            "Updated content {} ({} files)",
            update.meta_data.name,
            update.files.len()
        );
        self.changes
            .emit(&ContentChange::Updated(update.meta_data.name.clone()));
        Ok(())
    }

    /// Remove an entry and its local file. Returns `false` if it was unknown.
    pub fn delete_content(&self, content_name: &str) -> Result<bool, ContentError> {
        let mut state = self.lock();
        let Some(entry) = state.index.find(content_name) else {
            return Ok(false);
        };
        if let Some(local) = local_file(entry) {
            validate_file_name(local)?;
        }
        let Some(entry) = state.index.remove(content_name) else {
            return Ok(false);
        };

        if let Some(local) = local_file(&entry) {
            let path = self.directory.join(local);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ContentError::io(&path, e)),
            }
        }
        state.index.save(&self.index_path)?;
        drop(state);

        tracing::debug!("Deleted content {}", entry.name);
        self.changes.emit(&ContentChange::Deleted(entry.name));
        Ok(true)
    }

    /// Mark the cached metadata as complete. Called when the service reports
    /// content readiness.
    pub fn load_meta_data(&self) {
        let mut state = self.lock();
        state.ready = true;
        tracing::info!(
            "Content ready: {} entries for {}",
            state.index.entries.len(),
            state.index.project_name
        );
    }

    /// Whether content can be used, loading a local index if the service has
    /// not announced readiness yet.
    pub fn ensure_ready(&self) -> Result<bool, ContentError> {
        let mut state = self.lock();
        if state.ready {
            return Ok(true);
        }
        if self.index_path.exists() {
            state.index = ContentIndex::load(&self.index_path)?;
            state.ready = true;
        }
        Ok(state.ready)
    }

    /// Metadata of an entry, looked up ignoring case.
    pub fn meta_data(&self, content_name: &str) -> Result<Option<ContentMetaData>, ContentError> {
        if !self.ensure_ready()? {
            return Err(ContentError::ContentNotReady);
        }
        Ok(self.lock().index.find(content_name).cloned())
    }

    /// Whether an entry exists.
    pub fn exists(&self, content_name: &str) -> Result<bool, ContentError> {
        Ok(self.meta_data(content_name)?.is_some())
    }

    /// Path of an entry's local file.
    pub fn file_path(&self, content_name: &str) -> Result<Option<PathBuf>, ContentError> {
        let Some(entry) = self.meta_data(content_name)? else {
            return Ok(None);
        };
        let Some(local) = local_file(&entry) else {
            return Ok(None);
        };
        validate_file_name(local)?;
        Ok(Some(self.directory.join(local)))
    }

    /// Whether a metadata index exists on disk. Picks the short ready timeout.
    pub fn has_cached_content(&self) -> bool {
        self.index_path.exists()
    }

    /// Whether content readiness was reached.
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Project the cache belongs to.
    pub fn project_name(&self) -> String {
        self.lock().index.project_name.clone()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().index.entries.len()
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Register a change handler.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ContentChange) + Send + Sync + 'static,
    {
        self.changes.subscribe(handler)
    }

    /// Remove a change handler.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.changes.unsubscribe(id)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ServiceHandler for ContentStore {
    fn load_content_meta_data(&self) {
        self.load_meta_data();
    }

    fn content_updated(&self, update: &UpdateContent) {
        if let Err(e) = self.update_content(update) {
            tracing::error!("Failed to store content {}: {e}", update.meta_data.name);
        }
    }

    fn content_deleted(&self, content_name: &str) {
        match self.delete_content(content_name) {
            Ok(true) => {}
            Ok(false) => tracing::debug!("Content {content_name} was not cached"),
            Err(e) => tracing::error!("Failed to delete content {content_name}: {e}"),
        }
    }

    fn project_selected(&self, project: &SetProject) -> Option<Message> {
        match self.set_project(project) {
            Ok(check) => Some(Message::CheckProjectContent(check)),
            Err(e) => {
                tracing::error!("Project {} rejected: {e}", project.project_name);
                None
            }
        }
    }
}

fn local_file(entry: &ContentMetaData) -> Option<&str> {
    entry.local_file_path.as_deref().filter(|path| !path.is_empty())
}

/// Content files must stay inside the content directory.
fn validate_file_name(name: &str) -> Result<(), ContentError> {
    let path = Path::new(name);
    let inside = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if name.is_empty() || !inside {
        return Err(ContentError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
