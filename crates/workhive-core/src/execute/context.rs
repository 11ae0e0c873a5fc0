//! Isolated execution contexts and completion callbacks.
//!
//! An `IsolatedContext` gives every distinct `ContextOptions` its own static
//! state and its own private copies of the configured dynamic libraries.
//! Libraries are copied to a UUID-named staging directory before loading so
//! that two contexts listing the same file still get separate images, and so
//! the original file stays free to be rebuilt while loaded.

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::action::StaticStore;
use crate::config::ContextOptions;
use crate::error::{Error, Result};
use crate::work::{Outcome, WorkItemId};

/// Callback trait for per-item progress reporting.
///
/// This is the only way to observe results before `await_all` returns.
pub trait CompletionCallback: Send + Sync {
    /// Called when a worker picks up an item.
    fn on_item_started(&self, _item: WorkItemId, _action: &str) {}

    /// Called once per item with its terminal outcome.
    fn on_item_completed(&self, item: WorkItemId, outcome: &Outcome);
}

/// A dynamic library loaded privately into one context.
pub struct ContextLibrary {
    name: String,
    original: PathBuf,
    staged: PathBuf,
    library: libloading::Library,
}

impl ContextLibrary {
    /// File name of the original library.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn original_path(&self) -> &Path {
        &self.original
    }

    /// Path of the private copy actually loaded.
    pub fn staged_path(&self) -> &Path {
        &self.staged
    }

    /// The loaded library, for symbol lookup.
    pub fn library(&self) -> &libloading::Library {
        &self.library
    }
}

impl std::fmt::Debug for ContextLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLibrary")
            .field("name", &self.name)
            .field("staged", &self.staged)
            .finish()
    }
}

/// Execution context shared by all items of one `ContextOptions`.
pub struct IsolatedContext {
    id: Uuid,
    options: ContextOptions,
    statics: StaticStore,
    libraries: Vec<ContextLibrary>,
    staging_dir: Option<PathBuf>,
}

impl IsolatedContext {
    /// Build a context, staging and loading its libraries under `staging_root`.
    pub fn load(options: ContextOptions, staging_root: &Path) -> Result<Self> {
        let id = Uuid::new_v4();
        let mut context = Self {
            id,
            options,
            statics: StaticStore::new(),
            libraries: Vec::new(),
            staging_dir: None,
        };

        if context.options.library_paths.is_empty() {
            return Ok(context);
        }

        let staging_dir = staging_root.join(id.to_string());
        fs::create_dir_all(&staging_dir)?;
        context.staging_dir = Some(staging_dir.clone());

        // On failure `context` drops here and removes the staging directory.
        for (index, original) in context.options.library_paths.clone().into_iter().enumerate() {
            let name = original
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("lib{}", index));
            // Index prefix keeps same-named libraries from different dirs apart.
            let staged = staging_dir.join(format!("{}-{}", index, name));
            fs::copy(&original, &staged).map_err(|e| {
                Error::Configuration(format!(
                    "failed to stage context library {}: {}",
                    original.display(),
                    e
                ))
            })?;

            // SAFETY: loading runs the library's initializers. The host
            // chose these libraries in its context options.
            let library = unsafe { libloading::Library::new(&staged) }?;
            tracing::debug!(context = %id, library = %name, "loaded context library");

            context.libraries.push(ContextLibrary {
                name,
                original,
                staged,
                library,
            });
        }

        Ok(context)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn statics(&self) -> &StaticStore {
        &self.statics
    }

    pub fn libraries(&self) -> &[ContextLibrary] {
        &self.libraries
    }
}

impl Drop for IsolatedContext {
    fn drop(&mut self) {
        // Libraries must be unloaded before their files go away.
        self.libraries.clear();
        if let Some(dir) = self.staging_dir.take()
            && let Err(e) = fs::remove_dir_all(&dir)
        {
            tracing::warn!("Failed to remove context staging dir {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_without_libraries() {
        let temp = tempfile::TempDir::new().unwrap();
        let options = ContextOptions::new().with_setting("profile", "fast");
        let context = IsolatedContext::load(options.clone(), temp.path()).unwrap();

        assert_eq!(context.options(), &options);
        assert!(context.libraries().is_empty());
        // Nothing staged when there is nothing to load.
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_contexts_have_separate_statics() {
        let temp = tempfile::TempDir::new().unwrap();
        let a = IsolatedContext::load(ContextOptions::new(), temp.path()).unwrap();
        let b = IsolatedContext::load(ContextOptions::new(), temp.path()).unwrap();

        assert_ne!(a.id(), b.id());
        assert!(!a.statics().same_store(b.statics()));
    }

    #[test]
    fn test_invalid_library_is_rejected_and_staging_cleaned() {
        let temp = tempfile::TempDir::new().unwrap();
        let bogus = temp.path().join("libbogus.so");
        fs::write(&bogus, b"not a shared object").unwrap();
        let staging = temp.path().join("staging");

        let result = IsolatedContext::load(ContextOptions::new().with_library(&bogus), &staging);
        assert!(matches!(result, Err(Error::LibraryLoad(_))));
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
    }
}
