//! Virtual file systems attached to a node.
//!
//! Every node carries an ordered list of file systems. The first entry is
//! always the process-wide [`MessageFileSystem`], which serves dynamically
//! registered paths; a [`LocalFileSystem`] follows when the node has a
//! root directory.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Options passed along with a path request.
pub type PathOptions = HashMap<String, String>;

/// Handler behind a registered message path.
pub type PathHandler = Arc<dyn Fn(&str, &PathOptions) -> Vec<u8> + Send + Sync>;

/// Ordered set of file systems shared by every node with the same root.
pub type FileSystems = Arc<[Arc<dyn VirtualFileSystem>]>;

pub trait VirtualFileSystem: Send + Sync {
    fn name(&self) -> &str;

    /// Contents of `path`, or `None` when this file system does not serve it.
    fn read(&self, path: &str, options: &PathOptions) -> Option<Vec<u8>>;
}

/// In-memory table of path handlers.
#[derive(Default)]
pub struct MessageFileSystem {
    paths: RwLock<BTreeMap<String, PathHandler>>,
}

impl MessageFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `path`, replacing any earlier registration.
    pub fn add_path<F>(&self, path: impl Into<String>, handler: F)
    where
        F: Fn(&str, &PathOptions) -> Vec<u8> + Send + Sync + 'static,
    {
        let path = path.into();
        debug!("message path registered: {}", path);
        self.paths.write().insert(path, Arc::new(handler));
    }

    pub fn remove_path(&self, path: &str) -> bool {
        self.paths.write().remove(path).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.read().contains_key(path)
    }

    /// Registered paths in sorted order.
    pub fn paths(&self) -> Vec<String> {
        self.paths.read().keys().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        self.paths.write().clear();
    }
}

impl VirtualFileSystem for MessageFileSystem {
    fn name(&self) -> &str {
        "messages"
    }

    fn read(&self, path: &str, options: &PathOptions) -> Option<Vec<u8>> {
        // Clone the handler out so it runs without the table lock held.
        let handler = self.paths.read().get(path).cloned()?;
        Some(handler(path, options))
    }
}

impl fmt::Debug for MessageFileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFileSystem")
            .field("paths", &self.paths())
            .finish()
    }
}

/// Read-only view of a directory on disk.
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a virtual path onto the root, refusing anything that could escape it.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }
}

impl VirtualFileSystem for LocalFileSystem {
    fn name(&self) -> &str {
        "local"
    }

    fn read(&self, path: &str, _options: &PathOptions) -> Option<Vec<u8>> {
        let resolved = self.resolve(path)?;
        match std::fs::read(&resolved) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                debug!("local read {} failed: {}", resolved.display(), err);
                None
            }
        }
    }
}
