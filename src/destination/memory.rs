//! In-memory destination store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::{check_segment, ChildEntry, DestinationStore, EntryKind, FolderHandle};
use crate::error::{ArchiveError, Result};

#[derive(Debug, Default)]
struct Tree {
    /// Every folder except the root, with its creation time.
    folders: BTreeMap<FolderHandle, DateTime<Utc>>,
    files: BTreeMap<FolderHandle, BTreeMap<String, Vec<u8>>>,
    /// File names whose writes fail, for exercising error paths.
    failing: BTreeSet<String>,
    writes: usize,
}

impl Tree {
    fn folder_exists(&self, folder: &FolderHandle) -> bool {
        folder.is_root() || self.folders.contains_key(folder)
    }
}

/// A destination store that lives in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tree: Mutex<Tree>,
}

fn not_found(folder: &FolderHandle) -> ArchiveError {
    ArchiveError::io(
        folder.to_string(),
        std::io::Error::new(std::io::ErrorKind::NotFound, "no such folder"),
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write of a file called `name` fail.
    pub fn fail_writes_to(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    /// Contents of a file, if present.
    pub fn read_file(&self, folder: &FolderHandle, name: &str) -> Option<Vec<u8>> {
        self.lock().files.get(folder)?.get(name).cloned()
    }

    pub fn folder_exists(&self, folder: &FolderHandle) -> bool {
        self.lock().folder_exists(folder)
    }

    /// Every folder in the store, root excluded.
    pub fn folders(&self) -> Vec<FolderHandle> {
        self.lock().folders.keys().cloned().collect()
    }

    /// Successful `create_file` calls so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DestinationStore for MemoryStore {
    fn get_or_create_folder(&self, parent: &FolderHandle, name: &str) -> Result<FolderHandle> {
        check_segment(name)?;
        let mut tree = self.lock();
        if !tree.folder_exists(parent) {
            return Err(not_found(parent));
        }
        let child = parent.child(name);
        tree.folders.entry(child.clone()).or_insert_with(Utc::now);
        Ok(child)
    }

    fn list_children(&self, folder: &FolderHandle) -> Result<Vec<ChildEntry>> {
        let tree = self.lock();
        if !tree.folder_exists(folder) {
            return Err(not_found(folder));
        }

        let mut children: Vec<ChildEntry> = tree
            .folders
            .iter()
            .filter(|(handle, _)| handle.parent().as_ref() == Some(folder))
            .filter_map(|(handle, created)| {
                Some(ChildEntry {
                    name: handle.name()?.to_string(),
                    kind: EntryKind::Folder,
                    created_at: Some(*created),
                })
            })
            .collect();

        if let Some(files) = tree.files.get(folder) {
            children.extend(files.keys().map(|name| ChildEntry {
                name: name.clone(),
                kind: EntryKind::File,
                created_at: None,
            }));
        }
        Ok(children)
    }

    fn create_file(&self, folder: &FolderHandle, name: &str, content: &[u8]) -> Result<()> {
        check_segment(name)?;
        let mut tree = self.lock();
        if !tree.folder_exists(folder) {
            return Err(not_found(folder));
        }
        if tree.failing.contains(name) {
            return Err(ArchiveError::io(
                folder.child(name).to_string(),
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "write refused"),
            ));
        }
        tree.files
            .entry(folder.clone())
            .or_default()
            .insert(name.to_string(), content.to_vec());
        tree.writes += 1;
        Ok(())
    }
}
