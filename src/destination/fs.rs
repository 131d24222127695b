//! Local directory tree as a destination store.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{check_segment, ChildEntry, DestinationStore, EntryKind, FolderHandle};
use crate::error::{ArchiveError, Result};

/// Destination store rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Use `root` as the store root, creating it if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| ArchiveError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a folder handle.
    pub fn path_of(&self, folder: &FolderHandle) -> PathBuf {
        folder
            .segments()
            .iter()
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

impl DestinationStore for FsStore {
    fn get_or_create_folder(&self, parent: &FolderHandle, name: &str) -> Result<FolderHandle> {
        check_segment(name)?;
        let parent_path = self.path_of(parent);
        if !parent_path.is_dir() {
            return Err(ArchiveError::io(
                &parent_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "parent folder missing"),
            ));
        }

        let path = parent_path.join(name);
        match std::fs::create_dir(&path) {
            Ok(()) => debug!(path = %path.display(), "Created folder"),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(ArchiveError::io(&path, e)),
        }
        Ok(parent.child(name))
    }

    fn list_children(&self, folder: &FolderHandle) -> Result<Vec<ChildEntry>> {
        let path = self.path_of(folder);
        let entries = std::fs::read_dir(&path).map_err(|e| ArchiveError::io(&path, e))?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ArchiveError::io(&path, e))?;
            let metadata = entry.metadata().map_err(|e| ArchiveError::io(entry.path(), e))?;
            let kind = if metadata.is_dir() {
                EntryKind::Folder
            } else {
                EntryKind::File
            };
            let created_at = metadata
                .created()
                .or_else(|_| metadata.modified())
                .ok()
                .map(DateTime::<Utc>::from);
            children.push(ChildEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                created_at,
            });
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn create_file(&self, folder: &FolderHandle, name: &str, content: &[u8]) -> Result<()> {
        check_segment(name)?;
        let path = self.path_of(folder).join(name);
        std::fs::write(&path, content).map_err(|e| ArchiveError::io(&path, e))?;
        debug!(path = %path.display(), bytes = content.len(), "Wrote file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folders_and_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let root = FolderHandle::root();

        let archive = store.get_or_create_folder(&root, "Archive").unwrap();
        let again = store.get_or_create_folder(&root, "Archive").unwrap();
        assert_eq!(archive, again);
        store.create_file(&archive, "a.txt", b"hello").unwrap();

        assert_eq!(std::fs::read(dir.path().join("Archive/a.txt")).unwrap(), b"hello");
        let children = store.list_children(&archive).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind, EntryKind::File);
        assert!(children[0].created_at.is_some());
    }

    #[test]
    fn test_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path().join("store")).unwrap();
        let root = FolderHandle::root();
        assert!(store.get_or_create_folder(&root, "..").is_err());
        assert!(store.create_file(&root, "../x.txt", b"x").is_err());
        assert!(!dir.path().join("x.txt").exists());
    }

    #[test]
    fn test_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        let ghost = FolderHandle::root().child("ghost");
        assert!(store.get_or_create_folder(&ghost, "x").is_err());
        assert!(store.list_children(&ghost).is_err());
    }
}
