//! Destination folder/file stores and the archive layout on top of them.

pub mod fs;
pub mod memory;
pub mod path;
pub mod probe;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use path::{AuditReport, MisplacedEntry, MisplacedPattern, PathResolver};
pub use probe::ExistenceProbe;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ArchiveError, Result};

/// A folder, named by its chain of segments from the store root.
///
/// Handles are plain values: holding one says nothing about whether the
/// folder exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FolderHandle {
    segments: Vec<String>,
}

impl FolderHandle {
    /// The store root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a handle from root-relative segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self { segments }
    }

    /// `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, rest) = self.segments.split_last()?;
        Some(Self {
            segments: rest.to_vec(),
        })
    }

    /// Whether `self` is `ancestor` or lies below it.
    pub fn is_within(&self, ancestor: &FolderHandle) -> bool {
        self.segments.starts_with(&ancestor.segments)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Last segment; `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for FolderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Folder,
    File,
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Creation time, when the store knows it.
    pub created_at: Option<DateTime<Utc>>,
}

/// Hierarchical folder/file store the archive is written to.
pub trait DestinationStore {
    /// Return the child folder `name` of `parent`, creating it if needed.
    fn get_or_create_folder(&self, parent: &FolderHandle, name: &str) -> Result<FolderHandle>;

    /// List the direct children of `folder`. Never creates anything.
    fn list_children(&self, folder: &FolderHandle) -> Result<Vec<ChildEntry>>;

    /// Create or replace the file `name` inside `folder`.
    fn create_file(&self, folder: &FolderHandle, name: &str, content: &[u8]) -> Result<()>;
}

impl<D: DestinationStore + ?Sized> DestinationStore for &D {
    fn get_or_create_folder(&self, parent: &FolderHandle, name: &str) -> Result<FolderHandle> {
        (**self).get_or_create_folder(parent, name)
    }

    fn list_children(&self, folder: &FolderHandle) -> Result<Vec<ChildEntry>> {
        (**self).list_children(folder)
    }

    fn create_file(&self, folder: &FolderHandle, name: &str, content: &[u8]) -> Result<()> {
        (**self).create_file(folder, name, content)
    }
}

/// Reject names that cannot be a single path segment.
pub(crate) fn check_segment(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(ArchiveError::InvalidInput(format!(
            "'{name}' is not a valid folder or file name"
        )));
    }
    Ok(())
}

/// Find the child named `name` of the given kind, if it exists.
pub fn find_child<D: DestinationStore + ?Sized>(
    store: &D,
    folder: &FolderHandle,
    name: &str,
    kind: EntryKind,
) -> Result<Option<ChildEntry>> {
    Ok(store
        .list_children(folder)?
        .into_iter()
        .find(|c| c.kind == kind && c.name == name))
}
