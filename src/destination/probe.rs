//! Second deduplication layer: ask the destination itself.

use tracing::debug;

use super::path::{artifact_name, record_base_name, ArtifactKind, PathResolver};
use super::{find_child, DestinationStore, EntryKind, FolderHandle};
use crate::error::Result;
use crate::model::record::Record;

/// Checks whether a record is already archived, using only folder listings.
pub struct ExistenceProbe;

impl ExistenceProbe {
    /// `true` when the record's folder exists and holds its metadata file.
    ///
    /// The metadata file is written last, so a folder left behind by an
    /// interrupted write is reported as absent.
    pub fn exists<D: DestinationStore>(store: D, anchor: &FolderHandle, record: &Record) -> Result<bool> {
        let resolver = PathResolver::new(store, anchor.clone());
        let Some(folder) = resolver.locate_record(record)? else {
            return Ok(false);
        };

        let marker = artifact_name(&record_base_name(record), ArtifactKind::Metadata);
        let complete = find_child(resolver.store(), &folder, &marker, EntryKind::File)?.is_some();
        if !complete {
            debug!(record = %record.id, folder = %folder, "Record folder without metadata marker");
        }
        Ok(complete)
    }
}
