//! Cold-start path: discard leftovers of interrupted writes and load every
//! sealed data file of the store.
use anyhow::{bail, Context, Result};
use datafile::{parse_data_file_name, DataFileError, DataFileReader, RecordLayout};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::{DataFileCollection, FileList};

impl DataFileCollection {
    /// Loads all sealed `<store>_<id>.dfl` files in `dir`, sorted by id.
    ///
    /// Files without a valid footer were never sealed: their session was
    /// never acknowledged, so they are deleted. Returns the files and the
    /// highest file id seen, including deleted ones.
    pub(crate) fn load_files(
        dir: &Path,
        store_name: &str,
        layout: RecordLayout,
    ) -> Result<(FileList, Option<u32>)> {
        let mut files = Vec::new();
        let mut max_id: Option<u32> = None;

        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to list store directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(file_id) = parse_data_file_name(store_name, name) else {
                continue;
            };
            max_id = Some(max_id.map_or(file_id, |m| m.max(file_id)));

            match DataFileReader::open(&path) {
                Ok(reader) => {
                    if reader.file_id() != file_id {
                        bail!(
                            "data file {} claims id {} in its footer",
                            path.display(),
                            reader.file_id()
                        );
                    }
                    if reader.layout() != layout {
                        bail!(
                            "data file {} has layout {:?}, store {} expects {:?}",
                            path.display(),
                            reader.layout(),
                            store_name,
                            layout
                        );
                    }
                    files.push(Arc::new(reader));
                }
                Err(DataFileError::Corrupt { reason, .. }) => {
                    tracing::warn!(
                        store = %store_name,
                        file_id,
                        path = %path.display(),
                        %reason,
                        "discarding incomplete data file"
                    );
                    fs::remove_file(&path).with_context(|| {
                        format!("failed to remove incomplete data file {}", path.display())
                    })?;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to open {}", path.display()));
                }
            }
        }

        files.sort_by_key(|r| r.file_id());
        Ok((files, max_id))
    }

    /// Removes `<store>_*.tmp` files left by interrupted metadata or index
    /// writes.
    pub(crate) fn cleanup_tmp_files(dir: &Path, store_name: &str) {
        let prefix = format!("{}_", store_name);
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let p = entry.path();
                if let Some(name) = p.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with(&prefix) && name.ends_with(".tmp") {
                        tracing::warn!(store = %store_name, path = %p.display(), "removing stale temp file");
                        let _ = fs::remove_file(&p);
                    }
                }
            }
        }
    }
}
