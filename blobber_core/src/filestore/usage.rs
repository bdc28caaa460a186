//! Disk accounting and object enumeration.

use super::FileStore;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use std::path::Path;

fn walker(path: &Path) -> ignore::WalkBuilder {
    let mut builder = ignore::WalkBuilder::new(path);
    builder.standard_filters(false).follow_links(false);
    builder
}

/// Sum of the sizes of all regular files under `path`.
fn dir_size(path: &Path, cancel: &CancelToken) -> Result<u64> {
    let mut total = 0;
    for entry in walker(path).build() {
        cancel.check()?;
        let entry = entry?;
        if entry.file_type().is_some_and(|t| t.is_file()) {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

impl FileStore {
    /// Bytes used under the store root, staged uploads included.
    pub fn total_disk_size_used(&self, cancel: &CancelToken) -> Result<u64> {
        dir_size(self.root(), cancel)
    }

    /// Bytes used by one allocation's objects, staged uploads included.
    pub fn allocation_disk_size_used(&self, allocation_id: &str, cancel: &CancelToken) -> Result<u64> {
        let alloc = self.setup_allocation(allocation_id, true)?;
        if !alloc.objects_path.is_dir() {
            return Err(Error::not_found(format!("allocation {}", allocation_id)));
        }
        dir_size(&alloc.objects_path, cancel)
    }

    /// Bytes currently staged for an allocation.
    pub fn temp_path_size(&self, allocation_id: &str, cancel: &CancelToken) -> Result<u64> {
        let alloc = self.setup_allocation(allocation_id, true)?;
        if !alloc.temp_objects_path.is_dir() {
            return Err(Error::not_found(format!(
                "staging area of allocation {}",
                allocation_id
            )));
        }
        dir_size(&alloc.temp_objects_path, cancel)
    }

    /// Call `f(hash, size)` for every committed object of an allocation.
    ///
    /// Staged uploads are skipped. An allocation with no directory has no objects.
    pub fn iterate_objects<F>(&self, allocation_id: &str, cancel: &CancelToken, mut f: F) -> Result<()>
    where
        F: FnMut(&str, u64),
    {
        let alloc = self.setup_allocation(allocation_id, true)?;
        if !alloc.objects_path.is_dir() {
            return Ok(());
        }

        let temp_dir = alloc.temp_objects_path.clone();
        let mut builder = walker(&alloc.objects_path);
        builder.filter_entry(move |entry| entry.path() != temp_dir.as_path());

        for entry in builder.build() {
            cancel.check()?;
            let entry = entry?;
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }

            let Ok(rel) = entry.path().strip_prefix(&alloc.objects_path) else {
                continue;
            };
            let hash: String = rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect();
            f(&hash, entry.metadata()?.len());
        }
        Ok(())
    }
}
