use super::{ChangeContext, NewFileChange, parent_dir_mut};
use crate::error::{Error, Result};
use crate::reference::{Ref, clean_path, get_reference_path};
use serde::{Deserialize, Serialize};

/// Replacement of an existing file's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateFileChange {
    #[serde(flatten)]
    pub file: NewFileChange,
    /// Content hashes the update stopped referencing.
    #[serde(skip)]
    superseded: Vec<String>,
}

impl UpdateFileChange {
    pub fn new(file: NewFileChange) -> Self {
        Self {
            file,
            superseded: Vec::new(),
        }
    }

    pub(super) fn process_change(&mut self, ctx: &ChangeContext<'_>) -> Result<Ref> {
        let path = clean_path(&self.file.path);
        let mut root = get_reference_path(ctx.refs, ctx.allocation_id, &path)?;
        let dir = parent_dir_mut(&mut root, &path)?;
        let target = dir
            .child_mut(&path)
            .filter(|c| c.is_file())
            .ok_or_else(|| Error::file_not_found(format!("file to update not found: {}", path)))?;

        self.superseded = [&target.content_hash, &target.thumbnail_hash]
            .into_iter()
            .filter(|h| !h.is_empty() && **h != self.file.hash && **h != self.file.thumbnail_hash)
            .cloned()
            .collect();
        self.file.fill(target)?;

        root.calculate_hash(Some(ctx.refs), ctx.cancel)?;
        Ok(root)
    }

    pub(super) fn superseded(&self) -> &[String] {
        &self.superseded
    }
}
