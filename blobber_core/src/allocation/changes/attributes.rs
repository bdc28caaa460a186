use super::{ChangeContext, parent_dir_mut};
use crate::error::{Error, Result};
use crate::reference::{Attributes, Ref, clean_path, get_reference_path};
use serde::{Deserialize, Serialize};

/// New attributes for an existing file. `None` resets them to defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributesChange {
    pub connection_id: String,
    pub allocation_id: String,
    pub path: String,
    pub attributes: Option<Attributes>,
}

impl AttributesChange {
    pub(super) fn process_change(&mut self, ctx: &ChangeContext<'_>) -> Result<Ref> {
        let path = clean_path(&self.path);
        let mut root = get_reference_path(ctx.refs, ctx.allocation_id, &path)?;
        let dir = parent_dir_mut(&mut root, &path)?;
        let file = dir
            .child_mut(&path)
            .filter(|c| c.is_file())
            .ok_or_else(|| Error::file_not_found(format!("file to update not found: {}", path)))?;
        file.set_attributes(self.attributes.as_ref())?;

        root.calculate_hash(Some(ctx.refs), ctx.cancel)?;
        Ok(root)
    }
}
