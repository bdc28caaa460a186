use super::{ChangeContext, parent_dir_mut, relocate, validate_name};
use crate::error::{Error, Result};
use crate::reference::{Ref, clean_path, get_object_tree, get_reference_path, join_path, parent_path};
use serde::{Deserialize, Serialize};

/// New name for a file or directory, keeping it in the same parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenameFileChange {
    pub connection_id: String,
    pub allocation_id: String,
    pub path: String,
    pub new_name: String,
}

impl RenameFileChange {
    pub(super) fn process_change(&mut self, ctx: &ChangeContext<'_>) -> Result<Ref> {
        let path = clean_path(&self.path);
        if path == "/" {
            return Err(Error::invalid_operation("the allocation root cannot be renamed"));
        }
        validate_name(&self.new_name)?;
        let new_path = join_path(&parent_path(&path), &self.new_name);

        let mut root = get_reference_path(ctx.refs, ctx.allocation_id, &path)?;
        let dir = parent_dir_mut(&mut root, &path)?;
        let idx = dir
            .child_index(&path)
            .ok_or_else(|| Error::file_not_found(format!("nothing to rename at {}", path)))?;
        if new_path == path {
            root.calculate_hash(Some(ctx.refs), ctx.cancel)?;
            return Ok(root);
        }
        if dir.child_index(&new_path).is_some() {
            return Err(Error::invalid_parameters(format!("{} already exists", new_path)));
        }

        // rows keep their ids and are rewritten in place
        let mut moved = get_object_tree(ctx.refs, ctx.allocation_id, &path)?;
        relocate(&mut moved, &new_path);
        dir.remove_child(idx as i64);
        dir.add_child(moved);

        root.calculate_hash(Some(ctx.refs), ctx.cancel)?;
        Ok(root)
    }
}
