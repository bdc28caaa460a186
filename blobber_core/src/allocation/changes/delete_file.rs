use super::{ChangeContext, parent_dir_mut};
use crate::error::{Error, Result};
use crate::reference::{Ref, clean_path, get_object_tree, get_reference_path};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Removal of a file or a whole directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeleteFileChange {
    pub connection_id: String,
    pub allocation_id: String,
    pub name: String,
    pub path: String,
    pub size: i64,
    pub hash: String,
    /// Content hashes of the removed subtree, filled in when applied.
    #[serde(rename = "ContentHash")]
    pub content_hash: Option<BTreeMap<String, bool>>,
}

impl DeleteFileChange {
    pub(super) fn process_change(&mut self, ctx: &ChangeContext<'_>) -> Result<Ref> {
        let path = clean_path(&self.path);
        if path == "/" {
            return Err(Error::invalid_operation("the allocation root cannot be deleted"));
        }

        let mut root = get_reference_path(ctx.refs, ctx.allocation_id, &path)?;
        let dir = parent_dir_mut(&mut root, &path)?;
        let idx = dir
            .child_index(&path)
            .ok_or_else(|| Error::file_not_found(format!("nothing to delete at {}", path)))?;

        let removed = get_object_tree(ctx.refs, ctx.allocation_id, &path)?;
        self.content_hash = Some(
            removed
                .content_hashes()
                .into_iter()
                .map(|h| (h, true))
                .collect(),
        );
        dir.remove_child(idx as i64);
        ctx.refs.delete_subtree(ctx.allocation_id, &path)?;

        root.calculate_hash(Some(ctx.refs), ctx.cancel)?;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::{ChangeProcessor, release_content};
    use super::*;
    use crate::meta::RefStore;
    use crate::reference::get_reference;

    fn delete(fx: &Fixture, path: &str) -> crate::Result<Ref> {
        let mut change = ChangeProcessor::from(DeleteFileChange {
            path: path.into(),
            ..Default::default()
        });
        let root = change.process_change(&fx.ctx())?;
        change.commit_to_file_store(&fx.ctx())?;
        release_content(&fx.ctx(), &change.released_content())?;
        Ok(root)
    }

    #[test]
    fn test_delete_file() {
        let fx = Fixture::new();
        fx.insert("/a", b"aa");
        fx.insert("/b", b"b");
        let a = get_reference(&fx.refs, ALLOC, "/a").unwrap();

        let root = delete(&fx, "/a").unwrap();
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.size, 1);
        assert!(get_reference(&fx.refs, ALLOC, "/a").unwrap_err().is_not_found());
        assert!(!fx.files.object_exists(ALLOC, &a.content_hash).unwrap());
    }

    #[test]
    fn test_delete_directory_subtree() {
        let fx = Fixture::new();
        fx.insert("/d/x", b"x");
        fx.insert("/d/e/y", b"y");
        fx.insert("/keep", b"k");

        let root = delete(&fx, "/d").unwrap();
        assert_eq!(root.children.len(), 1);
        assert!(fx.refs.list_descendants(ALLOC, "/d").unwrap().is_empty());
        assert_eq!(fx.refs.list_descendants(ALLOC, "/").unwrap().len(), 2);
    }

    #[test]
    fn test_delete_last_file_empties_root() {
        let fx = Fixture::new();
        fx.insert("/only", b"o");
        let root = delete(&fx, "/only").unwrap();
        assert_eq!(root.hash, "");
        assert_eq!(root.num_blocks, 0);
        assert_eq!(get_reference(&fx.refs, ALLOC, "/").unwrap().hash, "");
    }

    #[test]
    fn test_delete_missing() {
        let fx = Fixture::new();
        fx.insert("/a", b"a");
        assert_eq!(delete(&fx, "/b").unwrap_err().code(), "file_not_found");
        assert_eq!(delete(&fx, "/x/b").unwrap_err().code(), "invalid_reference_path");
        assert_eq!(delete(&fx, "/").unwrap_err().code(), "invalid_operation");
    }

    #[test]
    fn test_release_ignores_missing_objects() {
        let fx = Fixture::new();
        let change = ChangeProcessor::from(DeleteFileChange {
            content_hash: Some([("f".repeat(40), true)].into_iter().collect()),
            ..Default::default()
        });
        change.commit_to_file_store(&fx.ctx()).unwrap();
        release_content(&fx.ctx(), &change.released_content()).unwrap();
    }
}
