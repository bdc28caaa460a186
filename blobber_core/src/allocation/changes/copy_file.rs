use super::{ChangeContext, ensure_dir_mut, relocate};
use crate::error::{Error, Result};
use crate::reference::{Ref, base_name, clean_path, get_object_tree, get_reference_path, join_path};
use serde::{Deserialize, Serialize};

/// Copy of a file or directory into another directory.
///
/// Only references are cloned: the copy points at the same content objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyFileChange {
    pub connection_id: String,
    pub allocation_id: String,
    pub path: String,
    /// Directory receiving the copy.
    pub dest_path: String,
}

fn clear_ids(node: &mut Ref) {
    node.id = 0;
    for child in &mut node.children {
        clear_ids(child);
    }
}

impl CopyFileChange {
    pub(super) fn process_change(&mut self, ctx: &ChangeContext<'_>) -> Result<Ref> {
        let src = clean_path(&self.path);
        let dest_dir = clean_path(&self.dest_path);
        if src == "/" {
            return Err(Error::invalid_operation("the allocation root cannot be copied"));
        }
        if dest_dir == src || dest_dir.starts_with(&format!("{}/", src)) {
            return Err(Error::invalid_parameters(format!(
                "Invalid destination path {}: inside {}",
                dest_dir, src
            )));
        }
        if ctx.refs.get_ref(ctx.allocation_id, &src)?.is_none() {
            return Err(Error::file_not_found(format!("nothing to copy at {}", src)));
        }

        let mut copy = get_object_tree(ctx.refs, ctx.allocation_id, &src)?;
        let new_path = join_path(&dest_dir, &base_name(&src));
        clear_ids(&mut copy);
        relocate(&mut copy, &new_path);

        let mut root = get_reference_path(ctx.refs, ctx.allocation_id, &new_path)?;
        let dir = ensure_dir_mut(&mut root, &dest_dir)?;
        if dir.child_index(&new_path).is_some() {
            return Err(Error::invalid_parameters(format!("{} already exists", new_path)));
        }
        dir.add_child(copy);

        root.calculate_hash(Some(ctx.refs), ctx.cancel)?;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::super::ChangeProcessor;
    use super::super::testing::*;
    use super::*;
    use crate::meta::RefStore;
    use crate::reference::get_reference;

    fn copy(fx: &Fixture, path: &str, dest: &str) -> crate::Result<Ref> {
        ChangeProcessor::from(CopyFileChange {
            path: path.into(),
            dest_path: dest.into(),
            ..Default::default()
        })
        .process_change(&fx.ctx())
    }

    #[test]
    fn test_copy_file_into_new_directory() {
        let fx = Fixture::new();
        fx.insert("/a", b"data");
        let src = get_reference(&fx.refs, ALLOC, "/a").unwrap();

        let root = copy(&fx, "/a", "/backup").unwrap();
        let dup = get_reference(&fx.refs, ALLOC, "/backup/a").unwrap();
        assert_ne!(dup.id, src.id);
        assert_eq!(dup.content_hash, src.content_hash);
        assert_eq!(root.size, 8);
        assert!(get_reference(&fx.refs, ALLOC, "/backup").unwrap().is_dir());
        assert!(get_reference(&fx.refs, ALLOC, "/a").is_ok());
    }

    #[test]
    fn test_copy_directory() {
        let fx = Fixture::new();
        fx.insert("/d/x", b"x");
        fx.insert("/d/e/y", b"y");
        fx.insert("/t/keep", b"k");

        copy(&fx, "/d", "/t").unwrap();
        assert_eq!(fx.refs.list_descendants(ALLOC, "/t/d").unwrap().len(), 4);
        assert_eq!(fx.refs.list_descendants(ALLOC, "/d").unwrap().len(), 4);
        assert!(get_reference(&fx.refs, ALLOC, "/t/keep").is_ok());
    }

    #[test]
    fn test_copy_into_itself_rejected() {
        let fx = Fixture::new();
        fx.insert("/d/x", b"x");
        assert_eq!(copy(&fx, "/d", "/d/sub").unwrap_err().code(), "invalid_parameters");
        assert_eq!(copy(&fx, "/d", "/d").unwrap_err().code(), "invalid_parameters");
    }

    #[test]
    fn test_copy_destination_must_be_directory() {
        let fx = Fixture::new();
        fx.insert("/a", b"a");
        fx.insert("/f", b"f");
        let err = copy(&fx, "/a", "/f").unwrap_err();
        assert_eq!(err.code(), "invalid_dir_tree");
    }

    #[test]
    fn test_copy_collision_and_missing() {
        let fx = Fixture::new();
        fx.insert("/a", b"a");
        fx.insert("/t/a", b"other");
        assert_eq!(copy(&fx, "/a", "/t").unwrap_err().code(), "invalid_parameters");
        assert_eq!(copy(&fx, "/missing", "/t").unwrap_err().code(), "file_not_found");
    }
}
