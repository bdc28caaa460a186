//! Proof path from the allocation root to the file holding a block.

use super::{Ref, get_ref_with_sorted_children};
use crate::error::{Error, Result};
use crate::meta::RefStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Everything a verifier needs to tie an absolute block number to one file.
///
/// `path` is the root's listing data; every directory on the way carries a
/// `list` with its children's listing data, down to the file's parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectPath {
    pub root_hash: String,
    pub meta: Map<String, Value>,
    pub path: Map<String, Value>,
    /// Block number local to the file.
    pub file_block_num: i64,
    pub ref_id: i64,
}

fn with_list(dir: &Ref, list: Vec<Value>) -> Map<String, Value> {
    let mut data = dir.listing_data();
    data.insert("list".into(), Value::Array(list));
    data
}

/// Locate the file holding the 1-indexed `block_num` across the whole allocation.
pub fn get_object_path(store: &dyn RefStore, allocation_id: &str, block_num: i64) -> Result<ObjectPath> {
    let root = get_ref_with_sorted_children(store, allocation_id, "/")?;
    if !root.is_dir() {
        return Err(Error::invalid_dir_struct(
            "allocation root corresponds to an invalid directory structure",
        ));
    }

    if root.num_blocks < block_num {
        return Err(Error::invalid_block_num(format!(
            "block {} is past the {} blocks of the allocation",
            block_num, root.num_blocks
        )));
    }

    if root.num_blocks == 0 {
        let list = root
            .children
            .iter()
            .map(|c| Value::Object(c.listing_data()))
            .collect();
        return Ok(ObjectPath {
            root_hash: root.hash.clone(),
            path: with_list(&root, list),
            ..Default::default()
        });
    }

    if block_num < 1 {
        return Err(Error::invalid_block_num(format!(
            "block {} is before the first block",
            block_num
        )));
    }

    let (path, file, file_block_num) = descend(store, allocation_id, &root, block_num)?;
    Ok(ObjectPath {
        root_hash: root.hash.clone(),
        meta: file.listing_data(),
        path,
        file_block_num,
        ref_id: file.id,
    })
}

fn descend(
    store: &dyn RefStore,
    allocation_id: &str,
    dir: &Ref,
    mut remaining: i64,
) -> Result<(Map<String, Value>, Ref, i64)> {
    let mut list: Vec<Value> = dir
        .children
        .iter()
        .map(|c| Value::Object(c.listing_data()))
        .collect();

    for (idx, child) in dir.children.iter().enumerate() {
        if child.num_blocks < remaining {
            remaining -= child.num_blocks;
            continue;
        }

        if child.is_file() {
            return Ok((with_list(dir, list), child.clone(), remaining));
        }

        let sub = get_ref_with_sorted_children(store, allocation_id, &child.path)?;
        if sub.hash.is_empty() {
            return Err(Error::failed_object_path(format!(
                "could not load directory {}",
                child.path
            )));
        }
        let (sub_data, file, local) = descend(store, allocation_id, &sub, remaining)?;
        list[idx] = Value::Object(sub_data);
        return Ok((with_list(dir, list), file, local));
    }

    Err(Error::failed_object_path(format!(
        "block counts under {} do not add up",
        dir.path
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::CHUNK_SIZE;
    use crate::meta::MemoryStore;
    use crate::reference::parent_path;
    use std::collections::HashMap;

    fn file(path: &str, blocks: i64) -> Ref {
        let mut r = Ref::new_file();
        r.allocation_id = "7".into();
        r.update_path(path, &parent_path(path));
        r.size = blocks * CHUNK_SIZE;
        r
    }

    fn persist(mut root: Ref) -> MemoryStore {
        let store = MemoryStore::new();
        root.calculate_hash(Some(&store), &CancelToken::new()).unwrap();
        store
    }

    #[test]
    fn test_single_file() {
        let mut root = Ref::placeholder_directory("7", "/");
        root.add_child(file("/1", 10));
        let store = persist(root);

        let op = get_object_path(&store, "7", 1).unwrap();
        assert_eq!(op.meta["path"], "/1");
        assert_eq!(op.meta["num_of_blocks"], 10);
        assert_eq!(op.meta["type"], "f");
        assert_eq!(op.path["path"], "/");
        assert_eq!(op.path["num_of_blocks"], 10);
        assert_eq!(op.path["type"], "d");
        assert_eq!(op.file_block_num, 1);
        assert!(op.ref_id > 0);

        let root = store.get_ref("7", "/").unwrap().unwrap();
        assert_eq!(op.root_hash, root.hash);

        assert_eq!(get_object_path(&store, "7", 10).unwrap().file_block_num, 10);
    }

    #[test]
    fn test_block_out_of_range() {
        let mut root = Ref::placeholder_directory("7", "/");
        root.add_child(file("/1", 10));
        let store = persist(root);

        for bad in [0, 11] {
            let err = get_object_path(&store, "7", bad).unwrap_err();
            assert_eq!(err.code(), "invalid_block_num");
        }
    }

    #[test]
    fn test_empty_tree() {
        let store = MemoryStore::new();
        let op = get_object_path(&store, "3", 0).unwrap();
        assert_eq!(op.path["path"], "/");
        assert_eq!(op.path["num_of_blocks"], 0);
        assert_eq!(op.path["type"], "d");
        assert_eq!(op.file_block_num, 0);
        assert!(op.meta.is_empty());
    }

    #[test]
    fn test_invalid_root() {
        let store = MemoryStore::new();
        let mut stray = file("/1", 1);
        store.save_ref(&mut stray).unwrap();
        let err = get_object_path(&store, "7", 1).unwrap_err();
        assert_eq!(err.code(), "invalid_dir_tree");
        assert!(err.is_structural());
    }

    #[test]
    fn test_file_at_root() {
        let store = MemoryStore::new();
        let mut root = file("/", 1);
        root.hash = "h".into();
        store.save_ref(&mut root).unwrap();
        let err = get_object_path(&store, "7", 1).unwrap_err();
        assert_eq!(err.code(), "invalid_dir_struct");
    }

    /// Delegates to a [`MemoryStore`] but fails listings under one path.
    struct BrokenListing {
        inner: MemoryStore,
        broken: &'static str,
    }

    impl RefStore for BrokenListing {
        fn get_ref(&self, allocation_id: &str, path: &str) -> Result<Option<Ref>> {
            self.inner.get_ref(allocation_id, path)
        }

        fn get_ref_by_lookup_hash(&self, allocation_id: &str, lookup_hash: &str) -> Result<Option<Ref>> {
            self.inner.get_ref_by_lookup_hash(allocation_id, lookup_hash)
        }

        fn list_children(&self, allocation_id: &str, parent_path: &str) -> Result<Vec<Ref>> {
            if parent_path == self.broken {
                return Err(std::io::Error::other("disk on fire").into());
            }
            self.inner.list_children(allocation_id, parent_path)
        }

        fn list_descendants(&self, allocation_id: &str, path: &str) -> Result<Vec<Ref>> {
            self.inner.list_descendants(allocation_id, path)
        }

        fn save_ref(&self, r: &mut Ref) -> Result<()> {
            self.inner.save_ref(r)
        }

        fn delete_ref(&self, id: i64) -> Result<()> {
            self.inner.delete_ref(id)
        }

        fn delete_subtree(&self, allocation_id: &str, path: &str) -> Result<usize> {
            self.inner.delete_subtree(allocation_id, path)
        }

        fn content_hash_in_use(&self, allocation_id: &str, content_hash: &str) -> Result<bool> {
            self.inner.content_hash_in_use(allocation_id, content_hash)
        }
    }

    #[test]
    fn test_store_failure_is_not_a_missing_directory() {
        let mut root = Ref::placeholder_directory("7", "/");
        let mut dir = Ref::placeholder_directory("7", "/d");
        dir.add_child(file("/d/x", 3));
        root.add_child(dir);
        let store = BrokenListing {
            inner: persist(root),
            broken: "/d",
        };

        let err = get_object_path(&store, "7", 1).unwrap_err();
        assert_eq!(err.code(), "io_error");

        let store = BrokenListing { broken: "/", ..store };
        assert_eq!(get_object_path(&store, "7", 1).unwrap_err().code(), "io_error");
    }

    #[test]
    fn test_unresolvable_directory() {
        let store = MemoryStore::new();
        let mut root = Ref::placeholder_directory("7", "/");
        root.num_blocks = 5;
        root.hash = "h".into();
        store.save_ref(&mut root).unwrap();
        let mut dir = Ref::placeholder_directory("7", "/d");
        dir.num_blocks = 5;
        store.save_ref(&mut dir).unwrap();

        let err = get_object_path(&store, "7", 1).unwrap_err();
        assert_eq!(err.code(), "failed_object_path");
    }

    #[test]
    fn test_every_block_maps_to_one_file() {
        let mut root = Ref::placeholder_directory("7", "/");
        let mut dir = Ref::placeholder_directory("7", "/d");
        dir.add_child(file("/d/x", 3));
        root.add_child(file("/a", 2));
        root.add_child(dir);
        let store = persist(root);

        let mut per_file: HashMap<String, Vec<i64>> = HashMap::new();
        for block in 1..=5 {
            let op = get_object_path(&store, "7", block).unwrap();
            let path = op.meta["path"].as_str().unwrap().to_string();
            per_file.entry(path).or_default().push(op.file_block_num);
        }
        assert_eq!(per_file["/a"], vec![1, 2]);
        assert_eq!(per_file["/d/x"], vec![1, 2, 3]);
    }

    #[test]
    fn test_nested_listing() {
        let mut root = Ref::placeholder_directory("7", "/");
        let mut dir = Ref::placeholder_directory("7", "/d");
        dir.add_child(file("/d/x", 3));
        root.add_child(dir);
        let store = persist(root);

        let op = get_object_path(&store, "7", 2).unwrap();
        let top = op.path["list"].as_array().unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0]["path"], "/d");
        assert_eq!(top[0]["list"][0]["path"], "/d/x");
        assert_eq!(op.file_block_num, 2);
    }
}
