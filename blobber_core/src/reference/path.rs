//! Loading parts of the stored tree.

use super::{Ref, clean_path, get_sub_dirs_from_path};
use crate::error::{Error, Result};
use crate::meta::RefStore;
use std::collections::HashMap;

pub fn get_reference(store: &dyn RefStore, allocation_id: &str, path: &str) -> Result<Ref> {
    store
        .get_ref(allocation_id, path)?
        .ok_or_else(|| Error::not_found(format!("record not found: {}", path)))
}

pub fn get_reference_from_lookup_hash(
    store: &dyn RefStore,
    allocation_id: &str,
    lookup_hash: &str,
) -> Result<Ref> {
    store
        .get_ref_by_lookup_hash(allocation_id, lookup_hash)?
        .ok_or_else(|| Error::not_found(format!("record not found: {}", lookup_hash)))
}

/// Delete one row by id. Missing ids are not an error.
pub fn delete_reference(store: &dyn RefStore, id: i64) -> Result<()> {
    if id < 0 {
        return Err(Error::InvalidRefId { id });
    }
    store.delete_ref(id)
}

fn check_child(parent: &Ref, child: &Ref) -> Result<()> {
    if child.parent_path != parent.path || child.path_level != parent.path_level + 1 {
        return Err(Error::invalid_dir_tree(format!(
            "{} (level {}) is stored under {} (level {})",
            child.path, child.path_level, parent.path, parent.path_level
        )));
    }
    Ok(())
}

fn ensure_children_loaded(store: &dyn RefStore, dir: &mut Ref) -> Result<()> {
    if dir.children_loaded {
        return Ok(());
    }
    for child in store.list_children(&dir.allocation_id, &dir.path)? {
        check_child(dir, &child)?;
        dir.add_child(child);
    }
    dir.children_loaded = true;
    Ok(())
}

/// Root of the allocation with every directory along `path` loaded.
pub fn get_reference_path(store: &dyn RefStore, allocation_id: &str, path: &str) -> Result<Ref> {
    get_reference_path_from_paths(store, allocation_id, &[path])
}

/// Root of the allocation with every directory along each of `paths` loaded.
///
/// A missing root yields an empty unsaved root; ancestors missing further down
/// simply end the walk for that path.
pub fn get_reference_path_from_paths(
    store: &dyn RefStore,
    allocation_id: &str,
    paths: &[&str],
) -> Result<Ref> {
    let Some(mut root) = store.get_ref(allocation_id, "/")? else {
        return Ok(Ref::placeholder_directory(allocation_id, "/"));
    };
    if !root.is_dir() {
        return Err(Error::invalid_dir_tree("root of the allocation is not a directory"));
    }
    ensure_children_loaded(store, &mut root)?;

    for path in paths {
        let segments = get_sub_dirs_from_path(&clean_path(path));
        let mut node = &mut root;
        for depth in 0..segments.len().saturating_sub(1) {
            let ancestor = format!("/{}", segments[..=depth].join("/"));
            let Some(idx) = node.child_index(&ancestor) else {
                break;
            };
            let child = &mut node.children[idx];
            if !child.is_dir() {
                return Err(Error::invalid_dir_tree(format!(
                    "{} is a file but {} needs it to be a directory",
                    ancestor, path
                )));
            }
            ensure_children_loaded(store, child)?;
            node = child;
        }
    }

    Ok(root)
}

fn load_with_children(
    store: &dyn RefStore,
    allocation_id: &str,
    path: &str,
    sorted: bool,
) -> Result<Ref> {
    let path = clean_path(path);
    let rows = store.list_children(allocation_id, &path)?;

    let Some(mut dir) = store.get_ref(allocation_id, &path)? else {
        if !rows.is_empty() {
            return Err(Error::invalid_dir_tree(format!(
                "{} has children but no row of its own",
                path
            )));
        }
        let mut placeholder = Ref::placeholder_directory(allocation_id, &path);
        placeholder.children_loaded = true;
        return Ok(placeholder);
    };

    if dir.is_file() && !rows.is_empty() {
        return Err(Error::invalid_dir_tree(format!("file {} has children", path)));
    }
    for row in rows {
        check_child(&dir, &row)?;
        if sorted {
            dir.add_child(row);
        } else {
            dir.children.push(row);
        }
    }
    if dir.is_dir() {
        dir.children_loaded = true;
    }
    Ok(dir)
}

/// The ref at `path` with its direct children, in store order.
///
/// A path with no row yields an unsaved empty directory.
pub fn get_ref_with_children(store: &dyn RefStore, allocation_id: &str, path: &str) -> Result<Ref> {
    load_with_children(store, allocation_id, path, false)
}

/// Like [`get_ref_with_children`], children ordered by lookup hash.
pub fn get_ref_with_sorted_children(
    store: &dyn RefStore,
    allocation_id: &str,
    path: &str,
) -> Result<Ref> {
    load_with_children(store, allocation_id, path, true)
}

/// The complete subtree rooted at `path`.
pub fn get_object_tree(store: &dyn RefStore, allocation_id: &str, path: &str) -> Result<Ref> {
    let path = clean_path(path);
    let mut rows = store.list_descendants(allocation_id, &path)?.into_iter();

    let Some(mut top) = rows.next() else {
        return Err(Error::invalid_parameters(format!(
            "could not find object tree at {}",
            path
        )));
    };
    if top.path != path {
        return Err(Error::invalid_object_tree(format!("no row for {}", path)));
    }

    let mut by_parent: HashMap<String, Vec<Ref>> = HashMap::new();
    for row in rows {
        by_parent.entry(row.parent_path.clone()).or_default().push(row);
    }
    attach_descendants(&mut top, &mut by_parent);

    if let Some(orphan) = by_parent.values().flatten().next() {
        return Err(Error::invalid_object_tree(format!(
            "{} has no parent in the tree",
            orphan.path
        )));
    }
    Ok(top)
}

fn attach_descendants(node: &mut Ref, by_parent: &mut HashMap<String, Vec<Ref>>) {
    if !node.is_dir() {
        return;
    }
    node.children_loaded = true;
    if let Some(children) = by_parent.remove(&node.path) {
        for mut child in children {
            attach_descendants(&mut child, by_parent);
            node.add_child(child);
        }
    }
}
