//! Merkle reference tree of an allocation.
//!
//! Every file and directory is a [`Ref`] keyed by (allocation, path). A
//! directory owns its loaded children, kept sorted by lookup hash so that its
//! hash depends only on which children it has. Rows are persisted flat through
//! [`RefStore`](crate::meta::RefStore); parent/child links are recovered from
//! `parent_path`.

mod attributes;
mod objectpath;
mod path;

pub use attributes::{Attributes, WhoPays};
pub use objectpath::{ObjectPath, get_object_path};
pub use path::{
    delete_reference, get_object_tree, get_ref_with_children, get_ref_with_sorted_children,
    get_reference, get_reference_from_lookup_hash, get_reference_path,
    get_reference_path_from_paths,
};

use crate::cancel::CancelToken;
use crate::config::CHUNK_SIZE;
use crate::error::Result;
use crate::hash::{hash_str, reference_lookup};
use crate::meta::RefStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefType {
    #[serde(rename = "f")]
    File,
    #[default]
    #[serde(rename = "d")]
    Directory,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::File => "f",
            RefType::Directory => "d",
        }
    }
}

/// Path segments below the root: `/` gives none, `/1/2` gives `["1", "2"]`.
pub fn get_sub_dirs_from_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parent directory of a path. The root has no parent.
pub fn parent_path(path: &str) -> String {
    let segments = get_sub_dirs_from_path(path);
    match segments.len() {
        0 => String::new(),
        n => join_segments(&segments[..n - 1]),
    }
}

/// Last segment of a path, `/` for the root.
pub fn base_name(path: &str) -> String {
    get_sub_dirs_from_path(path)
        .pop()
        .unwrap_or_else(|| "/".to_string())
}

/// Join a directory and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Canonical form of a user-supplied path: leading `/`, no empty segments.
pub fn clean_path(path: &str) -> String {
    join_segments(&get_sub_dirs_from_path(path))
}

fn join_segments(segments: &[String]) -> String {
    format!("/{}", segments.join("/"))
}

/// One node of the reference tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ref {
    pub id: i64,
    #[serde(rename = "type")]
    pub ref_type: RefType,
    pub allocation_id: String,
    pub lookup_hash: String,
    pub name: String,
    pub path: String,
    pub hash: String,
    pub num_blocks: i64,
    pub path_hash: String,
    pub parent_path: String,
    pub path_level: usize,
    pub custom_meta: String,
    pub content_hash: String,
    pub size: i64,
    pub merkle_root: String,
    pub actual_file_size: i64,
    pub actual_file_hash: String,
    pub mimetype: String,
    pub write_marker: String,
    pub thumbnail_size: i64,
    pub thumbnail_hash: String,
    pub actual_thumbnail_size: i64,
    pub actual_thumbnail_hash: String,
    pub encrypted_key: String,
    /// Raw attribute JSON, see [`Attributes`].
    pub attributes: String,

    #[serde(skip)]
    pub children: Vec<Ref>,
    /// Set once `children` reflects the stored child set (even if empty).
    #[serde(skip)]
    pub children_loaded: bool,
}

impl Ref {
    pub fn new_directory() -> Self {
        Self {
            ref_type: RefType::Directory,
            attributes: "{}".to_string(),
            ..Default::default()
        }
    }

    pub fn new_file() -> Self {
        Self {
            ref_type: RefType::File,
            attributes: "{}".to_string(),
            ..Default::default()
        }
    }

    /// An unsaved directory at `path`.
    pub fn placeholder_directory(allocation_id: &str, path: &str) -> Self {
        let mut dir = Self::new_directory();
        dir.allocation_id = allocation_id.to_string();
        dir.name = base_name(path);
        dir.update_path(path, &parent_path(path));
        dir
    }

    pub fn is_dir(&self) -> bool {
        self.ref_type == RefType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.ref_type == RefType::File
    }

    /// Move this node to `path`, recomputing level and lookup hash.
    pub fn update_path(&mut self, path: &str, parent_path: &str) {
        self.path = path.to_string();
        self.parent_path = parent_path.to_string();
        self.path_level = get_sub_dirs_from_path(path).len() + 1;
        self.lookup_hash = reference_lookup(&self.allocation_id, path);
    }

    /// Insert keeping children ordered by lookup hash. Returns the position.
    pub fn add_child(&mut self, child: Ref) -> usize {
        let pos = self
            .children
            .binary_search_by(|c| c.lookup_hash.as_str().cmp(child.lookup_hash.as_str()))
            .unwrap_or_else(|insert_at| insert_at);
        self.children.insert(pos, child);
        self.children_loaded = true;
        pos
    }

    /// Restore lookup-hash order after children were moved.
    pub fn sort_children(&mut self) {
        self.children
            .sort_by(|a, b| a.lookup_hash.as_str().cmp(b.lookup_hash.as_str()));
    }

    /// Remove the child at `index`. Out-of-range indices are ignored.
    pub fn remove_child(&mut self, index: i64) -> Option<Ref> {
        if index < 0 || index as usize >= self.children.len() {
            return None;
        }
        Some(self.children.remove(index as usize))
    }

    pub fn child_index(&self, path: &str) -> Option<usize> {
        self.children.iter().position(|c| c.path == path)
    }

    pub fn child(&self, path: &str) -> Option<&Ref> {
        self.children.iter().find(|c| c.path == path)
    }

    pub fn child_mut(&mut self, path: &str) -> Option<&mut Ref> {
        self.children.iter_mut().find(|c| c.path == path)
    }

    /// Input of a file's hash.
    pub fn file_hash_data(&self) -> String {
        let attributes = if self.attributes.is_empty() {
            "{}"
        } else {
            self.attributes.as_str()
        };
        format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.allocation_id,
            self.ref_type.as_str(),
            self.name,
            self.path,
            self.size,
            self.content_hash,
            self.merkle_root,
            self.actual_file_size,
            self.actual_file_hash,
            attributes
        )
    }

    /// Recompute hashes bottom-up and, when a store is given, persist every
    /// recomputed node children first.
    ///
    /// A directory whose children were never loaded keeps its stored hash.
    pub fn calculate_hash(&mut self, store: Option<&dyn RefStore>, cancel: &CancelToken) -> Result<String> {
        cancel.check()?;
        match self.ref_type {
            RefType::File => self.calculate_file_hash(),
            RefType::Directory => {
                if self.children.is_empty() && !self.children_loaded {
                    return Ok(self.hash.clone());
                }
                for child in &mut self.children {
                    child.calculate_hash(store, cancel)?;
                }
                self.calculate_dir_hash();
            }
        }

        if let Some(store) = store {
            store.save_ref(self)?;
        }
        Ok(self.hash.clone())
    }

    fn calculate_file_hash(&mut self) {
        self.hash = hash_str(&self.file_hash_data());
        self.num_blocks = (self.size + CHUNK_SIZE - 1).div_euclid(CHUNK_SIZE);
        self.refresh_location();
        self.path_hash = self.lookup_hash.clone();
    }

    fn calculate_dir_hash(&mut self) {
        self.refresh_location();
        if self.children.is_empty() {
            self.hash = String::new();
            self.path_hash = String::new();
            self.num_blocks = 0;
            self.size = 0;
            return;
        }

        let hashes: Vec<&str> = self.children.iter().map(|c| c.hash.as_str()).collect();
        let path_hashes: Vec<&str> = self.children.iter().map(|c| c.path_hash.as_str()).collect();
        self.hash = hash_str(&hashes.join(":"));
        self.path_hash = hash_str(&path_hashes.join(":"));
        self.num_blocks = self.children.iter().map(|c| c.num_blocks).sum();
        self.size = self.children.iter().map(|c| c.size).sum();
    }

    fn refresh_location(&mut self) {
        self.path_level = get_sub_dirs_from_path(&self.path).len() + 1;
        self.lookup_hash = reference_lookup(&self.allocation_id, &self.path);
    }

    pub fn get_attributes(&self) -> Result<Attributes> {
        Attributes::decode(&self.attributes)
    }

    /// Store `attrs`; `None` or zero attributes are stored as `{}`.
    pub fn set_attributes(&mut self, attrs: Option<&Attributes>) -> Result<()> {
        self.attributes = match attrs {
            Some(a) => a.encode()?,
            None => "{}".to_string(),
        };
        Ok(())
    }

    /// Fields exposed in listings and proofs.
    pub fn listing_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("type".into(), json!(self.ref_type.as_str()));
        data.insert("lookup_hash".into(), json!(self.lookup_hash));
        data.insert("name".into(), json!(self.name));
        data.insert("path".into(), json!(self.path));
        data.insert("hash".into(), json!(self.hash));
        data.insert("num_of_blocks".into(), json!(self.num_blocks));
        data.insert("path_hash".into(), json!(self.path_hash));
        data.insert("size".into(), json!(self.size));

        if self.is_file() {
            let attributes = serde_json::from_str::<Value>(&self.attributes).unwrap_or(Value::Null);
            data.insert("custom_meta".into(), json!(self.custom_meta));
            data.insert("content_hash".into(), json!(self.content_hash));
            data.insert("merkle_root".into(), json!(self.merkle_root));
            data.insert("actual_file_size".into(), json!(self.actual_file_size));
            data.insert("actual_file_hash".into(), json!(self.actual_file_hash));
            data.insert("mimetype".into(), json!(self.mimetype));
            data.insert("thumbnail_size".into(), json!(self.thumbnail_size));
            data.insert("thumbnail_hash".into(), json!(self.thumbnail_hash));
            data.insert("actual_thumbnail_size".into(), json!(self.actual_thumbnail_size));
            data.insert("actual_thumbnail_hash".into(), json!(self.actual_thumbnail_hash));
            data.insert("encrypted_key".into(), json!(self.encrypted_key));
            data.insert("attributes".into(), attributes);
        }
        data
    }

    /// Content hashes (content and thumbnail) of every file in this subtree.
    pub fn content_hashes(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_content_hashes(&mut out);
        out
    }

    fn collect_content_hashes(&self, out: &mut Vec<String>) {
        if self.is_file() {
            if !self.content_hash.is_empty() {
                out.push(self.content_hash.clone());
            }
            if !self.thumbnail_hash.is_empty() {
                out.push(self.thumbnail_hash.clone());
            }
        }
        for child in &self.children {
            child.collect_content_hashes(out);
        }
    }
}
