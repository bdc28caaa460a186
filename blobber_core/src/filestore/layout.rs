//! On-disk layout of the content store.
//!
//! ```text
//! <root>/<a[0..3]>/<a[3..6]>/<a[6..9]>/<a[9..]>/        allocation
//!     objects/<h[0..3]>/<h[3..6]>/<h[6..9]>/<h[9..]>     committed object
//!     objects/tmp/<name>.<sha3(path)>.<connection>       staged upload
//! ```

use crate::error::{Error, Result};
use crate::hash::hash_str;
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) const OBJECTS_DIR: &str = "objects";
pub(crate) const TEMP_DIR: &str = "tmp";

/// Shortest identifier that can be sharded into three levels plus a file name.
const MIN_SHARDED_LEN: usize = 10;

/// Split a content hash into its three shard directories and the remaining file name.
///
/// `ed79cae70d43...` becomes (`ed7/9ca/e70`, `d43...`). Only lowercase hex is
/// accepted, so no hash can shard into the `tmp` staging directory.
pub fn object_dir_from_hash(hash: &str) -> Result<(PathBuf, String)> {
    validate_sharded(hash, |c| matches!(c, '0'..='9' | 'a'..='f'))?;
    Ok(shard(hash))
}

fn shard(id: &str) -> (PathBuf, String) {
    let dir = Path::new(&id[0..3]).join(&id[3..6]).join(&id[6..9]);
    (dir, id[9..].to_string())
}

fn validate_sharded(id: &str, allowed: impl Fn(char) -> bool) -> Result<()> {
    if id.len() < MIN_SHARDED_LEN || !id.chars().all(allowed) {
        return Err(Error::invalid_parameters(format!(
            "'{}' is not a shardable identifier",
            id
        )));
    }
    Ok(())
}

/// A single path component supplied by a caller (file name, connection ID).
fn validate_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(Error::invalid_parameters(format!(
            "invalid {}: '{}'",
            kind, value
        )));
    }
    Ok(())
}

/// Resolved directories of one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreAllocation {
    pub id: String,
    pub path: PathBuf,
    pub objects_path: PathBuf,
    pub temp_objects_path: PathBuf,
}

impl StoreAllocation {
    pub(crate) fn resolve(root: &Path, id: &str) -> Result<Self> {
        validate_sharded(id, |c| c.is_ascii_alphanumeric())?;
        let (dir, file) = shard(id);
        let path = root.join(dir).join(file);
        let objects_path = path.join(OBJECTS_DIR);
        let temp_objects_path = objects_path.join(TEMP_DIR);
        Ok(Self {
            id: id.to_string(),
            path,
            objects_path,
            temp_objects_path,
        })
    }

    pub(crate) fn create_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.temp_objects_path)?;
        Ok(())
    }

    /// Permanent path of a committed object.
    pub fn object_path(&self, hash: &str) -> Result<PathBuf> {
        let (dir, file) = object_dir_from_hash(hash)?;
        Ok(self.objects_path.join(dir).join(file))
    }

    /// Staging path of a file being uploaded in a session.
    pub fn temp_file_path(&self, name: &str, path: &str, connection_id: &str) -> Result<PathBuf> {
        validate_component("file name", name)?;
        validate_component("connection id", connection_id)?;
        Ok(self.temp_objects_path.join(format!(
            "{}.{}.{}",
            name,
            hash_str(path),
            connection_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_dir_from_hash() {
        let (dir, file) = object_dir_from_hash(
            "ed79cae70d439c11258236da1dfa6fc550f7cc569768304623e8fbd7d70efae4",
        )
        .unwrap();
        assert_eq!(dir, Path::new("ed7").join("9ca").join("e70"));
        assert_eq!(
            file,
            "d439c11258236da1dfa6fc550f7cc569768304623e8fbd7d70efae4"
        );
    }

    #[test]
    fn test_rejects_short_or_unsafe_ids() {
        assert!(object_dir_from_hash("abc").is_err());
        assert!(object_dir_from_hash("../../../../etc").is_err());
        assert_eq!(
            object_dir_from_hash("short").unwrap_err().code(),
            "invalid_parameters"
        );
    }

    #[test]
    fn test_object_hashes_are_lowercase_hex() {
        for bad in ["tmp0000000000", "ED79CAE70D43", "xyz0123456789"] {
            let err = object_dir_from_hash(bad).unwrap_err();
            assert_eq!(err.code(), "invalid_parameters", "{}", bad);
        }
        let alloc = StoreAllocation::resolve(Path::new("/store"), "tmpalloc0001").unwrap();
        assert!(alloc.object_path("tmp0000000000").is_err());
        assert!(alloc.object_path(&"0".repeat(40)).is_ok());
    }

    #[test]
    fn test_allocation_dirs() {
        let alloc = StoreAllocation::resolve(Path::new("/store"), "0123456789abcdef").unwrap();
        assert_eq!(alloc.path, Path::new("/store/012/345/678/9abcdef"));
        assert_eq!(alloc.objects_path, alloc.path.join("objects"));
        assert_eq!(alloc.temp_objects_path, alloc.path.join("objects/tmp"));
    }

    #[test]
    fn test_temp_file_name() {
        let alloc = StoreAllocation::resolve(Path::new("/store"), "0123456789abcdef").unwrap();
        let temp = alloc.temp_file_path("a.txt", "/docs/a.txt", "conn1").unwrap();
        assert_eq!(
            temp,
            alloc
                .temp_objects_path
                .join(format!("a.txt.{}.conn1", hash_str("/docs/a.txt")))
        );
        assert!(alloc.temp_file_path("../x", "/x", "conn1").is_err());
        assert!(alloc.temp_file_path("x", "/x", "").is_err());
    }
}
