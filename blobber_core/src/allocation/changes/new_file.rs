use super::{ChangeContext, ensure_dir_mut};
use crate::error::{Error, Result};
use crate::filestore::FileInputData;
use crate::reference::{Attributes, Ref, base_name, clean_path, get_reference_path, parent_path};
use serde::{Deserialize, Serialize};

/// Upload of a file that does not exist yet.
///
/// Also the payload of [`UpdateFileChange`](super::UpdateFileChange).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewFileChange {
    pub connection_id: String,
    pub allocation_id: String,
    /// Name the bytes were staged under.
    pub filename: String,
    pub thumbnail_filename: String,
    #[serde(rename = "filepath")]
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub actual_hash: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub actual_size: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mimetype: String,
    /// Content address of the staged bytes.
    #[serde(rename = "content_hash", skip_serializing_if = "String::is_empty")]
    pub hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub merkle_root: String,
    #[serde(rename = "thumbnail_content_hash", skip_serializing_if = "String::is_empty")]
    pub thumbnail_hash: String,
    pub size: i64,
    pub thumbnail_size: i64,
    #[serde(rename = "actual_thumb_size")]
    pub actual_thumbnail_size: i64,
    #[serde(rename = "actual_thumb_hash")]
    pub actual_thumbnail_hash: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub encrypted_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub custom_meta: String,
    pub attributes: Attributes,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl NewFileChange {
    pub(super) fn content_input(&self) -> FileInputData {
        FileInputData::new(&self.filename, &self.path, &self.hash)
    }

    pub(super) fn thumbnail_input(&self) -> Option<FileInputData> {
        (self.thumbnail_size > 0)
            .then(|| FileInputData::new(&self.thumbnail_filename, &self.path, &self.thumbnail_hash))
    }

    /// Copy the upload's metadata onto a file ref.
    pub(super) fn fill(&self, file: &mut Ref) -> Result<()> {
        file.content_hash = self.hash.clone();
        file.merkle_root = self.merkle_root.clone();
        file.size = self.size;
        file.actual_file_size = self.actual_size;
        file.actual_file_hash = self.actual_hash.clone();
        file.mimetype = self.mimetype.clone();
        file.custom_meta = self.custom_meta.clone();
        file.encrypted_key = self.encrypted_key.clone();
        file.thumbnail_size = self.thumbnail_size;
        file.thumbnail_hash = self.thumbnail_hash.clone();
        file.actual_thumbnail_size = self.actual_thumbnail_size;
        file.actual_thumbnail_hash = self.actual_thumbnail_hash.clone();
        file.set_attributes(Some(&self.attributes))
    }

    pub(super) fn process_change(&mut self, ctx: &ChangeContext<'_>) -> Result<Ref> {
        let path = clean_path(&self.path);
        if path == "/" {
            return Err(Error::invalid_parameters("a file cannot replace the allocation root"));
        }

        let mut root = get_reference_path(ctx.refs, ctx.allocation_id, &path)?;
        let parent = parent_path(&path);
        let dir = ensure_dir_mut(&mut root, &parent)?;
        if dir.child_index(&path).is_some() {
            return Err(Error::invalid_operation(format!("{} already exists", path)));
        }

        let mut file = Ref::new_file();
        file.allocation_id = ctx.allocation_id.to_string();
        file.name = base_name(&path);
        file.update_path(&path, &parent);
        self.fill(&mut file)?;
        dir.add_child(file);

        root.calculate_hash(Some(ctx.refs), ctx.cancel)?;
        Ok(root)
    }

    pub(super) fn commit_to_file_store(&self, ctx: &ChangeContext<'_>) -> Result<()> {
        ctx.files
            .commit_write(ctx.allocation_id, &self.content_input(), ctx.connection_id)?;
        if let Some(thumbnail) = self.thumbnail_input() {
            ctx.files
                .commit_write(ctx.allocation_id, &thumbnail, ctx.connection_id)?;
        }
        Ok(())
    }

    pub(super) fn delete_temp_file(&self, ctx: &ChangeContext<'_>) -> Result<()> {
        ctx.files
            .delete_temp_file(ctx.allocation_id, &self.content_input(), ctx.connection_id)?;
        if let Some(thumbnail) = self.thumbnail_input() {
            ctx.files
                .delete_temp_file(ctx.allocation_id, &thumbnail, ctx.connection_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::ChangeProcessor;
    use super::super::testing::*;
    use super::*;
    use crate::filestore::FileInputData;
    use crate::meta::RefStore;
    use crate::reference::{WhoPays, get_reference, get_ref_with_children};

    #[test]
    fn test_creates_missing_directories() {
        let fx = Fixture::new();
        let root = fx.insert("/a/b/c.txt", b"hello");

        assert_eq!(root.path, "/");
        assert_eq!(root.num_blocks, 1);
        assert_eq!(root.size, 5);

        let dir = get_reference(&fx.refs, ALLOC, "/a/b").unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.path_level, 3);
        let file = get_reference(&fx.refs, ALLOC, "/a/b/c.txt").unwrap();
        assert_eq!(file.name, "c.txt");
        assert_eq!(file.size, 5);
        assert!(fx.files.object_exists(ALLOC, &file.content_hash).unwrap());

        let stored_root = get_reference(&fx.refs, ALLOC, "/").unwrap();
        assert_eq!(stored_root.hash, root.hash);
    }

    #[test]
    fn test_existing_path_rejected() {
        let fx = Fixture::new();
        fx.insert("/a", b"one");
        let mut again = ChangeProcessor::from(fx.staged("/a", b"two"));
        let err = again.process_change(&fx.ctx()).unwrap_err();
        assert_eq!(err.code(), "invalid_operation");
    }

    #[test]
    fn test_file_as_directory_rejected() {
        let fx = Fixture::new();
        fx.insert("/a", b"one");
        let mut nested = ChangeProcessor::from(fx.staged("/a/b", b"two"));
        let err = nested.process_change(&fx.ctx()).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_root_path_rejected() {
        let fx = Fixture::new();
        let mut change = ChangeProcessor::from(NewFileChange {
            path: "/".into(),
            ..Default::default()
        });
        assert_eq!(
            change.process_change(&fx.ctx()).unwrap_err().code(),
            "invalid_parameters"
        );
    }

    #[test]
    fn test_attributes_stored() {
        let fx = Fixture::new();
        let mut nf = fx.staged("/paid", b"data");
        nf.attributes = Attributes::new(WhoPays::ThirdParty);
        ChangeProcessor::from(nf).process_change(&fx.ctx()).unwrap();
        let file = get_reference(&fx.refs, ALLOC, "/paid").unwrap();
        assert_eq!(file.attributes, r#"{"who_pays_for_reads":1}"#);
    }

    #[test]
    fn test_siblings_sorted_after_insert() {
        let fx = Fixture::new();
        for name in ["x", "y", "z", "w"] {
            fx.insert(&format!("/{}", name), name.as_bytes());
        }
        let root = get_ref_with_children(&fx.refs, ALLOC, "/").unwrap();
        assert_eq!(root.children.len(), 4);
        let stored = fx.refs.list_children(ALLOC, "/").unwrap();
        let hashes: Vec<&str> = stored.iter().map(|c| c.lookup_hash.as_str()).collect();
        assert!(hashes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_thumbnail_commit_and_cleanup() {
        let fx = Fixture::new();
        let mut nf = fx.staged("/img", b"image bytes");
        let thumb = fx
            .files
            .write_file(ALLOC, &FileInputData::new("img.thumb", "/img", ""), &b"thumb"[..], CONN, &fx.cancel)
            .unwrap();
        nf.thumbnail_filename = "img.thumb".into();
        nf.thumbnail_hash = thumb.content_hash.clone();
        nf.thumbnail_size = thumb.size;

        let change = ChangeProcessor::from(nf.clone());
        change.commit_to_file_store(&fx.ctx()).unwrap();
        assert!(fx.files.object_exists(ALLOC, &nf.hash).unwrap());
        assert!(fx.files.object_exists(ALLOC, &thumb.content_hash).unwrap());

        // staged copies are gone once promoted
        assert!(change.delete_temp_file(&fx.ctx()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_temp_file() {
        let fx = Fixture::new();
        let change = ChangeProcessor::from(fx.staged("/tmpfile", b"abc"));
        change.delete_temp_file(&fx.ctx()).unwrap();
        assert_eq!(fx.files.temp_path_size(ALLOC, &fx.cancel).unwrap(), 0);
        assert!(change.commit_to_file_store(&fx.ctx()).unwrap_err().is_not_found());
    }
}
