//! Typed change processors.
//!
//! Every recorded change is decoded into one [`ChangeProcessor`] variant based
//! on its operation tag. A processor carries its own payload and can apply
//! itself to the reference tree, promote the bytes it staged and clean them up
//! again.

mod attributes;
mod copy_file;
mod delete_file;
mod new_file;
mod rename_file;
mod update_file;

pub use attributes::AttributesChange;
pub use copy_file::CopyFileChange;
pub use delete_file::DeleteFileChange;
pub use new_file::NewFileChange;
pub use rename_file::RenameFileChange;
pub use update_file::UpdateFileChange;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::filestore::FileStore;
use crate::meta::RefStore;
use crate::reference::{Ref, base_name, get_sub_dirs_from_path, join_path, parent_path};
use std::fmt;
use tracing::debug;

/// Operation tag stored with every change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationTag {
    Insert,
    Update,
    Delete,
    Rename,
    Copy,
    UpdateAttrs,
}

impl OperationTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationTag::Insert => "insert",
            OperationTag::Update => "update",
            OperationTag::Delete => "delete",
            OperationTag::Rename => "rename",
            OperationTag::Copy => "copy",
            OperationTag::UpdateAttrs => "update_attrs",
        }
    }

    /// Tag for a stored operation string. Unknown and empty tags give `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "insert" => Some(OperationTag::Insert),
            "update" => Some(OperationTag::Update),
            "delete" => Some(OperationTag::Delete),
            "rename" => Some(OperationTag::Rename),
            "copy" => Some(OperationTag::Copy),
            "update_attrs" => Some(OperationTag::UpdateAttrs),
            _ => None,
        }
    }
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a processor needs from its session.
#[derive(Clone, Copy)]
pub struct ChangeContext<'a> {
    pub refs: &'a dyn RefStore,
    pub files: &'a FileStore,
    pub allocation_id: &'a str,
    pub connection_id: &'a str,
    pub cancel: &'a CancelToken,
}

impl<'a> ChangeContext<'a> {
    pub fn new(
        refs: &'a dyn RefStore,
        files: &'a FileStore,
        allocation_id: &'a str,
        connection_id: &'a str,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            refs,
            files,
            allocation_id,
            connection_id,
            cancel,
        }
    }
}

/// One decoded change.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeProcessor {
    NewFile(NewFileChange),
    UpdateFile(UpdateFileChange),
    DeleteFile(DeleteFileChange),
    RenameFile(RenameFileChange),
    CopyFile(CopyFileChange),
    Attributes(AttributesChange),
}

impl ChangeProcessor {
    pub fn operation(&self) -> OperationTag {
        match self {
            ChangeProcessor::NewFile(_) => OperationTag::Insert,
            ChangeProcessor::UpdateFile(_) => OperationTag::Update,
            ChangeProcessor::DeleteFile(_) => OperationTag::Delete,
            ChangeProcessor::RenameFile(_) => OperationTag::Rename,
            ChangeProcessor::CopyFile(_) => OperationTag::Copy,
            ChangeProcessor::Attributes(_) => OperationTag::UpdateAttrs,
        }
    }

    /// Path the change targets.
    pub fn path(&self) -> &str {
        match self {
            ChangeProcessor::NewFile(c) => &c.path,
            ChangeProcessor::UpdateFile(c) => &c.file.path,
            ChangeProcessor::DeleteFile(c) => &c.path,
            ChangeProcessor::RenameFile(c) => &c.path,
            ChangeProcessor::CopyFile(c) => &c.path,
            ChangeProcessor::Attributes(c) => &c.path,
        }
    }

    /// Decode a stored payload. An empty payload gives default fields.
    pub fn unmarshal(tag: OperationTag, input: &str) -> Result<Self> {
        let input = if input.trim().is_empty() { "{}" } else { input };
        Ok(match tag {
            OperationTag::Insert => ChangeProcessor::NewFile(serde_json::from_str(input)?),
            OperationTag::Update => ChangeProcessor::UpdateFile(serde_json::from_str(input)?),
            OperationTag::Delete => ChangeProcessor::DeleteFile(serde_json::from_str(input)?),
            OperationTag::Rename => ChangeProcessor::RenameFile(serde_json::from_str(input)?),
            OperationTag::Copy => ChangeProcessor::CopyFile(serde_json::from_str(input)?),
            OperationTag::UpdateAttrs => ChangeProcessor::Attributes(
                serde_json::from_str(input)
                    .map_err(|e| Error::invalid_attributes(format!("decoding attribute change: {}", e)))?,
            ),
        })
    }

    pub fn marshal(&self) -> Result<String> {
        Ok(match self {
            ChangeProcessor::NewFile(c) => serde_json::to_string(c)?,
            ChangeProcessor::UpdateFile(c) => serde_json::to_string(c)?,
            ChangeProcessor::DeleteFile(c) => serde_json::to_string(c)?,
            ChangeProcessor::RenameFile(c) => serde_json::to_string(c)?,
            ChangeProcessor::CopyFile(c) => serde_json::to_string(c)?,
            ChangeProcessor::Attributes(c) => serde_json::to_string(c)?,
        })
    }

    /// Apply the change to the stored tree and return the updated root.
    pub fn process_change(&mut self, ctx: &ChangeContext<'_>) -> Result<Ref> {
        ctx.cancel.check()?;
        debug!(
            allocation = ctx.allocation_id,
            connection = ctx.connection_id,
            operation = %self.operation(),
            path = %self.path(),
            "applying change"
        );
        match self {
            ChangeProcessor::NewFile(c) => c.process_change(ctx),
            ChangeProcessor::UpdateFile(c) => c.process_change(ctx),
            ChangeProcessor::DeleteFile(c) => c.process_change(ctx),
            ChangeProcessor::RenameFile(c) => c.process_change(ctx),
            ChangeProcessor::CopyFile(c) => c.process_change(ctx),
            ChangeProcessor::Attributes(c) => c.process_change(ctx),
        }
    }

    /// Remove bytes this change staged.
    ///
    /// Changes that never stage bytes return [`Error::OperationNotApplicable`].
    pub fn delete_temp_file(&self, ctx: &ChangeContext<'_>) -> Result<()> {
        match self {
            ChangeProcessor::NewFile(c) => c.delete_temp_file(ctx),
            ChangeProcessor::UpdateFile(c) => c.file.delete_temp_file(ctx),
            ChangeProcessor::DeleteFile(_)
            | ChangeProcessor::RenameFile(_)
            | ChangeProcessor::CopyFile(_)
            | ChangeProcessor::Attributes(_) => Err(Error::OperationNotApplicable),
        }
    }

    /// Promote staged bytes into the content store.
    ///
    /// Nothing is deleted here. Content the change stopped referencing is
    /// listed by [`ChangeProcessor::released_content`] and dropped by
    /// [`release_content`] once the tree update is durable.
    pub fn commit_to_file_store(&self, ctx: &ChangeContext<'_>) -> Result<()> {
        match self {
            ChangeProcessor::NewFile(c) => c.commit_to_file_store(ctx),
            ChangeProcessor::UpdateFile(c) => c.file.commit_to_file_store(ctx),
            ChangeProcessor::DeleteFile(_)
            | ChangeProcessor::RenameFile(_)
            | ChangeProcessor::CopyFile(_)
            | ChangeProcessor::Attributes(_) => Ok(()),
        }
    }

    /// Content hashes the applied change stopped referencing.
    pub fn released_content(&self) -> Vec<String> {
        match self {
            ChangeProcessor::UpdateFile(c) => c.superseded().to_vec(),
            ChangeProcessor::DeleteFile(c) => c
                .content_hash
                .as_ref()
                .map(|hashes| hashes.keys().cloned().collect())
                .unwrap_or_default(),
            ChangeProcessor::NewFile(_)
            | ChangeProcessor::RenameFile(_)
            | ChangeProcessor::CopyFile(_)
            | ChangeProcessor::Attributes(_) => Vec::new(),
        }
    }
}

impl From<NewFileChange> for ChangeProcessor {
    fn from(c: NewFileChange) -> Self {
        ChangeProcessor::NewFile(c)
    }
}

impl From<UpdateFileChange> for ChangeProcessor {
    fn from(c: UpdateFileChange) -> Self {
        ChangeProcessor::UpdateFile(c)
    }
}

impl From<DeleteFileChange> for ChangeProcessor {
    fn from(c: DeleteFileChange) -> Self {
        ChangeProcessor::DeleteFile(c)
    }
}

impl From<RenameFileChange> for ChangeProcessor {
    fn from(c: RenameFileChange) -> Self {
        ChangeProcessor::RenameFile(c)
    }
}

impl From<CopyFileChange> for ChangeProcessor {
    fn from(c: CopyFileChange) -> Self {
        ChangeProcessor::CopyFile(c)
    }
}

impl From<AttributesChange> for ChangeProcessor {
    fn from(c: AttributesChange) -> Self {
        ChangeProcessor::Attributes(c)
    }
}

/// Ancestor path of `path` at `depth` segments, `/a/b/c` at 2 being `/a/b`.
fn ancestor(segments: &[String], depth: usize) -> String {
    format!("/{}", segments[..depth].join("/"))
}

/// Parent directory of `path` inside a tree loaded by `get_reference_path`.
fn parent_dir_mut<'r>(root: &'r mut Ref, path: &str) -> Result<&'r mut Ref> {
    let segments = get_sub_dirs_from_path(path);
    let mut dir = root;
    for depth in 1..segments.len() {
        let p = ancestor(&segments, depth);
        dir = dir
            .child_mut(&p)
            .filter(|c| c.is_dir())
            .ok_or_else(|| Error::invalid_reference_path(format!("{} is not a directory in the tree", p)))?;
    }
    Ok(dir)
}

/// Directory `dir_path`, creating missing directories on the way.
fn ensure_dir_mut<'r>(root: &'r mut Ref, dir_path: &str) -> Result<&'r mut Ref> {
    let segments = get_sub_dirs_from_path(dir_path);
    let allocation_id = root.allocation_id.clone();
    let mut dir = root;
    for depth in 1..=segments.len() {
        let p = ancestor(&segments, depth);
        let idx = match dir.child_index(&p) {
            Some(idx) => idx,
            None => {
                let mut created = Ref::placeholder_directory(&allocation_id, &p);
                created.children_loaded = true;
                dir.add_child(created)
            }
        };
        let next = &mut dir.children[idx];
        if !next.is_dir() {
            return Err(Error::invalid_dir_tree(format!(
                "{} is a file, cannot hold {}",
                p, dir_path
            )));
        }
        dir = next;
    }
    Ok(dir)
}

/// Move a loaded subtree to `new_path`, rewriting every descendant path.
fn relocate(node: &mut Ref, new_path: &str) {
    node.name = base_name(new_path);
    node.update_path(new_path, &parent_path(new_path));
    for child in &mut node.children {
        let child_path = join_path(new_path, &base_name(&child.path));
        relocate(child, &child_path);
    }
    node.sort_children();
}

/// Reject names that would escape or alias their directory.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::invalid_parameters(format!("invalid name {:?}", name)));
    }
    Ok(())
}

/// Delete committed objects that no file of the allocation points at anymore.
///
/// `ctx.refs` must see the committed tree; objects still referenced there are kept.
pub fn release_content<'h>(ctx: &ChangeContext<'_>, hashes: impl IntoIterator<Item = &'h String>) -> Result<()> {
    for hash in hashes {
        if hash.is_empty() || ctx.refs.content_hash_in_use(ctx.allocation_id, hash)? {
            continue;
        }
        match ctx.files.delete_file(ctx.allocation_id, hash) {
            Ok(()) => debug!(allocation = ctx.allocation_id, hash = %hash, "released object"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::filestore::FileInputData;
    use crate::meta::MemoryStore;
    use tempfile::TempDir;

    pub const ALLOC: &str = "allocation01";
    pub const CONN: &str = "connection";

    pub struct Fixture {
        pub _dir: TempDir,
        pub files: FileStore,
        pub refs: MemoryStore,
        pub cancel: CancelToken,
    }

    impl Fixture {
        pub fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let files = FileStore::init(dir.path()).unwrap();
            Self {
                _dir: dir,
                files,
                refs: MemoryStore::new(),
                cancel: CancelToken::new(),
            }
        }

        pub fn ctx(&self) -> ChangeContext<'_> {
            ChangeContext::new(&self.refs, &self.files, ALLOC, CONN, &self.cancel)
        }

        /// Stage `data` for `path` and return a matching insert payload.
        pub fn staged(&self, path: &str, data: &[u8]) -> NewFileChange {
            let name = base_name(path);
            let out = self
                .files
                .write_file(ALLOC, &FileInputData::new(&name, path, ""), data, CONN, &self.cancel)
                .unwrap();
            NewFileChange {
                connection_id: CONN.into(),
                allocation_id: ALLOC.into(),
                filename: name,
                path: path.into(),
                hash: out.content_hash.clone(),
                merkle_root: out.merkle_root,
                actual_hash: out.content_hash,
                actual_size: out.size,
                size: out.size,
                ..Default::default()
            }
        }

        /// Insert `path` with `data` and commit its bytes.
        pub fn insert(&self, path: &str, data: &[u8]) -> Ref {
            let mut change = ChangeProcessor::from(self.staged(path, data));
            let root = change.process_change(&self.ctx()).unwrap();
            change.commit_to_file_store(&self.ctx()).unwrap();
            root
        }
    }
}
