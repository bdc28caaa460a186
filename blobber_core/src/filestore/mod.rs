//! Content-addressed file store.
//!
//! Bytes are staged per (allocation, session) under `objects/tmp` while a write
//! session is open and promoted to their hash-addressed path on commit.

mod layout;
mod usage;

pub use layout::{StoreAllocation, object_dir_from_hash};

use crate::cancel::CancelToken;
use crate::config::{CHUNK_SIZE, FRAGMENT_SIZE, MERKLE_LEAVES};
use crate::error::{Error, Result};
use crate::hash::{ContentHasher, hash_bytes};
use crate::merkle::{LeafHasher, MerklePath, MerkleTree};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const COPY_BUF_SIZE: usize = CHUNK_SIZE as usize;

/// Describes the file a store operation targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInputData {
    pub name: String,
    pub path: String,
    /// Content address the committed object is stored under.
    pub hash: String,
}

impl FileInputData {
    pub fn new(name: impl Into<String>, path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            hash: hash.into(),
        }
    }
}

/// Result of staging bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOutputData {
    pub name: String,
    pub path: String,
    pub merkle_root: String,
    pub content_hash: String,
    pub size: i64,
}

/// One challenged leaf of a stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeBlock {
    /// Fragment `offset` of every 64 KiB block, concatenated.
    pub data: Vec<u8>,
    pub merkle_root: String,
    pub merkle_path: MerklePath,
}

impl ChallengeBlock {
    /// Check the returned bytes against the returned proof.
    pub fn verify(&self) -> bool {
        self.merkle_path
            .verify(&hash_bytes(&self.data), &self.merkle_root)
    }
}

/// Hash-addressed object storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create the root directory if needed and open it.
    pub fn init<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Open an existing store root.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(Error::not_found(format!(
                "file store root {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an allocation's directories, creating them unless `skip_create`.
    pub fn setup_allocation(&self, allocation_id: &str, skip_create: bool) -> Result<StoreAllocation> {
        let alloc = StoreAllocation::resolve(&self.root, allocation_id)?;
        if !skip_create {
            alloc.create_dirs()?;
        }
        Ok(alloc)
    }

    /// Stream `reader` onto the session's staged copy of `input`.
    ///
    /// Repeated writes in the same session append in place. The returned size,
    /// content hash and Merkle root cover everything staged so far, so the
    /// staged prefix is read back for hashing but never rewritten. A failed or
    /// cancelled write truncates the file back to its previous length.
    pub fn write_file<R: Read>(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        reader: R,
        connection_id: &str,
        cancel: &CancelToken,
    ) -> Result<FileOutputData> {
        let alloc = self.setup_allocation(allocation_id, false)?;
        let temp_path = alloc.temp_file_path(&input.name, &input.path, connection_id)?;

        let staged = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&temp_path)?;
        let prior_len = staged.metadata()?.len();

        let appended = (|| -> Result<(u64, String, MerkleTree)> {
            let mut sink = HashingSink::new(&staged);
            sink.absorb(&staged, cancel)?;
            sink.copy_from(reader, cancel)?;
            (&staged).flush()?;
            Ok(sink.finish())
        })();
        let (size, content_hash, tree) = match appended {
            Ok(done) => done,
            Err(e) => {
                let restored = if prior_len == 0 {
                    fs::remove_file(&temp_path)
                } else {
                    staged.set_len(prior_len)
                };
                if let Err(undo) = restored {
                    warn!(path = %temp_path.display(), error = %undo, "could not restore staged file");
                }
                return Err(e);
            }
        };

        debug!(
            allocation = allocation_id,
            path = %input.path,
            connection = connection_id,
            size,
            "staged file"
        );

        Ok(FileOutputData {
            name: input.name.clone(),
            path: input.path.clone(),
            merkle_root: tree.root(),
            content_hash,
            size: size as i64,
        })
    }

    /// Promote the staged file to its content address.
    ///
    /// Returns `true` when a new object was stored and `false` when an object
    /// with that hash already existed and the staged copy was discarded.
    pub fn commit_write(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
    ) -> Result<bool> {
        let alloc = self.setup_allocation(allocation_id, false)?;
        let temp_path = alloc.temp_file_path(&input.name, &input.path, connection_id)?;
        let object_path = alloc.object_path(&input.hash)?;

        if !temp_path.is_file() {
            return Err(Error::not_found(format!(
                "staged file for {} in session {}",
                input.path, connection_id
            )));
        }

        if object_path.exists() {
            fs::remove_file(&temp_path)?;
            debug!(allocation = allocation_id, hash = %input.hash, "object exists, staged copy discarded");
            return Ok(false);
        }

        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&temp_path, &object_path)?;
        debug!(allocation = allocation_id, hash = %input.hash, "object committed");
        Ok(true)
    }

    /// Remove the session's staged copy of `input`.
    pub fn delete_temp_file(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        connection_id: &str,
    ) -> Result<()> {
        let alloc = self.setup_allocation(allocation_id, true)?;
        let temp_path = alloc.temp_file_path(&input.name, &input.path, connection_id)?;
        remove_existing(&temp_path, || {
            format!("staged file for {} in session {}", input.path, connection_id)
        })
    }

    /// Remove a committed object and prune the shard directories it leaves empty.
    pub fn delete_file(&self, allocation_id: &str, content_hash: &str) -> Result<()> {
        let alloc = self.setup_allocation(allocation_id, true)?;
        let object_path = alloc.object_path(content_hash)?;
        remove_existing(&object_path, || format!("object {}", content_hash))?;

        let mut dir = object_path.parent();
        while let Some(d) = dir
            && d != alloc.objects_path.as_path()
        {
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    pub fn object_exists(&self, allocation_id: &str, content_hash: &str) -> Result<bool> {
        let alloc = self.setup_allocation(allocation_id, true)?;
        Ok(alloc.object_path(content_hash)?.is_file())
    }

    fn open_object(&self, allocation_id: &str, input: &FileInputData) -> Result<(fs::File, u64)> {
        let alloc = self.setup_allocation(allocation_id, true)?;
        let path = alloc.object_path(&input.hash)?;
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("object {}", input.hash)));
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    /// Read `num_blocks` blocks starting at the 1-indexed `block_num`.
    ///
    /// A range running past the end of the object is truncated.
    pub fn get_file_block(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        block_num: i64,
        num_blocks: i64,
    ) -> Result<Vec<u8>> {
        let (mut file, size) = self.open_object(allocation_id, input)?;

        let max_block = (size as i64 + CHUNK_SIZE - 1) / CHUNK_SIZE;
        if block_num < 1 || block_num > max_block {
            return Err(Error::invalid_block_number(format!(
                "block {} outside [1, {}]",
                block_num, max_block
            )));
        }
        if num_blocks < 1 {
            return Err(Error::invalid_block_number(format!(
                "cannot read {} blocks",
                num_blocks
            )));
        }

        let offset = (block_num - 1) as u64 * CHUNK_SIZE as u64;
        let wanted = (num_blocks as u64).saturating_mul(CHUNK_SIZE as u64);
        let len = wanted.min(size - offset);

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Return leaf `block_offset` of a stored file with its inclusion proof.
    pub fn get_file_block_for_challenge(
        &self,
        allocation_id: &str,
        input: &FileInputData,
        block_offset: i64,
    ) -> Result<ChallengeBlock> {
        if block_offset < 0 || block_offset >= MERKLE_LEAVES as i64 {
            return Err(Error::invalid_block_number(format!(
                "challenge offset {} outside [0, {})",
                block_offset, MERKLE_LEAVES
            )));
        }
        let leaf = block_offset as usize;

        let (mut file, _) = self.open_object(allocation_id, input)?;
        let mut hasher = LeafHasher::new();
        let mut data = Vec::new();
        let mut block = vec![0u8; CHUNK_SIZE as usize];
        loop {
            let n = read_full(&mut file, &mut block)?;
            if n == 0 {
                break;
            }
            hasher.update(&block[..n]);
            let start = leaf * FRAGMENT_SIZE;
            if start < n {
                data.extend_from_slice(&block[start..(start + FRAGMENT_SIZE).min(n)]);
            }
            if n < block.len() {
                break;
            }
        }

        let tree = hasher.finalize();
        let merkle_path = tree
            .path(leaf)
            .ok_or_else(|| Error::invalid_block_number(format!("no leaf {}", leaf)))?;
        Ok(ChallengeBlock {
            data,
            merkle_root: tree.root(),
            merkle_path,
        })
    }

    /// Build the block tree of a committed object.
    pub fn get_merkle_tree_for_file(
        &self,
        allocation_id: &str,
        input: &FileInputData,
    ) -> Result<MerkleTree> {
        let (file, _) = self.open_object(allocation_id, input)?;
        let mut sink = HashingSink::new(std::io::sink());
        sink.copy_from(file, &CancelToken::new())?;
        Ok(sink.finish().2)
    }
}

fn remove_existing(path: &Path, what: impl FnOnce() -> String) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(what())),
        Err(e) => Err(e.into()),
    }
}

/// Fill `buf` unless the reader hits EOF first. Returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Writer that hashes and builds Merkle leaves for everything passing through.
struct HashingSink<W: Write> {
    out: W,
    content: ContentHasher,
    leaves: LeafHasher,
}

impl<W: Write> HashingSink<W> {
    fn new(out: W) -> Self {
        Self {
            out,
            content: ContentHasher::new(),
            leaves: LeafHasher::new(),
        }
    }

    /// Hash and write everything `reader` yields.
    fn copy_from<R: Read>(&mut self, reader: R, cancel: &CancelToken) -> Result<()> {
        self.pump(reader, cancel, true)
    }

    /// Hash bytes that are already in the output.
    fn absorb<R: Read>(&mut self, reader: R, cancel: &CancelToken) -> Result<()> {
        self.pump(reader, cancel, false)
    }

    fn pump<R: Read>(&mut self, mut reader: R, cancel: &CancelToken, write: bool) -> Result<()> {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            cancel.check()?;
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if write {
                self.out.write_all(&buf[..n])?;
            }
            self.content.update(&buf[..n]);
            self.leaves.update(&buf[..n]);
        }
    }

    fn finish(self) -> (u64, String, MerkleTree) {
        let size = self.leaves.len();
        (size, self.content.finalize_hex(), self.leaves.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ALLOC: &str = "6e8d35b2a1f74c0c9e3b2a9f8c7d6e5f4a3b2c1d0e9f8a7b6c5d4e3f2a1b0c9d";
    const HASH: &str = "ed79cae70d439c11258236da1dfa6fc550f7cc569768304623e8fbd7d70efae4";

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::init(dir.path().join("files")).unwrap();
        (dir, store)
    }

    fn input() -> FileInputData {
        FileInputData::new("a.txt", "/a.txt", HASH)
    }

    fn stage_and_commit(store: &FileStore, data: &[u8]) -> FileOutputData {
        let cancel = CancelToken::new();
        let out = store
            .write_file(ALLOC, &input(), data, "conn1", &cancel)
            .unwrap();
        store.commit_write(ALLOC, &input(), "conn1").unwrap();
        out
    }

    #[test]
    fn test_write_file_hashes() {
        let (_dir, store) = store();
        let out = store
            .write_file(ALLOC, &input(), &b"1\n"[..], "conn1", &CancelToken::new())
            .unwrap();
        assert_eq!(out.size, 2);
        assert_eq!(out.content_hash, "e5fa44f2b31c1fb553b6021e7360d07d5d91ff5e");
        assert_eq!(
            out.merkle_root,
            "064420446ca28f56d79d0abef22339474ab036406b47b72d0756434f786e7aef"
        );
    }

    #[test]
    fn test_write_file_appends_within_session() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        store
            .write_file(ALLOC, &input(), &b"1"[..], "conn1", &cancel)
            .unwrap();
        let out = store
            .write_file(ALLOC, &input(), &b"\n"[..], "conn1", &cancel)
            .unwrap();
        assert_eq!(out.size, 2);
        assert_eq!(out.content_hash, "e5fa44f2b31c1fb553b6021e7360d07d5d91ff5e");

        // another session stages independently
        let other = store
            .write_file(ALLOC, &input(), &b"xyz"[..], "conn2", &cancel)
            .unwrap();
        assert_eq!(other.size, 3);
    }

    #[test]
    fn test_cancelled_write_keeps_prior_bytes() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        store
            .write_file(ALLOC, &input(), &b"abc"[..], "conn1", &cancel)
            .unwrap();

        cancel.cancel();
        let err = store
            .write_file(ALLOC, &input(), &b"def"[..], "conn1", &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let alloc = store.setup_allocation(ALLOC, true).unwrap();
        let temp = alloc.temp_file_path("a.txt", "/a.txt", "conn1").unwrap();
        assert_eq!(fs::read(temp).unwrap(), b"abc");
    }

    /// Yields `data` once, then fails.
    struct BrokenReader {
        data: Option<Vec<u8>>,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.data.take() {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                None => Err(std::io::Error::other("connection reset")),
            }
        }
    }

    #[test]
    fn test_failed_append_truncates_to_prior_bytes() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        store
            .write_file(ALLOC, &input(), &b"abc"[..], "conn1", &cancel)
            .unwrap();

        let broken = BrokenReader {
            data: Some(b"def".to_vec()),
        };
        let err = store
            .write_file(ALLOC, &input(), broken, "conn1", &cancel)
            .unwrap_err();
        assert_eq!(err.code(), "io_error");

        let alloc = store.setup_allocation(ALLOC, true).unwrap();
        let temp = alloc.temp_file_path("a.txt", "/a.txt", "conn1").unwrap();
        assert_eq!(fs::read(&temp).unwrap(), b"abc");

        // the next append continues from the restored bytes
        let out = store
            .write_file(ALLOC, &input(), &b"\n"[..], "conn1", &cancel)
            .unwrap();
        assert_eq!(out.size, 4);
        assert_eq!(fs::read(&temp).unwrap(), b"abc\n");
    }

    #[test]
    fn test_failed_first_write_leaves_nothing_staged() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        cancel.cancel();
        store
            .write_file(ALLOC, &input(), &b"abc"[..], "conn1", &cancel)
            .unwrap_err();
        assert!(
            store
                .delete_temp_file(ALLOC, &input(), "conn1")
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_many_appends_match_single_write() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        let data: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
        let mut last = None;
        for piece in data.chunks(10_000) {
            last = Some(
                store
                    .write_file(ALLOC, &input(), piece, "conn1", &cancel)
                    .unwrap(),
            );
        }
        let whole = store
            .write_file(ALLOC, &input(), &data[..], "conn2", &cancel)
            .unwrap();
        let last = last.unwrap();
        assert_eq!(last.size, whole.size);
        assert_eq!(last.content_hash, whole.content_hash);
        assert_eq!(last.merkle_root, whole.merkle_root);
    }

    #[test]
    fn test_commit_and_dedup() {
        let (_dir, store) = store();
        let cancel = CancelToken::new();
        store
            .write_file(ALLOC, &input(), &b"1\n"[..], "conn1", &cancel)
            .unwrap();
        assert!(store.commit_write(ALLOC, &input(), "conn1").unwrap());

        store
            .write_file(ALLOC, &input(), &b"1\n"[..], "conn2", &cancel)
            .unwrap();
        assert!(!store.commit_write(ALLOC, &input(), "conn2").unwrap());
        assert_eq!(store.temp_path_size(ALLOC, &cancel).unwrap(), 0);
        assert!(store.object_exists(ALLOC, HASH).unwrap());
    }

    #[test]
    fn test_commit_without_staged_bytes() {
        let (_dir, store) = store();
        let err = store.commit_write(ALLOC, &input(), "conn1").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_delete_missing() {
        let (_dir, store) = store();
        assert!(store.delete_file(ALLOC, HASH).unwrap_err().is_not_found());
        assert!(
            store
                .delete_temp_file(ALLOC, &input(), "conn1")
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_delete_prunes_shards() {
        let (_dir, store) = store();
        stage_and_commit(&store, b"data");
        store.delete_file(ALLOC, HASH).unwrap();
        let alloc = store.setup_allocation(ALLOC, true).unwrap();
        assert!(!alloc.objects_path.join("ed7").exists());
        assert!(alloc.temp_objects_path.exists());
    }

    #[test]
    fn test_get_file_block_boundaries() {
        let (_dir, store) = store();
        let data: Vec<u8> = (0..(2 * CHUNK_SIZE as usize + 100))
            .map(|i| (i % 251) as u8)
            .collect();
        stage_and_commit(&store, &data);

        for bad in [0, 4] {
            let err = store.get_file_block(ALLOC, &input(), bad, 1).unwrap_err();
            assert_eq!(err.code(), "invalid_block_number");
        }

        let first = store.get_file_block(ALLOC, &input(), 1, 1).unwrap();
        assert_eq!(first, &data[..CHUNK_SIZE as usize]);

        let last = store.get_file_block(ALLOC, &input(), 3, 1).unwrap();
        assert_eq!(last, &data[2 * CHUNK_SIZE as usize..]);

        let tail = store.get_file_block(ALLOC, &input(), 2, 5).unwrap();
        assert_eq!(tail, &data[CHUNK_SIZE as usize..]);
    }

    #[test]
    fn test_get_file_block_missing_object() {
        let (_dir, store) = store();
        let err = store.get_file_block(ALLOC, &input(), 0, 1).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_challenge_boundaries() {
        let (_dir, store) = store();
        stage_and_commit(&store, b"1\n");

        for bad in [-1, MERKLE_LEAVES as i64] {
            let err = store
                .get_file_block_for_challenge(ALLOC, &input(), bad)
                .unwrap_err();
            assert_eq!(err.code(), "invalid_block_number");
        }

        let first = store
            .get_file_block_for_challenge(ALLOC, &input(), 0)
            .unwrap();
        assert_eq!(first.data, b"1\n");
        assert!(first.verify());

        let last = store
            .get_file_block_for_challenge(ALLOC, &input(), MERKLE_LEAVES as i64 - 1)
            .unwrap();
        assert!(last.data.is_empty());
        assert!(last.verify());
        assert_eq!(last.merkle_root, first.merkle_root);
    }

    #[test]
    fn test_challenge_spans_blocks() {
        let (_dir, store) = store();
        let data: Vec<u8> = (0..(CHUNK_SIZE as usize + 200))
            .map(|i| (i % 97) as u8)
            .collect();
        stage_and_commit(&store, &data);

        let block = store
            .get_file_block_for_challenge(ALLOC, &input(), 2)
            .unwrap();
        let mut expected = data[128..192].to_vec();
        expected.extend_from_slice(&data[CHUNK_SIZE as usize + 128..CHUNK_SIZE as usize + 192]);
        assert_eq!(block.data, expected);
        assert!(block.verify());

        let tree = store.get_merkle_tree_for_file(ALLOC, &input()).unwrap();
        assert_eq!(tree.root(), block.merkle_root);
        assert_eq!(tree, MerkleTree::compute(&data));
    }
}
