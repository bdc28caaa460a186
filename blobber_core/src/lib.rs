//! # Blobber Core
//!
//! Storage node core: a content-addressed file store, a Merkle reference tree
//! per allocation and the write-session pipeline that mutates both.
//!
//! Clients stage bytes under a write session, record the changes they want
//! (insert, update, delete, rename, copy, attribute updates) and commit. On
//! commit every change is replayed against the allocation's reference tree,
//! the tree hashes are recomputed up to the root and the staged bytes are
//! promoted to their content address.
//!
//! ## Features
//!
//! - Hash-addressed object storage with per-session staging
//! - Block Merkle trees and challenge proofs over stored files
//! - Reference tree with lookup hashes and object-path proofs
//! - Read and write pricing against prepaid pools
//! - Pluggable metadata backend behind transactional traits
//!
//! ## Example
//!
//! ```no_run
//! use blobber_core::{
//!     AllocationChange, CancelToken, FileStore, MemoryStore, NewFileChange, Session,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let files = FileStore::init("./store/files")?;
//! let meta = MemoryStore::new();
//! let cancel = CancelToken::new();
//!
//! let session = Session::new(&meta, &files, "conn-1", "a1b2c3d4e5f6", "client-1");
//! let out = session.stage("a.txt", "/docs/a.txt", &b"hello"[..], &cancel)?;
//! let change = NewFileChange {
//!     filename: "a.txt".into(),
//!     path: "/docs/a.txt".into(),
//!     hash: out.content_hash.clone(),
//!     actual_hash: out.content_hash,
//!     merkle_root: out.merkle_root,
//!     size: out.size,
//!     actual_size: out.size,
//!     ..Default::default()
//! };
//! session.record([(AllocationChange::new(out.size), change.into())])?;
//!
//! let outcome = session.commit("", &cancel)?;
//! println!("allocation root {}", outcome.root.hash);
//! # Ok(())
//! # }
//! ```

pub mod allocation;
mod cancel;
pub mod config;
mod error;
pub mod filestore;
mod hash;
pub mod merkle;
pub mod meta;
pub mod reference;
mod session;

pub use allocation::changes::{
    AttributesChange, CopyFileChange, DeleteFileChange, NewFileChange, RenameFileChange,
    UpdateFileChange,
};
pub use allocation::{
    Allocation, AllocationChange, AllocationChangeCollector, ChangeContext, ChangeProcessor,
    ConnectionStatus, OperationTag, Pending, ReadPool, SessionRecord, Terms, Timestamp, WritePool,
    WriteReservation, get_pending, reserve_write,
};
pub use cancel::CancelToken;
pub use config::Config;
pub use error::{CommitFailure, Error, Result};
pub use filestore::{ChallengeBlock, FileInputData, FileOutputData, FileStore};
pub use hash::{ContentHasher, hash_bytes, hash_str, reference_lookup};
pub use meta::{ChangeStore, MemoryStore, MetaTx, PoolStore, RefStore, TxBackend};
pub use reference::{Attributes, ObjectPath, Ref, RefType, WhoPays};
pub use session::{CommitOutcome, Session};
