//! Metadata persistence boundary.
//!
//! The tree, session and pool logic only talks to these traits. [`MemoryStore`]
//! is the bundled backend; anything that can answer the same queries inside a
//! transaction (a relational database, typically) can stand in for it.

mod memory;

pub use memory::{MemoryStore, MemoryTx, Snapshot};

use crate::allocation::{AllocationChange, Pending, ReadPool, SessionRecord, Timestamp, WritePool};
use crate::error::Result;
use crate::reference::Ref;

/// Reference rows, keyed by (allocation, path). Rows never carry children.
pub trait RefStore {
    fn get_ref(&self, allocation_id: &str, path: &str) -> Result<Option<Ref>>;

    fn get_ref_by_lookup_hash(&self, allocation_id: &str, lookup_hash: &str) -> Result<Option<Ref>>;

    /// Direct children of `parent_path`, ordered by lookup hash.
    fn list_children(&self, allocation_id: &str, parent_path: &str) -> Result<Vec<Ref>>;

    /// `path` and everything below it, ordered by (level, lookup hash).
    fn list_descendants(&self, allocation_id: &str, path: &str) -> Result<Vec<Ref>>;

    /// Insert (`id == 0`, an id is assigned) or update by id.
    ///
    /// Fails with `conflict` when another row already holds the same path.
    fn save_ref(&self, r: &mut Ref) -> Result<()>;

    /// Delete one row. Missing ids are not an error.
    fn delete_ref(&self, id: i64) -> Result<()>;

    /// Delete `path` and every row below it. Returns the number of rows removed.
    fn delete_subtree(&self, allocation_id: &str, path: &str) -> Result<usize>;

    /// Whether any file row of the allocation still points at this content.
    fn content_hash_in_use(&self, allocation_id: &str, content_hash: &str) -> Result<bool>;
}

/// Write-session headers and their change records.
pub trait ChangeStore {
    fn get_session(&self, connection_id: &str) -> Result<Option<SessionRecord>>;

    fn insert_session(&self, record: &SessionRecord) -> Result<()>;

    fn update_session(&self, record: &SessionRecord) -> Result<()>;

    /// Append a change record and assign its id.
    fn insert_change(&self, change: &mut AllocationChange) -> Result<()>;

    /// Changes of a session in insertion order.
    fn list_changes(&self, connection_id: &str) -> Result<Vec<AllocationChange>>;
}

/// Prepaid pools and pending-write counters.
pub trait PoolStore {
    /// Pools of (client, allocation, blobber) still valid after `until`.
    fn read_pools(
        &self,
        client_id: &str,
        allocation_id: &str,
        blobber_id: &str,
        until: Timestamp,
    ) -> Result<Vec<ReadPool>>;

    fn write_pools(
        &self,
        client_id: &str,
        allocation_id: &str,
        blobber_id: &str,
        until: Timestamp,
    ) -> Result<Vec<WritePool>>;

    /// Replace every read pool of (client, allocation).
    fn set_read_pools(&self, client_id: &str, allocation_id: &str, pools: Vec<ReadPool>) -> Result<()>;

    /// Replace every write pool of (client, allocation).
    fn set_write_pools(&self, client_id: &str, allocation_id: &str, pools: Vec<WritePool>) -> Result<()>;

    fn get_pending(&self, client_id: &str, allocation_id: &str, blobber_id: &str) -> Result<Option<Pending>>;

    /// Insert (`id == 0`) or update.
    fn save_pending(&self, pending: &mut Pending) -> Result<()>;
}

/// A transaction spanning all three stores.
///
/// Dropping an uncommitted transaction discards its writes.
pub trait MetaTx {
    fn refs(&self) -> &dyn RefStore;
    fn changes(&self) -> &dyn ChangeStore;
    fn pools(&self) -> &dyn PoolStore;

    fn commit(self: Box<Self>) -> Result<()>;
    fn rollback(self: Box<Self>);
}

/// Something that can open transactions.
pub trait TxBackend {
    fn begin(&self) -> Result<Box<dyn MetaTx + '_>>;
}
