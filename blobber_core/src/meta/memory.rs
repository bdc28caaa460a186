//! In-memory metadata backend.
//!
//! All tables live behind one lock. A transaction works on its own copy of
//! the tables and keeps a log of what it did; committing replays that log on
//! top of whatever the store holds by then and swaps the result in. Ids come
//! from one counter shared with every transaction, so they never collide.
//!
//! Ref rows are checked optimistically: a transaction remembers every existing
//! row it overwrites or deletes, and its commit is a `conflict` when another
//! transaction changed one of them first. Two sessions on the same allocation
//! both rewrite the root row, so only the first of them commits. Pool and
//! pending rows are last writer wins.

use super::{ChangeStore, MetaTx, PoolStore, RefStore, TxBackend};
use crate::allocation::{AllocationChange, Pending, ReadPool, SessionRecord, Timestamp, WritePool};
use crate::error::{Error, Result};
use crate::hash::reference_lookup;
use crate::reference::Ref;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Tables {
    refs: BTreeMap<i64, Ref>,
    /// reference_lookup(allocation, path) -> ref id
    by_path: HashMap<String, i64>,
    sessions: BTreeMap<String, SessionRecord>,
    changes: BTreeMap<i64, AllocationChange>,
    read_pools: Vec<ReadPool>,
    write_pools: Vec<WritePool>,
    pending: BTreeMap<i64, Pending>,
}

fn next_id(ids: &AtomicI64) -> i64 {
    ids.fetch_add(1, Ordering::Relaxed)
}

impl Tables {
    fn get_ref(&self, allocation_id: &str, path: &str) -> Option<Ref> {
        self.get_ref_by_lookup_hash(allocation_id, &reference_lookup(allocation_id, path))
    }

    fn get_ref_by_lookup_hash(&self, allocation_id: &str, lookup_hash: &str) -> Option<Ref> {
        self.by_path
            .get(lookup_hash)
            .and_then(|id| self.refs.get(id))
            .filter(|r| r.allocation_id == allocation_id)
            .cloned()
    }

    fn list_children(&self, allocation_id: &str, parent_path: &str) -> Vec<Ref> {
        let mut out: Vec<Ref> = self
            .refs
            .values()
            .filter(|r| r.allocation_id == allocation_id && r.parent_path == parent_path && r.path != parent_path)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.lookup_hash.cmp(&b.lookup_hash));
        out
    }

    fn list_descendants(&self, allocation_id: &str, path: &str) -> Vec<Ref> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut out: Vec<Ref> = self
            .refs
            .values()
            .filter(|r| r.allocation_id == allocation_id && (r.path == path || r.path.starts_with(&prefix)))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.path_level
                .cmp(&b.path_level)
                .then_with(|| a.lookup_hash.cmp(&b.lookup_hash))
        });
        out
    }

    fn put_ref(&mut self, row: &mut Ref, ids: &AtomicI64) -> Result<()> {
        let key = reference_lookup(&row.allocation_id, &row.path);
        if let Some(&holder) = self.by_path.get(&key)
            && holder != row.id
        {
            return Err(Error::conflict(format!(
                "{} in allocation {} is already stored as ref {}",
                row.path, row.allocation_id, holder
            )));
        }
        if row.id == 0 {
            row.id = next_id(ids);
        }
        if let Some(old) = self.refs.get(&row.id) {
            let old_key = reference_lookup(&old.allocation_id, &old.path);
            if old_key != key {
                self.by_path.remove(&old_key);
            }
        }
        self.by_path.insert(key, row.id);
        self.refs.insert(row.id, row.clone());
        Ok(())
    }

    fn delete_ref(&mut self, id: i64) -> bool {
        let Some(old) = self.refs.remove(&id) else {
            return false;
        };
        let key = reference_lookup(&old.allocation_id, &old.path);
        if self.by_path.get(&key) == Some(&id) {
            self.by_path.remove(&key);
        }
        true
    }

    fn delete_subtree(&mut self, allocation_id: &str, path: &str) -> usize {
        self.list_descendants(allocation_id, path)
            .into_iter()
            .filter(|r| self.delete_ref(r.id))
            .count()
    }

    fn content_hash_in_use(&self, allocation_id: &str, content_hash: &str) -> bool {
        self.refs.values().any(|r| {
            r.is_file()
                && r.allocation_id == allocation_id
                && (r.content_hash == content_hash || r.thumbnail_hash == content_hash)
        })
    }

    fn insert_session(&mut self, record: &SessionRecord) -> Result<()> {
        if self.sessions.contains_key(&record.connection_id) {
            return Err(Error::conflict(format!(
                "session {} already exists",
                record.connection_id
            )));
        }
        self.sessions
            .insert(record.connection_id.clone(), record.clone());
        Ok(())
    }

    fn update_session(&mut self, record: &SessionRecord) -> Result<()> {
        match self.sessions.get_mut(&record.connection_id) {
            None => Err(Error::not_found(format!("session {}", record.connection_id))),
            Some(stored) if stored.status.is_terminal() => Err(Error::conflict(format!(
                "session {} is already {:?}",
                record.connection_id, stored.status
            ))),
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
        }
    }

    fn set_pools<P, F>(pools: &mut Vec<P>, client_id: &str, allocation_id: &str, new: Vec<P>, owner: F)
    where
        F: Fn(&mut P) -> (&mut String, &mut String),
    {
        pools.retain_mut(|p| {
            let (c, a) = owner(p);
            !(c.as_str() == client_id && a.as_str() == allocation_id)
        });
        for mut p in new {
            let (c, a) = owner(&mut p);
            *c = client_id.to_string();
            *a = allocation_id.to_string();
            pools.push(p);
        }
    }

    fn find_pending(&self, client_id: &str, allocation_id: &str, blobber_id: &str) -> Option<&Pending> {
        self.pending.values().find(|p| {
            p.client_id == client_id && p.allocation_id == allocation_id && p.blobber_id == blobber_id
        })
    }
}

/// A write against the tables, recorded so a transaction can replay it.
#[derive(Debug, Clone)]
enum Op {
    SaveRef(Ref),
    DeleteRef(i64),
    DeleteSubtree {
        allocation_id: String,
        path: String,
    },
    InsertSession(SessionRecord),
    UpdateSession(SessionRecord),
    InsertChange(AllocationChange),
    SetReadPools {
        client_id: String,
        allocation_id: String,
        pools: Vec<ReadPool>,
    },
    SetWritePools {
        client_id: String,
        allocation_id: String,
        pools: Vec<WritePool>,
    },
    SavePending(Pending),
}

impl Op {
    /// Existing ref rows this op would overwrite or delete in `t`.
    fn ref_ids(&self, t: &Tables) -> Vec<i64> {
        match self {
            Op::SaveRef(row) if row.id != 0 => vec![row.id],
            Op::DeleteRef(id) => vec![*id],
            Op::DeleteSubtree {
                allocation_id,
                path,
            } => t
                .list_descendants(allocation_id, path)
                .iter()
                .map(|r| r.id)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Apply to `t`, filling in assigned ids so a replay reproduces them.
    ///
    /// Returns the id of the written row, or the number of rows removed.
    fn apply(&mut self, t: &mut Tables, ids: &AtomicI64) -> Result<i64> {
        match self {
            Op::SaveRef(row) => {
                t.put_ref(row, ids)?;
                Ok(row.id)
            }
            Op::DeleteRef(id) => Ok(t.delete_ref(*id) as i64),
            Op::DeleteSubtree {
                allocation_id,
                path,
            } => Ok(t.delete_subtree(allocation_id, path) as i64),
            Op::InsertSession(record) => t.insert_session(record).map(|_| 0),
            Op::UpdateSession(record) => t.update_session(record).map(|_| 0),
            Op::InsertChange(change) => {
                if change.id == 0 {
                    change.id = next_id(ids);
                }
                t.changes.insert(change.id, change.clone());
                Ok(change.id)
            }
            Op::SetReadPools {
                client_id,
                allocation_id,
                pools,
            } => {
                Tables::set_pools(&mut t.read_pools, client_id, allocation_id, pools.clone(), |p| {
                    (&mut p.client_id, &mut p.allocation_id)
                });
                Ok(0)
            }
            Op::SetWritePools {
                client_id,
                allocation_id,
                pools,
            } => {
                Tables::set_pools(&mut t.write_pools, client_id, allocation_id, pools.clone(), |p| {
                    (&mut p.client_id, &mut p.allocation_id)
                });
                Ok(0)
            }
            Op::SavePending(pending) => {
                if pending.id == 0 {
                    pending.id = t
                        .find_pending(&pending.client_id, &pending.allocation_id, &pending.blobber_id)
                        .map(|p| p.id)
                        .unwrap_or_else(|| next_id(ids));
                }
                t.pending.insert(pending.id, pending.clone());
                Ok(pending.id)
            }
        }
    }
}

/// Serialized form of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub next_id: i64,
    pub refs: Vec<Ref>,
    pub sessions: Vec<SessionRecord>,
    pub changes: Vec<AllocationChange>,
    pub read_pools: Vec<ReadPool>,
    pub write_pools: Vec<WritePool>,
    pub pending: Vec<Pending>,
}

/// Metadata store held in memory, optionally persisted as a JSON snapshot.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    ids: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            ids: AtomicI64::new(1),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        let t = self.tables.lock();
        Snapshot {
            next_id: self.ids.load(Ordering::Relaxed),
            refs: t.refs.values().cloned().collect(),
            sessions: t.sessions.values().cloned().collect(),
            changes: t.changes.values().cloned().collect(),
            read_pools: t.read_pools.clone(),
            write_pools: t.write_pools.clone(),
            pending: t.pending.values().cloned().collect(),
        }
    }

    /// Rebuild a store from a snapshot, re-checking path uniqueness.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self> {
        let store = Self::new();
        let max_id = snapshot
            .refs
            .iter()
            .map(|r| r.id)
            .chain(snapshot.changes.iter().map(|c| c.id))
            .chain(snapshot.pending.iter().map(|p| p.id))
            .max()
            .unwrap_or(0);
        store
            .ids
            .store(snapshot.next_id.max(max_id + 1).max(1), Ordering::Relaxed);

        {
            let mut t = store.tables.lock();
            for mut row in snapshot.refs {
                t.put_ref(&mut row, &store.ids)?;
            }
            for record in &snapshot.sessions {
                t.insert_session(record)?;
            }
            t.changes = snapshot.changes.into_iter().map(|c| (c.id, c)).collect();
            t.read_pools = snapshot.read_pools;
            t.write_pools = snapshot.write_pools;
            t.pending = snapshot.pending.into_iter().map(|p| (p.id, p)).collect();
        }
        Ok(store)
    }

    /// Load a snapshot file. A missing file gives an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_snapshot(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a snapshot file atomically.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, &self.snapshot())?;
        tmp.flush()?;
        tmp.persist(path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.tables.lock())
    }

    fn exec(&self, mut op: Op) -> Result<i64> {
        op.apply(&mut self.tables.lock(), &self.ids)
    }

    fn replay(&self, log: Vec<Op>, seen: &HashMap<i64, Option<Ref>>) -> Result<()> {
        let mut base = self.tables.lock();
        for (id, row) in seen {
            if base.refs.get(id) != row.as_ref() {
                return Err(Error::conflict(format!(
                    "ref {} was changed by another transaction",
                    id
                )));
            }
        }
        let mut next = base.clone();
        for mut op in log {
            op.apply(&mut next, &self.ids)?;
        }
        *base = next;
        Ok(())
    }
}

struct TxState {
    tables: Tables,
    log: Vec<Op>,
    /// Ref rows as they were before this transaction first touched them.
    seen: HashMap<i64, Option<Ref>>,
    /// Ref ids this transaction inserted.
    created: HashSet<i64>,
}

/// Transaction over a [`MemoryStore`]. Dropping it discards its writes.
pub struct MemoryTx<'a> {
    store: &'a MemoryStore,
    state: Mutex<TxState>,
}

impl<'a> MemoryTx<'a> {
    fn new(store: &'a MemoryStore) -> Self {
        let tables = store.tables.lock().clone();
        Self {
            store,
            state: Mutex::new(TxState {
                tables,
                log: Vec::new(),
                seen: HashMap::new(),
                created: HashSet::new(),
            }),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        f(&self.state.lock().tables)
    }

    fn exec(&self, mut op: Op) -> Result<i64> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for id in op.ref_ids(&state.tables) {
            if !state.created.contains(&id) && !state.seen.contains_key(&id) {
                state.seen.insert(id, state.tables.refs.get(&id).cloned());
            }
        }
        let inserting = matches!(&op, Op::SaveRef(row) if row.id == 0);
        let n = op.apply(&mut state.tables, &self.store.ids)?;
        if inserting {
            state.created.insert(n);
        }
        state.log.push(op);
        Ok(n)
    }
}

impl TxBackend for MemoryStore {
    fn begin(&self) -> Result<Box<dyn MetaTx + '_>> {
        Ok(Box::new(MemoryTx::new(self)))
    }
}

impl MetaTx for MemoryTx<'_> {
    fn refs(&self) -> &dyn RefStore {
        self
    }

    fn changes(&self) -> &dyn ChangeStore {
        self
    }

    fn pools(&self) -> &dyn PoolStore {
        self
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let TxState { log, seen, .. } = self.state.into_inner();
        let ops = log.len();
        self.store.replay(log, &seen)?;
        debug!(ops, "transaction committed");
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!(ops = self.state.lock().log.len(), "transaction rolled back");
    }
}

macro_rules! impl_meta_stores {
    ($ty:ty) => {
        impl RefStore for $ty {
            fn get_ref(&self, allocation_id: &str, path: &str) -> Result<Option<Ref>> {
                Ok(self.read(|t| t.get_ref(allocation_id, path)))
            }

            fn get_ref_by_lookup_hash(&self, allocation_id: &str, lookup_hash: &str) -> Result<Option<Ref>> {
                Ok(self.read(|t| t.get_ref_by_lookup_hash(allocation_id, lookup_hash)))
            }

            fn list_children(&self, allocation_id: &str, parent_path: &str) -> Result<Vec<Ref>> {
                Ok(self.read(|t| t.list_children(allocation_id, parent_path)))
            }

            fn list_descendants(&self, allocation_id: &str, path: &str) -> Result<Vec<Ref>> {
                Ok(self.read(|t| t.list_descendants(allocation_id, path)))
            }

            fn save_ref(&self, r: &mut Ref) -> Result<()> {
                let children = std::mem::take(&mut r.children);
                let mut row = r.clone();
                r.children = children;
                row.children_loaded = false;
                r.id = self.exec(Op::SaveRef(row))?;
                Ok(())
            }

            fn delete_ref(&self, id: i64) -> Result<()> {
                self.exec(Op::DeleteRef(id)).map(|_| ())
            }

            fn delete_subtree(&self, allocation_id: &str, path: &str) -> Result<usize> {
                let removed = self.exec(Op::DeleteSubtree {
                    allocation_id: allocation_id.to_string(),
                    path: path.to_string(),
                })?;
                Ok(removed as usize)
            }

            fn content_hash_in_use(&self, allocation_id: &str, content_hash: &str) -> Result<bool> {
                Ok(self.read(|t| t.content_hash_in_use(allocation_id, content_hash)))
            }
        }

        impl ChangeStore for $ty {
            fn get_session(&self, connection_id: &str) -> Result<Option<SessionRecord>> {
                Ok(self.read(|t| t.sessions.get(connection_id).cloned()))
            }

            fn insert_session(&self, record: &SessionRecord) -> Result<()> {
                self.exec(Op::InsertSession(record.clone())).map(|_| ())
            }

            fn update_session(&self, record: &SessionRecord) -> Result<()> {
                self.exec(Op::UpdateSession(record.clone())).map(|_| ())
            }

            fn insert_change(&self, change: &mut AllocationChange) -> Result<()> {
                change.id = self.exec(Op::InsertChange(change.clone()))?;
                Ok(())
            }

            fn list_changes(&self, connection_id: &str) -> Result<Vec<AllocationChange>> {
                Ok(self.read(|t| {
                    t.changes
                        .values()
                        .filter(|c| c.connection_id == connection_id)
                        .cloned()
                        .collect()
                }))
            }
        }

        impl PoolStore for $ty {
            fn read_pools(
                &self,
                client_id: &str,
                allocation_id: &str,
                blobber_id: &str,
                until: Timestamp,
            ) -> Result<Vec<ReadPool>> {
                Ok(self.read(|t| {
                    t.read_pools
                        .iter()
                        .filter(|p| {
                            p.client_id == client_id
                                && p.allocation_id == allocation_id
                                && p.blobber_id == blobber_id
                                && p.expire_at > until
                        })
                        .cloned()
                        .collect()
                }))
            }

            fn write_pools(
                &self,
                client_id: &str,
                allocation_id: &str,
                blobber_id: &str,
                until: Timestamp,
            ) -> Result<Vec<WritePool>> {
                Ok(self.read(|t| {
                    t.write_pools
                        .iter()
                        .filter(|p| {
                            p.client_id == client_id
                                && p.allocation_id == allocation_id
                                && p.blobber_id == blobber_id
                                && p.expire_at > until
                        })
                        .cloned()
                        .collect()
                }))
            }

            fn set_read_pools(&self, client_id: &str, allocation_id: &str, pools: Vec<ReadPool>) -> Result<()> {
                self.exec(Op::SetReadPools {
                    client_id: client_id.to_string(),
                    allocation_id: allocation_id.to_string(),
                    pools,
                })
                .map(|_| ())
            }

            fn set_write_pools(&self, client_id: &str, allocation_id: &str, pools: Vec<WritePool>) -> Result<()> {
                self.exec(Op::SetWritePools {
                    client_id: client_id.to_string(),
                    allocation_id: allocation_id.to_string(),
                    pools,
                })
                .map(|_| ())
            }

            fn get_pending(&self, client_id: &str, allocation_id: &str, blobber_id: &str) -> Result<Option<Pending>> {
                Ok(self.read(|t| t.find_pending(client_id, allocation_id, blobber_id).cloned()))
            }

            fn save_pending(&self, pending: &mut Pending) -> Result<()> {
                pending.id = self.exec(Op::SavePending(pending.clone()))?;
                Ok(())
            }
        }
    };
}

impl_meta_stores!(MemoryStore);
impl_meta_stores!(MemoryTx<'_>);
