//! Write sessions and their recorded changes.

use super::changes::{ChangeContext, ChangeProcessor, OperationTag, release_content};
use crate::error::{CommitFailure, Error, Result};
use crate::meta::ChangeStore;
use crate::reference::Ref;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Lifecycle of a write session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Not persisted yet.
    #[default]
    New = 0,
    InProgress = 1,
    Committed = 2,
    Deleted = 3,
}

impl ConnectionStatus {
    /// Committed and deleted sessions can never be saved again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Committed | ConnectionStatus::Deleted)
    }
}

/// Persisted header of a write session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub connection_id: String,
    pub allocation_id: String,
    pub client_id: String,
    pub size: i64,
    pub status: ConnectionStatus,
}

/// One recorded mutation. `input` is the serialized processor payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationChange {
    pub id: i64,
    pub size: i64,
    pub operation: String,
    pub connection_id: String,
    pub input: String,
}

impl AllocationChange {
    pub fn new(size: i64) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }
}

/// All changes of one write session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllocationChangeCollector {
    pub connection_id: String,
    pub allocation_id: String,
    pub client_id: String,
    pub size: i64,
    pub status: ConnectionStatus,
    pub changes: Vec<AllocationChange>,
    /// Decoded changes, in recording order. Changes with an unknown operation
    /// have no processor.
    pub processors: Vec<ChangeProcessor>,
}

impl AllocationChangeCollector {
    pub fn new(connection_id: &str, allocation_id: &str, client_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            allocation_id: allocation_id.to_string(),
            client_id: client_id.to_string(),
            ..Default::default()
        }
    }

    fn from_record(record: SessionRecord) -> Self {
        Self {
            connection_id: record.connection_id,
            allocation_id: record.allocation_id,
            client_id: record.client_id,
            size: record.size,
            status: record.status,
            ..Default::default()
        }
    }

    fn record(&self) -> SessionRecord {
        SessionRecord {
            connection_id: self.connection_id.clone(),
            allocation_id: self.allocation_id.clone(),
            client_id: self.client_id.clone(),
            size: self.size,
            status: self.status,
        }
    }

    /// Load a live session of the allocation, or start a fresh one.
    ///
    /// Deleted sessions and sessions of other allocations are not reused.
    pub fn get_allocation_changes(
        store: &dyn ChangeStore,
        connection_id: &str,
        allocation_id: &str,
        client_id: &str,
    ) -> Result<Self> {
        match store.get_session(connection_id)? {
            Some(record)
                if record.status != ConnectionStatus::Deleted
                    && record.allocation_id == allocation_id =>
            {
                let mut collector = Self::from_record(record);
                collector.changes = store.list_changes(connection_id)?;
                collector.compute_properties()?;
                Ok(collector)
            }
            _ => Ok(Self::new(connection_id, allocation_id, client_id)),
        }
    }

    /// Record a change, storing the processor's payload in `change.input`.
    pub fn add_change(&mut self, mut change: AllocationChange, processor: ChangeProcessor) -> Result<()> {
        change.connection_id = self.connection_id.clone();
        change.operation = processor.operation().as_str().to_string();
        change.input = processor.marshal()?;
        self.size += change.size;
        self.changes.push(change);
        self.processors.push(processor);
        Ok(())
    }

    /// Persist the session header and any change not stored yet.
    ///
    /// A new session is stored as in progress. Saving over a committed or
    /// deleted session, or starting a new session under an existing id, is a
    /// conflict.
    pub fn save(&mut self, store: &dyn ChangeStore) -> Result<()> {
        match store.get_session(&self.connection_id)? {
            Some(stored) if stored.status.is_terminal() => {
                return Err(Error::conflict(format!(
                    "session {} is already {:?}",
                    self.connection_id, stored.status
                )));
            }
            Some(_) if self.status == ConnectionStatus::New => {
                return Err(Error::conflict(format!(
                    "session {} already exists",
                    self.connection_id
                )));
            }
            Some(_) => store.update_session(&self.record())?,
            None => {
                if self.status == ConnectionStatus::New {
                    self.status = ConnectionStatus::InProgress;
                }
                store.insert_session(&self.record())?;
            }
        }

        for change in self.changes.iter_mut().filter(|c| c.id == 0) {
            change.connection_id = self.connection_id.clone();
            store.insert_change(change)?;
        }
        debug!(
            connection = %self.connection_id,
            status = ?self.status,
            changes = self.changes.len(),
            "saved session"
        );
        Ok(())
    }

    /// Decode every recorded change into its processor.
    ///
    /// Unknown and empty operations get no processor; the records themselves
    /// are kept. A payload that does not decode is an error.
    pub fn compute_properties(&mut self) -> Result<()> {
        let mut processors = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            let Some(tag) = OperationTag::parse(&change.operation) else {
                debug!(change = change.id, operation = %change.operation, "skipping unknown operation");
                continue;
            };
            let processor = ChangeProcessor::unmarshal(tag, &change.input).inspect_err(|e| {
                warn!(change = change.id, operation = %tag, error = %e, "undecodable change payload");
            })?;
            processors.push(processor);
        }
        self.processors = processors;
        Ok(())
    }

    /// Apply every change in order and return the final root.
    ///
    /// The first failure aborts. A non-empty `allocation_root` must match the
    /// resulting root hash.
    pub fn apply_changes(&mut self, ctx: &ChangeContext<'_>, allocation_root: &str) -> Result<Ref> {
        let mut root = None;
        for processor in &mut self.processors {
            root = Some(processor.process_change(ctx)?);
        }
        let root = match root {
            Some(root) => root,
            None => crate::reference::get_reference_path(ctx.refs, ctx.allocation_id, "/")?,
        };
        if !allocation_root.is_empty() && root.hash != allocation_root {
            return Err(Error::invalid_parameters(format!(
                "allocation root mismatch: expected {}, tree has {}",
                allocation_root, root.hash
            )));
        }
        Ok(root)
    }

    /// Promote the bytes of every change, in order.
    ///
    /// The first failure aborts the rest. Returns the committed paths, or
    /// [`Error::PartialCommit`] listing what made it, what failed and what was
    /// never attempted. A cancelled token counts as not attempted.
    pub fn commit_to_file_store(&self, ctx: &ChangeContext<'_>) -> Result<Vec<String>> {
        let mut committed = Vec::new();

        for (i, processor) in self.processors.iter().enumerate() {
            let path = processor.path().to_string();
            let result = ctx.cancel.check().and_then(|()| processor.commit_to_file_store(ctx));
            let err = match result {
                Ok(()) => {
                    committed.push(path);
                    continue;
                }
                Err(e) => e,
            };

            let rest = self.processors[i + 1..].iter().map(|p| p.path().to_string());
            let (failed, skipped) = if matches!(err, Error::Cancelled) {
                (Vec::new(), std::iter::once(path).chain(rest).collect())
            } else {
                warn!(connection = %self.connection_id, path = %path, error = %err, "commit failed");
                (
                    vec![CommitFailure {
                        path,
                        reason: err.to_string(),
                    }],
                    rest.collect(),
                )
            };
            return Err(Error::PartialCommit {
                committed,
                failed,
                skipped,
            });
        }
        Ok(committed)
    }

    /// Content hashes the applied changes stopped referencing, deduplicated.
    pub fn released_content(&self) -> Vec<String> {
        let mut hashes: Vec<String> = self.processors.iter().flat_map(|p| p.released_content()).collect();
        hashes.sort();
        hashes.dedup();
        hashes
    }

    /// Delete objects released by this session that nothing references anymore.
    ///
    /// Run only after the tree update is committed; `ctx.refs` must see it.
    pub fn release_content(&self, ctx: &ChangeContext<'_>) -> Result<()> {
        release_content(ctx, &self.released_content())
    }

    /// Drop every staged file of the session. Failures are logged, not returned.
    pub fn delete_changes(&self, ctx: &ChangeContext<'_>) {
        for processor in &self.processors {
            match processor.delete_temp_file(ctx) {
                Ok(()) => {}
                Err(e) if e.is_not_applicable() || e.is_not_found() => {}
                Err(e) => {
                    warn!(connection = %self.connection_id, path = %processor.path(), error = %e, "could not delete staged file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::changes::testing::*;
    use crate::allocation::changes::{
        AttributesChange, CopyFileChange, DeleteFileChange, NewFileChange, RenameFileChange,
        UpdateFileChange,
    };
    use crate::meta::MemoryStore;
    use crate::reference::get_reference;

    fn stored(store: &MemoryStore, conn: &str, status: ConnectionStatus) {
        store
            .insert_session(&SessionRecord {
                connection_id: conn.into(),
                allocation_id: "1".into(),
                client_id: "1".into(),
                size: 0,
                status,
            })
            .unwrap();
    }

    #[test]
    fn test_get_allocation_changes() {
        let store = MemoryStore::new();
        stored(&store, "1", ConnectionStatus::InProgress);
        stored(&store, "2", ConnectionStatus::Deleted);

        let missing = AllocationChangeCollector::get_allocation_changes(&store, "99", "1", "1").unwrap();
        assert_eq!(missing.connection_id, "99");
        assert_eq!(missing.allocation_id, "1");
        assert_eq!(missing.client_id, "1");
        assert_eq!(missing.status, ConnectionStatus::New);

        let found = AllocationChangeCollector::get_allocation_changes(&store, "1", "1", "1").unwrap();
        assert_eq!(found.status, ConnectionStatus::InProgress);

        let deleted = AllocationChangeCollector::get_allocation_changes(&store, "2", "1", "1").unwrap();
        assert_eq!(deleted.status, ConnectionStatus::New);
        assert_eq!(deleted.connection_id, "2");

        let other_alloc = AllocationChangeCollector::get_allocation_changes(&store, "1", "7", "1").unwrap();
        assert_eq!(other_alloc.status, ConnectionStatus::New);
    }

    #[test]
    fn test_add_change_payloads() {
        let cases: Vec<(ChangeProcessor, &str, &str)> = vec![
            (
                NewFileChange::default().into(),
                "insert",
                r#"{"connection_id":"","allocation_id":"","filename":"","thumbnail_filename":"","filepath":"","size":0,"thumbnail_size":0,"actual_thumb_size":0,"actual_thumb_hash":"","attributes":{}}"#,
            ),
            (
                DeleteFileChange::default().into(),
                "delete",
                r#"{"connection_id":"","allocation_id":"","name":"","path":"","size":0,"hash":"","ContentHash":null}"#,
            ),
            (
                UpdateFileChange::default().into(),
                "update",
                r#"{"connection_id":"","allocation_id":"","filename":"","thumbnail_filename":"","filepath":"","size":0,"thumbnail_size":0,"actual_thumb_size":0,"actual_thumb_hash":"","attributes":{}}"#,
            ),
            (
                CopyFileChange::default().into(),
                "copy",
                r#"{"connection_id":"","allocation_id":"","path":"","dest_path":""}"#,
            ),
            (
                RenameFileChange::default().into(),
                "rename",
                r#"{"connection_id":"","allocation_id":"","path":"","new_name":""}"#,
            ),
            (
                AttributesChange::default().into(),
                "update_attrs",
                r#"{"connection_id":"","allocation_id":"","path":"","attributes":null}"#,
            ),
        ];

        for (processor, op, input) in cases {
            let mut acc = AllocationChangeCollector::new("c", "a", "x");
            acc.add_change(AllocationChange::new(3), processor.clone()).unwrap();
            assert_eq!(acc.changes[0].input, input);
            assert_eq!(acc.changes[0].operation, op);
            assert_eq!(acc.changes[0].connection_id, "c");
            assert_eq!(acc.processors, vec![processor]);
            assert_eq!(acc.size, 3);
        }
    }

    #[test]
    fn test_save_state_machine() {
        let store = MemoryStore::new();

        let mut first = AllocationChangeCollector::new("3", "1", "1");
        first.save(&store).unwrap();
        assert_eq!(first.status, ConnectionStatus::InProgress);

        let mut duplicate = AllocationChangeCollector::new("3", "1", "1");
        assert!(duplicate.save(&store).unwrap_err().is_conflict());
        assert_eq!(duplicate.status, ConnectionStatus::New);

        let mut resumed = AllocationChangeCollector::new("3", "1", "1");
        resumed.status = ConnectionStatus::InProgress;
        resumed.save(&store).unwrap();
        assert_eq!(resumed.status, ConnectionStatus::InProgress);

        resumed.status = ConnectionStatus::Committed;
        resumed.save(&store).unwrap();
        assert_eq!(store.get_session("3").unwrap().unwrap().status, ConnectionStatus::Committed);

        resumed.status = ConnectionStatus::InProgress;
        assert!(resumed.save(&store).unwrap_err().is_conflict());
    }

    #[test]
    fn test_save_appends_only_new_changes() {
        let store = MemoryStore::new();
        let mut acc = AllocationChangeCollector::new("c", "a", "x");
        acc.add_change(AllocationChange::new(1), RenameFileChange::default().into()).unwrap();
        acc.save(&store).unwrap();
        acc.add_change(AllocationChange::new(2), CopyFileChange::default().into()).unwrap();
        acc.save(&store).unwrap();

        let changes = store.list_changes("c").unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].operation, "rename");
        assert_eq!(changes[1].operation, "copy");
        assert!(changes.iter().all(|c| c.id > 0));
        assert_eq!(store.get_session("c").unwrap().unwrap().size, 3);
    }

    #[test]
    fn test_compute_properties() {
        let change = |op: &str| AllocationChange {
            operation: op.into(),
            ..Default::default()
        };
        let cases: Vec<(Vec<AllocationChange>, Vec<ChangeProcessor>)> = vec![
            (
                vec![change("insert"), change("update")],
                vec![NewFileChange::default().into(), UpdateFileChange::default().into()],
            ),
            (
                vec![change("delete"), change(""), change("rename")],
                vec![DeleteFileChange::default().into(), RenameFileChange::default().into()],
            ),
            (
                vec![change("copy"), change("invalid"), change("update_attrs")],
                vec![CopyFileChange::default().into(), AttributesChange::default().into()],
            ),
        ];

        for (changes, want) in cases {
            let mut acc = AllocationChangeCollector {
                changes: changes.clone(),
                ..Default::default()
            };
            acc.compute_properties().unwrap();
            assert_eq!(acc.changes, changes);
            assert_eq!(acc.processors, want);
        }
    }

    #[test]
    fn test_compute_properties_rejects_garbage_payload() {
        let mut acc = AllocationChangeCollector {
            changes: vec![AllocationChange {
                operation: "copy".into(),
                input: "{not json".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(acc.compute_properties().unwrap_err().code(), "serialization_error");
        assert!(acc.processors.is_empty());
        assert_eq!(acc.changes.len(), 1);
    }

    #[test]
    fn test_compute_properties_rejects_unknown_payer() {
        let store = MemoryStore::new();
        let mut acc = AllocationChangeCollector::new("c", "a", "x");
        acc.changes.push(AllocationChange {
            operation: "update_attrs".into(),
            input: r#"{"path":"/f","attributes":{"who_pays_for_reads":7}}"#.into(),
            ..Default::default()
        });
        acc.save(&store).unwrap();

        let err = AllocationChangeCollector::get_allocation_changes(&store, "c", "a", "x").unwrap_err();
        assert_eq!(err.code(), "invalid_attributes");
    }

    #[test]
    fn test_apply_and_commit_in_order() {
        let fx = Fixture::new();
        let mut acc = AllocationChangeCollector::new(CONN, ALLOC, "client");
        acc.add_change(AllocationChange::new(5), fx.staged("/a", b"hello").into()).unwrap();
        acc.add_change(
            AllocationChange::new(0),
            RenameFileChange {
                path: "/a".into(),
                new_name: "b".into(),
                ..Default::default()
            }
            .into(),
        )
        .unwrap();

        let root = acc.apply_changes(&fx.ctx(), "").unwrap();
        assert!(root.child("/b").is_some());
        let committed = acc.commit_to_file_store(&fx.ctx()).unwrap();
        assert_eq!(committed, vec!["/a".to_string(), "/a".to_string()]);

        let b = get_reference(&fx.refs, ALLOC, "/b").unwrap();
        assert!(fx.files.object_exists(ALLOC, &b.content_hash).unwrap());
    }

    #[test]
    fn test_apply_checks_expected_root() {
        let fx = Fixture::new();
        let mut acc = AllocationChangeCollector::new(CONN, ALLOC, "client");
        acc.add_change(AllocationChange::new(1), fx.staged("/a", b"x").into()).unwrap();
        let err = acc.apply_changes(&fx.ctx(), "not-the-root").unwrap_err();
        assert_eq!(err.code(), "invalid_parameters");
    }

    #[test]
    fn test_apply_stops_at_first_failure() {
        let fx = Fixture::new();
        let mut acc = AllocationChangeCollector::new(CONN, ALLOC, "client");
        acc.add_change(
            AllocationChange::new(0),
            DeleteFileChange {
                path: "/missing".into(),
                ..Default::default()
            }
            .into(),
        )
        .unwrap();
        acc.add_change(AllocationChange::new(1), fx.staged("/a", b"x").into()).unwrap();
        assert_eq!(acc.apply_changes(&fx.ctx(), "").unwrap_err().code(), "file_not_found");
        assert!(get_reference(&fx.refs, ALLOC, "/a").is_err());
    }

    #[test]
    fn test_commit_aborts_at_first_failure() {
        let fx = Fixture::new();
        let mut acc = AllocationChangeCollector::new(CONN, ALLOC, "client");
        acc.add_change(AllocationChange::new(1), fx.staged("/ok", b"ok").into()).unwrap();
        let never_staged = NewFileChange {
            filename: "ghost".into(),
            path: "/ghost".into(),
            hash: "a".repeat(40),
            ..Default::default()
        };
        acc.add_change(AllocationChange::new(1), never_staged.into()).unwrap();
        acc.add_change(AllocationChange::new(1), fx.staged("/late", b"late").into()).unwrap();

        match acc.commit_to_file_store(&fx.ctx()).unwrap_err() {
            Error::PartialCommit {
                committed,
                failed,
                skipped,
            } => {
                assert_eq!(committed, vec!["/ok".to_string()]);
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].path, "/ghost");
                assert!(failed[0].reason.starts_with("not_found"));
                assert_eq!(skipped, vec!["/late".to_string()]);
            }
            other => panic!("expected partial commit, got {}", other),
        }
        // the aborted change keeps its staged bytes
        assert_eq!(fx.files.temp_path_size(ALLOC, &fx.cancel).unwrap(), 4);
    }

    #[test]
    fn test_commit_skips_after_cancel() {
        let fx = Fixture::new();
        let mut acc = AllocationChangeCollector::new(CONN, ALLOC, "client");
        acc.add_change(AllocationChange::new(1), fx.staged("/a", b"a").into()).unwrap();
        acc.add_change(AllocationChange::new(1), fx.staged("/b", b"b").into()).unwrap();
        fx.cancel.cancel();
        match acc.commit_to_file_store(&fx.ctx()).unwrap_err() {
            Error::PartialCommit {
                committed,
                failed,
                skipped,
            } => {
                assert!(committed.is_empty());
                assert!(failed.is_empty());
                assert_eq!(skipped, vec!["/a".to_string(), "/b".to_string()]);
            }
            other => panic!("expected partial commit, got {}", other),
        }
    }

    #[test]
    fn test_released_content_is_deduplicated() {
        let fx = Fixture::new();
        fx.insert("/x/one", b"same");
        fx.insert("/x/two", b"same");
        let hash = get_reference(&fx.refs, ALLOC, "/x/one").unwrap().content_hash;

        let mut acc = AllocationChangeCollector::new(CONN, ALLOC, "client");
        for path in ["/x/one", "/x/two"] {
            acc.add_change(
                AllocationChange::new(0),
                DeleteFileChange {
                    path: path.into(),
                    ..Default::default()
                }
                .into(),
            )
            .unwrap();
        }
        acc.apply_changes(&fx.ctx(), "").unwrap();
        acc.commit_to_file_store(&fx.ctx()).unwrap();
        assert_eq!(acc.released_content(), vec![hash.clone()]);
        assert!(fx.files.object_exists(ALLOC, &hash).unwrap());

        acc.release_content(&fx.ctx()).unwrap();
        assert!(!fx.files.object_exists(ALLOC, &hash).unwrap());
    }

    #[test]
    fn test_delete_changes_removes_staging() {
        let fx = Fixture::new();
        let mut acc = AllocationChangeCollector::new(CONN, ALLOC, "client");
        acc.add_change(AllocationChange::new(3), fx.staged("/a", b"abc").into()).unwrap();
        acc.add_change(AllocationChange::new(0), DeleteFileChange::default().into()).unwrap();
        assert_eq!(fx.files.temp_path_size(ALLOC, &fx.cancel).unwrap(), 3);

        acc.delete_changes(&fx.ctx());
        assert_eq!(fx.files.temp_path_size(ALLOC, &fx.cancel).unwrap(), 0);
        // a second pass finds nothing left and stays quiet
        acc.delete_changes(&fx.ctx());
    }
}
