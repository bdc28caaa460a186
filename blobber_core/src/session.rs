//! Write sessions driven end to end against a metadata backend.

use crate::allocation::{AllocationChange, AllocationChangeCollector, ChangeContext, ChangeProcessor, ConnectionStatus};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::filestore::{FileInputData, FileOutputData, FileStore};
use crate::meta::{MetaTx, TxBackend};
use crate::reference::Ref;
use std::io::Read;
use tracing::{debug, info, warn};

/// Result of a committed session.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Allocation root after every change was applied.
    pub root: Ref,
    /// Paths whose bytes were promoted.
    pub committed: Vec<String>,
}

/// One client's write session on one allocation.
pub struct Session<'a> {
    backend: &'a dyn TxBackend,
    files: &'a FileStore,
    connection_id: String,
    allocation_id: String,
    client_id: String,
}

impl<'a> Session<'a> {
    pub fn new(
        backend: &'a dyn TxBackend,
        files: &'a FileStore,
        connection_id: &str,
        allocation_id: &str,
        client_id: &str,
    ) -> Self {
        Self {
            backend,
            files,
            connection_id: connection_id.to_string(),
            allocation_id: allocation_id.to_string(),
            client_id: client_id.to_string(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn allocation_id(&self) -> &str {
        &self.allocation_id
    }

    /// Stage bytes for `path` under this session.
    pub fn stage<R: Read>(&self, name: &str, path: &str, reader: R, cancel: &CancelToken) -> Result<FileOutputData> {
        self.files.write_file(
            &self.allocation_id,
            &FileInputData::new(name, path, ""),
            reader,
            &self.connection_id,
            cancel,
        )
    }

    fn load(&self, tx: &dyn MetaTx) -> Result<AllocationChangeCollector> {
        AllocationChangeCollector::get_allocation_changes(
            tx.changes(),
            &self.connection_id,
            &self.allocation_id,
            &self.client_id,
        )
    }

    /// Load a session that can still be committed or abandoned.
    fn load_live(&self, tx: &dyn MetaTx) -> Result<AllocationChangeCollector> {
        let collector = self.load(tx)?;
        match collector.status {
            ConnectionStatus::New => Err(Error::not_found(format!("session {}", self.connection_id))),
            status if status.is_terminal() => Err(Error::conflict(format!(
                "session {} is already {:?}",
                self.connection_id, status
            ))),
            _ => Ok(collector),
        }
    }

    /// Append changes to the session and persist them.
    pub fn record<I>(&self, changes: I) -> Result<AllocationChangeCollector>
    where
        I: IntoIterator<Item = (AllocationChange, ChangeProcessor)>,
    {
        let tx = self.backend.begin()?;
        let mut collector = self.load(tx.as_ref())?;
        for (change, processor) in changes {
            collector.add_change(change, processor)?;
        }
        collector.save(tx.changes())?;
        tx.commit()?;
        Ok(collector)
    }

    /// Apply every recorded change, promote the staged bytes and close the session.
    ///
    /// Tree and session updates happen in one transaction. Any failure leaves
    /// both untouched; objects already promoted by a failing byte commit stay
    /// in the store. Content the session stopped referencing is deleted only
    /// after the transaction committed.
    pub fn commit(&self, allocation_root: &str, cancel: &CancelToken) -> Result<CommitOutcome> {
        let tx = self.backend.begin()?;
        let (outcome, collector) = match self.commit_in(tx.as_ref(), allocation_root, cancel) {
            Ok(done) => done,
            Err(e) => {
                warn!(connection = %self.connection_id, error = %e, "session commit failed");
                tx.rollback();
                return Err(e);
            }
        };
        tx.commit()?;
        info!(
            connection = %self.connection_id,
            allocation = %self.allocation_id,
            root = %outcome.root.hash,
            files = outcome.committed.len(),
            "session committed"
        );
        self.release(&collector);
        Ok(outcome)
    }

    fn commit_in(
        &self,
        tx: &dyn MetaTx,
        allocation_root: &str,
        cancel: &CancelToken,
    ) -> Result<(CommitOutcome, AllocationChangeCollector)> {
        let mut collector = self.load_live(tx)?;
        let ctx = ChangeContext::new(tx.refs(), self.files, &self.allocation_id, &self.connection_id, cancel);

        let root = collector.apply_changes(&ctx, allocation_root)?;
        cancel.check()?;
        let committed = collector.commit_to_file_store(&ctx)?;

        collector.status = ConnectionStatus::Committed;
        collector.save(tx.changes())?;
        Ok((CommitOutcome { root, committed }, collector))
    }

    /// Drop objects the committed session released. The session is already
    /// durable, so failures are only logged; a leftover object is unreferenced.
    fn release(&self, collector: &AllocationChangeCollector) {
        let result = self.backend.begin().and_then(|tx| {
            let cancel = CancelToken::new();
            let released = collector.release_content(&ChangeContext::new(
                tx.refs(),
                self.files,
                &self.allocation_id,
                &self.connection_id,
                &cancel,
            ));
            tx.rollback();
            released
        });
        if let Err(e) = result {
            warn!(connection = %self.connection_id, error = %e, "could not release unreferenced objects");
        }
    }

    /// Drop the session's staged bytes and mark it deleted.
    pub fn abandon(&self) -> Result<()> {
        let tx = self.backend.begin()?;
        let mut collector = self.load_live(tx.as_ref())?;
        let cancel = CancelToken::new();
        collector.delete_changes(&ChangeContext::new(
            tx.refs(),
            self.files,
            &self.allocation_id,
            &self.connection_id,
            &cancel,
        ));
        collector.status = ConnectionStatus::Deleted;
        collector.save(tx.changes())?;
        tx.commit()?;
        debug!(connection = %self.connection_id, "session abandoned");
        Ok(())
    }
}
