//! Prepaid pools and pending write accounting.

use super::pricing::total_balance;
use super::{Allocation, Timestamp};
use crate::error::Result;
use crate::meta::PoolStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPool {
    pub pool_id: String,
    pub client_id: String,
    pub allocation_id: String,
    pub blobber_id: String,
    pub balance: i64,
    pub expire_at: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritePool {
    pub pool_id: String,
    pub client_id: String,
    pub allocation_id: String,
    pub blobber_id: String,
    pub balance: i64,
    pub expire_at: Timestamp,
}

/// Bytes written by a client but not yet settled against its write pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pending {
    pub id: i64,
    pub client_id: String,
    pub allocation_id: String,
    pub blobber_id: String,
    pub pending_write: i64,
}

impl Pending {
    pub fn new(client_id: &str, allocation_id: &str, blobber_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            allocation_id: allocation_id.to_string(),
            blobber_id: blobber_id.to_string(),
            ..Default::default()
        }
    }

    /// Add `size`, clamped to the `i64` range.
    pub fn add_pending_write(&mut self, size: i64) {
        self.pending_write = self.pending_write.saturating_add(size);
    }

    /// Subtract `size`, never going below zero.
    pub fn sub_pending_write(&mut self, size: i64) {
        self.pending_write = self.pending_write.saturating_sub(size).max(0);
    }

    /// Write pool balance left once the pending bytes are paid for.
    pub fn have_write<'a, I>(&self, pools: I, allocation: &Allocation, now: Timestamp) -> i64
    where
        I: IntoIterator<Item = &'a WritePool>,
    {
        let have = total_balance(pools.into_iter().map(|p| p.balance));
        have.saturating_sub(allocation.want_write(&self.blobber_id, self.pending_write, now))
    }
}

/// Stored pending record of (client, allocation, blobber), or a fresh one.
pub fn get_pending(
    store: &dyn PoolStore,
    client_id: &str,
    allocation_id: &str,
    blobber_id: &str,
) -> Result<Pending> {
    Ok(store
        .get_pending(client_id, allocation_id, blobber_id)?
        .unwrap_or_else(|| Pending::new(client_id, allocation_id, blobber_id)))
}

/// Outcome of [`reserve_write`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReservation {
    pub pending: Pending,
    /// Balance left after paying for everything pending. Negative means refused.
    pub have: i64,
}

impl WriteReservation {
    pub fn is_funded(&self) -> bool {
        self.have >= 0
    }
}

/// Add `size` bytes to the client's pending writes if its write pools cover them.
///
/// The pending counter is only saved when the write is funded.
pub fn reserve_write(
    store: &dyn PoolStore,
    allocation: &Allocation,
    client_id: &str,
    blobber_id: &str,
    size: i64,
    now: Timestamp,
) -> Result<WriteReservation> {
    let mut pending = get_pending(store, client_id, &allocation.id, blobber_id)?;
    let pools = store.write_pools(client_id, &allocation.id, blobber_id, now)?;

    pending.add_pending_write(size);
    let have = pending.have_write(&pools, allocation, now);
    if have >= 0 {
        store.save_pending(&mut pending)?;
    }
    debug!(
        client = client_id,
        allocation = %allocation.id,
        pending = pending.pending_write,
        have,
        "write reservation"
    );
    Ok(WriteReservation { pending, have })
}
