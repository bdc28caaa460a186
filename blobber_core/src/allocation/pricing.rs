//! Read and write pricing of an allocation.

use crate::config::{CHUNK_SIZE, GB};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Prices one blobber charges for an allocation, in minor token units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terms {
    pub blobber_id: String,
    /// Per GB read.
    pub read_price: i64,
    /// Per GB stored per time unit.
    pub write_price: i64,
}

/// Storage contract of one client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub expiration: Timestamp,
    pub time_unit: Duration,
    pub terms: Vec<Terms>,
}

fn size_in_gb(size: i64) -> f64 {
    size as f64 / GB as f64
}

/// Sum of pool balances, clamped to the `i64` range.
pub(crate) fn total_balance(balances: impl IntoIterator<Item = i64>) -> i64 {
    balances.into_iter().fold(0i64, i64::saturating_add)
}

impl Allocation {
    pub fn terms_for(&self, blobber_id: &str) -> Option<&Terms> {
        self.terms.iter().find(|t| t.blobber_id == blobber_id)
    }

    /// Time units left until expiration, counted from `at`.
    ///
    /// NaN when both the remaining time and the time unit are zero, negative
    /// once `at` is past expiration.
    pub fn rest_duration_in_time_units(&self, at: Timestamp) -> f64 {
        let rest_ns = (self.expiration as f64 - at as f64) * 1e9;
        rest_ns / self.time_unit.as_nanos() as f64
    }

    /// Cost of reading `num_blocks` blocks from `blobber_id`.
    pub fn want_read(&self, blobber_id: &str, num_blocks: i64) -> i64 {
        if num_blocks <= 0 {
            return 0;
        }
        match self.terms_for(blobber_id) {
            Some(terms) => {
                let gb = num_blocks as f64 * CHUNK_SIZE as f64 / GB as f64;
                // float to int casts saturate
                (gb * terms.read_price as f64) as i64
            }
            None => 0,
        }
    }

    /// Cost of keeping `size` bytes on `blobber_id` from `at` until expiration.
    pub fn want_write(&self, blobber_id: &str, size: i64, at: Timestamp) -> i64 {
        if size <= 0 {
            return 0;
        }
        match self.terms_for(blobber_id) {
            Some(terms) => {
                let cost = size_in_gb(size)
                    * terms.write_price as f64
                    * self.rest_duration_in_time_units(at);
                // NaN casts to 0
                cost as i64
            }
            None => 0,
        }
    }

    /// Balance left after paying for a read. Negative means not enough funds.
    pub fn have_read<'a, I>(&self, pools: I, blobber_id: &str, num_blocks: i64) -> i64
    where
        I: IntoIterator<Item = &'a super::ReadPool>,
    {
        let have = total_balance(pools.into_iter().map(|p| p.balance));
        have.saturating_sub(self.want_read(blobber_id, num_blocks))
    }
}
