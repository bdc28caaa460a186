//! File attributes stored as a small JSON blob on each file ref.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who is billed for reads of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum WhoPays {
    #[default]
    Owner = 0,
    ThirdParty = 1,
}

impl TryFrom<i64> for WhoPays {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(WhoPays::Owner),
            1 => Ok(WhoPays::ThirdParty),
            other => Err(format!("unknown who_pays_for_reads value {}", other)),
        }
    }
}

impl From<WhoPays> for i64 {
    fn from(value: WhoPays) -> Self {
        value as i64
    }
}

impl fmt::Display for WhoPays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhoPays::Owner => write!(f, "owner"),
            WhoPays::ThirdParty => write!(f, "3rd_party"),
        }
    }
}

impl std::str::FromStr for WhoPays {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "owner" | "0" => Ok(WhoPays::Owner),
            "3rd_party" | "third_party" | "1" => Ok(WhoPays::ThirdParty),
            other => Err(Error::invalid_attributes(format!(
                "unknown payer '{}'",
                other
            ))),
        }
    }
}

fn is_owner(who: &WhoPays) -> bool {
    *who == WhoPays::Owner
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default, skip_serializing_if = "is_owner")]
    pub who_pays_for_reads: WhoPays,
}

impl Attributes {
    pub fn new(who_pays_for_reads: WhoPays) -> Self {
        Self { who_pays_for_reads }
    }

    /// True when nothing but defaults is set.
    ///
    /// Owner-pays is the default, so an explicit owner setting also counts as
    /// zero and is not stored.
    // FIXME: owner-pays cannot be told apart from "unset"; needs a product decision.
    pub fn is_zero(&self) -> bool {
        self.who_pays_for_reads == WhoPays::Owner
    }

    /// Decode a stored blob. Empty input means defaults.
    pub fn decode(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| Error::invalid_attributes(format!("decoding file attributes: {}", e)))
    }

    /// Encode for storage. Zero attributes encode as `{}`.
    pub fn encode(&self) -> Result<String> {
        if self.is_zero() {
            return Ok("{}".to_string());
        }
        Ok(serde_json::to_string(self)?)
    }
}
