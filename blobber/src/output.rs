//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use blobber_core::{ObjectPath, Ref};
use serde::Serialize;
use std::io::{self, Write};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write output using the configured format.
    ///
    /// `text_fn` is only called in text mode.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write raw bytes in text mode; JSON mode goes through [`OutputWriter::write`].
    pub fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut handle = self.stdout.lock();
        handle.write_all(bytes)?;
        handle.flush()?;
        Ok(())
    }

    /// Write an error message to stderr.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init`.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub blobber_id: String,
}

/// Output of every command that runs a write session.
#[derive(Debug, Serialize)]
pub struct SessionOutput {
    pub success: bool,
    pub result_code: u8,
    pub connection_id: String,
    pub operation: String,
    pub allocation_root: String,
    pub committed: Vec<String>,
}

/// One row of a listing.
#[derive(Debug, Clone, Serialize)]
pub struct EntryInfo {
    pub name: String,
    pub path: String,
    pub entry_type: String,
    pub size: i64,
    pub num_blocks: i64,
    pub hash: String,
}

impl From<&Ref> for EntryInfo {
    fn from(r: &Ref) -> Self {
        Self {
            name: r.name.clone(),
            path: r.path.clone(),
            entry_type: r.ref_type.as_str().to_string(),
            size: r.size,
            num_blocks: r.num_blocks,
            hash: r.hash.clone(),
        }
    }
}

/// Output for `ls`.
#[derive(Debug, Serialize)]
pub struct LsOutput {
    pub success: bool,
    pub result_code: u8,
    #[serde(flatten)]
    pub entry: EntryInfo,
    pub children: Vec<EntryInfo>,
}

/// Output for `block`.
#[derive(Debug, Serialize)]
pub struct BlockOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub block_num: i64,
    pub size: usize,
    /// Hex-encoded bytes.
    pub data: String,
}

/// Output for `challenge`.
#[derive(Debug, Serialize)]
pub struct ChallengeOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub block_offset: i64,
    pub merkle_root: String,
    pub proof_nodes: Vec<String>,
    pub verified: bool,
    /// Hex-encoded leaf bytes.
    pub data: String,
}

/// Output for `object-path`.
#[derive(Debug, Serialize)]
pub struct ObjectPathOutput {
    pub success: bool,
    pub result_code: u8,
    pub block_num: i64,
    #[serde(flatten)]
    pub object_path: ObjectPath,
}

/// Output for `du`.
#[derive(Debug, Serialize)]
pub struct DuOutput {
    pub success: bool,
    pub result_code: u8,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectInfo {
    pub hash: String,
    pub size: u64,
}

/// Output for `objects`.
#[derive(Debug, Serialize)]
pub struct ObjectsOutput {
    pub success: bool,
    pub result_code: u8,
    pub objects: Vec<ObjectInfo>,
}

/// Output for `lookup`.
#[derive(Debug, Serialize)]
pub struct LookupOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub lookup_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<i64>,
}

/// Output for `price`.
#[derive(Debug, Serialize)]
pub struct PriceOutput {
    pub success: bool,
    pub result_code: u8,
    pub blobber_id: String,
    pub want_read: i64,
    pub want_write: i64,
    pub have_read: i64,
    pub have_write: i64,
    pub pending_write: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reserved: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub kind: String,
    pub pool_id: String,
    pub balance: i64,
    pub expire_at: i64,
    pub expire_at_human: String,
}

/// Output for `pool`.
#[derive(Debug, Serialize)]
pub struct PoolOutput {
    pub success: bool,
    pub result_code: u8,
    pub pools: Vec<PoolInfo>,
    pub pending_write: i64,
}
