//! Store configuration and protocol constants.

use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

pub const KB: i64 = 1024;
pub const MB: i64 = 1024 * KB;
pub const GB: i64 = 1024 * MB;

/// Size of one storage block.
pub const CHUNK_SIZE: i64 = 64 * KB;

/// Leaves of every block Merkle tree, and the number of challengeable
/// positions per file.
pub const MERKLE_LEAVES: usize = 1024;

/// Bytes of each block that fall into one Merkle leaf.
pub const FRAGMENT_SIZE: usize = CHUNK_SIZE as usize / MERKLE_LEAVES;

/// Name of the config file under the store root.
pub const CONFIG_FILE: &str = "config";

const CONFIG_VERSION: &str = "1";

/// Contents of the store `config` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// ID of the blobber this store belongs to. Used to pick pricing terms.
    pub blobber_id: String,
}

impl Config {
    pub fn new(blobber_id: impl Into<String>) -> Self {
        Self {
            blobber_id: blobber_id.into(),
        }
    }

    /// Parse `key=value` lines. `#` starts a comment line; unknown keys are ignored.
    pub fn parse(content: &str) -> Result<Self> {
        let mut version = None;
        let mut blobber_id = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "blobber_id" => blobber_id = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some(CONFIG_VERSION) {
            return Err(Error::invalid_config(format!(
                "Unsupported config version: {:?}",
                version
            )));
        }

        let blobber_id = blobber_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::invalid_config("Missing blobber_id in config"))?;

        Ok(Self::new(blobber_id))
    }

    /// Render the file contents.
    pub fn render(&self) -> String {
        format!(
            "version={}\nblobber_id={}\n",
            CONFIG_VERSION, self.blobber_id
        )
    }

    /// Read `<root>/config`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Err(Error::invalid_config(format!(
                "config file not found under {}",
                root.display()
            )));
        }
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Write `<root>/config`, creating the root if needed.
    pub fn write(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        fs::write(root.join(CONFIG_FILE), self.render())?;
        Ok(())
    }
}
