use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a scanner reads its data from. Drives worker pool selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Co-located tablet storage. CPU bound.
    Local,
    /// Network or object storage. Threads mostly block on I/O.
    Remote,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::Remote => "remote",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
