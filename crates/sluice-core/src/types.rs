use serde::{Deserialize, Serialize};

use crate::error::SluiceError;

pub type Result<T> = std::result::Result<T, SluiceError>;

/// Subset of file metadata forwarded through the pipeline.
///
/// Stages pass this through unchanged; only the terminal sink interprets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Size of the source file in bytes, if known.
    pub len: u64,
    /// Unix permission bits of the source file.
    pub mode: u32,
    /// Modification time as seconds since the Unix epoch.
    pub mtime_unix: i64,
}

impl FileMeta {
    pub fn with_len(len: u64) -> Self {
        Self {
            len,
            ..Self::default()
        }
    }
}
