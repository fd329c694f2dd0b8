pub mod crypt;
pub mod lz4;
pub mod qpress;
pub mod zstd;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SluiceError;
use crate::types::{FileMeta, Result};

pub use crypt::{DecryptSink, EncryptSink, KEY_SIZE};
pub use lz4::{Lz4CompressSink, Lz4DecompressSink};
pub use qpress::{QpressCompressSink, QpressDecompressSink};
pub use zstd::{ZstdCompressSink, ZstdDecompressSink};

/// Default worker-thread count per stage.
pub const DEFAULT_WORKER_THREADS: usize = 4;
/// Default chunk size dispatched as one parallel work item.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Per-pipeline context of one transform stage.
///
/// A stage wraps the next stage's context and owns whatever long-lived
/// resources (worker pool, key material) its files share. Constructing the
/// value is stage init; dropping it is deinit.
pub trait Sink {
    /// Opens a per-file transform handle, opening the downstream file under
    /// the stage's adjusted name.
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>>;
}

/// Per-file transform state of one open pipeline file.
pub trait SinkFile {
    /// Pushes one slice of the stream through the stage.
    ///
    /// Blocks until every block dispatched for this call has been
    /// transformed and written downstream. The slice may end anywhere,
    /// including mid-record; the stage carries partial state to the next
    /// call.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Flushes trailers and closes the downstream file.
    ///
    /// Fails if the stream has not reached its terminal state.
    fn close(self: Box<Self>) -> Result<()>;
}

/// Configuration shared by every stage, supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOptions {
    /// Worker threads in the stage's pool.
    pub worker_threads: usize,
    /// Bytes per chunk dispatched as one parallel work item.
    pub chunk_size: usize,
}

impl StageOptions {
    pub fn new(worker_threads: usize, chunk_size: usize) -> Self {
        Self {
            worker_threads: worker_threads.max(1),
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for StageOptions {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_THREADS, DEFAULT_CHUNK_SIZE)
    }
}

/// Growth-only cache of reusable byte buffers.
///
/// Chunk slots cycle through here between dispatches so their capacity is
/// paid once per file, not once per block. Buffers are only ever touched by
/// the thread driving `write`/`close` or by the single task that owns them.
#[derive(Debug, Default)]
pub struct BufferCache {
    spares: Vec<Vec<u8>>,
}

impl BufferCache {
    pub fn get(&mut self) -> Vec<u8> {
        match self.spares.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::new(),
        }
    }

    pub fn put(&mut self, buf: Vec<u8>) {
        self.spares.push(buf);
    }
}

/// Appends a stage's format suffix to the file name.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Strips a stage's format suffix, failing fast when it is absent.
pub(crate) fn strip_suffix(path: &Path, suffix: &str) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(SluiceError::InvalidFormat("missing file name"))?;
    let stem = name
        .strip_suffix(suffix)
        .filter(|stem| stem.ends_with('.'))
        .map(|stem| &stem[..stem.len() - 1])
        .ok_or(SluiceError::InvalidFormat("missing format suffix"))?;
    if stem.is_empty() {
        return Err(SluiceError::InvalidFormat("missing format suffix"));
    }
    Ok(path.with_file_name(stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_round_trip() {
        let encoded = with_suffix(Path::new("backup/ibdata1"), "qp");
        assert_eq!(encoded, PathBuf::from("backup/ibdata1.qp"));
        let decoded = strip_suffix(&encoded, "qp").expect("suffix present");
        assert_eq!(decoded, PathBuf::from("backup/ibdata1"));
    }

    #[test]
    fn strip_fails_fast_without_suffix() {
        assert!(strip_suffix(Path::new("ibdata1"), "qp").is_err());
        assert!(strip_suffix(Path::new(".qp"), "qp").is_err());
        assert!(strip_suffix(Path::new("file.lz4"), "qp").is_err());
    }

    #[test]
    fn buffer_cache_reuses_capacity() {
        let mut cache = BufferCache::default();
        let mut buf = cache.get();
        buf.reserve(4096);
        let capacity = buf.capacity();
        cache.put(buf);

        let reused = cache.get();
        assert!(reused.is_empty());
        assert!(reused.capacity() >= capacity);
    }
}
