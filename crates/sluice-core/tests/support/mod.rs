#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sluice_core::{FileMeta, Result, Sink, SinkFile};

/// Terminal sink capturing each closed file's bytes in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files
            .lock()
            .expect("memory sink mutex poisoned")
            .get(path.as_ref())
            .cloned()
    }

    /// The single captured file; panics when there is not exactly one.
    pub fn single(&self) -> (PathBuf, Vec<u8>) {
        let files = self.files.lock().expect("memory sink mutex poisoned");
        assert_eq!(files.len(), 1, "expected exactly one captured file");
        let (path, bytes) = files.iter().next().expect("one entry");
        (path.clone(), bytes.clone())
    }
}

impl Sink for MemorySink {
    fn open<'a>(&'a self, path: &Path, _meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        Ok(Box::new(MemoryFile {
            path: path.to_path_buf(),
            bytes: Vec::new(),
            files: Arc::clone(&self.files),
        }))
    }
}

struct MemoryFile {
    path: PathBuf,
    bytes: Vec<u8>,
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
}

impl SinkFile for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.bytes.extend_from_slice(buf);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.files
            .lock()
            .expect("memory sink mutex poisoned")
            .insert(this.path, this.bytes);
        Ok(())
    }
}

/// Sink whose files reject writes once a byte budget is spent.
pub struct FailingSink {
    pub budget: usize,
}

impl Sink for FailingSink {
    fn open<'a>(&'a self, _path: &Path, _meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        Ok(Box::new(FailingFile { left: self.budget }))
    }
}

struct FailingFile {
    left: usize,
}

impl SinkFile for FailingFile {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if buf.len() > self.left {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "sink full").into());
        }
        self.left -= buf.len();
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Feeds `data` to the file in pieces of at most `piece` bytes.
pub fn write_split(file: &mut Box<dyn SinkFile + '_>, data: &[u8], piece: usize) -> Result<()> {
    for part in data.chunks(piece.max(1)) {
        file.write(part)?;
    }
    Ok(())
}

/// Deterministic patterned payload that compresses but is not constant.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Deterministic pseudo-random payload that does not compress.
pub fn incompressible(len: usize) -> Vec<u8> {
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}
