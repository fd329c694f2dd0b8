use std::path::Path;

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::SluiceError;
use crate::format::xbcrypt::{ChunkHeader, ChunkVersion, CONTENT_HASH_SIZE};
use crate::io::ByteCursor;
use crate::pool::{TaskHandle, WorkerPool};
use crate::types::{FileMeta, Result};

use super::{strip_suffix, with_suffix, BufferCache, Sink, SinkFile, StageOptions};

/// Format suffix appended by the encryptor and stripped by the decryptor.
pub const SUFFIX: &str = "xbcrypt";

/// Key length of the chunk cipher.
pub const KEY_SIZE: usize = 32;
/// IV length drawn for every version-3 chunk.
pub const IV_SIZE: usize = 16;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Chunked parallel encryptor producing version-3 xbcrypt records.
///
/// Each chunk is encrypted under its own random IV; the plaintext's SHA-256
/// rides inside the ciphertext so the decryptor can verify content, and the
/// CRC32 of the ciphertext gates the record before any decryption runs.
pub struct EncryptSink<S> {
    next: S,
    pool: WorkerPool,
    chunk_size: usize,
    key: [u8; KEY_SIZE],
}

impl<S: Sink> EncryptSink<S> {
    pub fn new(next: S, key: [u8; KEY_SIZE], options: &StageOptions) -> Self {
        Self {
            next,
            pool: WorkerPool::new(options.worker_threads),
            chunk_size: options.chunk_size.max(1),
            key,
        }
    }
}

impl<S: Sink> Sink for EncryptSink<S> {
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        let next = self.next.open(&with_suffix(path, SUFFIX), meta)?;
        tracing::debug!(
            path = %path.display(),
            chunk_size = self.chunk_size,
            "encrypt stage opened"
        );
        Ok(Box::new(EncryptFile {
            next,
            pool: &self.pool,
            chunk_size: self.chunk_size,
            key: self.key,
            pending: Vec::new(),
            cache: BufferCache::default(),
            record: Vec::new(),
        }))
    }
}

struct EncryptedChunk {
    original_len: usize,
    iv: [u8; IV_SIZE],
    ciphertext: Vec<u8>,
}

struct EncryptFile<'a> {
    next: Box<dyn SinkFile + 'a>,
    pool: &'a WorkerPool,
    chunk_size: usize,
    key: [u8; KEY_SIZE],
    pending: Vec<TaskHandle<EncryptedChunk>>,
    cache: BufferCache,
    record: Vec<u8>,
}

impl EncryptFile<'_> {
    fn flush_pending(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.pending.drain(..) {
            let chunk = handle.wait();
            if first_err.is_none() {
                self.record.clear();
                ChunkHeader {
                    version: ChunkVersion::V3,
                    original_size: chunk.original_len as u64,
                    encrypted_size: chunk.ciphertext.len() as u64,
                    checksum: crc32fast::hash(&chunk.ciphertext),
                    iv: chunk.iv.to_vec(),
                }
                .encode(&mut self.record);
                self.record.extend_from_slice(&chunk.ciphertext);

                if let Err(err) = self.next.write(&self.record) {
                    first_err = Some(err);
                }
            }
            self.cache.put(chunk.ciphertext);
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl SinkFile for EncryptFile<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(self.chunk_size) {
            let mut plaintext = self.cache.get();
            plaintext.extend_from_slice(chunk);
            let mut iv = [0u8; IV_SIZE];
            rand::thread_rng().fill_bytes(&mut iv);
            let key = self.key;
            self.pending
                .push(self.pool.submit(move |_worker| encrypt_chunk(plaintext, key, iv)));

            if self.pending.len() >= self.pool.num_workers() {
                self.flush_pending()?;
            }
        }
        self.flush_pending()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush_pending()?;
        tracing::debug!("encrypt stage closed");
        self.next.close()
    }
}

fn encrypt_chunk(mut plaintext: Vec<u8>, key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> EncryptedChunk {
    let original_len = plaintext.len();
    let hash = Sha256::digest(&plaintext);
    plaintext.extend_from_slice(&hash);

    // Fresh cipher per chunk; instances are never shared across tasks.
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut plaintext);

    EncryptedChunk {
        original_len,
        iv,
        ciphertext: plaintext,
    }
}

/// Incremental decryptor for xbcrypt chunk streams, versions 1 through 3.
pub struct DecryptSink<S> {
    next: S,
    pool: WorkerPool,
    key: [u8; KEY_SIZE],
}

impl<S: Sink> DecryptSink<S> {
    pub fn new(next: S, key: [u8; KEY_SIZE], options: &StageOptions) -> Self {
        Self {
            next,
            pool: WorkerPool::new(options.worker_threads),
            key,
        }
    }
}

impl<S: Sink> Sink for DecryptSink<S> {
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        let inner = strip_suffix(path, SUFFIX)?;
        let next = self.next.open(&inner, meta)?;
        tracing::debug!(path = %path.display(), "decrypt stage opened");
        Ok(Box::new(DecryptFile {
            next,
            pool: &self.pool,
            key: self.key,
            carry: Vec::new(),
            carry_spare: Vec::new(),
            pending: Vec::new(),
            cache: BufferCache::default(),
        }))
    }
}

struct DecryptedChunk {
    output: Vec<u8>,
}

struct DecryptFile<'a> {
    next: Box<dyn SinkFile + 'a>,
    pool: &'a WorkerPool,
    key: [u8; KEY_SIZE],
    carry: Vec<u8>,
    carry_spare: Vec<u8>,
    pending: Vec<TaskHandle<Result<DecryptedChunk>>>,
    cache: BufferCache,
}

impl DecryptFile<'_> {
    fn consume(&mut self, cursor: &mut ByteCursor) -> Result<()> {
        loop {
            let save = cursor.save();
            let Some(header) = ChunkHeader::parse(cursor)? else {
                cursor.restore(save);
                return Ok(());
            };
            let Some(bytes) = cursor.read_bytes(header.encrypted_size as usize) else {
                cursor.restore(save);
                return Ok(());
            };

            // Authentication gate: the stored CRC32 is checked here, on the
            // driving thread, before the chunk is ever queued.
            let actual = crc32fast::hash(bytes);
            if actual != header.checksum {
                return Err(SluiceError::ChecksumMismatch {
                    expected: header.checksum,
                    actual,
                });
            }

            let iv = chunk_iv(&header)?;
            let mut ciphertext = self.cache.get();
            ciphertext.extend_from_slice(bytes);
            let key = self.key;
            let original_size = header.original_size as usize;
            self.pending.push(
                self.pool
                    .submit(move |_worker| decrypt_chunk(ciphertext, key, iv, original_size)),
            );
            if self.pending.len() >= self.pool.num_workers() {
                self.flush_pending()?;
            }
        }
    }

    fn flush_pending(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.pending.drain(..) {
            match handle.wait() {
                Ok(chunk) => {
                    if first_err.is_none() {
                        if let Err(err) = self.next.write(&chunk.output) {
                            first_err = Some(err);
                        }
                    }
                    self.cache.put(chunk.output);
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn drain_discard(&mut self) {
        for handle in self.pending.drain(..) {
            let _ = handle.wait();
        }
    }
}

impl SinkFile for DecryptFile<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let carry = std::mem::take(&mut self.carry);
        let mut rest = std::mem::take(&mut self.carry_spare);
        rest.clear();

        let mut cursor = ByteCursor::new();
        cursor.push(&carry);
        cursor.push(buf);

        let result = match self.consume(&mut cursor) {
            Ok(()) => self.flush_pending(),
            Err(err) => {
                self.drain_discard();
                Err(err)
            }
        };
        cursor.take_rest(&mut rest);
        drop(cursor);
        self.carry = rest;
        self.carry_spare = carry;
        result
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush_pending()?;
        if !self.carry.is_empty() {
            return Err(SluiceError::Truncated("xbcrypt stream ended mid-chunk"));
        }
        tracing::debug!("decrypt stage closed");
        self.next.close()
    }
}

/// IV applied to a chunk's cipher.
///
/// Version 1 predates stored IVs; version 2 stores one but never applied it,
/// and decrypting its chunks with a zero IV keeps old archives readable.
/// Only version 3 uses the stored IV.
fn chunk_iv(header: &ChunkHeader) -> Result<[u8; IV_SIZE]> {
    match header.version {
        ChunkVersion::V1 | ChunkVersion::V2 => Ok([0u8; IV_SIZE]),
        ChunkVersion::V3 => {
            let iv: [u8; IV_SIZE] =
                header.iv.as_slice().try_into().map_err(|_| SluiceError::InvalidSize {
                    field: "xbcrypt iv length",
                    value: header.iv.len() as u64,
                    limit: IV_SIZE as u64,
                })?;
            Ok(iv)
        }
    }
}

fn decrypt_chunk(
    mut ciphertext: Vec<u8>,
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    original_size: usize,
) -> Result<DecryptedChunk> {
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut ciphertext);

    if ciphertext.len() == original_size + CONTENT_HASH_SIZE as usize {
        let stored = ciphertext.split_off(original_size);
        let actual = Sha256::digest(&ciphertext);
        if actual.as_slice() != stored.as_slice() {
            return Err(SluiceError::Decryption(
                "content hash mismatch after decryption".to_string(),
            ));
        }
    } else if ciphertext.len() != original_size {
        return Err(SluiceError::Decryption(format!(
            "decrypted length {} does not match declared size {}",
            ciphertext.len(),
            original_size
        )));
    }

    Ok(DecryptedChunk { output: ciphertext })
}
