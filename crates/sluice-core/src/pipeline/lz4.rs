use std::path::Path;

use xxhash_rust::xxh32::{xxh32, Xxh32};

use crate::error::SluiceError;
use crate::format::lz4f::{BlockMaxSize, FrameHeader, UNCOMPRESSED_FLAG};
use crate::io::ByteCursor;
use crate::pool::{TaskHandle, WorkerPool};
use crate::types::{FileMeta, Result};

use super::{strip_suffix, with_suffix, BufferCache, Sink, SinkFile, StageOptions};

/// Format suffix appended by the compressor and stripped by the decompressor.
pub const SUFFIX: &str = "lz4";

/// Parallel compressor emitting one self-contained LZ4 frame per `write`.
pub struct Lz4CompressSink<S> {
    next: S,
    pool: WorkerPool,
    chunk_size: usize,
}

impl<S: Sink> Lz4CompressSink<S> {
    pub fn new(next: S, options: &StageOptions) -> Self {
        Self {
            next,
            pool: WorkerPool::new(options.worker_threads),
            chunk_size: options.chunk_size.max(1),
        }
    }
}

impl<S: Sink> Sink for Lz4CompressSink<S> {
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        let next = self.next.open(&with_suffix(path, SUFFIX), meta)?;
        let block_max = BlockMaxSize::for_chunk_size(self.chunk_size);
        tracing::debug!(
            path = %path.display(),
            chunk_size = self.chunk_size,
            "lz4 compress stage opened"
        );
        Ok(Box::new(CompressFile {
            next,
            pool: &self.pool,
            // Chunks must fit the frame's declared block-size class.
            block_size: self.chunk_size.min(block_max.size_bytes()),
            block_max,
            pending: Vec::new(),
            cache: BufferCache::default(),
            record: Vec::new(),
        }))
    }
}

struct CompressedBlock {
    input: Vec<u8>,
    scratch: Vec<u8>,
    stored_raw: bool,
}

impl CompressedBlock {
    fn stored(&self) -> &[u8] {
        if self.stored_raw {
            &self.input
        } else {
            &self.scratch
        }
    }
}

struct CompressFile<'a> {
    next: Box<dyn SinkFile + 'a>,
    pool: &'a WorkerPool,
    block_size: usize,
    block_max: BlockMaxSize,
    pending: Vec<TaskHandle<CompressedBlock>>,
    cache: BufferCache,
    record: Vec<u8>,
}

impl CompressFile<'_> {
    fn flush_pending(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.pending.drain(..) {
            let block = handle.wait();
            if first_err.is_none() {
                self.record.clear();
                let stored = block.stored();
                let mut len = stored.len() as u32;
                if block.stored_raw {
                    len |= UNCOMPRESSED_FLAG;
                }
                self.record.extend_from_slice(&len.to_le_bytes());
                self.record.extend_from_slice(stored);

                if let Err(err) = self.next.write(&self.record) {
                    first_err = Some(err);
                }
            }
            self.cache.put(block.input);
            self.cache.put(block.scratch);
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl SinkFile for CompressFile<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let header = FrameHeader::for_content(buf.len() as u64, self.block_max);
        self.next.write(&header.encode())?;

        // The content hash covers the original bytes, accumulated here in
        // submission order while the workers compress.
        let mut hasher = Xxh32::new(0);
        for chunk in buf.chunks(self.block_size) {
            let mut input = self.cache.get();
            input.extend_from_slice(chunk);
            let scratch = self.cache.get();
            self.pending
                .push(self.pool.submit(move |_worker| compress_block(input, scratch)));
            hasher.update(chunk);

            if self.pending.len() >= self.pool.num_workers() {
                self.flush_pending()?;
            }
        }
        self.flush_pending()?;

        self.record.clear();
        self.record.extend_from_slice(&0u32.to_le_bytes());
        self.record.extend_from_slice(&hasher.digest().to_le_bytes());
        self.next.write(&self.record)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush_pending()?;
        tracing::debug!("lz4 compress stage closed");
        self.next.close()
    }
}

fn compress_block(input: Vec<u8>, mut scratch: Vec<u8>) -> CompressedBlock {
    scratch.resize(lz4_flex::block::get_maximum_output_size(input.len()), 0);
    let written = lz4_flex::block::compress_into(&input, &mut scratch).unwrap_or(usize::MAX);
    let stored_raw = written >= input.len();
    scratch.truncate(if stored_raw { 0 } else { written });
    CompressedBlock {
        input,
        scratch,
        stored_raw,
    }
}

/// Incremental LZ4 frame decompressor.
///
/// Resumability comes from the cursor's save/restore: a record that does not
/// fit the buffered input is retried on the next call, with only the
/// unconsumed bytes themselves carried over.
pub struct Lz4DecompressSink<S> {
    next: S,
    pool: WorkerPool,
}

impl<S: Sink> Lz4DecompressSink<S> {
    pub fn new(next: S, options: &StageOptions) -> Self {
        Self {
            next,
            pool: WorkerPool::new(options.worker_threads),
        }
    }
}

impl<S: Sink> Sink for Lz4DecompressSink<S> {
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        let inner = strip_suffix(path, SUFFIX)?;
        let next = self.next.open(&inner, meta)?;
        tracing::debug!(path = %path.display(), "lz4 decompress stage opened");
        Ok(Box::new(DecompressFile {
            next,
            pool: &self.pool,
            carry: Vec::new(),
            carry_spare: Vec::new(),
            frame: None,
            hasher: Xxh32::new(0),
            frame_bytes: 0,
            pending: Vec::new(),
            cache: BufferCache::default(),
        }))
    }
}

struct DecodedBlock {
    input: Vec<u8>,
    output: Vec<u8>,
}

struct DecompressFile<'a> {
    next: Box<dyn SinkFile + 'a>,
    pool: &'a WorkerPool,
    carry: Vec<u8>,
    carry_spare: Vec<u8>,
    /// Descriptor of the frame currently being decoded.
    frame: Option<FrameHeader>,
    hasher: Xxh32,
    frame_bytes: u64,
    pending: Vec<TaskHandle<Result<DecodedBlock>>>,
    cache: BufferCache,
}

impl DecompressFile<'_> {
    fn consume(&mut self, cursor: &mut ByteCursor) -> Result<()> {
        loop {
            let save = cursor.save();
            let Some(frame) = self.frame else {
                match FrameHeader::parse(cursor)? {
                    Some(header) => {
                        self.frame = Some(header);
                        self.hasher = Xxh32::new(0);
                        self.frame_bytes = 0;
                        continue;
                    }
                    None => {
                        cursor.restore(save);
                        return Ok(());
                    }
                }
            };

            let Some(len) = cursor.read_u32_le() else {
                cursor.restore(save);
                return Ok(());
            };

            if len == 0 {
                // End mark; the content checksum follows when declared.
                let stored = if frame.content_checksum {
                    match cursor.read_u32_le() {
                        Some(stored) => Some(stored),
                        None => {
                            cursor.restore(save);
                            return Ok(());
                        }
                    }
                } else {
                    None
                };
                self.finish_frame(frame, stored)?;
                continue;
            }

            let stored_raw = len & UNCOMPRESSED_FLAG != 0;
            let size = (len & !UNCOMPRESSED_FLAG) as usize;
            if size == 0 || size > frame.block_max_size.size_bytes() {
                return Err(SluiceError::InvalidSize {
                    field: "lz4 block size",
                    value: size as u64,
                    limit: frame.block_max_size.size_bytes() as u64,
                });
            }
            let Some(bytes) = cursor.read_bytes(size) else {
                cursor.restore(save);
                return Ok(());
            };
            let mut input = self.cache.get();
            input.extend_from_slice(bytes);

            let block_checksum = if frame.block_checksum {
                match cursor.read_u32_le() {
                    Some(stored) => Some(stored),
                    None => {
                        self.cache.put(input);
                        cursor.restore(save);
                        return Ok(());
                    }
                }
            } else {
                None
            };

            let output = self.cache.get();
            let max_out = frame.block_max_size.size_bytes();
            self.pending.push(self.pool.submit(move |_worker| {
                decode_block(input, output, stored_raw, block_checksum, max_out)
            }));
            if self.pending.len() >= self.pool.num_workers() {
                self.flush_pending()?;
            }
        }
    }

    fn finish_frame(&mut self, frame: FrameHeader, stored: Option<u32>) -> Result<()> {
        // Every block must be reaped and hashed before the comparison.
        self.flush_pending()?;

        if let Some(content_size) = frame.content_size {
            if content_size != self.frame_bytes {
                return Err(SluiceError::SizeMismatch {
                    what: "lz4 frame content size",
                    expected: content_size,
                    actual: self.frame_bytes,
                });
            }
        }
        if let Some(stored) = stored {
            let actual = self.hasher.digest();
            if actual != stored {
                return Err(SluiceError::ChecksumMismatch {
                    expected: stored,
                    actual,
                });
            }
        }
        tracing::debug!(bytes = self.frame_bytes, "lz4 frame complete");
        self.frame = None;
        Ok(())
    }

    fn flush_pending(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.pending.drain(..) {
            match handle.wait() {
                Ok(block) => {
                    if first_err.is_none() {
                        self.hasher.update(&block.output);
                        self.frame_bytes += block.output.len() as u64;
                        if let Err(err) = self.next.write(&block.output) {
                            first_err = Some(err);
                        }
                    }
                    self.cache.put(block.input);
                    self.cache.put(block.output);
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

impl SinkFile for DecompressFile<'_> {
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
        if self.frame.is_some() {
            return Err(SluiceError::Truncated("lz4 frame missing its end mark"));
        }
        if !self.carry.is_empty() {
            return Err(SluiceError::Truncated("unprocessed bytes after last frame"));
        }
        tracing::debug!("lz4 decompress stage closed");
        self.next.close()
    }
}

fn decode_block(
    input: Vec<u8>,
    mut output: Vec<u8>,
    stored_raw: bool,
    block_checksum: Option<u32>,
    max_out: usize,
) -> Result<DecodedBlock> {
    if let Some(stored) = block_checksum {
        let actual = xxh32(&input, 0);
        if actual != stored {
            return Err(SluiceError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
    }

    if stored_raw {
        output.extend_from_slice(&input);
    } else {
        output.resize(max_out, 0);
        let written = lz4_flex::block::decompress_into(&input, &mut output)
            .map_err(|err| SluiceError::Decompression(err.to_string()))?;
        output.truncate(written);
    }
    Ok(DecodedBlock { input, output })
}
