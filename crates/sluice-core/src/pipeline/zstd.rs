use std::io::Write as _;
use std::path::Path;

use xxhash_rust::xxh64::xxh64;

use crate::error::SluiceError;
use crate::format::zstdf::{
    self, FrameInfo, CONTENT_CHECKSUM_SIZE, DESCRIPTOR_CHECKSUM_FLAG, DESCRIPTOR_OFFSET,
    MAX_FRAME_CONTENT_SIZE,
};
use crate::io::ByteCursor;
use crate::pool::{TaskHandle, WorkerPool};
use crate::types::{FileMeta, Result};

use super::{strip_suffix, with_suffix, BufferCache, Sink, SinkFile, StageOptions};

/// Format suffix appended by the compressor and stripped by the decompressor.
pub const SUFFIX: &str = "zst";

/// Parallel compressor emitting one complete ZSTD frame per chunk.
///
/// Frames carry a pledged content size and a content checksum, so the
/// decompressor can verify each one independently.
pub struct ZstdCompressSink<S> {
    next: S,
    pool: WorkerPool,
    chunk_size: usize,
    level: i32,
}

impl<S: Sink> ZstdCompressSink<S> {
    pub fn new(next: S, options: &StageOptions) -> Self {
        Self {
            next,
            pool: WorkerPool::new(options.worker_threads),
            chunk_size: options.chunk_size.max(1),
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }
}

impl<S: Sink> Sink for ZstdCompressSink<S> {
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        let next = self.next.open(&with_suffix(path, SUFFIX), meta)?;
        tracing::debug!(
            path = %path.display(),
            chunk_size = self.chunk_size,
            level = self.level,
            "zstd compress stage opened"
        );
        Ok(Box::new(CompressFile {
            next,
            pool: &self.pool,
            chunk_size: self.chunk_size,
            level: self.level,
            pending: Vec::new(),
            cache: BufferCache::default(),
        }))
    }
}

struct CompressedFrame {
    input: Vec<u8>,
    frame: Vec<u8>,
}

struct CompressFile<'a> {
    next: Box<dyn SinkFile + 'a>,
    pool: &'a WorkerPool,
    chunk_size: usize,
    level: i32,
    pending: Vec<TaskHandle<Result<CompressedFrame>>>,
    cache: BufferCache,
}

impl CompressFile<'_> {
    fn flush_pending(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.pending.drain(..) {
            match handle.wait() {
                Ok(frame) => {
                    if first_err.is_none() {
                        if let Err(err) = self.next.write(&frame.frame) {
                            first_err = Some(err);
                        }
                    }
                    self.cache.put(frame.input);
                    self.cache.put(frame.frame);
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
}

impl SinkFile for CompressFile<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(self.chunk_size) {
            let mut input = self.cache.get();
            input.extend_from_slice(chunk);
            let frame = self.cache.get();
            let level = self.level;
            self.pending
                .push(self.pool.submit(move |_worker| compress_frame(input, frame, level)));

            if self.pending.len() >= self.pool.num_workers() {
                self.flush_pending()?;
            }
        }
        self.flush_pending()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush_pending()?;
        tracing::debug!("zstd compress stage closed");
        self.next.close()
    }
}

fn compress_frame(input: Vec<u8>, frame: Vec<u8>, level: i32) -> Result<CompressedFrame> {
    let map = |err: std::io::Error| SluiceError::Compression(err.to_string());

    let mut encoder = zstd::Encoder::new(frame, level).map_err(map)?;
    encoder.include_checksum(true).map_err(map)?;
    encoder.include_contentsize(true).map_err(map)?;
    encoder
        .set_pledged_src_size(Some(input.len() as u64))
        .map_err(map)?;
    encoder.write_all(&input).map_err(map)?;
    let frame = encoder.finish().map_err(map)?;
    Ok(CompressedFrame { input, frame })
}

/// Incremental ZSTD frame decompressor.
///
/// Delimits whole frames with the cursor's save/restore, dispatches each
/// frame to a worker, and validates the content checksum on reap. Skippable
/// frames are recognized and dropped.
pub struct ZstdDecompressSink<S> {
    next: S,
    pool: WorkerPool,
}

impl<S: Sink> ZstdDecompressSink<S> {
    pub fn new(next: S, options: &StageOptions) -> Self {
        Self {
            next,
            pool: WorkerPool::new(options.worker_threads),
        }
    }
}

impl<S: Sink> Sink for ZstdDecompressSink<S> {
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        let inner = strip_suffix(path, SUFFIX)?;
        let next = self.next.open(&inner, meta)?;
        tracing::debug!(path = %path.display(), "zstd decompress stage opened");
        Ok(Box::new(DecompressFile {
            next,
            pool: &self.pool,
            carry: Vec::new(),
            carry_spare: Vec::new(),
            pending: Vec::new(),
            cache: BufferCache::default(),
        }))
    }
}

struct DecodedFrame {
    frame: Vec<u8>,
    output: Vec<u8>,
    /// Stored and computed content checksums, when the frame declared one.
    checksums: Option<(u32, u32)>,
}

struct DecompressFile<'a> {
    next: Box<dyn SinkFile + 'a>,
    pool: &'a WorkerPool,
    carry: Vec<u8>,
    carry_spare: Vec<u8>,
    pending: Vec<TaskHandle<Result<DecodedFrame>>>,
    cache: BufferCache,
}

impl DecompressFile<'_> {
    fn consume(&mut self, cursor: &mut ByteCursor) -> Result<()> {
        loop {
            let Some(info) = zstdf::next_frame(cursor)? else {
                return Ok(());
            };
            if info.skippable {
                tracing::debug!(len = info.total_len, "dropping skippable zstd frame");
                cursor.skip(info.total_len);
                continue;
            }

            let bytes = cursor
                .read_bytes(info.total_len)
                .ok_or(SluiceError::InvalidFormat("zstd frame vanished after walk"))?;
            let mut frame = self.cache.get();
            frame.extend_from_slice(bytes);

            let output = self.cache.get();
            self.pending
                .push(self.pool.submit(move |_worker| decode_frame(frame, output, info)));
            if self.pending.len() >= self.pool.num_workers() {
                self.flush_pending()?;
            }
        }
    }

    fn flush_pending(&mut self) -> Result<()> {
        let mut first_err = None;
        let handles = std::mem::take(&mut self.pending);
        for handle in handles {
            match handle.wait() {
                Ok(frame) => {
                    if first_err.is_none() {
                        first_err = self.emit(&frame).err();
                    }
                    self.cache.put(frame.frame);
                    self.cache.put(frame.output);
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

    fn emit(&mut self, frame: &DecodedFrame) -> Result<()> {
        if let Some((expected, actual)) = frame.checksums {
            if expected != actual {
                return Err(SluiceError::ChecksumMismatch { expected, actual });
            }
        }
        self.next.write(&frame.output)
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
        if !self.carry.is_empty() {
            return Err(SluiceError::Truncated("zstd stream ended mid-frame"));
        }
        tracing::debug!("zstd decompress stage closed");
        self.next.close()
    }
}

fn decode_frame(mut frame: Vec<u8>, mut output: Vec<u8>, info: FrameInfo) -> Result<DecodedFrame> {
    let map = |err: std::io::Error| SluiceError::Decompression(err.to_string());

    // The library offers no typed report of which check failed, so strip the
    // stored checksum, clear its descriptor flag in this private copy, and
    // compare the hash ourselves after decompressing.
    let stored = if info.has_checksum {
        let split = frame.len() - CONTENT_CHECKSUM_SIZE;
        let tail = &frame[split..];
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        frame.truncate(split);
        frame[DESCRIPTOR_OFFSET] &= !DESCRIPTOR_CHECKSUM_FLAG;
        Some(stored)
    } else {
        None
    };

    match info.content_size {
        Some(size) => {
            output.reserve(size as usize);
            let mut decompressor = zstd::bulk::Decompressor::new().map_err(map)?;
            decompressor
                .decompress_to_buffer(&frame, &mut output)
                .map_err(map)?;
            if output.len() as u64 != size {
                return Err(SluiceError::SizeMismatch {
                    what: "zstd frame content size",
                    expected: size,
                    actual: output.len() as u64,
                });
            }
        }
        None => {
            output = zstd::stream::decode_all(&frame[..]).map_err(map)?;
            if output.len() as u64 > MAX_FRAME_CONTENT_SIZE {
                return Err(SluiceError::InvalidSize {
                    field: "zstd frame content",
                    value: output.len() as u64,
                    limit: MAX_FRAME_CONTENT_SIZE,
                });
            }
        }
    }

    let checksums = stored.map(|stored| (stored, xxh64(&output, 0) as u32));
    Ok(DecodedFrame {
        frame,
        output,
        checksums,
    })
}
