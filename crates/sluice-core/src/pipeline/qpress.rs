use std::path::Path;

use adler32::RollingAdler32;

use crate::error::SluiceError;
use crate::format::qpress::{
    ArchiveHeader, BlockHeader, BlockSizeHeader, FileHeader, QpressParser, QpressStatus, Trailer,
};
use crate::pool::{TaskHandle, WorkerPool};
use crate::types::{FileMeta, Result};

use super::{strip_suffix, with_suffix, BufferCache, Sink, SinkFile, StageOptions};

/// Format suffix appended by the compressor and stripped by the decompressor.
pub const SUFFIX: &str = "qp";

/// Chunked parallel compressor producing qpress archives.
pub struct QpressCompressSink<S> {
    next: S,
    pool: WorkerPool,
    chunk_size: usize,
}

impl<S: Sink> QpressCompressSink<S> {
    pub fn new(next: S, options: &StageOptions) -> Self {
        Self {
            next,
            pool: WorkerPool::new(options.worker_threads),
            chunk_size: options.chunk_size.max(1),
        }
    }
}

impl<S: Sink> Sink for QpressCompressSink<S> {
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or(SluiceError::InvalidFormat("missing file name"))?
            .as_bytes()
            .to_vec();
        let next = self.next.open(&with_suffix(path, SUFFIX), meta)?;

        let mut file = CompressFile {
            next,
            pool: &self.pool,
            chunk_size: self.chunk_size,
            offset: 0,
            pending: Vec::new(),
            cache: BufferCache::default(),
            record: Vec::new(),
        };
        file.write_headers(&name)?;
        tracing::debug!(
            path = %path.display(),
            chunk_size = self.chunk_size,
            "qpress compress stage opened"
        );
        Ok(Box::new(file))
    }
}

struct CompressedChunk {
    input: Vec<u8>,
    scratch: Vec<u8>,
    /// Set when compression did not shrink the chunk and it is stored raw.
    stored_raw: bool,
    checksum: u32,
}

impl CompressedChunk {
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
    chunk_size: usize,
    /// Running uncompressed stream offset, recorded in each block header.
    offset: u64,
    pending: Vec<TaskHandle<CompressedChunk>>,
    cache: BufferCache,
    record: Vec<u8>,
}

impl CompressFile<'_> {
    fn write_headers(&mut self, name: &[u8]) -> Result<()> {
        self.record.clear();
        self.record
            .extend_from_slice(&ArchiveHeader::new(self.chunk_size as u64).to_bytes());
        self.record
            .extend_from_slice(&FileHeader::new(name.len() as u32).to_bytes());
        self.record.extend_from_slice(name);
        self.record.push(0);
        self.next.write(&self.record)
    }

    fn flush_pending(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.pending.drain(..) {
            let chunk = handle.wait();
            if first_err.is_some() {
                self.cache.put(chunk.input);
                self.cache.put(chunk.scratch);
                continue;
            }

            self.record.clear();
            let stored = chunk.stored();
            self.record
                .extend_from_slice(&BlockHeader::new(self.offset, chunk.checksum).to_bytes());
            self.record.extend_from_slice(
                &BlockSizeHeader::new(stored.len() as u32, chunk.input.len() as u32).to_bytes(),
            );
            self.record.extend_from_slice(stored);
            self.offset += chunk.input.len() as u64;

            if let Err(err) = self.next.write(&self.record) {
                first_err = Some(err);
            }
            self.cache.put(chunk.input);
            self.cache.put(chunk.scratch);
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl SinkFile for CompressFile<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(self.chunk_size) {
            let mut input = self.cache.get();
            input.extend_from_slice(chunk);
            let scratch = self.cache.get();
            self.pending
                .push(self.pool.submit(move |_worker| compress_chunk(input, scratch)));

            if self.pending.len() >= self.pool.num_workers() {
                self.flush_pending()?;
            }
        }
        self.flush_pending()
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush_pending()?;
        self.next.write(&Trailer.to_bytes())?;
        tracing::debug!(bytes = self.offset, "qpress compress stage closed");
        self.next.close()
    }
}

fn compress_chunk(input: Vec<u8>, mut scratch: Vec<u8>) -> CompressedChunk {
    scratch.resize(lz4_flex::block::get_maximum_output_size(input.len()), 0);
    // compress_into cannot fail with a maximum-size output buffer; treat a
    // failure like an incompressible chunk and store it raw.
    let written = lz4_flex::block::compress_into(&input, &mut scratch).unwrap_or(usize::MAX);
    let stored_raw = written >= input.len();
    scratch.truncate(if stored_raw { 0 } else { written });

    let mut chunk = CompressedChunk {
        input,
        scratch,
        stored_raw,
        checksum: 0,
    };
    let mut adler = RollingAdler32::new();
    adler.update_buffer(chunk.stored());
    chunk.checksum = adler.hash();
    chunk
}

/// Incremental qpress decompressor driving parallel block verification.
pub struct QpressDecompressSink<S> {
    next: S,
    pool: WorkerPool,
}

impl<S: Sink> QpressDecompressSink<S> {
    pub fn new(next: S, options: &StageOptions) -> Self {
        Self {
            next,
            pool: WorkerPool::new(options.worker_threads),
        }
    }
}

impl<S: Sink> Sink for QpressDecompressSink<S> {
    fn open<'a>(&'a self, path: &Path, meta: FileMeta) -> Result<Box<dyn SinkFile + 'a>> {
        let inner = strip_suffix(path, SUFFIX)?;
        let next = self.next.open(&inner, meta)?;
        tracing::debug!(path = %path.display(), "qpress decompress stage opened");
        Ok(Box::new(DecompressFile {
            next,
            pool: &self.pool,
            parser: QpressParser::new(),
            offset: 0,
            pending: Vec::new(),
            cache: BufferCache::default(),
        }))
    }
}

struct DecodedBlock {
    data: Vec<u8>,
    output: Vec<u8>,
}

struct DecompressFile<'a> {
    next: Box<dyn SinkFile + 'a>,
    pool: &'a WorkerPool,
    parser: QpressParser,
    /// Running uncompressed count, checked against each block's offset.
    offset: u64,
    pending: Vec<TaskHandle<Result<DecodedBlock>>>,
    cache: BufferCache,
}

impl DecompressFile<'_> {
    fn consume(&mut self, buf: &[u8]) -> Result<()> {
        let mut input = buf;
        loop {
            match self.parser.advance(&mut input)? {
                QpressStatus::NeedMore => return Ok(()),
                QpressStatus::ArchiveStart { chunk_size } => {
                    tracing::debug!(chunk_size, "qpress archive header");
                }
                QpressStatus::FileStart => {}
                QpressStatus::Block(block) => {
                    if block.offset != self.offset {
                        return Err(SluiceError::SizeMismatch {
                            what: "qpress block offset",
                            expected: self.offset,
                            actual: block.offset,
                        });
                    }
                    self.offset += u64::from(block.original_len);

                    let output = self.cache.get();
                    self.pending
                        .push(self.pool.submit(move |_worker| decode_block(block, output)));
                    if self.pending.len() >= self.pool.num_workers() {
                        self.flush_pending()?;
                    }
                }
                QpressStatus::FileEnd => {
                    tracing::debug!(bytes = self.offset, "qpress archive trailer");
                }
            }
        }
    }

    fn flush_pending(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in self.pending.drain(..) {
            match handle.wait() {
                Ok(block) => {
                    if first_err.is_none() {
                        if let Err(err) = self.next.write(&block.output) {
                            first_err = Some(err);
                        }
                    }
                    self.parser.recycle(block.data);
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

    /// Waits out every in-flight task, discarding results.
    fn drain_discard(&mut self) {
        for handle in self.pending.drain(..) {
            let _ = handle.wait();
        }
    }
}

impl SinkFile for DecompressFile<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        match self.consume(buf) {
            Ok(()) => self.flush_pending(),
            Err(err) => {
                self.drain_discard();
                Err(err)
            }
        }
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush_pending()?;
        if !self.parser.is_finished() {
            return Err(SluiceError::Truncated(
                "qpress stream ended before its trailer",
            ));
        }
        tracing::debug!(bytes = self.offset, "qpress decompress stage closed");
        self.next.close()
    }
}

fn decode_block(
    block: crate::format::qpress::QpressBlock,
    mut output: Vec<u8>,
) -> Result<DecodedBlock> {
    let mut adler = RollingAdler32::new();
    adler.update_buffer(&block.data);
    let actual = adler.hash();
    if actual != block.checksum {
        return Err(SluiceError::ChecksumMismatch {
            expected: block.checksum,
            actual,
        });
    }

    if block.stored_len == block.original_len {
        output.extend_from_slice(&block.data);
    } else {
        output.resize(block.original_len as usize, 0);
        let written = lz4_flex::block::decompress_into(&block.data, &mut output)
            .map_err(|err| SluiceError::Decompression(err.to_string()))?;
        if written != block.original_len as usize {
            return Err(SluiceError::SizeMismatch {
                what: "qpress block decompressed length",
                expected: u64::from(block.original_len),
                actual: written as u64,
            });
        }
    }
    Ok(DecodedBlock {
        data: block.data,
        output,
    })
}
