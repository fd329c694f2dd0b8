use crate::error::SluiceError;
use crate::types::Result;

/// Magic bytes at the start of a qpress archive.
pub const ARCHIVE_MAGIC: [u8; 8] = *b"qpress10";
/// Magic bytes preceding every block record.
pub const BLOCK_MAGIC: [u8; 8] = *b"NEWBNEWB";
/// Magic bytes preceding the archive trailer.
pub const TRAILER_MAGIC: [u8; 8] = *b"ENDSENDS";

/// Fixed size of the archive header in bytes.
pub const ARCHIVE_HEADER_SIZE: usize = 16;
/// Fixed size of the file header in bytes (`'F'` marker + name length).
pub const FILE_HEADER_SIZE: usize = 5;
/// Fixed size of each block header in bytes (magic + offset + checksum).
pub const BLOCK_HEADER_SIZE: usize = 20;
/// Fixed size of the block size header in bytes (stored + original length).
pub const BLOCK_SIZE_HEADER_SIZE: usize = 8;
/// Fixed size of the archive trailer in bytes (magic + recovery bytes).
pub const TRAILER_SIZE: usize = 16;

/// Upper bound accepted for a declared chunk size.
pub const MAX_CHUNK_SIZE: u64 = 1 << 30;
/// Upper bound accepted for an embedded file name length.
pub const MAX_NAME_LEN: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub chunk_size: u64,
}

impl ArchiveHeader {
    pub fn new(chunk_size: u64) -> Self {
        Self { chunk_size }
    }

    pub fn to_bytes(&self) -> [u8; ARCHIVE_HEADER_SIZE] {
        let mut bytes = [0u8; ARCHIVE_HEADER_SIZE];
        bytes[..8].copy_from_slice(&ARCHIVE_MAGIC);
        bytes[8..].copy_from_slice(&self.chunk_size.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; ARCHIVE_HEADER_SIZE]) -> Result<Self> {
        if bytes[..8] != ARCHIVE_MAGIC {
            return Err(SluiceError::InvalidFormat("invalid qpress archive magic"));
        }
        let chunk_size = u64::from_le_bytes([
            bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15],
        ]);
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(SluiceError::InvalidSize {
                field: "qpress chunk size",
                value: chunk_size,
                limit: MAX_CHUNK_SIZE,
            });
        }
        Ok(Self { chunk_size })
    }
}

/// The `'F'` record introducing the single file of an archive.
///
/// `name_len` excludes the NUL terminator that follows the name bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub name_len: u32,
}

impl FileHeader {
    pub fn new(name_len: u32) -> Self {
        Self { name_len }
    }

    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        bytes[0] = b'F';
        bytes[1..].copy_from_slice(&self.name_len.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; FILE_HEADER_SIZE]) -> Result<Self> {
        if bytes[0] != b'F' {
            return Err(SluiceError::InvalidFormat("invalid qpress file marker"));
        }
        let name_len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(SluiceError::InvalidSize {
                field: "qpress file name length",
                value: u64::from(name_len),
                limit: u64::from(MAX_NAME_LEN),
            });
        }
        Ok(Self { name_len })
    }
}

/// Per-block header: magic, running uncompressed offset, Adler-32 of the
/// stored payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub offset: u64,
    pub checksum: u32,
}

impl BlockHeader {
    pub fn new(offset: u64, checksum: u32) -> Self {
        Self { offset, checksum }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[..8].copy_from_slice(&BLOCK_MAGIC);
        bytes[8..16].copy_from_slice(&self.offset.to_le_bytes());
        bytes[16..].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; BLOCK_HEADER_SIZE]) -> Result<Self> {
        if bytes[..8] != BLOCK_MAGIC {
            return Err(SluiceError::InvalidFormat("invalid qpress block magic"));
        }
        Ok(Self {
            offset: u64::from_le_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
            checksum: u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        })
    }
}

/// Stored and original lengths of one block payload.
///
/// `stored_len == original_len` marks a block stored raw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeHeader {
    pub stored_len: u32,
    pub original_len: u32,
}

impl BlockSizeHeader {
    pub fn new(stored_len: u32, original_len: u32) -> Self {
        Self {
            stored_len,
            original_len,
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_SIZE_HEADER_SIZE];
        bytes[..4].copy_from_slice(&self.stored_len.to_le_bytes());
        bytes[4..].copy_from_slice(&self.original_len.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; BLOCK_SIZE_HEADER_SIZE]) -> Self {
        Self {
            stored_len: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            original_len: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    fn validate(&self, chunk_size: u64) -> Result<()> {
        if self.original_len == 0 || u64::from(self.original_len) > chunk_size {
            return Err(SluiceError::InvalidSize {
                field: "qpress block original length",
                value: u64::from(self.original_len),
                limit: chunk_size,
            });
        }
        if self.stored_len == 0 || self.stored_len > self.original_len {
            return Err(SluiceError::InvalidSize {
                field: "qpress block stored length",
                value: u64::from(self.stored_len),
                limit: u64::from(self.original_len),
            });
        }
        Ok(())
    }
}

/// The `"ENDSENDS"` trailer closing an archive.
///
/// The recovery-bytes field is always written as zero and ignored when read,
/// matching the wire format of existing archives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trailer;

impl Trailer {
    pub fn to_bytes(&self) -> [u8; TRAILER_SIZE] {
        let mut bytes = [0u8; TRAILER_SIZE];
        bytes[..8].copy_from_slice(&TRAILER_MAGIC);
        bytes
    }
}

/// One fully parsed block record, payload included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QpressBlock {
    pub offset: u64,
    pub checksum: u32,
    pub stored_len: u32,
    pub original_len: u32,
    pub data: Vec<u8>,
}

/// Outcome of one [`QpressParser::advance`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum QpressStatus {
    /// The input ran out mid-record; feed more bytes and call again.
    NeedMore,
    /// An archive header was parsed.
    ArchiveStart { chunk_size: u64 },
    /// A file header and its name were consumed.
    FileStart,
    /// A complete block record was parsed.
    Block(QpressBlock),
    /// The archive trailer was consumed.
    FileEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    ArchiveHeader,
    FileHeader,
    FileName { remaining: u32 },
    BlockOrTrailer,
    BlockHeader,
    BlockSizeHeader,
    BlockData { stored_len: u32 },
    Trailer,
}

/// Resumable parser for the qpress container.
///
/// Each state declares exactly how many bytes it needs; when the input runs
/// out first, the bytes consumed so far stay in an owned partial-record
/// buffer and the next `advance` call continues where this one stopped. Any
/// split point in the stream is legal, including mid-magic.
#[derive(Debug)]
pub struct QpressParser {
    state: ParseState,
    partial: Vec<u8>,
    chunk_size: Option<u64>,
    block: BlockHeader,
    sizes: BlockSizeHeader,
    files_done: u64,
}

impl QpressParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::ArchiveHeader,
            partial: Vec::new(),
            chunk_size: None,
            block: BlockHeader::new(0, 0),
            sizes: BlockSizeHeader::new(0, 0),
            files_done: 0,
        }
    }

    /// Chunk size declared by the first archive header, once seen.
    pub fn chunk_size(&self) -> Option<u64> {
        self.chunk_size
    }

    /// Number of archives fully consumed through their trailer.
    pub fn files_done(&self) -> u64 {
        self.files_done
    }

    /// True once the stream sits at an archive boundary with nothing
    /// buffered, i.e. `close` is legal.
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::ArchiveHeader && self.partial.is_empty() && self.files_done > 0
    }

    /// Hands a spent block buffer back for reuse by the next block.
    pub fn recycle(&mut self, mut buf: Vec<u8>) {
        if self.partial.is_empty() && self.partial.capacity() < buf.capacity() {
            buf.clear();
            self.partial = buf;
        }
    }

    /// Consumes bytes from the front of `input`, advancing `input` past
    /// them, until one record completes or the input runs out.
    pub fn advance(&mut self, input: &mut &[u8]) -> Result<QpressStatus> {
        loop {
            match self.state {
                ParseState::ArchiveHeader => {
                    if !self.fill(input, ARCHIVE_HEADER_SIZE) {
                        return Ok(QpressStatus::NeedMore);
                    }
                    let mut bytes = [0u8; ARCHIVE_HEADER_SIZE];
                    bytes.copy_from_slice(&self.partial);
                    self.partial.clear();
                    let header = ArchiveHeader::from_bytes(bytes)?;
                    if let Some(first) = self.chunk_size {
                        if first != header.chunk_size {
                            return Err(SluiceError::SizeMismatch {
                                what: "qpress chunk size",
                                expected: first,
                                actual: header.chunk_size,
                            });
                        }
                    }
                    self.chunk_size = Some(header.chunk_size);
                    self.state = ParseState::FileHeader;
                    return Ok(QpressStatus::ArchiveStart {
                        chunk_size: header.chunk_size,
                    });
                }
                ParseState::FileHeader => {
                    if !self.fill(input, FILE_HEADER_SIZE) {
                        return Ok(QpressStatus::NeedMore);
                    }
                    let mut bytes = [0u8; FILE_HEADER_SIZE];
                    bytes.copy_from_slice(&self.partial);
                    self.partial.clear();
                    let header = FileHeader::from_bytes(bytes)?;
                    // Name bytes plus the NUL terminator.
                    self.state = ParseState::FileName {
                        remaining: header.name_len + 1,
                    };
                }
                ParseState::FileName { remaining } => {
                    // Skipped, not buffered; only the count persists.
                    let take = (remaining as usize).min(input.len());
                    if take == 0 {
                        return Ok(QpressStatus::NeedMore);
                    }
                    let consumed = &input[..take];
                    *input = &input[take..];
                    let left = remaining - take as u32;
                    if left > 0 {
                        self.state = ParseState::FileName { remaining: left };
                        return Ok(QpressStatus::NeedMore);
                    }
                    if consumed[take - 1] != 0 {
                        return Err(SluiceError::InvalidFormat(
                            "qpress file name missing terminator",
                        ));
                    }
                    self.state = ParseState::BlockOrTrailer;
                    return Ok(QpressStatus::FileStart);
                }
                ParseState::BlockOrTrailer => {
                    if !self.fill(input, BLOCK_MAGIC.len()) {
                        return Ok(QpressStatus::NeedMore);
                    }
                    let magic = &self.partial[..];
                    if magic == BLOCK_MAGIC {
                        self.partial.clear();
                        self.state = ParseState::BlockHeader;
                    } else if magic == TRAILER_MAGIC {
                        self.partial.clear();
                        self.state = ParseState::Trailer;
                    } else {
                        return Err(SluiceError::InvalidFormat("invalid qpress block magic"));
                    }
                }
                ParseState::BlockHeader => {
                    if !self.fill(input, BLOCK_HEADER_SIZE - BLOCK_MAGIC.len()) {
                        return Ok(QpressStatus::NeedMore);
                    }
                    self.block = BlockHeader::new(
                        u64::from_le_bytes([
                            self.partial[0],
                            self.partial[1],
                            self.partial[2],
                            self.partial[3],
                            self.partial[4],
                            self.partial[5],
                            self.partial[6],
                            self.partial[7],
                        ]),
                        u32::from_le_bytes([
                            self.partial[8],
                            self.partial[9],
                            self.partial[10],
                            self.partial[11],
                        ]),
                    );
                    self.partial.clear();
                    self.state = ParseState::BlockSizeHeader;
                }
                ParseState::BlockSizeHeader => {
                    if !self.fill(input, BLOCK_SIZE_HEADER_SIZE) {
                        return Ok(QpressStatus::NeedMore);
                    }
                    let mut bytes = [0u8; BLOCK_SIZE_HEADER_SIZE];
                    bytes.copy_from_slice(&self.partial);
                    self.partial.clear();
                    let sizes = BlockSizeHeader::from_bytes(bytes);
                    let chunk_size = self
                        .chunk_size
                        .ok_or(SluiceError::InvalidFormat("qpress block before header"))?;
                    sizes.validate(chunk_size)?;
                    self.sizes = sizes;
                    self.state = ParseState::BlockData {
                        stored_len: sizes.stored_len,
                    };
                }
                ParseState::BlockData { stored_len } => {
                    if !self.fill(input, stored_len as usize) {
                        return Ok(QpressStatus::NeedMore);
                    }
                    let data = std::mem::take(&mut self.partial);
                    self.state = ParseState::BlockOrTrailer;
                    return Ok(QpressStatus::Block(QpressBlock {
                        offset: self.block.offset,
                        checksum: self.block.checksum,
                        stored_len: self.sizes.stored_len,
                        original_len: self.sizes.original_len,
                        data,
                    }));
                }
                ParseState::Trailer => {
                    // Recovery-bytes field; the value is ignored.
                    if !self.fill(input, TRAILER_SIZE - TRAILER_MAGIC.len()) {
                        return Ok(QpressStatus::NeedMore);
                    }
                    self.partial.clear();
                    self.files_done += 1;
                    self.state = ParseState::ArchiveHeader;
                    return Ok(QpressStatus::FileEnd);
                }
            }
        }
    }

    fn fill(&mut self, input: &mut &[u8], need: usize) -> bool {
        debug_assert!(self.partial.len() <= need);
        let take = (need - self.partial.len()).min(input.len());
        self.partial.extend_from_slice(&input[..take]);
        *input = &input[take..];
        self.partial.len() == need
    }
}

impl Default for QpressParser {
    fn default() -> Self {
        Self::new()
    }
}
