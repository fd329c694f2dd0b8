use crate::error::SluiceError;
use crate::io::ByteCursor;
use crate::types::Result;

/// ZSTD frame magic number.
pub const FRAME_MAGIC: u32 = 0xFD2F_B528;
/// First of the sixteen skippable-frame magic numbers.
pub const SKIPPABLE_MAGIC_BASE: u32 = 0x184D_2A50;
const SKIPPABLE_MAGIC_MASK: u32 = 0xFFFF_FFF0;

/// Offset of the frame header descriptor byte within a frame.
pub const DESCRIPTOR_OFFSET: usize = 4;
/// Content-checksum bit of the frame header descriptor.
pub const DESCRIPTOR_CHECKSUM_FLAG: u8 = 0x04;

/// Size of the content checksum trailing a checksummed frame.
pub const CONTENT_CHECKSUM_SIZE: usize = 4;

/// Upper bound accepted for a frame's declared or produced content.
pub const MAX_FRAME_CONTENT_SIZE: u64 = 1 << 27;

const MAX_WINDOW_LOG: u8 = 31;

/// Shape of one complete frame found in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Total frame length in bytes, checksum included.
    pub total_len: usize,
    /// Content size declared in the frame header, when present.
    pub content_size: Option<u64>,
    /// Whether a content checksum trails the last block.
    pub has_checksum: bool,
    /// Skippable frames carry metadata and produce no content.
    pub skippable: bool,
}

/// Walks the cursor to delimit one complete frame.
///
/// The cursor is always restored to its entry position: on success the
/// caller re-reads `total_len` bytes to obtain the frame, on `Ok(None)`
/// (not enough bytes buffered yet) it carries the tail over to the next
/// `write` call. Malformed framing is an error.
pub fn next_frame(cursor: &mut ByteCursor) -> Result<Option<FrameInfo>> {
    let start = cursor.save();
    let result = walk_frame(cursor);
    cursor.restore(start);
    result
}

fn walk_frame(cursor: &mut ByteCursor) -> Result<Option<FrameInfo>> {
    let Some(magic) = cursor.read_u32_le() else {
        return Ok(None);
    };

    if magic & SKIPPABLE_MAGIC_MASK == SKIPPABLE_MAGIC_BASE {
        let Some(size) = cursor.read_u32_le() else {
            return Ok(None);
        };
        if !cursor.skip(size as usize) {
            return Ok(None);
        }
        return Ok(Some(FrameInfo {
            total_len: 8 + size as usize,
            content_size: None,
            has_checksum: false,
            skippable: true,
        }));
    }

    if magic != FRAME_MAGIC {
        return Err(SluiceError::InvalidFormat("invalid zstd frame magic"));
    }

    let Some(descriptor) = cursor.read_u8() else {
        return Ok(None);
    };
    if descriptor & 0x08 != 0 {
        return Err(SluiceError::InvalidFormat(
            "reserved zstd frame descriptor bit set",
        ));
    }
    let single_segment = descriptor & 0x20 != 0;
    let has_checksum = descriptor & DESCRIPTOR_CHECKSUM_FLAG != 0;
    let dict_id_flag = descriptor & 0x03;
    let fcs_flag = descriptor >> 6;

    let mut total = 5usize;

    if !single_segment {
        let Some(window) = cursor.read_u8() else {
            return Ok(None);
        };
        let window_log = 10 + (window >> 3);
        if window_log > MAX_WINDOW_LOG {
            return Err(SluiceError::InvalidSize {
                field: "zstd window log",
                value: u64::from(window_log),
                limit: u64::from(MAX_WINDOW_LOG),
            });
        }
        total += 1;
    }

    let dict_id_len = match dict_id_flag {
        0 => 0,
        1 => 1,
        2 => 2,
        _ => 4,
    };
    if dict_id_len > 0 {
        // A nonzero flag means the frame needs a dictionary we do not have.
        return Err(SluiceError::InvalidFormat(
            "zstd dictionary frames not supported",
        ));
    }

    let fcs_len = match fcs_flag {
        0 => usize::from(single_segment),
        1 => 2,
        2 => 4,
        _ => 8,
    };
    let content_size = match fcs_len {
        0 => None,
        1 => match cursor.read_u8() {
            Some(byte) => Some(u64::from(byte)),
            None => return Ok(None),
        },
        2 => {
            let Some(bytes) = cursor.read_bytes(2) else {
                return Ok(None);
            };
            Some(u64::from(u16::from_le_bytes([bytes[0], bytes[1]])) + 256)
        }
        4 => match cursor.read_u32_le() {
            Some(value) => Some(u64::from(value)),
            None => return Ok(None),
        },
        _ => match cursor.read_u64_le() {
            Some(value) => Some(value),
            None => return Ok(None),
        },
    };
    total += fcs_len;

    if let Some(size) = content_size {
        if size > MAX_FRAME_CONTENT_SIZE {
            return Err(SluiceError::InvalidSize {
                field: "zstd frame content size",
                value: size,
                limit: MAX_FRAME_CONTENT_SIZE,
            });
        }
    }

    // Walk block headers to the end of the frame body.
    loop {
        let Some(bytes) = cursor.read_bytes(3) else {
            return Ok(None);
        };
        let header = u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16;
        let last_block = header & 1 != 0;
        let block_type = (header >> 1) & 0x03;
        let block_size = (header >> 3) as usize;

        let payload = match block_type {
            0 | 2 => block_size,
            1 => 1, // RLE blocks store the repeated byte once
            _ => {
                return Err(SluiceError::InvalidFormat("reserved zstd block type"));
            }
        };
        if !cursor.skip(payload) {
            return Ok(None);
        }
        total += 3 + payload;
        if last_block {
            break;
        }
    }

    if has_checksum {
        if !cursor.skip(CONTENT_CHECKSUM_SIZE) {
            return Ok(None);
        }
        total += CONTENT_CHECKSUM_SIZE;
    }

    Ok(Some(FrameInfo {
        total_len: total,
        content_size,
        has_checksum,
        skippable: false,
    }))
}
