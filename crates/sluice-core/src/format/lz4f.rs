use xxhash_rust::xxh32::xxh32;

use crate::error::SluiceError;
use crate::io::ByteCursor;
use crate::types::Result;

/// LZ4 frame magic number.
pub const FRAME_MAGIC: u32 = 0x184D_2204;
/// Size of a frame header carrying a content size.
pub const FRAME_HEADER_SIZE: usize = 15;
/// Size of the end mark plus content checksum.
pub const END_MARK_SIZE: usize = 8;
/// High bit of a block length marking a block stored uncompressed.
pub const UNCOMPRESSED_FLAG: u32 = 0x8000_0000;

const FLG_VERSION: u8 = 0x40;
const FLG_BLOCK_INDEPENDENCE: u8 = 0x20;
const FLG_BLOCK_CHECKSUM: u8 = 0x10;
const FLG_CONTENT_SIZE: u8 = 0x08;
const FLG_CONTENT_CHECKSUM: u8 = 0x04;
const FLG_RESERVED: u8 = 0x02;

/// Block maximum size classes, encoded in the BD byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BlockMaxSize {
    Size64Kb = 4,
    Size256Kb = 5,
    Size1Mb = 6,
    #[default]
    Size4Mb = 7,
}

impl BlockMaxSize {
    /// Smallest class that fits blocks of `chunk_size` bytes.
    pub fn for_chunk_size(chunk_size: usize) -> Self {
        if chunk_size <= 64 * 1024 {
            Self::Size64Kb
        } else if chunk_size <= 256 * 1024 {
            Self::Size256Kb
        } else if chunk_size <= 1024 * 1024 {
            Self::Size1Mb
        } else {
            Self::Size4Mb
        }
    }

    pub fn size_bytes(self) -> usize {
        match self {
            Self::Size64Kb => 64 * 1024,
            Self::Size256Kb => 256 * 1024,
            Self::Size1Mb => 1024 * 1024,
            Self::Size4Mb => 4 * 1024 * 1024,
        }
    }

    fn from_bd(bd: u8) -> Result<Self> {
        if bd & 0x8F != 0 {
            return Err(SluiceError::InvalidFormat("reserved lz4 BD bits set"));
        }
        match (bd >> 4) & 0x07 {
            4 => Ok(Self::Size64Kb),
            5 => Ok(Self::Size256Kb),
            6 => Ok(Self::Size1Mb),
            7 => Ok(Self::Size4Mb),
            _ => Err(SluiceError::InvalidFormat("invalid lz4 block size class")),
        }
    }

    fn to_bd(self) -> u8 {
        (self as u8) << 4
    }
}

/// Parsed LZ4 frame descriptor.
///
/// The encoder always emits independent blocks with a content size and a
/// content checksum and no per-block checksums; the parser accepts any
/// conformant combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub block_independence: bool,
    pub block_checksum: bool,
    pub content_size: Option<u64>,
    pub content_checksum: bool,
    pub block_max_size: BlockMaxSize,
}

impl FrameHeader {
    /// Header for one self-contained frame of `content_size` bytes.
    pub fn for_content(content_size: u64, block_max_size: BlockMaxSize) -> Self {
        Self {
            block_independence: true,
            block_checksum: false,
            content_size: Some(content_size),
            content_checksum: true,
            block_max_size,
        }
    }

    fn flg_byte(&self) -> u8 {
        let mut flg = FLG_VERSION;
        if self.block_independence {
            flg |= FLG_BLOCK_INDEPENDENCE;
        }
        if self.block_checksum {
            flg |= FLG_BLOCK_CHECKSUM;
        }
        if self.content_size.is_some() {
            flg |= FLG_CONTENT_SIZE;
        }
        if self.content_checksum {
            flg |= FLG_CONTENT_CHECKSUM;
        }
        flg
    }

    /// Serializes the header, magic and header-checksum byte included.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE);
        bytes.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
        bytes.push(self.flg_byte());
        bytes.push(self.block_max_size.to_bd());
        if let Some(size) = self.content_size {
            bytes.extend_from_slice(&size.to_le_bytes());
        }
        // Header checksum covers FLG through the optional content size.
        bytes.push((xxh32(&bytes[4..], 0) >> 8) as u8);
        bytes
    }

    /// Attempts to parse one frame header off the cursor.
    ///
    /// Returns `Ok(None)` when the cursor holds too few bytes; the caller is
    /// expected to restore its saved position and retry with more input.
    pub fn parse(cursor: &mut ByteCursor) -> Result<Option<Self>> {
        let Some(magic) = cursor.read_u32_le() else {
            return Ok(None);
        };
        if magic != FRAME_MAGIC {
            return Err(SluiceError::InvalidFormat("invalid lz4 frame magic"));
        }
        let Some(flg) = cursor.read_u8() else {
            return Ok(None);
        };
        if flg & 0xC0 != FLG_VERSION {
            return Err(SluiceError::InvalidFormat("unsupported lz4 frame version"));
        }
        if flg & FLG_RESERVED != 0 {
            return Err(SluiceError::InvalidFormat("reserved lz4 FLG bits set"));
        }
        if flg & 0x01 != 0 {
            return Err(SluiceError::InvalidFormat(
                "lz4 dictionary frames not supported",
            ));
        }
        let Some(bd) = cursor.read_u8() else {
            return Ok(None);
        };
        let block_max_size = BlockMaxSize::from_bd(bd)?;

        let content_size = if flg & FLG_CONTENT_SIZE != 0 {
            match cursor.read_u64_le() {
                Some(size) => Some(size),
                None => return Ok(None),
            }
        } else {
            None
        };
        let Some(stored_hc) = cursor.read_u8() else {
            return Ok(None);
        };

        let header = Self {
            block_independence: flg & FLG_BLOCK_INDEPENDENCE != 0,
            block_checksum: flg & FLG_BLOCK_CHECKSUM != 0,
            content_size,
            content_checksum: flg & FLG_CONTENT_CHECKSUM != 0,
            block_max_size,
        };

        let mut described = [0u8; 10];
        described[0] = flg;
        described[1] = bd;
        let len = match content_size {
            Some(size) => {
                described[2..].copy_from_slice(&size.to_le_bytes());
                10
            }
            None => 2,
        };
        let actual_hc = (xxh32(&described[..len], 0) >> 8) as u8;
        if actual_hc != stored_hc {
            return Err(SluiceError::ChecksumMismatch {
                expected: u32::from(stored_hc),
                actual: u32::from(actual_hc),
            });
        }
        Ok(Some(header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_parse_round_trip() {
        let header = FrameHeader::for_content(11, BlockMaxSize::Size64Kb);
        let bytes = header.encode();
        assert_eq!(bytes.len(), FRAME_HEADER_SIZE);
        assert_eq!(bytes[4], 0x6C);
        assert_eq!(bytes[5], 0x40);

        let mut cursor = ByteCursor::new();
        cursor.push(&bytes);
        let parsed = FrameHeader::parse(&mut cursor).expect("valid header");
        assert_eq!(parsed, Some(header));
        assert!(cursor.is_empty());
    }

    #[test]
    fn short_input_is_incomplete_not_an_error() {
        let bytes = FrameHeader::for_content(64, BlockMaxSize::Size4Mb).encode();
        for len in 0..bytes.len() {
            let mut cursor = ByteCursor::new();
            cursor.push(&bytes[..len]);
            let save = cursor.save();
            assert_eq!(FrameHeader::parse(&mut cursor).expect("no error"), None);
            cursor.restore(save);
            assert_eq!(cursor.remaining(), len);
        }
    }

    #[test]
    fn corrupt_header_checksum_is_rejected() {
        let mut bytes = FrameHeader::for_content(64, BlockMaxSize::Size64Kb).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut cursor = ByteCursor::new();
        cursor.push(&bytes);
        let err = FrameHeader::parse(&mut cursor).unwrap_err();
        assert!(matches!(err, SluiceError::ChecksumMismatch { .. }));
    }

    #[test]
    fn block_size_class_fits_chunk() {
        assert_eq!(BlockMaxSize::for_chunk_size(1024), BlockMaxSize::Size64Kb);
        assert_eq!(
            BlockMaxSize::for_chunk_size(100 * 1024),
            BlockMaxSize::Size256Kb
        );
        assert_eq!(
            BlockMaxSize::for_chunk_size(16 * 1024 * 1024),
            BlockMaxSize::Size4Mb
        );
    }
}
