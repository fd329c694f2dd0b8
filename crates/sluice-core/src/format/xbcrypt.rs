use crate::error::SluiceError;
use crate::io::ByteCursor;
use crate::types::Result;

/// Chunk magic of the original format version.
pub const CHUNK_MAGIC_V1: [u8; 8] = *b"XBCRYP01";
/// Chunk magic of version 2, which added the stored IV.
pub const CHUNK_MAGIC_V2: [u8; 8] = *b"XBCRYP02";
/// Chunk magic of version 3, the first to apply the stored IV.
pub const CHUNK_MAGIC_V3: [u8; 8] = *b"XBCRYP03";

/// Size of the fixed chunk header fields (magic, reserved, sizes, checksum).
pub const CHUNK_FIXED_SIZE: usize = 36;
/// Length of the content hash appended to the plaintext before encryption.
pub const CONTENT_HASH_SIZE: u64 = 32;

/// Hard cap on a chunk's declared original size.
pub const MAX_ORIGINAL_SIZE: u64 = i32::MAX as u64;
/// Hard cap on a stored IV length.
pub const MAX_IV_SIZE: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkVersion {
    V1,
    V2,
    V3,
}

impl ChunkVersion {
    fn from_magic(magic: &[u8]) -> Result<Self> {
        match magic {
            m if m == CHUNK_MAGIC_V1 => Ok(Self::V1),
            m if m == CHUNK_MAGIC_V2 => Ok(Self::V2),
            m if m == CHUNK_MAGIC_V3 => Ok(Self::V3),
            _ => Err(SluiceError::InvalidFormat("invalid xbcrypt chunk magic")),
        }
    }

    fn magic(self) -> [u8; 8] {
        match self {
            Self::V1 => CHUNK_MAGIC_V1,
            Self::V2 => CHUNK_MAGIC_V2,
            Self::V3 => CHUNK_MAGIC_V3,
        }
    }

    /// Versions 2 and 3 store an IV; only version 3 applies it.
    pub fn stores_iv(self) -> bool {
        !matches!(self, Self::V1)
    }
}

/// Header of one encrypted chunk record.
///
/// `checksum` is the CRC32 of the raw encrypted payload bytes that follow
/// the header; it authenticates the chunk before any decryption work is
/// queued. The encrypted payload runs `encrypted_size` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: ChunkVersion,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub checksum: u32,
    pub iv: Vec<u8>,
}

impl ChunkHeader {
    /// Attempts to parse one chunk header off the cursor.
    ///
    /// Returns `Ok(None)` when the cursor holds too few bytes; the caller is
    /// expected to restore its saved position and retry with more input.
    pub fn parse(cursor: &mut ByteCursor) -> Result<Option<Self>> {
        let Some(magic) = cursor.read_bytes(8) else {
            return Ok(None);
        };
        let version = ChunkVersion::from_magic(magic)?;

        // Reserved field, unused by every known writer.
        if cursor.read_u64_le().is_none() {
            return Ok(None);
        }
        let Some(original_size) = cursor.read_u64_le() else {
            return Ok(None);
        };
        if original_size > MAX_ORIGINAL_SIZE {
            return Err(SluiceError::InvalidSize {
                field: "xbcrypt original size",
                value: original_size,
                limit: MAX_ORIGINAL_SIZE,
            });
        }
        let Some(encrypted_size) = cursor.read_u64_le() else {
            return Ok(None);
        };
        if encrypted_size < original_size || encrypted_size > original_size + CONTENT_HASH_SIZE {
            return Err(SluiceError::InvalidSize {
                field: "xbcrypt encrypted size",
                value: encrypted_size,
                limit: original_size + CONTENT_HASH_SIZE,
            });
        }
        let Some(checksum) = cursor.read_u32_le() else {
            return Ok(None);
        };

        let iv = if version.stores_iv() {
            let Some(iv_len) = cursor.read_u64_le() else {
                return Ok(None);
            };
            if iv_len > MAX_IV_SIZE {
                return Err(SluiceError::InvalidSize {
                    field: "xbcrypt iv length",
                    value: iv_len,
                    limit: MAX_IV_SIZE,
                });
            }
            let Some(iv) = cursor.read_bytes(iv_len as usize) else {
                return Ok(None);
            };
            iv.to_vec()
        } else {
            Vec::new()
        };

        Ok(Some(Self {
            version,
            original_size,
            encrypted_size,
            checksum,
            iv,
        }))
    }

    /// Appends the serialized header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.magic());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&self.original_size.to_le_bytes());
        out.extend_from_slice(&self.encrypted_size.to_le_bytes());
        out.extend_from_slice(&self.checksum.to_le_bytes());
        if self.version.stores_iv() {
            out.extend_from_slice(&(self.iv.len() as u64).to_le_bytes());
            out.extend_from_slice(&self.iv);
        }
    }
}
