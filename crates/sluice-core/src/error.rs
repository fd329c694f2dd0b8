use thiserror::Error;

#[derive(Debug, Error)]
pub enum SluiceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),
    #[error("checksum mismatch (expected {expected:#010x}, actual {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("{field} out of range (value {value}, limit {limit})")]
    InvalidSize {
        field: &'static str,
        value: u64,
        limit: u64,
    },
    #[error("{what} mismatch (expected {expected}, actual {actual})")]
    SizeMismatch {
        what: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("truncated stream: {0}")]
    Truncated(&'static str),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SluiceError>,
    },
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SluiceError {
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}
