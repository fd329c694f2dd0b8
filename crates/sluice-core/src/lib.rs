pub mod error;
pub mod format;
pub mod io;
pub mod pipeline;
pub mod pool;
pub mod types;

pub use error::SluiceError;
pub use io::{ByteCursor, CursorPos};
pub use pipeline::{
    BufferCache, DecryptSink, EncryptSink, Lz4CompressSink, Lz4DecompressSink, QpressCompressSink,
    QpressDecompressSink, Sink, SinkFile, StageOptions, ZstdCompressSink, ZstdDecompressSink,
    KEY_SIZE,
};
pub use pool::{TaskHandle, WorkerPool};
pub use types::{FileMeta, Result};
