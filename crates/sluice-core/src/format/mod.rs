pub mod lz4f;
pub mod qpress;
pub mod xbcrypt;
pub mod zstdf;
