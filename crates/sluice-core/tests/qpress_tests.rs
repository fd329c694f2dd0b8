mod support;

use std::path::{Path, PathBuf};

use sluice_core::format::qpress::{
    ARCHIVE_HEADER_SIZE, BLOCK_HEADER_SIZE, BLOCK_MAGIC, BLOCK_SIZE_HEADER_SIZE, FILE_HEADER_SIZE,
    TRAILER_MAGIC, TRAILER_SIZE,
};
use sluice_core::{
    FileMeta, QpressCompressSink, QpressDecompressSink, Sink, SluiceError, StageOptions,
};
use support::{patterned, write_split, MemorySink};

fn compress(data: &[u8], options: &StageOptions) -> Vec<u8> {
    let sink = MemorySink::new();
    let stage = QpressCompressSink::new(sink.clone(), options);
    let mut file = stage
        .open(Path::new("ibdata1"), FileMeta::with_len(data.len() as u64))
        .expect("open compressor");
    file.write(data).expect("write");
    file.close().expect("close");

    let (path, bytes) = sink.single();
    assert_eq!(path, PathBuf::from("ibdata1.qp"));
    bytes
}

fn decompress_split(
    encoded: &[u8],
    piece: usize,
    options: &StageOptions,
) -> sluice_core::Result<Vec<u8>> {
    let sink = MemorySink::new();
    let stage = QpressDecompressSink::new(sink.clone(), options);
    let mut file = stage.open(Path::new("ibdata1.qp"), FileMeta::default())?;
    write_split(&mut file, encoded, piece)?;
    file.close()?;
    Ok(sink.contents("ibdata1").expect("decoded file captured"))
}

/// Walks an encoded archive, returning (block count, payload byte ranges).
fn walk_blocks(encoded: &[u8]) -> (usize, Vec<std::ops::Range<usize>>) {
    let chunk_headers = ARCHIVE_HEADER_SIZE + FILE_HEADER_SIZE;
    assert_eq!(&encoded[..8], b"qpress10");
    let name_len =
        u32::from_le_bytes(encoded[17..21].try_into().expect("name length")) as usize;
    let mut pos = chunk_headers + name_len + 1;

    let mut blocks = 0;
    let mut payloads = Vec::new();
    loop {
        let magic = &encoded[pos..pos + 8];
        if magic == TRAILER_MAGIC {
            assert_eq!(&encoded[pos + 8..pos + TRAILER_SIZE], &[0u8; 8]);
            assert_eq!(pos + TRAILER_SIZE, encoded.len());
            return (blocks, payloads);
        }
        assert_eq!(magic, BLOCK_MAGIC);
        let sizes = &encoded[pos + BLOCK_HEADER_SIZE..pos + BLOCK_HEADER_SIZE + 8];
        let stored_len = u32::from_le_bytes(sizes[..4].try_into().expect("stored len")) as usize;
        let payload = pos + BLOCK_HEADER_SIZE + BLOCK_SIZE_HEADER_SIZE;
        payloads.push(payload..payload + stored_len);
        pos = payload + stored_len;
        blocks += 1;
    }
}

#[test]
fn round_trips_a_patterned_megabyte() -> Result<(), Box<dyn std::error::Error>> {
    let options = StageOptions::new(4, 64 * 1024);
    let data = patterned(1024 * 1024 + 123);
    let encoded = compress(&data, &options);
    assert!(encoded.len() < data.len());

    let decoded = decompress_split(&encoded, encoded.len(), &options)?;
    assert_eq!(decoded, data);
    Ok(())
}

#[test]
fn ten_mib_of_zeros_produces_exactly_160_block_records()
-> Result<(), Box<dyn std::error::Error>> {
    let options = StageOptions::new(4, 64 * 1024);
    let data = vec![0u8; 10 * 1024 * 1024];
    let encoded = compress(&data, &options);

    let (blocks, _) = walk_blocks(&encoded);
    assert_eq!(blocks, 160);

    let decoded = decompress_split(&encoded, encoded.len(), &options)?;
    assert_eq!(decoded, data);
    Ok(())
}

#[test]
fn decoding_is_independent_of_write_chunking() -> Result<(), Box<dyn std::error::Error>> {
    let options = StageOptions::new(2, 8 * 1024);
    let data = patterned(100_000);
    let encoded = compress(&data, &options);

    for piece in [1, 7, 1000, encoded.len()] {
        assert_eq!(decompress_split(&encoded, piece, &options)?, data);
    }
    Ok(())
}

#[test]
fn split_inside_the_block_magic_parses_cleanly() -> Result<(), Box<dyn std::error::Error>> {
    let options = StageOptions::new(2, 4096);
    let data = patterned(20_000);
    let encoded = compress(&data, &options);

    // First block magic starts right after the name records.
    let first_magic = ARCHIVE_HEADER_SIZE + FILE_HEADER_SIZE + "ibdata1".len() + 1;
    assert_eq!(&encoded[first_magic..first_magic + 8], BLOCK_MAGIC);
    let split = first_magic + 4;

    let sink = MemorySink::new();
    let stage = QpressDecompressSink::new(sink.clone(), &options);
    let mut file = stage.open(Path::new("ibdata1.qp"), FileMeta::default())?;
    file.write(&encoded[..split])?;
    file.write(&encoded[split..])?;
    file.close()?;
    assert_eq!(sink.contents("ibdata1").expect("captured"), data);
    Ok(())
}

#[test]
fn compressing_across_multiple_writes_still_round_trips()
-> Result<(), Box<dyn std::error::Error>> {
    let options = StageOptions::new(3, 4096);
    let data = patterned(50_000);

    let sink = MemorySink::new();
    let stage = QpressCompressSink::new(sink.clone(), &options);
    let mut file = stage.open(Path::new("ibdata1"), FileMeta::default())?;
    file.write(&data[..10_000])?;
    file.write(&data[10_000..10_001])?;
    file.write(&data[10_001..])?;
    file.close()?;

    let (_, encoded) = sink.single();
    assert_eq!(decompress_split(&encoded, encoded.len(), &options)?, data);
    Ok(())
}

#[test]
fn flipping_a_payload_byte_is_a_checksum_mismatch() {
    let options = StageOptions::new(2, 4096);
    let data = patterned(20_000);
    let mut encoded = compress(&data, &options);

    let (_, payloads) = walk_blocks(&encoded);
    let target = payloads[1].start + 3;
    encoded[target] ^= 0x01;

    let err = decompress_split(&encoded, encoded.len(), &options).unwrap_err();
    assert!(matches!(err, SluiceError::ChecksumMismatch { .. }));
}

#[test]
fn missing_trailer_fails_close_with_truncation() {
    let options = StageOptions::new(2, 4096);
    let data = patterned(10_000);
    let encoded = compress(&data, &options);

    let truncated = &encoded[..encoded.len() - TRAILER_SIZE];
    let err = decompress_split(truncated, truncated.len(), &options).unwrap_err();
    assert!(matches!(err, SluiceError::Truncated(_)));
}

#[test]
fn decompressor_requires_the_format_suffix() {
    let sink = MemorySink::new();
    let stage = QpressDecompressSink::new(sink, &StageOptions::default());
    let err = stage
        .open(Path::new("ibdata1"), FileMeta::default())
        .err()
        .expect("open must fail");
    assert!(matches!(err, SluiceError::InvalidFormat(_)));
}

#[test]
fn concatenated_archives_decode_back_to_back() -> Result<(), Box<dyn std::error::Error>> {
    let options = StageOptions::new(2, 4096);
    let first = patterned(9_000);
    let second = patterned(5_000);

    let mut encoded = compress(&first, &options);
    encoded.extend_from_slice(&compress(&second, &options));

    let decoded = decompress_split(&encoded, 333, &options)?;
    let mut expected = first;
    expected.extend_from_slice(&second);
    assert_eq!(decoded, expected);
    Ok(())
}

#[test]
fn chunk_size_disagreement_across_archives_is_rejected() {
    let data = patterned(9_000);
    let mut encoded = compress(&data, &StageOptions::new(2, 4096));
    encoded.extend_from_slice(&compress(&data, &StageOptions::new(2, 8192)));

    let err = decompress_split(&encoded, encoded.len(), &StageOptions::new(2, 4096)).unwrap_err();
    assert!(matches!(err, SluiceError::SizeMismatch { .. }));
}
