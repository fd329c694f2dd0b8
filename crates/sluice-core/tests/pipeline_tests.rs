mod support;

use std::path::{Path, PathBuf};

use proptest::prelude::*;

use sluice_core::{
    DecryptSink, EncryptSink, FileMeta, Lz4CompressSink, Lz4DecompressSink, QpressCompressSink,
    QpressDecompressSink, Sink, SluiceError, StageOptions, ZstdCompressSink, ZstdDecompressSink,
};
use support::{patterned, write_split, FailingSink, MemorySink};

const KEY: [u8; 32] = [42u8; 32];

fn run_stage<S: Sink>(stage: &S, path: &str, data: &[u8], piece: usize) -> sluice_core::Result<()> {
    let mut file = stage.open(Path::new(path), FileMeta::with_len(data.len() as u64))?;
    write_split(&mut file, data, piece)?;
    file.close()
}

#[test]
fn compress_then_encrypt_round_trips_through_decrypt_then_decompress()
-> Result<(), Box<dyn std::error::Error>> {
    let options = StageOptions::new(3, 16 * 1024);
    let data = patterned(150_000);

    let encode_sink = MemorySink::new();
    let encoder = QpressCompressSink::new(
        EncryptSink::new(encode_sink.clone(), KEY, &options),
        &options,
    );
    run_stage(&encoder, "ibdata1", &data, 40_000)?;

    let (path, wire) = encode_sink.single();
    assert_eq!(path, PathBuf::from("ibdata1.qp.xbcrypt"));

    let decode_sink = MemorySink::new();
    let decoder = DecryptSink::new(
        QpressDecompressSink::new(decode_sink.clone(), &options),
        KEY,
        &options,
    );
    run_stage(&decoder, "ibdata1.qp.xbcrypt", &wire, 777)?;

    assert_eq!(decode_sink.contents("ibdata1").expect("captured"), data);
    Ok(())
}

#[test]
fn lz4_and_zstd_chains_round_trip_behind_encryption() -> Result<(), Box<dyn std::error::Error>> {
    let options = StageOptions::new(2, 8 * 1024);
    let data = patterned(60_000);

    let lz4_sink = MemorySink::new();
    let lz4_encoder =
        Lz4CompressSink::new(EncryptSink::new(lz4_sink.clone(), KEY, &options), &options);
    run_stage(&lz4_encoder, "ib_logfile0", &data, 20_000)?;
    let (_, lz4_wire) = lz4_sink.single();

    let lz4_out = MemorySink::new();
    let lz4_decoder = DecryptSink::new(
        Lz4DecompressSink::new(lz4_out.clone(), &options),
        KEY,
        &options,
    );
    run_stage(&lz4_decoder, "ib_logfile0.lz4.xbcrypt", &lz4_wire, 501)?;
    assert_eq!(lz4_out.contents("ib_logfile0").expect("captured"), data);

    let zstd_sink = MemorySink::new();
    let zstd_encoder =
        ZstdCompressSink::new(EncryptSink::new(zstd_sink.clone(), KEY, &options), &options);
    run_stage(&zstd_encoder, "undo_001", &data, 20_000)?;
    let (_, zstd_wire) = zstd_sink.single();

    let zstd_out = MemorySink::new();
    let zstd_decoder = DecryptSink::new(
        ZstdDecompressSink::new(zstd_out.clone(), &options),
        KEY,
        &options,
    );
    run_stage(&zstd_decoder, "undo_001.zst.xbcrypt", &zstd_wire, 501)?;
    assert_eq!(zstd_out.contents("undo_001").expect("captured"), data);
    Ok(())
}

#[test]
fn downstream_write_failure_propagates_and_leaves_no_stuck_tasks() {
    let options = StageOptions::new(4, 4096);
    let stage = QpressCompressSink::new(FailingSink { budget: 64 }, &options);
    let mut file = stage
        .open(Path::new("ibdata1"), FileMeta::default())
        .expect("headers fit the budget");

    let err = file
        .write(&patterned(100_000))
        .err()
        .expect("write must fail");
    assert!(matches!(err, SluiceError::Io(_)));
    // Dropping the file and stage joins the pool without deadlocking.
}

fn qpress_round_trip(data: &[u8], options: &StageOptions, piece: usize) -> Vec<u8> {
    let sink = MemorySink::new();
    let encoder = QpressCompressSink::new(sink.clone(), options);
    run_stage(&encoder, "f", data, piece.max(1)).expect("compress");
    let (_, wire) = sink.single();

    let out = MemorySink::new();
    let decoder = QpressDecompressSink::new(out.clone(), options);
    run_stage(&decoder, "f.qp", &wire, piece.max(1)).expect("decompress");
    out.contents("f").expect("captured")
}

fn lz4_round_trip(data: &[u8], options: &StageOptions, piece: usize) -> Vec<u8> {
    let sink = MemorySink::new();
    let encoder = Lz4CompressSink::new(sink.clone(), options);
    run_stage(&encoder, "f", data, piece.max(1)).expect("compress");
    let (_, wire) = sink.single();

    let out = MemorySink::new();
    let decoder = Lz4DecompressSink::new(out.clone(), options);
    run_stage(&decoder, "f.lz4", &wire, piece.max(1)).expect("decompress");
    out.contents("f").expect("captured")
}

fn zstd_round_trip(data: &[u8], options: &StageOptions, piece: usize) -> Vec<u8> {
    let sink = MemorySink::new();
    let encoder = ZstdCompressSink::new(sink.clone(), options);
    run_stage(&encoder, "f", data, piece.max(1)).expect("compress");
    let (_, wire) = sink.single();

    let out = MemorySink::new();
    let decoder = ZstdDecompressSink::new(out.clone(), options);
    run_stage(&decoder, "f.zst", &wire, piece.max(1)).expect("decompress");
    out.contents("f").expect("captured")
}

fn crypt_round_trip(data: &[u8], options: &StageOptions, piece: usize) -> Vec<u8> {
    let sink = MemorySink::new();
    let encoder = EncryptSink::new(sink.clone(), KEY, options);
    run_stage(&encoder, "f", data, piece.max(1)).expect("encrypt");
    let (_, wire) = sink.single();

    let out = MemorySink::new();
    let decoder = DecryptSink::new(out.clone(), KEY, options);
    run_stage(&decoder, "f.xbcrypt", &wire, piece.max(1)).expect("decrypt");
    out.contents("f").expect("captured")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn qpress_round_trips_any_data_chunking_and_feed(
        data in proptest::collection::vec(any::<u8>(), 0..16384),
        chunk_size in 1usize..2048,
        piece in 1usize..700,
    ) {
        let options = StageOptions::new(3, chunk_size);
        prop_assert_eq!(qpress_round_trip(&data, &options, piece), data);
    }

    #[test]
    fn lz4_round_trips_any_data_chunking_and_feed(
        data in proptest::collection::vec(any::<u8>(), 0..16384),
        chunk_size in 1usize..2048,
        piece in 1usize..700,
    ) {
        let options = StageOptions::new(3, chunk_size);
        prop_assert_eq!(lz4_round_trip(&data, &options, piece), data);
    }

    #[test]
    fn zstd_round_trips_any_data_chunking_and_feed(
        data in proptest::collection::vec(any::<u8>(), 0..16384),
        chunk_size in 1usize..2048,
        piece in 1usize..700,
    ) {
        let options = StageOptions::new(3, chunk_size);
        prop_assert_eq!(zstd_round_trip(&data, &options, piece), data);
    }

    #[test]
    fn crypt_round_trips_any_data_chunking_and_feed(
        data in proptest::collection::vec(any::<u8>(), 0..16384),
        chunk_size in 1usize..2048,
        piece in 1usize..700,
    ) {
        let options = StageOptions::new(3, chunk_size);
        prop_assert_eq!(crypt_round_trip(&data, &options, piece), data);
    }
}
