use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dwarfsrs::codec::{BrotliCodec, Codec, LzmaCodec, Lz4Codec, ZstdCodec};

fn sample_block() -> Vec<u8> {
    // A repeating, partially-compressible pattern is closer to real file
    // content than an all-zero buffer and still fully deterministic.
    (0..1024 * 1024).map(|i| (i % 251) as u8).collect()
}

fn bench_compression(c: &mut Criterion) {
    let data = sample_block();
    let zstd = ZstdCodec;
    let lz4 = Lz4Codec;
    let brotli = BrotliCodec;
    let lzma = LzmaCodec;

    c.bench_function("zstd_compress_1mb", |b| b.iter(|| zstd.compress(black_box(&data), 3)));
    c.bench_function("lz4_compress_1mb", |b| b.iter(|| lz4.compress(black_box(&data), 0)));
    c.bench_function("brotli_compress_1mb", |b| b.iter(|| brotli.compress(black_box(&data), 5)));
    c.bench_function("lzma_compress_1mb", |b| b.iter(|| lzma.compress(black_box(&data), 3)));
}

fn bench_decompression(c: &mut Criterion) {
    let data = sample_block();
    let zstd = ZstdCodec;
    let lz4 = Lz4Codec;
    let zstd_compressed = zstd.compress(&data, 3).unwrap();
    let lz4_compressed = lz4.compress(&data, 0).unwrap();

    c.bench_function("zstd_decompress_1mb", |b| b.iter(|| zstd.decompress(black_box(&zstd_compressed))));
    c.bench_function("lz4_decompress_1mb", |b| b.iter(|| lz4.decompress(black_box(&lz4_compressed))));
}

criterion_group!(benches, bench_compression, bench_decompression);
criterion_main!(benches);
