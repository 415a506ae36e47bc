use codec::{compress_if_smaller, yenc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

const SEGMENT_SIZE: usize = 768_000;

fn sample_payload() -> Vec<u8> {
    let mut data = Vec::with_capacity(SEGMENT_SIZE);
    for i in 0..SEGMENT_SIZE {
        let byte = ((i as u8).wrapping_mul(31)) ^ 0xA5;
        data.push(byte);
    }
    data
}

fn bench_yenc_encode(c: &mut Criterion) {
    let payload = sample_payload();
    c.bench_function("yenc_encode_segment", |b| {
        b.iter(|| yenc::encode(black_box(&payload), "seg", yenc::DEFAULT_LINE_WIDTH))
    });
}

fn bench_yenc_decode(c: &mut Criterion) {
    let framed = yenc::encode(&sample_payload(), "seg", yenc::DEFAULT_LINE_WIDTH);
    c.bench_function("yenc_decode_segment", |b| {
        b.iter(|| yenc::decode(black_box(&framed)).expect("valid framing"))
    });
}

fn bench_compression(c: &mut Criterion) {
    let payload = sample_payload();
    c.bench_function("zlib_segment", |b| {
        b.iter(|| compress_if_smaller(black_box(&payload)).expect("compression"))
    });
}

criterion_group!(benches, bench_yenc_encode, bench_yenc_decode, bench_compression);
criterion_main!(benches);
