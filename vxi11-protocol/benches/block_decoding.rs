use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use vxi11_protocol::scpi::{decode_block, decode_numeric_list, frame_block};

fn block_decoding(c: &mut Criterion) {
    // one full screen of a 1.2 Mpts scope channel
    let payload: Vec<u8> = (0..1_200_000).map(|i| (i % 251) as u8).collect();
    let framed = frame_block(&payload);

    c.bench_function("decode_block 1.2M", |b| {
        b.iter(|| decode_block(black_box(&framed)))
    });
}

fn numeric_list_decoding(c: &mut Criterion) {
    let text = (0..10_000)
        .map(|i| format!("{:e}", i as f64 * 1.5e-3))
        .collect::<Vec<_>>()
        .join(",");

    c.bench_function("decode_numeric_list 10k", |b| {
        b.iter(|| decode_numeric_list(black_box(&text), ','))
    });
}

criterion_group!(benches, block_decoding, numeric_list_decoding);
criterion_main!(benches);
