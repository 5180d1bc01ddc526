//! Benchmarks for the frame codec and its hot helpers
//!
//! Run with: cargo bench

use bytes::{Bytes, BytesMut};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use ws_engine::Role;
use ws_engine::frame::{self, DecodeLimits, Frame, OpCode};
use ws_engine::mask::apply_mask;
use ws_engine::utf8::validate_utf8;

const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

fn bench_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("mask");

    for size in [64, 256, 1024, 4096, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("apply_mask", size), &size, |b, &size| {
            let mut data = vec![0x42u8; size];
            b.iter(|| apply_mask(black_box(&mut data), black_box(MASK)));
        });
    }

    group.finish();
}

fn bench_utf8(c: &mut Criterion) {
    let mut group = c.benchmark_group("utf8");

    for size in [64, 1024, 16384] {
        let ascii = "a".repeat(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("ascii", size), &ascii, |b, data| {
            b.iter(|| validate_utf8(black_box(data.as_bytes())));
        });
    }

    for size in [64, 1024, 4096] {
        let mixed = "Hello, 世界! 🎉 ".repeat(size / 20);
        group.throughput(Throughput::Bytes(mixed.len() as u64));
        group.bench_with_input(BenchmarkId::new("mixed", mixed.len()), &mixed, |b, data| {
            b.iter(|| validate_utf8(black_box(data.as_bytes())));
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let limits = DecodeLimits::for_role(Role::Server, 1024 * 1024);

    for size in [8, 125, 1024, 65536, 131072] {
        let wire = frame::encode(&Frame::binary(payload(size)).with_mask(MASK));
        group.throughput(Throughput::Bytes(wire.len() as u64));

        group.bench_with_input(BenchmarkId::new("masked", size), &wire, |b, data| {
            b.iter(|| frame::decode(black_box(data), &limits).unwrap());
        });
    }

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");

    for size in [8, 125, 1024, 16384, 65536] {
        let data = Bytes::from(payload(size));
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("unmasked", size), &data, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);
            b.iter(|| {
                buf.clear();
                let frame = Frame::new(OpCode::Binary, data.clone(), true);
                frame::encode_into(black_box(&frame), &mut buf);
            });
        });

        group.bench_with_input(BenchmarkId::new("masked", size), &data, |b, data| {
            let mut buf = BytesMut::with_capacity(size + 14);
            b.iter(|| {
                buf.clear();
                let frame = Frame::new(OpCode::Binary, data.clone(), true).with_mask(MASK);
                frame::encode_into(black_box(&frame), &mut buf);
            });
        });
    }

    group.finish();
}

fn bench_handshake(c: &mut Criterion) {
    use ws_engine::handshake::hixie::challenge_response;
    use ws_engine::handshake::key::{SecurityKey, generate_accept_key};

    let mut group = c.benchmark_group("handshake");

    group.bench_function("generate_key", |b| b.iter(SecurityKey::generate));

    group.bench_function("generate_accept_key", |b| {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        b.iter(|| generate_accept_key(black_box(key)));
    });

    group.bench_function("hixie_challenge", |b| {
        b.iter(|| challenge_response(black_box(155712099), black_box(173347027), b"Tm[K T2u"));
    });

    group.finish();
}

#[cfg(feature = "permessage-deflate")]
fn bench_deflate(c: &mut Criterion) {
    use ws_engine::extension::deflate::{DeflateDecoder, DeflateEncoder};

    let mut group = c.benchmark_group("deflate");

    for size in [256, 4096, 65536] {
        let text = "the quick brown fox jumps over the lazy dog ".repeat(size / 44 + 1);
        let data = &text.as_bytes()[..size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("compress", size), data, |b, data| {
            let mut encoder = DeflateEncoder::new(15, false, 6, 0);
            b.iter(|| encoder.compress(black_box(data)).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("round_trip", size), data, |b, data| {
            b.iter(|| {
                let mut encoder = DeflateEncoder::new(15, true, 6, 0);
                let mut decoder = DeflateDecoder::new(true);
                let compressed = encoder.compress(black_box(data)).unwrap().unwrap();
                decoder.decompress(&compressed, 1 << 20).unwrap()
            });
        });
    }

    group.finish();
}

#[cfg(not(feature = "permessage-deflate"))]
fn bench_deflate(_c: &mut Criterion) {}

criterion_group!(
    benches,
    bench_mask,
    bench_utf8,
    bench_decode,
    bench_encode,
    bench_handshake,
    bench_deflate,
);

criterion_main!(benches);
