// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire Path Benchmark
//!
//! Measures the per-frame costs on the send/receive path:
//! - Identity derivation (name hash, dynamic allocation)
//! - Frame encoding (raw payload vs. in-place serialization)
//! - Buffered frame decoding with chunked input
//!
//! No sockets involved; this isolates CPU cost.

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rdsync::wire::FrameCodec;
use rdsync::{IdKind, Identities, RdId, WriteCursor};
use std::hint::black_box as bb;

fn bench_identity(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity");

    for name in ["x", "settings", "very.long.child.name.with.many.segments"] {
        group.bench_with_input(BenchmarkId::new("derive", name.len()), &name, |b, name| {
            let parent = RdId::new(0x1234_5678);
            b.iter(|| Identities::derive(bb(parent), bb(name)));
        });
    }

    group.bench_function("next_dynamic", |b| {
        let ids = Identities::new(IdKind::Client);
        b.iter(|| ids.next(bb(RdId::NULL)));
    });

    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for size in [16usize, 256, 4096, 65536] {
        let payload = vec![0xABu8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("raw", size), &payload, |b, payload| {
            b.iter(|| FrameCodec::encode(bb(RdId::new(42)), bb(payload)));
        });
        group.bench_with_input(BenchmarkId::new("serialized", size), &payload, |b, payload| {
            b.iter(|| {
                FrameCodec::encode_with(RdId::new(42), &mut |out: &mut WriteCursor| {
                    out.write_i64(7);
                    out.write_bytes(bb(payload));
                    Ok(())
                })
            });
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for size in [16usize, 256, 4096] {
        let mut stream = Vec::new();
        for i in 0..64 {
            stream.extend(FrameCodec::encode(RdId::new(i), &vec![i as u8; size]));
        }
        group.throughput(Throughput::Bytes(stream.len() as u64));
        group.bench_with_input(BenchmarkId::new("buffered_1k_chunks", size), &stream, |b, stream| {
            b.iter(|| {
                let mut codec = FrameCodec::with_default_max();
                let mut frames = 0;
                for chunk in stream.chunks(1024) {
                    codec.feed(chunk);
                    while let Some(frame) = codec.decode_buffered() {
                        bb(&frame);
                        frames += 1;
                    }
                }
                assert_eq!(frames, 64);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_identity, bench_encode, bench_decode);
criterion_main!(benches);
