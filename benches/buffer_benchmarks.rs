//! Benchmarks for streaming staged content

use bifrost_tunnel::buffer::Buffer;
use bifrost_tunnel::upload::ByteArrayUploadable;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::io;

fn mixed_buffer(parts: usize, part_size: usize) -> Buffer {
    let mut buffer = Buffer::new();
    for i in 0..parts {
        if i % 2 == 0 {
            buffer.append_bytes(&vec![b'm'; part_size]);
        } else {
            buffer.append_uploadable(ByteArrayUploadable::new(vec![b'l'; part_size]));
        }
    }
    buffer
}

/// Plain write versus write with progress at several granularities
fn bench_write(c: &mut Criterion) {
    let buffer = mixed_buffer(16, 64 * 1024);
    let mut group = c.benchmark_group("buffer_write");
    group.throughput(Throughput::Bytes(buffer.size()));

    group.bench_function("write_to", |b| {
        b.iter(|| buffer.write_to(&mut io::sink()).unwrap());
    });

    for granularity in [512u64, 8 * 1024, 64 * 1024] {
        group.bench_with_input(
            BenchmarkId::new("write_to_with_progress", granularity),
            &granularity,
            |b, &granularity| {
                b.iter(|| {
                    let mut calls = 0u64;
                    let mut listener = Granularity(granularity, &mut calls);
                    buffer.write_to_with_progress(&mut io::sink(), &mut listener).unwrap();
                    black_box(calls);
                });
            },
        );
    }

    group.finish();
}

struct Granularity<'a>(u64, &'a mut u64);

impl bifrost_tunnel::ProgressListener for Granularity<'_> {
    fn chunk_granularity(&mut self, _total_size: u64) -> u64 {
        self.0
    }

    fn on_transferred(&mut self, _bytes: u64) {
        *self.1 += 1;
    }
}

/// Building a buffer from many small text fragments
fn bench_append(c: &mut Criterion) {
    c.bench_function("append_str_1000", |b| {
        b.iter(|| {
            let mut buffer = Buffer::new();
            for i in 0..1000 {
                buffer.append_str("key=").append_number(i).append_char('&');
            }
            black_box(buffer.size());
        });
    });
}

criterion_group!(benches, bench_write, bench_append);
criterion_main!(benches);
