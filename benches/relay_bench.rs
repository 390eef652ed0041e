//! Relay engine benchmarks.
//!
//! Measures the rate limiter on its own and full flush passes through the
//! pump with in-memory channels on both sides.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use snowflake::metrics::ProxyMetrics;
use snowflake::proxy::{RelayPump, Side};
use snowflake::rate_limit::{BucketRateLimit, SharedRateLimit};
use snowflake::transport::memory;
use snowflake::transport::ReadyState;

const CHUNK: usize = 16 * 1024;

fn bench_bucket_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("bucket_update");
    group.throughput(Throughput::Elements(1));

    group.bench_function("16k_chunk", |b| {
        let mut limit = BucketRateLimit::new(1e12, Duration::from_secs(5));
        b.iter(|| black_box(limit.update(CHUNK)))
    });

    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_flush");

    for chunks in [1usize, 16, 64] {
        group.throughput(Throughput::Bytes((chunks * CHUNK) as u64));
        group.bench_function(format!("{}_chunks", chunks), |b| {
            let payload = Bytes::from(vec![0u8; CHUNK]);
            b.iter(|| {
                let mut pump = RelayPump::new(
                    SharedRateLimit::unlimited(),
                    Arc::new(ProxyMetrics::new()),
                );
                let (client, _client_remote) = memory::channel("client", ReadyState::Open);
                let (relay, _relay_remote) = memory::channel("relay", ReadyState::Open);
                pump.attach(Side::Client, client.channel);
                pump.attach(Side::Relay, relay.channel);

                for _ in 0..chunks {
                    pump.enqueue(Side::Client, payload.clone());
                    pump.enqueue(Side::Relay, payload.clone());
                }
                black_box(pump.flush())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_bucket_update, bench_flush);
criterion_main!(benches);
