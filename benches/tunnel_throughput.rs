//! Tunnel throughput benchmarks
//!
//! This benchmark suite measures:
//! - Write fragmentation at several split thresholds
//! - Message switch routing and poll delivery without sockets
//! - Full client to server transfers over loopback HTTP
//!
//! Run with: cargo bench --bench tunnel_throughput

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use httptunnel::tunnel::{
    Completion, MessageSwitch, TunnelClientChannel, TunnelConfig, TunnelServer, WriteFragmenter,
};
use std::num::NonZeroUsize;
use std::time::Duration;

// ========== Fragmenter Benchmarks ==========

fn bench_fragmenter(c: &mut Criterion) {
    let mut group = c.benchmark_group("fragmenter_flush");
    let payload = Bytes::from(vec![0x5a; 1024 * 1024]);
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for threshold in [1024usize, 16 * 1024, 64 * 1024] {
        let fragmenter = WriteFragmenter::new(NonZeroUsize::new(threshold).unwrap());
        group.bench_with_input(BenchmarkId::from_parameter(threshold), &threshold, |b, _| {
            b.iter(|| {
                let mut buffer = payload.clone();
                let done = fragmenter.flush(&mut buffer, |fragment| {
                    black_box(fragment);
                    Completion::succeeded()
                });
                black_box(done);
            });
        });
    }

    group.finish();
}

// ========== Switch Benchmarks ==========

fn bench_switch_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("switch_round_trip");
    let chunk = Bytes::from(vec![0xa5; 16 * 1024]);
    group.throughput(Throughput::Bytes(chunk.len() as u64));

    let (switch, acceptor) = MessageSwitch::new(TunnelConfig::default());
    let tunnel_id = switch.create_tunnel(None).unwrap();
    let tunnel = acceptor.try_accept().unwrap();

    group.bench_function("inbound_route_and_read", |b| {
        b.iter(|| {
            switch.route_inbound_data(&tunnel_id, chunk.clone());
            black_box(tunnel.read());
        });
    });

    group.bench_function("outbound_write_and_poll", |b| {
        b.iter(|| {
            let written = tunnel.write(chunk.clone());
            let reply = switch.poll_outbound_data(&tunnel_id).unwrap().wait();
            black_box((written, reply));
        });
    });

    group.finish();
}

// ========== End-to-end Benchmarks ==========

fn bench_loopback_transfer(c: &mut Criterion) {
    let mut group = c.benchmark_group("loopback_transfer");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    let config = TunnelConfig::default();
    let (server, acceptor) = TunnelServer::bind("127.0.0.1:0".parse().unwrap(), config.clone()).unwrap();
    let handle = server.spawn().unwrap();

    let client = TunnelClientChannel::new(config).unwrap();
    client.connect(handle.local_addr()).wait().unwrap();
    let tunnel = acceptor.accept().unwrap();

    for size in [16 * 1024usize, 256 * 1024] {
        let payload = Bytes::from(vec![0x3c; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("client_to_server", size), &size, |b, &size| {
            b.iter(|| {
                client.write(payload.clone()).wait().unwrap();
                let mut received = 0;
                while received < size {
                    received += tunnel.read().map_or(0, |data| data.len());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fragmenter,
    bench_switch_round_trip,
    bench_loopback_transfer
);
criterion_main!(benches);
