//! End-to-end multiplexer benchmarks against an in-memory server.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use iproto_client::{Client, Connection, ConnectionConfig, Multiplexer};
use iproto_protocol::{FramePool, FrameReader, FrameWriter, Greeting, Response, Value};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;

/// Answers every request with its own sync and a single one-field tuple.
async fn serve(stream: tokio::io::DuplexStream) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half, Arc::new(FramePool::new(64, 256)));
    let mut writer = FrameWriter::new(write_half);
    let reply = vec![vec![Value::from(1u64)]];

    while let Ok(frame) = reader.read_frame().await {
        let sync = frame.header.sync;
        reader.release(frame);
        let response = Response::ok(sync, reply.clone());
        let Ok(frame) = response.to_frame() else {
            break;
        };
        if writer.write_frame(&frame).await.is_err() {
            break;
        }
    }
}

fn setup_client(rt: &Runtime) -> Client {
    rt.block_on(async {
        let (client, mut server) = tokio::io::duplex(1024 * 1024);
        server
            .write_all(&Greeting::build("Tarantool 2.10.4 (Binary)", &[1u8; 32]))
            .await
            .unwrap();
        tokio::spawn(serve(server));
        let conn = Connection::handshake(client, ConnectionConfig::new("bench"))
            .await
            .unwrap();
        Client::from_multiplexer(Multiplexer::start(conn))
    })
}

fn bench_ping_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup_client(&rt);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));

    group.bench_function("ping", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(client.ping().await.unwrap()) });
    });

    group.finish();
}

fn bench_concurrent_calls(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = setup_client(&rt);

    let mut group = c.benchmark_group("e2e_concurrent_call");

    for concurrency in [1, 16, 128] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| {
                    let client = client.clone();
                    async move {
                        let handles: Vec<_> = (0..concurrency)
                            .map(|_| {
                                let client = client.clone();
                                tokio::spawn(async move { client.call("f", vec![]).await })
                            })
                            .collect();
                        for handle in handles {
                            black_box(handle.await.unwrap().unwrap());
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_ping_latency, bench_concurrent_calls);

criterion_main!(benches);
