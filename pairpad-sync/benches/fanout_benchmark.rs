use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pairpad_sync::protocol::{ClientEvent, Payload, ServerEvent};
use pairpad_sync::{Broadcaster, Connection, ConnectionRegistry, Frame};
use serde_json::Value;
use std::hint::black_box;
use std::sync::Arc;
use tokio::sync::mpsc;

fn code_payload(len: usize) -> Payload {
    let mut data = Payload::new();
    data.insert("code".into(), Value::String("x".repeat(len)));
    data
}

/// A room with `members` connections whose outboxes never fill during one iteration.
fn populated_room(members: usize) -> (Broadcaster, Vec<mpsc::Receiver<Frame>>) {
    let registry = Arc::new(ConnectionRegistry::new());
    let receivers = (0..members)
        .map(|_| {
            let (connection, rx) = Connection::channel(4);
            registry.register("bench", connection).unwrap();
            rx
        })
        .collect();
    (Broadcaster::new(registry), receivers)
}

fn bench_decode_code_update(c: &mut Criterion) {
    let frame = format!(r#"{{"type":"code_update","data":{{"code":"{}"}}}}"#, "x".repeat(1024));

    c.bench_function("decode_code_update_1KB", |b| {
        b.iter(|| black_box(ClientEvent::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_encode_envelope(c: &mut Criterion) {
    let data = code_payload(1024);

    c.bench_function("encode_code_update_1KB", |b| {
        b.iter(|| black_box(ServerEvent::CodeUpdate(data.clone()).encode().unwrap()))
    });
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast_fanout");
    let data = code_payload(256);

    for members in [2usize, 10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, &members| {
            let (broadcaster, mut receivers) = populated_room(members);
            b.iter(|| {
                let report = broadcaster.broadcast(
                    "bench",
                    ServerEvent::CodeUpdate(data.clone()),
                    None,
                );
                black_box(report.delivered);
                for rx in receivers.iter_mut() {
                    while rx.try_recv().is_ok() {}
                }
            })
        });
    }
    group.finish();
}

fn bench_register_unregister(c: &mut Criterion) {
    let registry = ConnectionRegistry::new();
    let (connection, _rx) = Connection::channel(1);

    c.bench_function("register_unregister", |b| {
        b.iter(|| {
            registry.register("bench", connection.clone()).unwrap();
            black_box(registry.unregister(&connection, "bench"));
        })
    });
}

criterion_group!(
    benches,
    bench_decode_code_update,
    bench_encode_envelope,
    bench_broadcast_fanout,
    bench_register_unregister,
);
criterion_main!(benches);
