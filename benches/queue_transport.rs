use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hetero_deploy::config::TransportConfig;
use hetero_deploy::protocol::{read_frame, write_frame};
use hetero_deploy::transport::{DataType, Dequeued, QueueTransport, Tensor, WorkMode};
use std::io::Cursor;

// ---------------------------------------------------------------------------
// Queue round trips
// ---------------------------------------------------------------------------

fn bench_enqueue_dequeue(c: &mut Criterion) {
    let transport = QueueTransport::in_memory(TransportConfig::default());
    let queue = transport
        .create_queue(0, "bench.raw", 64, WorkMode::Pull)
        .unwrap();

    let mut group = c.benchmark_group("queue_round_trip");
    for size in [64usize, 4 * 1024, 256 * 1024] {
        let payload = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("raw", size), &payload, |b, payload| {
            b.iter(|| {
                transport
                    .enqueue(0, queue, |buf| {
                        buf.extend_from_slice(payload);
                        Ok(())
                    })
                    .unwrap();
                match transport.dequeue(0, queue).unwrap() {
                    Dequeued::Item { value, .. } => black_box(value),
                    Dequeued::EndOfSequence => unreachable!(),
                };
            });
        });
    }
    group.finish();
}

fn bench_tensor_round_trip(c: &mut Criterion) {
    let transport = QueueTransport::in_memory(TransportConfig::default());
    let queue = transport
        .create_queue(0, "bench.tensor", 64, WorkMode::Pull)
        .unwrap();
    let tensor = Tensor::new(DataType::Float32, vec![1, 3, 32, 32], vec![0u8; 3 * 32 * 32 * 4]);

    c.bench_function("tensor_round_trip", |b| {
        b.iter(|| {
            transport.enqueue_tensor(0, queue, &tensor).unwrap();
            black_box(transport.dequeue_tensor(0, queue).unwrap());
        });
    });
}

// ---------------------------------------------------------------------------
// Control-plane framing
// ---------------------------------------------------------------------------

fn bench_frames(c: &mut Criterion) {
    let chunk = vec![7u8; 2 * 1024 * 1024];
    let mut group = c.benchmark_group("frames");
    group.throughput(Throughput::Bytes(chunk.len() as u64));
    group.bench_function("write_read_chunk", |b| {
        let mut wire = Vec::with_capacity(chunk.len() + 8);
        b.iter(|| {
            wire.clear();
            write_frame(&mut wire, 1, &chunk).unwrap();
            let (id, payload) = read_frame(&mut Cursor::new(&wire)).unwrap();
            black_box((id, payload.len()));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_enqueue_dequeue, bench_tensor_round_trip, bench_frames);
criterion_main!(benches);
