use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use proximity_voice::audio::RingBuffer;
use proximity_voice::codec::{FrameEncoder, OpusEncoder};

fn voice(len: usize) -> Vec<i16> {
    (0..len)
        .map(|i| ((i as f32 * 0.03).sin() * 6000.0) as i16)
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("try_get_encoded");
    for samples in [480usize, 2880, 4410] {
        let input = voice(samples);
        group.bench_with_input(BenchmarkId::from_parameter(samples), &input, |b, input| {
            let mut encoder = FrameEncoder::new(OpusEncoder::voice().unwrap());
            let mut queue = RingBuffer::new(input.len() + 120);
            b.iter(|| {
                queue.clear();
                queue.enqueue(input);
                black_box(encoder.try_get_encoded(&mut queue, true).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_ring_buffer(c: &mut Criterion) {
    let chunk = voice(441);
    c.bench_function("ring_buffer_enqueue_dequeue", |b| {
        let mut queue = RingBuffer::new(4096);
        b.iter(|| {
            queue.enqueue(black_box(&chunk));
            queue.dequeue(black_box(chunk.len())).unwrap();
        });
    });
}

criterion_group!(benches, bench_encode, bench_ring_buffer);
criterion_main!(benches);
