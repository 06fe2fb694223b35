use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use usc_tunnel::core::buffer::IoBuffer;
use usc_tunnel::core::envelope::{
    encode, insert_at, strip_at, Envelope, Operation, SecurityTransport, ENVELOPE_LEN,
};
use usc_tunnel::core::session::{Deframer, SessionBinding};

#[allow(clippy::unwrap_used)]
fn bench_header(c: &mut Criterion) {
    let env = Envelope::new(Operation::Data, SecurityTransport::Tls, 6513, 1000, 4096);
    let wire = env.to_bytes();

    let mut group = c.benchmark_group("envelope_header");
    group.bench_function("to_bytes", |b| b.iter(|| std::hint::black_box(env).to_bytes()));
    group.bench_function("from_bytes", |b| {
        b.iter(|| Envelope::from_bytes(std::hint::black_box(&wire)).unwrap())
    });
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_insert_strip(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_in_place");
    for &size in &[64usize, 1024, 16 * 1024, 65535] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("insert_strip_{size}b"), |b| {
            b.iter_batched(
                || {
                    let mut buf = IoBuffer::with_capacity(size + ENVELOPE_LEN);
                    buf.extend_from_slice(&vec![b'x'; size]).unwrap();
                    buf
                },
                |mut buf| {
                    let env = encode(None, size, Operation::Data, SecurityTransport::Tls);
                    insert_at(&mut buf, 0, &env).unwrap();
                    strip_at(&mut buf, 0).unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_deframe(c: &mut Criterion) {
    let binding = SessionBinding::defaults();
    let chunk = vec![b'<'; 4096];
    let mut wire = Vec::new();
    for _ in 0..16 {
        wire.extend_from_slice(&binding.envelope(Operation::Data, chunk.len()).to_bytes());
        wire.extend_from_slice(&chunk);
    }

    let mut group = c.benchmark_group("deframe");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("stream_64k", |b| {
        b.iter_batched(
            || IoBuffer::with_capacity(16 * 1024),
            |mut buf| {
                let mut deframer = Deframer::new();
                let mut delivered = 0;
                for piece in wire.chunks(16 * 1024 - ENVELOPE_LEN) {
                    buf.extend_from_slice(piece).unwrap();
                    while let Some(env) = deframer.next(&mut buf).unwrap() {
                        if binding.check(&env).is_ok() {
                            deframer.accept();
                        } else {
                            deframer.reject();
                        }
                    }
                    let ready = deframer.ready();
                    delivered += ready;
                    deframer.consume(&mut buf, ready).unwrap();
                }
                delivered
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_header, bench_insert_strip, bench_deframe);
criterion_main!(benches);
