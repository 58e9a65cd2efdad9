use cfsync::delta::{
    run_job, sig_args, DeltaJob, LoadSignatureJob, PatchJob, Rollsum, Signature, SignatureJob,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;
use std::sync::Arc;

const BUF: usize = 4095;

fn pseudo_random(n: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    (0..n)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}

/// Basis and a source with a few scattered edits.
fn make_pair(size: usize) -> (Vec<u8>, Vec<u8>) {
    let basis = pseudo_random(size, 42);
    let mut source = basis.clone();
    for i in (0..size).step_by((size / 8).max(1)) {
        source[i] ^= 0xff;
    }
    (basis, source)
}

fn load_signature(basis: &[u8]) -> Arc<Signature> {
    let params = sig_args(Some(basis.len() as u64));
    let encoded = run_job(&mut SignatureJob::new(params).unwrap(), basis, BUF, BUF).unwrap();
    let mut loader = LoadSignatureJob::new();
    run_job(&mut loader, &encoded, BUF * 2, BUF).unwrap();
    let mut sig = loader.into_signature().unwrap();
    sig.build_hash_table();
    Arc::new(sig)
}

fn bench_rollsum(c: &mut Criterion) {
    let data = pseudo_random(1 << 20, 7);
    let mut group = c.benchmark_group("rollsum");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("rotate_1mb", |b| {
        b.iter(|| {
            let mut sum = Rollsum::of(&data[..2048]);
            for i in 0..data.len() - 2048 {
                sum.rotate(data[i], data[i + 2048]);
            }
            black_box(sum.digest())
        })
    });
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_pipeline");

    for size in [64 * 1024, 1024 * 1024, 8 * 1024 * 1024] {
        let (basis, source) = make_pair(size);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("signature", size), &basis, |b, basis| {
            let params = sig_args(Some(basis.len() as u64));
            b.iter(|| run_job(&mut SignatureJob::new(params).unwrap(), black_box(basis), BUF, BUF).unwrap())
        });

        let sig = load_signature(&basis);
        group.bench_with_input(BenchmarkId::new("delta", size), &source, |b, source| {
            b.iter(|| run_job(&mut DeltaJob::new(sig.clone()), black_box(source), BUF, BUF).unwrap())
        });

        let delta = run_job(&mut DeltaJob::new(sig.clone()), &source, BUF, BUF).unwrap();
        group.bench_with_input(BenchmarkId::new("patch", size), &delta, |b, delta| {
            b.iter(|| {
                let basis = Cursor::new(basis.as_slice());
                run_job(&mut PatchJob::new(basis), black_box(delta), BUF * 2, BUF).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rollsum, bench_pipeline);
criterion_main!(benches);
