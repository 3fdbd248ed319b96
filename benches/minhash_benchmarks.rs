use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use fdedup::RANDOM_SEED;
use fdedup::minhash::{MinHasher, band_keys, optimal_band_plan};
use fdedup::shingle::{Shingler, normalize};

fn sample_document(tokens: usize) -> String {
    (0..tokens)
        .map(|i| format!("word{i:04}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn benchmark_shingling(c: &mut Criterion) {
    let document = sample_document(512);
    let shingler = Shingler::new(5, " ");

    let mut group = c.benchmark_group("shingling");
    group.throughput(Throughput::Bytes(document.len() as u64));
    group.bench_function("normalize_and_shingle_512_tokens", |b| {
        b.iter(|| {
            let normalized = normalize(std::hint::black_box(&document));
            shingler.shingles(&normalized).len()
        });
    });
    group.finish();
}

fn benchmark_minhash(c: &mut Criterion) {
    let document = sample_document(512);
    let shingler = Shingler::new(5, " ");
    let normalized = normalize(&document);
    let shingles = shingler.shingles(&normalized);
    let hasher = MinHasher::new(64, RANDOM_SEED);

    let mut group = c.benchmark_group("minhash");
    group.throughput(Throughput::Elements(shingles.len() as u64));
    group.bench_function("signature_64_perms", |b| {
        b.iter(|| hasher.minhash(std::hint::black_box(&shingles)));
    });
    group.finish();
}

fn benchmark_banding(c: &mut Criterion) {
    let document = sample_document(512);
    let shingler = Shingler::new(5, " ");
    let normalized = normalize(&document);
    let shingles = shingler.shingles(&normalized);
    let hasher = MinHasher::new(64, RANDOM_SEED);
    let signature = hasher.minhash(&shingles);
    let plan = optimal_band_plan(0.8, 64, 0.5, 0.5);

    c.bench_function("band_keys", |b| {
        b.iter(|| band_keys(std::hint::black_box(&signature), &plan, RANDOM_SEED));
    });
}

criterion_group!(
    benches,
    benchmark_shingling,
    benchmark_minhash,
    benchmark_banding
);
criterion_main!(benches);
