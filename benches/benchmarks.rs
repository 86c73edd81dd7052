
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use timelines::accumulator::FixedJitter;
use timelines::aggregator::merge_ranges;
use timelines::chunk::ChunkAccumulator;
use timelines::encoding::decode_samples;
use timelines::times::{decode_times, encode_times};
use timelines::{ChunkSet, Collector, CollectorConfig, SampleValue, TimelineStore};

use std::sync::Arc;
use std::time::Duration;

fn make_config(jitter_ms: u64) -> CollectorConfig {
    CollectorConfig {
        chunk_length: Duration::from_secs(600),
        background_writes: false,
        aggregation_enabled: false,
        chunks_to_aggregate: vec![8],
        deadline_jitter: Some(Arc::new(FixedJitter(jitter_ms))),
        ..Default::default()
    }
}

fn bench_sample_codec(c: &mut Criterion) {
    let events = datasets::generate_events(datasets::DEFAULT_SEED, 10_000, 1, 1);
    let values: Vec<SampleValue> = events
        .iter()
        .flat_map(|e| e.samples.values().copied())
        .collect();

    let mut encoded = ChunkAccumulator::new(1, 1);
    for v in &values {
        encoded.add_sample(*v);
    }
    let chunk = encoded.extract_and_reset(1);

    let mut group = c.benchmark_group("sample_codec");
    group.bench_function("encode_10k", |b| {
        b.iter(|| {
            let mut acc = ChunkAccumulator::new(1, 1);
            for v in &values {
                acc.add_sample(black_box(*v));
            }
            black_box(acc.extract_and_reset(1))
        })
    });
    group.bench_function("decode_10k", |b| {
        b.iter(|| black_box(decode_samples(black_box(&chunk.encoded_samples)).unwrap()))
    });
    group.finish();
}

fn bench_time_codec(c: &mut Criterion) {
    let times = datasets::generate_times(datasets::DEFAULT_SEED, 10_000);
    let encoded = encode_times(&times).unwrap();

    let mut group = c.benchmark_group("time_codec");
    group.bench_function("encode_10k", |b| {
        b.iter(|| black_box(encode_times(black_box(&times)).unwrap()))
    });
    group.bench_function("decode_10k", |b| {
        b.iter(|| black_box(decode_times(black_box(&encoded)).unwrap()))
    });
    group.finish();
}

fn bench_ingest_fixed_dataset(c: &mut Criterion) {
    let events = datasets::generate_events(datasets::DEFAULT_SEED, 20_000, 64, 8);

    let mut group = c.benchmark_group("ingest");
    group.bench_function("ingest_20k_64_hosts", |b| {
        b.iter_batched(
            || Collector::in_memory(make_config(120_000)).expect("collector"),
            |collector| {
                for event in &events {
                    collector.handle(black_box(event.clone())).unwrap();
                }
                collector.force_flush().unwrap();
                collector
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

fn bench_merge_ranges(c: &mut Criterion) {
    let events = datasets::generate_events(datasets::DEFAULT_SEED, 8_000, 1, 8);
    let collector = Collector::in_memory(make_config(100_000)).expect("collector");
    collector.replay().unwrap();
    for event in events {
        collector.handle(event).unwrap();
    }
    collector.force_flush().unwrap();
    let sources: Vec<ChunkSet> = collector.store().aggregation_candidates(0).unwrap();
    assert!(sources.len() >= 8, "dataset should produce at least 8 ranges");
    let sources = &sources[..8];

    c.bench_function("merge_8_ranges", |b| {
        b.iter(|| black_box(merge_ranges(1_000_000, 1, black_box(sources)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_sample_codec,
    bench_time_codec,
    bench_ingest_fixed_dataset,
    bench_merge_ranges
);
criterion_main!(benches);
