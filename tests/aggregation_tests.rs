use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use timelines::accumulator::FixedJitter;
use timelines::encoding::decode_chunk;
use timelines::persistence::MemoryBackingLog;
use timelines::times::decode_times;
use timelines::{
    CatalogStore, ChunkSet, Collector, CollectorConfig, Event, InMemoryIdResolver, SampleValue,
    TimelineStore,
};

fn collector(chunks_to_aggregate: Vec<usize>, max_level: u8) -> (Collector, Arc<CatalogStore>) {
    let store = Arc::new(CatalogStore::in_memory());
    let cfg = CollectorConfig {
        chunk_length: Duration::from_secs(600),
        background_writes: false,
        aggregation_enabled: false,
        chunks_to_aggregate,
        max_aggregation_level: max_level,
        deadline_jitter: Some(Arc::new(FixedJitter(1_000_000))),
        shutdown_grace_period: Duration::from_secs(2),
        drain_poll_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let collector = Collector::with_parts(
        cfg,
        store.clone(),
        Arc::new(InMemoryIdResolver::new()),
        Box::new(MemoryBackingLog::new()),
    )
    .expect("collector");
    collector.replay().expect("replay");
    (collector, store)
}

/// Writes `ranges` level-0 ranges of `per_range` samples each for `host`/`category`.
fn write_ranges(collector: &Collector, host: &str, category: &str, ranges: u64, per_range: u64) {
    for r in 0..ranges {
        for i in 0..per_range {
            let ts = r * 1_000 + i * 10;
            assert!(collector
                .handle(Event::new(host, category, ts).with_sample("v", ts as i64))
                .unwrap());
        }
        assert!(collector.force_flush().unwrap());
    }
}

fn total_samples(sets: &[ChunkSet]) -> u32 {
    sets.iter().map(|s| s.time_range.sample_count).sum()
}

fn assert_disjoint(sets: &[ChunkSet]) {
    for pair in sets.windows(2) {
        assert!(
            pair[0].time_range.end_time < pair[1].time_range.start_time,
            "valid ranges overlap: {:?} and {:?}",
            (pair[0].time_range.start_time, pair[0].time_range.end_time),
            (pair[1].time_range.start_time, pair[1].time_range.end_time)
        );
    }
}

#[test]
fn test_full_groups_merge_and_sources_are_deleted() {
    let (collector, store) = collector(vec![3], 1);
    write_ranges(&collector, "web-1", "cpu", 7, 4);
    assert_eq!(store.ranges().unwrap().len(), 7);

    let summary = collector.aggregate_now().unwrap().expect("pass ran");
    assert_eq!(summary.ranges_considered, 7);
    assert_eq!(summary.ranges_combined, 6);
    assert_eq!(summary.aggregates_created, 2);
    assert_eq!(summary.failures, 0);
    assert!(summary.bytes_created > 0);

    let valid = store.ranges_for_host(1, None, None).unwrap();
    let levels: Vec<u8> = valid.iter().map(|s| s.time_range.aggregation_level).collect();
    assert_eq!(levels, vec![1, 1, 0]);
    assert_eq!(total_samples(&valid), 28);
    assert_disjoint(&valid);
    // Sources of the two aggregates are physically gone; the leftover range stays.
    assert_eq!(store.ranges().unwrap().len(), 3);

    let merged = &valid[0];
    assert_eq!(merged.time_range.sample_count, 12);
    assert_eq!(merged.time_range.start_time, 0);
    assert_eq!(merged.time_range.end_time, 2_030);
    let times = decode_times(&merged.time_range.encoded_times).unwrap();
    let values = decode_chunk(&merged.chunks[0]).unwrap();
    assert_eq!(times.len(), 12);
    assert_eq!(
        values,
        times.iter().map(|&t| SampleValue::Int(t as i64)).collect::<Vec<_>>()
    );

    let stats = collector.stats().aggregation;
    assert_eq!(stats.passes, 1);
    assert_eq!(stats.aggregates_created, 2);
}

#[test]
fn test_second_level_merges_first_level_aggregates() {
    let (collector, store) = collector(vec![2, 2], 2);
    write_ranges(&collector, "web-1", "cpu", 4, 3);

    let summary = collector.aggregate_now().unwrap().expect("pass ran");
    // Level 0: 4 ranges -> 2 aggregates; level 1: 2 aggregates -> 1.
    assert_eq!(summary.aggregates_created, 3);

    let valid = store.ranges_for_host(1, None, None).unwrap();
    assert_eq!(valid.len(), 1);
    assert_eq!(valid[0].time_range.aggregation_level, 2);
    assert_eq!(valid[0].time_range.sample_count, 12);
    assert_eq!(store.ranges().unwrap().len(), 1);
}

#[test]
fn test_aggregates_never_mix_categories_or_hosts() {
    let (collector, store) = collector(vec![2], 1);
    write_ranges(&collector, "web-1", "cpu", 3, 2);
    write_ranges(&collector, "web-1", "mem", 2, 2);
    write_ranges(&collector, "web-2", "cpu", 1, 2);

    let summary = collector.aggregate_now().unwrap().expect("pass ran");
    assert_eq!(summary.aggregates_created, 2);

    for set in store.ranges_for_host(1, None, None).unwrap() {
        if set.time_range.aggregation_level == 1 {
            assert_eq!(set.time_range.sample_count, 4);
        }
    }
    let web2 = store.ranges_for_host(2, None, None).unwrap();
    assert_eq!(web2.len(), 1);
    assert_eq!(web2[0].time_range.aggregation_level, 0);
}

#[test]
fn test_kinds_missing_from_a_source_are_filled_with_nulls() {
    let (collector, store) = collector(vec![2], 1);
    for ts in [1u64, 2] {
        collector
            .handle(Event::new("db-1", "io", ts).with_sample("reads", 1i64))
            .unwrap();
    }
    collector.force_flush().unwrap();
    for ts in [10u64, 11] {
        collector
            .handle(
                Event::new("db-1", "io", ts)
                    .with_sample("reads", 2i64)
                    .with_sample("writes", 5i64),
            )
            .unwrap();
    }
    collector.force_flush().unwrap();

    collector.aggregate_now().unwrap().expect("pass ran");
    let valid = store.ranges_for_host(1, None, None).unwrap();
    assert_eq!(valid.len(), 1);
    let merged = &valid[0];
    assert_eq!(merged.chunks.len(), 2);
    for chunk in &merged.chunks {
        assert_eq!(chunk.sample_count, 4);
    }
    let writes = decode_chunk(&merged.chunks[1]).unwrap();
    assert_eq!(
        writes,
        vec![
            SampleValue::Null,
            SampleValue::Null,
            SampleValue::Int(5),
            SampleValue::Int(5)
        ]
    );
}

#[test]
fn test_readers_never_observe_a_half_applied_swap() {
    const RANGES: u64 = 30;
    const PER_RANGE: u64 = 5;

    let (collector, store) = collector(vec![3], 1);
    write_ranges(&collector, "web-1", "cpu", RANGES, PER_RANGE);
    let expected = (RANGES * PER_RANGE) as u32;

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = store.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut reads = 0u64;
            while !done.load(Ordering::SeqCst) || reads == 0 {
                let valid = store.ranges_for_host(1, None, None).expect("read");
                assert_eq!(total_samples(&valid), expected);
                assert_disjoint(&valid);
                reads += 1;
            }
            reads
        })
    };

    let summary = collector.aggregate_now().unwrap().expect("pass ran");
    done.store(true, Ordering::SeqCst);
    let reads = reader.join().expect("reader thread");
    assert!(reads > 0);
    assert_eq!(summary.aggregates_created, 10);
    assert_eq!(store.ranges_for_host(1, None, None).unwrap().len(), 10);
}

#[test]
fn test_keeping_sources_leaves_them_invalid() {
    let store = Arc::new(CatalogStore::in_memory());
    let cfg = CollectorConfig {
        background_writes: false,
        aggregation_enabled: false,
        chunks_to_aggregate: vec![2],
        delete_aggregated_chunks: false,
        deadline_jitter: Some(Arc::new(FixedJitter(1_000_000))),
        ..Default::default()
    };
    let collector = Collector::with_parts(
        cfg,
        store.clone(),
        Arc::new(InMemoryIdResolver::new()),
        Box::new(MemoryBackingLog::new()),
    )
    .unwrap();
    collector.replay().unwrap();
    write_ranges(&collector, "web-1", "cpu", 2, 2);
    collector.aggregate_now().unwrap().expect("pass ran");

    let all = store.ranges().unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all.iter().filter(|r| r.valid).count(), 1);
    assert_eq!(store.ranges_for_host(1, None, None).unwrap().len(), 1);
    // Level-0 candidates only include valid ranges.
    assert!(store.aggregation_candidates(0).unwrap().is_empty());
}

#[test]
fn test_background_aggregation_runs_on_its_interval() {
    let store = Arc::new(CatalogStore::in_memory());
    let cfg = CollectorConfig {
        background_writes: false,
        aggregation_enabled: true,
        aggregation_interval: Duration::from_millis(20),
        chunks_to_aggregate: vec![2],
        deadline_jitter: Some(Arc::new(FixedJitter(1_000_000))),
        ..Default::default()
    };
    let collector = Collector::with_parts(
        cfg,
        store.clone(),
        Arc::new(InMemoryIdResolver::new()),
        Box::new(MemoryBackingLog::new()),
    )
    .unwrap();
    collector.replay().unwrap();
    write_ranges(&collector, "web-1", "cpu", 2, 2);

    let mut merged = false;
    for _ in 0..200 {
        let valid = store.ranges_for_host(1, None, None).unwrap();
        if valid.len() == 1 && valid[0].time_range.aggregation_level == 1 {
            merged = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(merged, "timer-driven pass should have merged the two ranges");
    collector.shutdown().unwrap();
}
