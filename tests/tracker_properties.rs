//! Counter invariants over long pseudo-random alloc/free sequences.

use std::collections::HashMap;

use memprof::{BlockInfo, MemoryTracker};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn run_sequence(seed: u64, steps: usize) {
    let tracker = MemoryTracker::new();
    let mut model: HashMap<usize, usize> = HashMap::new();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut peak = 0usize;
    let mut last_total_allocs = 0;
    let mut last_total_bytes = 0;

    for _ in 0..steps {
        // A small address space makes frees of tracked and untracked
        // addresses equally likely.
        let address = rng.random_range(1..=64usize) * 16;
        if rng.random_range(0..3) == 0 {
            tracker.on_free(address, false);
            model.remove(&address);
        } else {
            let size = rng.random_range(1..=4096usize);
            tracker.on_alloc(address, size, None, None, 0, false);
            model.insert(address, size);
        }

        let stats = tracker.stats();
        let active: usize = model.values().sum();
        peak = peak.max(active);

        assert_eq!(stats.active_allocs, model.len());
        assert_eq!(stats.active_bytes, active);
        assert_eq!(stats.peak_bytes, peak);
        assert!(stats.active_bytes <= stats.peak_bytes);
        assert!(stats.total_allocs >= last_total_allocs);
        assert!(stats.total_bytes >= last_total_bytes);
        last_total_allocs = stats.total_allocs;
        last_total_bytes = stats.total_bytes;
    }

    let live = tracker.snapshot_live();
    assert_eq!(live.len(), model.len());
    for record in &live {
        assert_eq!(model.get(&record.address), Some(&record.size));
    }
    assert_eq!(
        live.iter().map(|r| r.size).sum::<usize>(),
        tracker.active_bytes()
    );
}

#[test]
fn counters_match_a_reference_model() {
    for seed in [1u64, 7, 0xdead_beef, 0x1234_5678_9abc] {
        run_sequence(seed, 2_000);
    }
}

#[test]
fn freeing_everything_returns_to_zero() {
    let tracker = MemoryTracker::new();
    for i in 1..=500usize {
        tracker.on_alloc(i * 32, i, Some("Blob"), Some("blob.rs"), i as u32, i % 2 == 0);
    }
    let peak = tracker.peak_bytes();
    assert_eq!(peak, (1..=500).sum::<usize>());
    for i in (1..=500usize).rev() {
        tracker.on_free(i * 32, i % 2 == 0);
    }
    let stats = tracker.stats();
    assert_eq!(stats.active_allocs, 0);
    assert_eq!(stats.active_bytes, 0);
    assert_eq!(stats.peak_bytes, peak);
    assert_eq!(stats.total_allocs, 500);
    assert!(tracker.snapshot_live().is_empty());
}

#[test]
fn blocks_carry_record_fields() {
    let tracker = MemoryTracker::new();
    tracker.on_alloc(0x1000, 24, Some("Edge"), Some("src/graph.rs"), 88, true);
    let record = tracker.snapshot_live()[0];
    let block = BlockInfo::from_record(&record, 5);
    assert_eq!(block.ptr, 0x1000);
    assert_eq!(block.size, 24);
    assert_eq!(block.alloc_id, 5);
    assert_eq!(block.thread_id, record.thread_id);
    assert_eq!(block.t_ns, record.timestamp_ns);
    assert_eq!(block.callsite, "src/graph.rs:88");
    assert_eq!(block.file, "src/graph.rs");
    assert_eq!(block.line, 88);
    assert_eq!(block.type_name, "Edge");
}
