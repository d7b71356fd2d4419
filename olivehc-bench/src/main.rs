//! Deterministic micro-benchmark harness for the allocator-adjacent data
//! structures, grounded on `hkv-engine`'s `bench_engine` idiom: a fixed
//! synthetic workload, wall-clock timing around it, and throughput printed
//! to stdout rather than wired into a benchmarking framework. No random
//! input — every run walks the same sequence of fingerprints/sizes so two
//! runs are directly comparable.

use std::time::Instant;

use olivehc_common::Fingerprint;
use olivehc_core::device::Device;
use olivehc_core::hash::LinearHash;

const ITEM_COUNT: usize = 200_000;
const DEVICE_CAPACITY: u64 = 8 * (1 << 30);

fn main() {
    bench_hash_insert();
    bench_hash_lookup();
    bench_device_alloc_free_cycle();
}

fn fingerprint_for(i: u64) -> Fingerprint {
    Fingerprint { low: i, high: i.wrapping_mul(0x9E3779B97F4A7C15) }
}

fn bench_hash_insert() {
    let mut hash: LinearHash<u64> = LinearHash::new();
    let start = Instant::now();
    for i in 0..ITEM_COUNT as u64 {
        hash.insert(fingerprint_for(i), i);
    }
    report("hash insert", ITEM_COUNT, start.elapsed());
}

fn bench_hash_lookup() {
    let mut hash: LinearHash<u64> = LinearHash::new();
    for i in 0..ITEM_COUNT as u64 {
        hash.insert(fingerprint_for(i), i);
    }
    let start = Instant::now();
    let mut hits = 0u64;
    for i in 0..ITEM_COUNT as u64 {
        if hash.get(fingerprint_for(i)).is_some() {
            hits += 1;
        }
    }
    assert_eq!(hits, ITEM_COUNT as u64, "every inserted fingerprint must be found");
    report("hash lookup", ITEM_COUNT, start.elapsed());
}

/// Allocates and immediately frees a fixed-size block in a tight loop, the
/// steady-state traffic pattern `device.c`'s order list and `ipbucket`
/// index are tuned for (allocate, serve, evict-or-expire, repeat).
fn bench_device_alloc_free_cycle() {
    let mut device = Device::new(DEVICE_CAPACITY);
    let start = Instant::now();
    for i in 0..ITEM_COUNT as u64 {
        let (_, key) = device.get_free_block(4096, i).expect("device has ample capacity");
        device.return_free_block(key, 4096, false);
    }
    report("device alloc/free cycle", ITEM_COUNT, start.elapsed());
}

fn report(label: &str, count: usize, elapsed: std::time::Duration) {
    let per_op_ns = elapsed.as_nanos() as f64 / count as f64;
    println!("{label}: {count} ops in {elapsed:?} ({per_op_ns:.1} ns/op)");
}
