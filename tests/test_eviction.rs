// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// FIFO zone eviction under memory pressure. A 16 MiB region has 15 zones;
// once the ring is full every allocation that does not fit the newest zone
// wipes the oldest zone wholesale.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use shmcache::{Cache, MAX_VALUE_SIZE};

const SIZE: usize = 16 * 1024 * 1024;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_evict_{}_{n}", std::process::id())
}

fn open_fresh(prefix: &str) -> Cache {
    let name = unique_name(prefix);
    Cache::clear_storage(&name);
    Cache::open(&name, SIZE).expect("cache open")
}

#[test]
fn full_zone_values_evict_fifo() {
    let cache = open_fresh("full_zones");
    assert_eq!(cache.zone_count(), 15);

    // Each value fills a whole zone, so the ring holds exactly 15 entries.
    for i in 0..100 {
        let key = format!("foo{i}");
        let value = vec![(i % 251) as u8; MAX_VALUE_SIZE as usize];
        cache.set(key.as_bytes(), &value, false).unwrap();
    }

    for i in 85..100 {
        let key = format!("foo{i}");
        let value = cache.get(key.as_bytes()).unwrap().expect("recent key kept");
        assert_eq!(value.bytes.len(), MAX_VALUE_SIZE as usize);
        assert!(value.bytes.iter().all(|&b| b == (i % 251) as u8));
    }
    for i in [0usize, 1, 42, 84] {
        let key = format!("foo{i}");
        assert!(cache.get(key.as_bytes()).unwrap().is_none(), "foo{i} evicted");
    }

    let stats = cache.stats().unwrap();
    assert_eq!(stats.items, 15);
    cache.validate().unwrap();

    cache.destroy().unwrap();
}

#[test]
fn mixed_sizes_keep_most_recent_keys() {
    let cache = open_fresh("mixed");
    let mut rng = rand::thread_rng();

    let total = 1000usize;
    let mut recent: Vec<(String, Vec<u8>)> = Vec::new();
    for i in 0..total {
        let key = format!("key{i}");
        let len = rng.gen_range(1..=MAX_VALUE_SIZE as usize);
        let value = vec![(i % 256) as u8; len];
        cache.set(key.as_bytes(), &value, false).unwrap();
        recent.push((key, value));
        if recent.len() > 15 {
            recent.remove(0);
        }
    }

    // A 15-zone ring can never have wiped the zones the last 15 writes
    // landed in, whatever their sizes were.
    for (key, value) in &recent {
        let got = cache.get(key.as_bytes()).unwrap().expect("recent key kept");
        assert_eq!(&got.bytes, value);
    }
    cache.validate().unwrap();

    cache.destroy().unwrap();
}

#[test]
fn eviction_counts_stay_consistent() {
    let cache = open_fresh("consistent");

    // Four of these fit a zone (with a little slack), so the 15-zone ring
    // tops out at 60 entries.
    let len = 260_000usize;
    for i in 0..200 {
        let key = format!("q{i}");
        cache.set(key.as_bytes(), &vec![0x77u8; len], false).unwrap();
    }

    let stats = cache.stats().unwrap();
    assert!(stats.items <= 60, "ring cannot hold more than 60 entries");
    assert!(stats.items >= 45, "eviction should only reclaim whole zones");
    assert_eq!(stats.used_value_bytes, stats.items * len as u64);
    cache.validate().unwrap();

    cache.destroy().unwrap();
}

#[test]
fn overwrites_survive_eviction_pressure() {
    let cache = open_fresh("overwrite");
    let mut rng = rand::thread_rng();

    // Keep rewriting a small working set while churning filler through the
    // ring; the working set keys must always resolve to their last value.
    let mut last: Vec<Vec<u8>> = vec![Vec::new(); 8];
    for round in 0..120 {
        for (slot, entry) in last.iter_mut().enumerate() {
            let len = rng.gen_range(1..=2048);
            let value = vec![(round * 8 + slot) as u8; len];
            cache
                .set(format!("hot{slot}").as_bytes(), &value, false)
                .unwrap();
            *entry = value;
        }
        let filler = vec![0xEEu8; rng.gen_range(1..=MAX_VALUE_SIZE as usize / 2)];
        cache
            .set(format!("filler{round}").as_bytes(), &filler, false)
            .unwrap();
    }

    // In-place rewrites do not refresh an entry's FIFO position, so a hot
    // key may have been swept out with its zone — but a surviving key must
    // resolve to exactly its last written value.
    for (slot, entry) in last.iter().enumerate() {
        if let Some(got) = cache.get(format!("hot{slot}").as_bytes()).unwrap() {
            assert_eq!(&got.bytes, entry);
        }
    }
    cache.validate().unwrap();

    cache.destroy().unwrap();
}
