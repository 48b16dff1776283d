// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Single-attachment cache behavior: round-trips, replace-in-place,
// failure semantics, counters and whole-region operations.

use std::sync::atomic::{AtomicUsize, Ordering};

use shmcache::{Cache, CacheError, MAX_VALUE_SIZE};

const SIZE: usize = 16 * 1024 * 1024;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_cache_{}_{n}", std::process::id())
}

fn open_fresh(prefix: &str) -> Cache {
    let name = unique_name(prefix);
    Cache::clear_storage(&name);
    Cache::open(&name, SIZE).expect("cache open")
}

#[test]
fn set_get_round_trip() {
    let cache = open_fresh("roundtrip");

    cache.set(b"foo", b"bar", false).unwrap();
    let value = cache.get(b"foo").unwrap().expect("entry present");
    assert_eq!(value.bytes, b"bar");
    assert!(!value.serialized);

    cache.destroy().unwrap();
}

#[test]
fn get_missing_returns_none() {
    let cache = open_fresh("missing");
    assert!(cache.get(b"nothing").unwrap().is_none());
    cache.destroy().unwrap();
}

#[test]
fn serialized_flag_round_trips() {
    let cache = open_fresh("flag");

    cache.set(b"s", b"\x01\x02\x03", true).unwrap();
    let value = cache.get(b"s").unwrap().expect("entry present");
    assert!(value.serialized);
    assert_eq!(value.bytes, vec![1, 2, 3]);

    cache.set(b"s", b"plain", false).unwrap();
    assert!(!cache.get(b"s").unwrap().unwrap().serialized);

    cache.destroy().unwrap();
}

#[test]
fn smaller_value_replaces_in_place() {
    let cache = open_fresh("inplace");

    cache.set(b"k", b"AAAAAA", false).unwrap();
    let first = cache.chunk_offset(b"k").unwrap().expect("offset");

    cache.set(b"k", b"BB", false).unwrap();
    let second = cache.chunk_offset(b"k").unwrap().expect("offset");

    assert_eq!(first, second, "small overwrite must reuse the chunk");
    assert_eq!(cache.get(b"k").unwrap().unwrap().bytes, b"BB");

    // Anything within the original reservation still replaces in place.
    cache.set(b"k", &[0x55u8; 128], false).unwrap();
    assert_eq!(cache.chunk_offset(b"k").unwrap().unwrap(), first);

    cache.destroy().unwrap();
}

#[test]
fn growing_value_moves_chunks() {
    let cache = open_fresh("grow");

    cache.set(b"k", b"small", false).unwrap();
    // A second live entry keeps the freed chunk away from the zone
    // boundary, so the grown value cannot reuse the old offset.
    cache.set(b"pin", b"pin", false).unwrap();
    let first = cache.chunk_offset(b"k").unwrap().expect("offset");

    cache.set(b"k", &[0xAAu8; 4096], false).unwrap();
    let second = cache.chunk_offset(b"k").unwrap().expect("offset");

    assert_ne!(first, second);
    assert_eq!(cache.get(b"k").unwrap().unwrap().bytes, vec![0xAA; 4096]);
    cache.validate().unwrap();

    cache.destroy().unwrap();
}

#[test]
fn oversize_set_fails_and_drops_previous_entry() {
    let cache = open_fresh("oversize");

    cache.set(b"k", b"v", false).unwrap();
    let huge = vec![0u8; MAX_VALUE_SIZE as usize + 1];
    assert!(matches!(
        cache.set(b"k", &huge, false),
        Err(CacheError::ValueTooLarge { .. })
    ));
    assert!(cache.get(b"k").unwrap().is_none());

    cache.destroy().unwrap();
}

#[test]
fn largest_value_fits_exactly() {
    let cache = open_fresh("maxval");

    let value = vec![0x5Au8; MAX_VALUE_SIZE as usize];
    cache.set(b"big", &value, false).unwrap();
    assert_eq!(cache.get(b"big").unwrap().unwrap().bytes, value);
    cache.validate().unwrap();

    cache.destroy().unwrap();
}

#[test]
fn add_fails_on_existing_key() {
    let cache = open_fresh("add");

    cache.add(b"k", b"one", false).unwrap();
    assert!(matches!(
        cache.add(b"k", b"two", false),
        Err(CacheError::AlreadyExists)
    ));
    assert_eq!(cache.get(b"k").unwrap().unwrap().bytes, b"one");

    cache.destroy().unwrap();
}

#[test]
fn replace_fails_on_missing_key() {
    let cache = open_fresh("replace");

    assert!(matches!(
        cache.replace(b"k", b"v", false),
        Err(CacheError::NotFound)
    ));
    cache.set(b"k", b"v", false).unwrap();
    cache.replace(b"k", b"w", false).unwrap();
    assert_eq!(cache.get(b"k").unwrap().unwrap().bytes, b"w");

    cache.destroy().unwrap();
}

#[test]
fn delete_is_not_idempotent() {
    let cache = open_fresh("delete");

    cache.set(b"k", b"v", false).unwrap();
    cache.delete(b"k").unwrap();
    assert!(matches!(cache.delete(b"k"), Err(CacheError::NotFound)));
    assert!(cache.get(b"k").unwrap().is_none());
    cache.validate().unwrap();

    cache.destroy().unwrap();
}

#[test]
fn exists_does_not_touch_counters() {
    let cache = open_fresh("exists");

    assert!(!cache.exists(b"k").unwrap());
    cache.set(b"k", b"v", false).unwrap();
    assert!(cache.exists(b"k").unwrap());

    let stats = cache.stats().unwrap();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.misses, 0);

    cache.destroy().unwrap();
}

#[test]
fn hit_and_miss_counters_accumulate() {
    let cache = open_fresh("counters");

    cache.set(b"k", b"v", false).unwrap();
    cache.get(b"k").unwrap();
    cache.get(b"k").unwrap();
    cache.get(b"absent").unwrap();

    let stats = cache.stats().unwrap();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);

    // Counters are shared: a second attachment sees the flushed values.
    cache.flush_stats().unwrap();
    let other = Cache::open(cache.name(), SIZE).unwrap();
    let stats = other.stats().unwrap();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 1);

    drop(other);
    cache.destroy().unwrap();
}

#[test]
fn increment_and_decrement_semantics() {
    let cache = open_fresh("incr");

    assert_eq!(cache.increment(b"n", 1, 0).unwrap(), 1);
    assert_eq!(cache.increment(b"n", 2, 0).unwrap(), 3);
    assert_eq!(cache.get(b"n").unwrap().unwrap().bytes, b"3");

    cache.set(b"n", b"xyz", false).unwrap();
    assert!(matches!(
        cache.increment(b"n", 1, 0),
        Err(CacheError::NotNumeric)
    ));

    cache.delete(b"n").unwrap();
    assert_eq!(cache.decrement(b"n", 5, 3).unwrap(), 3);
    assert_eq!(cache.decrement(b"n", 5, 3).unwrap(), 0);
    assert_eq!(cache.decrement(b"n", 7, 3).unwrap(), 0);

    cache.destroy().unwrap();
}

#[test]
fn increment_rejects_serialized_values() {
    let cache = open_fresh("incr_flag");

    cache.set(b"n", b"42", true).unwrap();
    assert!(matches!(
        cache.increment(b"n", 1, 0),
        Err(CacheError::NotNumeric)
    ));

    cache.destroy().unwrap();
}

#[test]
fn flush_empties_the_cache() {
    let cache = open_fresh("flush");

    for i in 0..50 {
        let key = format!("key{i}");
        cache.set(key.as_bytes(), b"payload", false).unwrap();
    }
    assert!(cache.stats().unwrap().items == 50);

    cache.flush().unwrap();

    assert_eq!(cache.stats().unwrap().items, 0);
    for i in 0..50 {
        let key = format!("key{i}");
        assert!(cache.get(key.as_bytes()).unwrap().is_none());
    }
    cache.validate().unwrap();

    cache.destroy().unwrap();
}

#[test]
fn keys_are_validated() {
    let cache = open_fresh("badkey");

    assert!(matches!(
        cache.set(b"", b"v", false),
        Err(CacheError::InvalidKey)
    ));
    assert!(matches!(
        cache.set(&[b'a'; 201], b"v", false),
        Err(CacheError::InvalidKey)
    ));
    assert!(matches!(
        cache.set(b"nul\0key", b"v", false),
        Err(CacheError::InvalidKey)
    ));
    // 200 bytes is the longest legal key.
    cache.set(&[b'a'; 200], b"v", false).unwrap();
    assert!(cache.exists(&[b'a'; 200]).unwrap());

    cache.destroy().unwrap();
}

#[test]
fn too_small_region_is_rejected() {
    let name = unique_name("small");
    assert!(matches!(
        Cache::open(&name, 8 * 1024 * 1024),
        Err(CacheError::RegionTooSmall(_))
    ));
}

#[test]
fn second_attachment_sees_existing_entries() {
    let cache = open_fresh("attach");
    cache.set(b"shared", b"data", false).unwrap();

    let other = Cache::open(cache.name(), SIZE).unwrap();
    assert_eq!(other.get(b"shared").unwrap().unwrap().bytes, b"data");
    other.set(b"back", b"channel", false).unwrap();
    assert_eq!(cache.get(b"back").unwrap().unwrap().bytes, b"channel");

    drop(other);
    cache.destroy().unwrap();
}

#[test]
fn random_deletes_keep_invariants() {
    use rand::Rng;
    let cache = open_fresh("randel");
    let mut rng = rand::thread_rng();

    let mut keys: Vec<String> = (0..200).map(|i| format!("key{i}")).collect();
    for key in &keys {
        let len = rng.gen_range(1..=4096);
        cache.set(key.as_bytes(), &vec![0xC3u8; len], false).unwrap();
    }

    while !keys.is_empty() {
        let at = rng.gen_range(0..keys.len());
        let key = keys.swap_remove(at);
        cache.delete(key.as_bytes()).unwrap();
        if keys.len() % 25 == 0 {
            cache.validate().unwrap();
        }
    }

    cache.validate().unwrap();
    assert_eq!(cache.stats().unwrap().items, 0);

    cache.destroy().unwrap();
}
