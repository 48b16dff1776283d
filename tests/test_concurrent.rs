// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Concurrent attachments hammering one cache. Each worker opens its own
// handle — the same thing independent processes do — so these exercise the
// full cross-attachment lock protocol, including eviction's try-lock
// rollback under contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rand::Rng;
use shmcache::{Cache, CacheError};

const SIZE: usize = 16 * 1024 * 1024;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_par_{}_{n}", std::process::id())
}

#[test]
fn disjoint_key_writers_do_not_corrupt() {
    const WORKERS: usize = 4;
    const KEYS_PER_WORKER: usize = 40;
    const ROUNDS: usize = 6;

    for _ in 0..ROUNDS {
        let name = unique_name("disjoint");
        Cache::clear_storage(&name);
        let cache = Cache::open(&name, SIZE).expect("cache open");

        let written: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let name = name.clone();
                let written = Arc::clone(&written);
                thread::spawn(move || {
                    let cache = Cache::open(&name, SIZE).expect("attach");
                    let mut rng = rand::thread_rng();
                    let mut mine = Vec::with_capacity(KEYS_PER_WORKER);
                    for i in 0..KEYS_PER_WORKER {
                        let key = format!("w{worker}k{i}");
                        let len = rng.gen_range(1..=768 * 1024);
                        let mut value = vec![0u8; len];
                        rng.fill(&mut value[..]);
                        cache.set(key.as_bytes(), &value, false).expect("set");
                        mine.push((key, value));
                    }
                    written.lock().unwrap().extend(mine);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        cache.validate().expect("invariants hold at quiescence");

        // Every key that survived the FIFO churn must return the exact
        // bytes its writer stored.
        for (key, value) in written.lock().unwrap().iter() {
            if let Some(got) = cache.get(key.as_bytes()).expect("get") {
                assert_eq!(&got.bytes, value, "payload mismatch for {key}");
            }
        }

        cache.destroy().unwrap();
    }
}

#[test]
fn same_key_contention_settles_on_one_write() {
    const WORKERS: usize = 4;
    const SETS_PER_WORKER: usize = 100;

    let name = unique_name("samekey");
    Cache::clear_storage(&name);
    let cache = Cache::open(&name, SIZE).expect("cache open");

    let written: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let name = name.clone();
            let written = Arc::clone(&written);
            thread::spawn(move || {
                let cache = Cache::open(&name, SIZE).expect("attach");
                let mut rng = rand::thread_rng();
                for i in 0..SETS_PER_WORKER {
                    let len = rng.gen_range(1..=64);
                    let mut value = vec![worker as u8; len];
                    value[0] = (i % 256) as u8;
                    cache.set(b"identicalkey", &value, false).expect("set");
                    // Read-your-writes is not guaranteed across racing
                    // writers, but the slot always holds *some* valid write.
                    assert!(cache.get(b"identicalkey").expect("get").is_some());
                    written.lock().unwrap().push(value);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let finale = cache
        .get(b"identicalkey")
        .unwrap()
        .expect("key present after all writers finish");
    let written = written.lock().unwrap();
    assert!(
        written.iter().any(|v| v == &finale.bytes),
        "final value must be one of the written values"
    );

    cache.validate().unwrap();
    cache.destroy().unwrap();
}

#[test]
fn mixed_readers_and_writers() {
    const WRITERS: usize = 2;
    const READERS: usize = 2;

    let name = unique_name("mixed_rw");
    Cache::clear_storage(&name);
    let cache = Cache::open(&name, SIZE).expect("cache open");
    for i in 0..32 {
        cache
            .set(format!("seed{i}").as_bytes(), &vec![i as u8; 512], false)
            .unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..WRITERS {
        let name = name.clone();
        handles.push(thread::spawn(move || {
            let cache = Cache::open(&name, SIZE).expect("attach");
            let mut rng = rand::thread_rng();
            for i in 0..300 {
                let key = format!("seed{}", rng.gen_range(0..32));
                match i % 3 {
                    0 => {
                        let len = rng.gen_range(1..=8192);
                        cache.set(key.as_bytes(), &vec![worker as u8; len], false).expect("set");
                    }
                    1 => {
                        let _ = cache.increment(format!("ctr{worker}").as_bytes(), 1, 0);
                    }
                    _ => match cache.delete(key.as_bytes()) {
                        Ok(()) | Err(CacheError::NotFound) => {}
                        Err(e) => panic!("delete failed: {e}"),
                    },
                }
            }
        }));
    }
    for _ in 0..READERS {
        let name = name.clone();
        handles.push(thread::spawn(move || {
            let cache = Cache::open(&name, SIZE).expect("attach");
            let mut rng = rand::thread_rng();
            for _ in 0..600 {
                let key = format!("seed{}", rng.gen_range(0..32));
                let _ = cache.get(key.as_bytes()).expect("get");
                let _ = cache.exists(key.as_bytes()).expect("exists");
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    // Each writer owned its counter, so the final counts are exact.
    for worker in 0..WRITERS {
        let value = cache
            .get(format!("ctr{worker}").as_bytes())
            .unwrap()
            .expect("counter present");
        assert_eq!(value.bytes, b"100");
    }

    cache.validate().unwrap();
    cache.destroy().unwrap();
}
