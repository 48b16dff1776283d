// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Usage: demo_kv [cache-name]   (run multiple instances in separate terminals)
//
// Every instance attaches to the same named cache; writes from one are
// immediately visible to the others. Commands:
//
//   set <key> <value>     get <key>        del <key>
//   incr <key> [delta]    decr <key> [delta]
//   stats                 flush            q

use std::io::{self, BufRead, Write};

use shmcache::{Cache, CacheError};

const DEFAULT_NAME: &str = "shmcache-demo";
const DEFAULT_SIZE: usize = 16 * 1024 * 1024;

fn main() {
    env_logger::init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_NAME.to_string());
    let cache = Cache::open(&name, DEFAULT_SIZE).expect("cache open");
    println!(
        "attached to '{}' ({} zones). Type 'help' for commands.",
        cache.name(),
        cache.zone_count()
    );

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let mut parts = line.trim().splitn(3, ' ');
        let cmd = parts.next().unwrap_or("");
        let key = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");

        let outcome = match cmd {
            "" => continue,
            "q" | "quit" => break,
            "help" => {
                println!("set/get/del <key> [value], incr/decr <key> [delta], stats, flush, q");
                continue;
            }
            "set" => cache.set(key.as_bytes(), rest.as_bytes(), false).map(|_| {
                println!("stored");
            }),
            "get" => cache.get(key.as_bytes()).map(|found| match found {
                Some(value) => println!("{}", String::from_utf8_lossy(&value.bytes)),
                None => println!("(not found)"),
            }),
            "del" => cache.delete(key.as_bytes()).map(|_| {
                println!("deleted");
            }),
            "incr" | "decr" => {
                let delta: i64 = rest.trim().parse().unwrap_or(1);
                let result = if cmd == "incr" {
                    cache.increment(key.as_bytes(), delta, 0)
                } else {
                    cache.decrement(key.as_bytes(), delta, 0)
                };
                result.map(|new| println!("{new}"))
            }
            "stats" => cache.stats().map(|s| {
                println!(
                    "items={} value_bytes={} alloc_bytes={} hits={} misses={} oldest_zone={}",
                    s.items, s.used_value_bytes, s.used_alloc_bytes, s.hits, s.misses,
                    s.oldest_zone_index
                );
            }),
            "flush" => cache.flush().map(|_| {
                println!("flushed");
            }),
            other => {
                println!("unknown command '{other}' (try 'help')");
                continue;
            }
        };

        match outcome {
            Ok(()) => {}
            Err(CacheError::NotFound) => println!("(not found)"),
            Err(e) => println!("error: {e}"),
        }
    }
}
