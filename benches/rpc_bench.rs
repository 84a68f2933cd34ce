//! Criterion benchmarks for hot paths in ocpp-rt.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - OCPP-J message decode (serde_json array-shape parsing)
//!   - Connection-rate-limiter token bucket allow/deny
//!   - Radix-trie route matching

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ocpp_rt::rpc::message::decode;
use ocpp_rt::trie::RadixTrie;

// ─── OCPP-J message decode ──────────────────────────────────────────────────

static BOOT_NOTIFICATION: &str =
    r#"[2,"19223201","BootNotification",{"chargePointVendor":"Acme","chargePointModel":"X-100"}]"#;
static HEARTBEAT: &str = r#"[2,"19223202","Heartbeat",{}]"#;
static CALL_RESULT: &str = r#"[3,"19223201",{"currentTime":"2026-07-28T00:00:00Z","interval":300,"status":"Accepted"}]"#;

fn bench_decode(c: &mut Criterion) {
    c.bench_function("decode_boot_notification_call", |b| {
        b.iter(|| {
            black_box(decode(black_box(BOOT_NOTIFICATION)));
        });
    });

    c.bench_function("decode_heartbeat_call", |b| {
        b.iter(|| {
            black_box(decode(black_box(HEARTBEAT)));
        });
    });

    c.bench_function("decode_call_result", |b| {
        b.iter(|| {
            black_box(decode(black_box(CALL_RESULT)));
        });
    });
}

// ─── Connection rate limiter ────────────────────────────────────────────────

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

struct BenchBucket {
    map: HashMap<IpAddr, Vec<Instant>>,
    window_ms: u64,
    limit: usize,
}

impl BenchBucket {
    fn new(window_ms: u64, limit: usize) -> Self {
        Self {
            map: HashMap::new(),
            window_ms,
            limit,
        }
    }

    fn try_take(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let window = std::time::Duration::from_millis(self.window_ms);
        let entries = self.map.entry(ip).or_default();
        entries.retain(|t| now.duration_since(*t) < window);
        if entries.len() >= self.limit {
            return false;
        }
        entries.push(now);
        true
    }
}

fn bench_rate_limiter(c: &mut Criterion) {
    let ip: IpAddr = "192.168.1.100".parse().unwrap();

    c.bench_function("conn_rate_limiter_allow", |b| {
        b.iter_with_setup(
            || BenchBucket::new(1_000, 20),
            |mut bucket| {
                black_box(bucket.try_take(black_box(ip)));
            },
        );
    });

    c.bench_function("conn_rate_limiter_20_ips", |b| {
        let ips: Vec<IpAddr> = (1u8..=20)
            .map(|i| format!("10.0.0.{i}").parse().unwrap())
            .collect();
        b.iter_with_setup(
            || BenchBucket::new(1_000, 20),
            |mut bucket| {
                for ip in &ips {
                    black_box(bucket.try_take(black_box(*ip)));
                }
            },
        );
    });
}

// ─── Radix-trie route matching ──────────────────────────────────────────────

fn bench_trie_match(c: &mut Criterion) {
    let trie: RadixTrie<&'static str> = RadixTrie::new();
    trie.insert("/ocpp/:identity", "csms-handler").unwrap();
    trie.insert("/health", "health-handler").unwrap();
    trie.freeze();

    c.bench_function("trie_match_param_route", |b| {
        b.iter(|| {
            black_box(trie.match_path(black_box("/ocpp/CP001")));
        });
    });

    c.bench_function("trie_match_static_route", |b| {
        b.iter(|| {
            black_box(trie.match_path(black_box("/health")));
        });
    });
}

// ─── Entry point ─────────────────────────────────────────────────────────────

criterion_group!(benches, bench_decode, bench_rate_limiter, bench_trie_match);
criterion_main!(benches);
