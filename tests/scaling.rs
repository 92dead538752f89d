//! Scaling tests with synthetic stores of 10k+ records.
//!
//! Measures the main operations at size:
//! - Population through single-request transactions
//! - Full and ranged scans
//! - Index lookups
//! - Restart and WAL replay

use crossbeam_channel::Receiver;
use serde_json::{json, Value};
use std::time::Instant;
use storehouse::{
    Database, Engine, EngineConfig, Handlers, IndexSpec, RangeSpec, Result, Store, StoreOptions,
};
use tempfile::TempDir;

const RECORD_COUNT: usize = 10_000;

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        println!(
            "  {} took {:.2}ms ({} items, {:.0} items/sec)",
            self.name,
            ms,
            count,
            if ms > 0.0 { count as f64 / (ms / 1000.0) } else { 0.0 }
        );
    }
}

fn settle<T>(engine: &Engine, rx: Receiver<Result<T>>) -> Result<T> {
    engine.run_until_idle();
    rx.try_recv().expect("operation did not settle")
}

fn open_events(engine: &Engine) -> Database {
    let db = Database::new(engine, "scaling");
    let (handlers, rx) = Handlers::channel();
    db.open_with_upgrade(
        1,
        |upgrade| {
            let events = upgrade.create_store("events", StoreOptions::with_key_path("seq"))?;
            events.create_index(IndexSpec::new("by_kind", "kind"))?;
            Ok(())
        },
        handlers,
    );
    settle(engine, rx).unwrap();
    db
}

fn event(seq: usize) -> Value {
    json!({
        "seq": seq,
        "kind": format!("kind-{}", seq % 10),
        "payload": {"n": seq, "text": "x".repeat(32)},
    })
}

/// Issue writes in batches, turning the loop between them.
fn populate(engine: &Engine, events: &Store, count: usize) {
    for seq in 0..count {
        events.add(event(seq), Handlers::ignore());
        if seq % 256 == 255 {
            engine.run_until_idle();
        }
    }
    engine.run_until_idle();
}

#[test]
fn test_scaling_in_memory() {
    println!("\n=== Scaling: {} records in memory ===", RECORD_COUNT);
    let engine = Engine::in_memory();
    let db = open_events(&engine);
    let events = db.store("events").unwrap();

    let timer = Timer::new("populate");
    populate(&engine, &events, RECORD_COUNT);
    timer.report_with_count(RECORD_COUNT);

    let timer = Timer::new("get_all");
    let (handlers, rx) = Handlers::channel();
    events.get_all(handlers);
    let all = settle(&engine, rx).unwrap();
    timer.report_with_count(all.len());
    assert_eq!(all.len(), RECORD_COUNT);
    assert!(all.windows(2).all(|w| w[0]["seq"].as_u64() < w[1]["seq"].as_u64()));

    let timer = Timer::new("get_range");
    let (handlers, rx) = Handlers::channel();
    events.get_range(RangeSpec::new().lower(1_000, false).upper(2_000, true), handlers);
    let range = settle(&engine, rx).unwrap();
    timer.report_with_count(range.len());
    assert_eq!(range.len(), 1_000);
    assert_eq!(range[0]["seq"], json!(1_000));

    let timer = Timer::new("index range");
    let (handlers, rx) = Handlers::channel();
    events.get_range_from_index(
        "by_kind",
        RangeSpec::new().lower("kind-3", false).upper("kind-3", false),
        handlers,
    );
    let kind = settle(&engine, rx).unwrap();
    timer.report_with_count(kind.len());
    assert_eq!(kind.len(), RECORD_COUNT / 10);

    let timer = Timer::new("point gets");
    for seq in (0..RECORD_COUNT).step_by(100) {
        let (handlers, rx) = Handlers::channel();
        events.get(seq as u64, handlers);
        assert!(settle(&engine, rx).unwrap().is_some());
    }
    timer.report_with_count(RECORD_COUNT / 100);
}

#[test]
fn test_scaling_restart_replays_wal() {
    println!("\n=== Scaling: restart with {} logged records ===", RECORD_COUNT);
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        path: Some(dir.path().join("data")),
        create_if_missing: true,
        checkpoint_every: 0,
        sync_writes: false,
    };

    {
        let engine = Engine::new(config.clone()).unwrap();
        let db = open_events(&engine);
        let events = db.store("events").unwrap();

        let timer = Timer::new("populate (durable)");
        populate(&engine, &events, RECORD_COUNT);
        timer.report_with_count(RECORD_COUNT);
    }

    let timer = Timer::new("recover");
    let engine = Engine::new(config).unwrap();
    timer.report_with_count(RECORD_COUNT);

    let db = Database::new(&engine, "scaling");
    let (handlers, rx) = Handlers::channel();
    db.open(1, handlers);
    settle(&engine, rx).unwrap();

    let (handlers, rx) = Handlers::channel();
    db.store("events").unwrap().count(handlers);
    assert_eq!(settle(&engine, rx).unwrap(), RECORD_COUNT as u64);
}
