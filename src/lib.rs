//! # Storehouse
//!
//! A callback-driven client layer over a versioned, transactional
//! key-value engine: named object stores, secondary indexes, key ranges
//! and cursors, all reported through success/error continuations.
//!
//! ## Core Concepts
//!
//! - **Engine**: owns the data, schedules transactions, and delivers every
//!   completion on a later turn of its event loop. In memory by default,
//!   optionally durable (snapshot + write-ahead log).
//! - **Database**: a handle that opens a named database at a version and
//!   runs the upgrade callback when the version moves forward.
//! - **Store**: per-store proxy with add/get/put/delete, full and ranged
//!   scans, index lookups, and a dispatch facade.
//! - **Handlers**: the success/error continuations; exactly one runs, once.
//!
//! ## Example
//!
//! ```ignore
//! use storehouse::{Database, Engine, Handlers, IndexSpec, RangeSpec, StoreOptions};
//! use serde_json::json;
//!
//! let engine = Engine::in_memory();
//! let db = Database::new(&engine, "app");
//!
//! db.open_with_upgrade(1, |upgrade| {
//!     let people = upgrade.create_store("people", StoreOptions::with_key_path("id"))?;
//!     people.create_index(IndexSpec::new("by_email", "email").unique(true))?;
//!     Ok(())
//! }, Handlers::ignore());
//! engine.run_until_idle();
//!
//! let people = db.store("people")?;
//! people.add(json!({"id": 1, "email": "a@example.com"}), Handlers::ignore());
//! people.get_range(
//!     RangeSpec::new().lower(1, false),
//!     Handlers::new(|records| println!("{:?}", records)),
//! );
//! engine.run_until_idle();
//! ```

pub mod database;
pub mod engine;
pub mod error;
pub mod range;
pub mod types;

// Re-exports
pub use database::{
    BoundRequest, Database, Handlers, Lifecycle, Operation, OperationRequest, Outcome, Store,
    Upgrade,
};
pub use engine::{
    Connection, Cursor, Engine, EngineConfig, Index, ObjectStore, Transaction, UpgradeStore,
    UpgradeTransaction,
};
pub use error::{Result, StoreError};
pub use range::{Endpoint, KeyRange, RangeSpec};
pub use types::*;
