//! Error handling tests: every failure reaches the error continuation,
//! exactly once, on a later turn.

use crossbeam_channel::{unbounded, Receiver};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use storehouse::{
    Database, Engine, Handlers, IndexSpec, Key, Lifecycle, OperationRequest, RangeSpec, Result,
    StoreError, StoreOptions,
};

fn settle<T>(engine: &Engine, rx: Receiver<Result<T>>) -> Result<T> {
    engine.run_until_idle();
    rx.try_recv().expect("operation did not settle")
}

fn open_db(engine: &Engine) -> Database {
    let db = Database::new(engine, "app");
    let (handlers, rx) = Handlers::channel();
    db.open_with_upgrade(
        1,
        |upgrade| {
            let people = upgrade.create_store("people", StoreOptions::with_key_path("id"))?;
            people.create_index(IndexSpec::new("by_email", "email").unique(true))?;
            upgrade.create_store("blobs", StoreOptions::default())?;
            Ok(())
        },
        handlers,
    );
    settle(engine, rx).unwrap();
    db
}

#[test]
fn test_open_lower_version_is_connection_error() {
    let engine = Engine::in_memory();
    drop(open_db(&engine));

    let db = Database::new(&engine, "app");
    let (handlers, rx) = Handlers::channel();
    db.open(0, handlers);
    assert!(matches!(
        settle(&engine, rx),
        Err(StoreError::Connection { .. })
    ));

    let (handlers, rx) = Handlers::channel();
    db.open(1, handlers);
    settle(&engine, rx).unwrap();

    // Bump the stored version, then ask for the old one.
    let newer = Database::new(&engine, "app");
    let (handlers, rx) = Handlers::channel();
    newer.open(3, handlers);
    settle(&engine, rx).unwrap();

    let older = Database::new(&engine, "app");
    let (handlers, rx) = Handlers::channel();
    older.open(2, handlers);
    match settle(&engine, rx) {
        Err(StoreError::Connection { name, source }) => {
            assert_eq!(name, "app");
            assert!(matches!(
                *source,
                StoreError::Version {
                    requested: 2,
                    stored: 3
                }
            ));
        }
        other => panic!("expected a connection error, got {:?}", other),
    }
    assert_eq!(older.lifecycle(), Lifecycle::Failed);
    assert!(matches!(older.store("people"), Err(StoreError::InvalidState(_))));
}

#[test]
fn test_failed_upgrade_leaves_nothing_behind() {
    let engine = Engine::in_memory();
    let db = Database::new(&engine, "app");

    let (handlers, rx) = Handlers::channel();
    db.open_with_upgrade(
        1,
        |upgrade| {
            upgrade.create_store("people", StoreOptions::default())?;
            upgrade.create_store("people", StoreOptions::default())?;
            Ok(())
        },
        handlers,
    );
    assert!(matches!(
        settle(&engine, rx),
        Err(StoreError::Connection { .. })
    ));
    assert_eq!(db.lifecycle(), Lifecycle::Failed);
    assert!(db.store_names().is_empty());
    assert_eq!(engine.database_version("app"), None);

    // The handle can be opened again.
    let (handlers, rx) = Handlers::channel();
    db.open(1, handlers);
    settle(&engine, rx).unwrap();
    assert_eq!(db.lifecycle(), Lifecycle::Open);
    assert!(db.store_names().is_empty());
}

#[test]
fn test_invalid_store_options_fail_the_open() {
    let engine = Engine::in_memory();
    let db = Database::new(&engine, "app");

    let (handlers, rx) = Handlers::channel();
    db.open_with_upgrade(
        1,
        |upgrade| {
            upgrade.create_store(
                "pairs",
                StoreOptions::with_key_path(vec!["a", "b"]).auto_increment(),
            )?;
            Ok(())
        },
        handlers,
    );
    match settle(&engine, rx) {
        Err(StoreError::Connection { source, .. }) => {
            assert!(matches!(*source, StoreError::InvalidOperation(_)))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_store_operations_refused_before_open() {
    let engine = Engine::in_memory();
    let db = Database::new(&engine, "app");
    assert_eq!(db.lifecycle(), Lifecycle::Unopened);
    assert!(matches!(db.store("people"), Err(StoreError::InvalidState(_))));
}

#[test]
fn test_store_operations_refused_during_upgrade() {
    let engine = Engine::in_memory();
    let db = Database::new(&engine, "app");
    let (tx, during) = unbounded();

    let (handlers, rx) = Handlers::channel();
    db.open_with_upgrade(
        1,
        move |upgrade| {
            let people = upgrade.create_store("people", StoreOptions::default())?;
            people.add_with_key(
                json!("too early"),
                1,
                Handlers::from_result(move |result| {
                    let _ = tx.send(result);
                }),
            );
            Ok(())
        },
        handlers,
    );
    settle(&engine, rx).unwrap();

    assert!(matches!(
        during.try_recv().unwrap(),
        Err(StoreError::InvalidState(_))
    ));
    let (handlers, rx) = Handlers::channel();
    db.store("people").unwrap().get(1, handlers);
    assert_eq!(settle(&engine, rx).unwrap(), None);
}

#[test]
fn test_create_index_outside_upgrade() {
    let engine = Engine::in_memory();
    let (tx, kept) = unbounded();

    let db = Database::new(&engine, "app");
    let (handlers, rx) = Handlers::channel();
    db.open_with_upgrade(
        1,
        move |upgrade| {
            let store = upgrade.create_store("people", StoreOptions::default())?;
            let _ = tx.send(store);
            Ok(())
        },
        handlers,
    );
    settle(&engine, rx).unwrap();

    // Rehydrated proxy: no descriptor.
    let rehydrated = db.store("people").unwrap();
    assert!(matches!(
        rehydrated.create_index(IndexSpec::new("by_x", "x")),
        Err(StoreError::InvalidState(_))
    ));

    // Upgrade proxy kept past its phase.
    let stale = kept.try_recv().unwrap();
    assert!(stale.has_descriptor());
    assert!(matches!(
        stale.create_index(IndexSpec::new("by_x", "x")),
        Err(StoreError::InvalidState(_))
    ));
}

#[test]
fn test_constraint_errors() {
    let engine = Engine::in_memory();
    let db = open_db(&engine);
    let people = db.store("people").unwrap();

    let (handlers, rx) = Handlers::channel();
    people.add(json!({"id": 1, "email": "a@x"}), handlers);
    settle(&engine, rx).unwrap();

    let (handlers, rx) = Handlers::channel();
    people.add(json!({"id": 1, "email": "b@x"}), handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::Constraint(_))));

    // put never conflicts on the primary key...
    let (handlers, rx) = Handlers::channel();
    people.put(json!({"id": 1, "email": "c@x"}), handlers);
    settle(&engine, rx).unwrap();

    // ...but unique indexes still apply.
    let (handlers, rx) = Handlers::channel();
    people.put(json!({"id": 2, "email": "c@x"}), handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::Constraint(_))));
}

#[test]
fn test_data_errors() {
    let engine = Engine::in_memory();
    let db = open_db(&engine);
    let people = db.store("people").unwrap();
    let blobs = db.store("blobs").unwrap();

    // In-line store with an explicit key.
    let (handlers, rx) = Handlers::channel();
    people.add_with_key(json!({"id": 1}), 1, handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::Data(_))));

    // In-line store, record without its key.
    let (handlers, rx) = Handlers::channel();
    people.add(json!({"email": "x@x"}), handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::Data(_))));

    // Out-of-line store without a key or generator.
    let (handlers, rx) = Handlers::channel();
    blobs.add(json!("payload"), handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::Data(_))));

    assert!(matches!(Key::number(f64::NAN), Err(StoreError::Data(_))));
}

#[test]
fn test_missing_index_reported_to_error_handler() {
    let engine = Engine::in_memory();
    let db = open_db(&engine);
    let people = db.store("people").unwrap();

    let (handlers, rx) = Handlers::channel();
    people.get_from_index("by_nothing", 1, handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::IndexNotFound(_))));

    let (handlers, rx) = Handlers::channel();
    people.get_range_from_index("by_nothing", RangeSpec::new().lower(0, false), handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::IndexNotFound(_))));
}

#[test]
fn test_range_without_bounds() {
    let engine = Engine::in_memory();
    let db = open_db(&engine);

    let (handlers, rx) = Handlers::channel();
    db.store("blobs").unwrap().get_range(RangeSpec::new(), handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::InvalidRange(_))));
}

#[test]
fn test_unknown_dispatch_type() {
    let engine = Engine::in_memory();
    let db = open_db(&engine);

    let (handlers, rx) = Handlers::channel();
    db.store("blobs")
        .unwrap()
        .operate_store(OperationRequest::new("merge"), handlers);
    assert!(matches!(
        settle(&engine, rx),
        Err(StoreError::UnsupportedOperation(kind)) if kind == "merge"
    ));
}

#[test]
fn test_missing_error_handler_is_harmless() {
    let engine = Engine::in_memory();
    let db = open_db(&engine);
    let people = db.store("people").unwrap();
    let successes = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&successes);
    people.add(
        json!({"no_id": true}),
        Handlers::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    engine.run_until_idle();

    assert_eq!(successes.load(Ordering::SeqCst), 0);
}

#[test]
fn test_closed_handle_refuses_operations() {
    let engine = Engine::in_memory();
    let db = open_db(&engine);
    let people = db.store("people").unwrap();

    db.close();
    assert_eq!(db.lifecycle(), Lifecycle::Closed);

    let (handlers, rx) = Handlers::channel();
    people.get(1, handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::InvalidState(_))));

    // Reopening restores access through fresh proxies.
    let (handlers, rx) = Handlers::channel();
    db.open(1, handlers);
    settle(&engine, rx).unwrap();
    let (handlers, rx) = Handlers::channel();
    db.store("people").unwrap().count(handlers);
    assert_eq!(settle(&engine, rx).unwrap(), 0);
}

#[test]
fn test_dropped_handle_refuses_operations() {
    let engine = Engine::in_memory();
    let db = open_db(&engine);
    let people = db.store("people").unwrap();
    drop(db);

    let (handlers, rx) = Handlers::channel();
    people.count(handlers);
    assert!(matches!(settle(&engine, rx), Err(StoreError::InvalidState(_))));
}

#[test]
fn test_errors_arrive_on_a_later_turn() {
    let engine = Engine::in_memory();
    let db = Database::new(&engine, "app");

    let (handlers, rx) = Handlers::<()>::channel();
    db.open(1, handlers);
    let (second, second_rx) = Handlers::<()>::channel();
    db.open(1, second);

    // Nothing is reported synchronously, not even the refused open.
    assert!(rx.try_recv().is_err());
    assert!(second_rx.try_recv().is_err());

    engine.run_until_idle();
    assert!(rx.try_recv().unwrap().is_ok());
    assert!(matches!(
        second_rx.try_recv().unwrap(),
        Err(StoreError::InvalidState(_))
    ));
}
