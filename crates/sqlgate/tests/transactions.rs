mod common;

use common::{MemoryEngine, block_on, expect_err, test_cx, unwrap_outcome};
use sqlgate::{Db, Error, LockMode, OpenOptions, Outcome, TransactionKind, Value, WhereOptions};

fn open_with_people() -> (Db, common::EngineProbe) {
    let cx = test_cx();
    let (engine, probe) = MemoryEngine::new();
    let db = unwrap_outcome(block_on(Db::open(&cx, engine, OpenOptions::new())));
    unwrap_outcome(block_on(db.execute(
        &cx,
        None,
        "CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT)",
        &[],
    )));
    (db, probe)
}

#[test]
fn test_read_only_transaction_skips_begin_and_commit() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let mut txn = unwrap_outcome(block_on(db.begin(&cx, TransactionKind::Deferred)));
    let rows = unwrap_outcome(block_on(txn.raw_query(
        &cx,
        None,
        "SELECT * FROM people",
        &[],
    )));
    assert!(rows.is_empty());
    unwrap_outcome(block_on(txn.commit(&cx)));

    assert_eq!(probe.statements_matching("BEGIN"), 0);
    assert_eq!(probe.statements_matching("COMMIT"), 0);

    // The shared lock was released: a writer can proceed.
    unwrap_outcome(block_on(db.insert(
        &cx,
        None,
        "people",
        &[("id", Value::Integer(1)), ("name", "A".into())],
        None,
    )));
    db.close();
}

#[test]
fn test_first_write_sends_begin_exactly_once() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let mut txn = unwrap_outcome(block_on(db.begin(&cx, TransactionKind::Deferred)));
    unwrap_outcome(block_on(txn.insert(
        &cx,
        None,
        "people",
        &[("id", Value::Integer(1)), ("name", "A".into())],
        None,
    )));
    unwrap_outcome(block_on(txn.insert(
        &cx,
        None,
        "people",
        &[("id", Value::Integer(2)), ("name", "B".into())],
        None,
    )));
    unwrap_outcome(block_on(txn.commit(&cx)));

    assert_eq!(probe.statements_matching("BEGIN DEFERRED"), 1);
    assert_eq!(probe.statements_matching("COMMIT"), 1);
    assert_eq!(probe.rows_of("people"), 2);
    db.close();
}

#[test]
fn test_immediate_transaction_begins_eagerly() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let mut txn = unwrap_outcome(block_on(db.begin(&cx, TransactionKind::Immediate)));
    assert_eq!(probe.statements_matching("BEGIN IMMEDIATE"), 1);
    unwrap_outcome(block_on(txn.commit(&cx)));
    assert_eq!(probe.statements_matching("COMMIT"), 1);
    db.close();
}

#[test]
fn test_failing_body_rolls_back_exactly_once_and_releases_lock() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let outcome: Outcome<(), Error> = block_on(db.transaction(
        &cx,
        TransactionKind::Deferred,
        async |txn: &mut sqlgate::Transaction<'_>| {
            match txn
                .insert(
                    &cx,
                    None,
                    "people",
                    &[("id", Value::Integer(9)), ("name", "gone".into())],
                    None,
                )
                .await
            {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            Outcome::Err(Error::query("caller bailed", None))
        },
    ));
    let err = expect_err(outcome);
    assert_eq!(err.to_string(), "query error: caller bailed");

    assert_eq!(probe.statements_matching("ROLLBACK"), 1);
    assert_eq!(probe.rows_of("people"), 0, "insert must be rolled back");

    // The exclusive lock is gone: new writers proceed.
    unwrap_outcome(block_on(db.insert(
        &cx,
        None,
        "people",
        &[("id", Value::Integer(1)), ("name", "kept".into())],
        None,
    )));
    assert_eq!(probe.rows_of("people"), 1);
    db.close();
}

#[test]
fn test_operations_after_commit_are_rejected() {
    let cx = test_cx();
    let (db, _probe) = open_with_people();

    let mut txn = unwrap_outcome(block_on(db.begin(&cx, TransactionKind::Deferred)));
    unwrap_outcome(block_on(txn.commit(&cx)));

    let err = expect_err(block_on(txn.raw_query(&cx, None, "SELECT * FROM people", &[])));
    assert!(err.to_string().contains("already closed"));
    let err = expect_err(block_on(txn.commit(&cx)));
    assert!(err.to_string().contains("already closed"));
    db.close();
}

#[test]
fn test_shared_to_exclusive_upgrade_on_first_write() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let mut txn = unwrap_outcome(block_on(db.begin(&cx, TransactionKind::Deferred)));
    // Read first: shared hold, no BEGIN.
    unwrap_outcome(block_on(txn.raw_query(&cx, None, "SELECT * FROM people", &[])));
    assert_eq!(probe.statements_matching("BEGIN"), 0);
    // First write upgrades and begins.
    unwrap_outcome(block_on(txn.insert(
        &cx,
        None,
        "people",
        &[("id", Value::Integer(1)), ("name", "A".into())],
        None,
    )));
    assert_eq!(probe.statements_matching("BEGIN DEFERRED"), 1);
    unwrap_outcome(block_on(txn.commit(&cx)));
    assert_eq!(probe.rows_of("people"), 1);
    db.close();
}

#[test]
fn test_nested_savepoints_route_through_parent() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let mut txn = unwrap_outcome(block_on(db.begin(&cx, TransactionKind::Deferred)));
    {
        let mut outer = unwrap_outcome(block_on(txn.savepoint(&cx, "outer")));
        unwrap_outcome(block_on(outer.insert(
            &cx,
            None,
            "people",
            &[("id", Value::Integer(1)), ("name", "a".into())],
            None,
        )));
        {
            let mut inner = unwrap_outcome(block_on(outer.savepoint(&cx, "inner")));
            unwrap_outcome(block_on(inner.insert(
                &cx,
                None,
                "people",
                &[("id", Value::Integer(2)), ("name", "b".into())],
                None,
            )));
            unwrap_outcome(block_on(inner.rollback(&cx)));
        }
        unwrap_outcome(block_on(outer.commit(&cx)));
    }
    unwrap_outcome(block_on(txn.commit(&cx)));

    // Creating the outer savepoint forced the parent transaction to begin,
    // so the chain announces in order.
    let log = probe.log();
    let begin = log.iter().position(|s| s == "BEGIN DEFERRED").expect("begin");
    let outer = log.iter().position(|s| s == "SAVEPOINT outer").expect("outer");
    let inner = log.iter().position(|s| s == "SAVEPOINT inner").expect("inner");
    assert!(begin < outer && outer < inner);
    assert_eq!(probe.statements_matching("ROLLBACK TO inner"), 1);
    assert_eq!(probe.statements_matching("RELEASE outer"), 1);
    // The inner rollback undid only the inner insert.
    assert_eq!(probe.rows_of("people"), 1);
    db.close();
}

#[test]
fn test_savepoint_resolves_exactly_once() {
    let cx = test_cx();
    let (db, _probe) = open_with_people();

    let mut txn = unwrap_outcome(block_on(db.begin(&cx, TransactionKind::Deferred)));
    let mut sp = unwrap_outcome(block_on(txn.savepoint(&cx, "sp1")));
    unwrap_outcome(block_on(sp.commit(&cx)));
    let err = expect_err(block_on(sp.commit(&cx)));
    assert!(err.to_string().contains("savepoint already closed"));
    let err = expect_err(block_on(sp.rollback(&cx)));
    assert!(err.to_string().contains("savepoint already closed"));
    drop(sp);
    unwrap_outcome(block_on(txn.commit(&cx)));
    db.close();
}

#[test]
fn test_root_savepoint_lazy_announce_and_release() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let mut sp = db.create_savepoint("root_sp");
    assert_eq!(probe.statements_matching("SAVEPOINT root_sp"), 0);
    unwrap_outcome(block_on(sp.insert(
        &cx,
        None,
        "people",
        &[("id", Value::Integer(5)), ("name", "r".into())],
        None,
    )));
    assert_eq!(probe.statements_matching("SAVEPOINT root_sp"), 1);
    unwrap_outcome(block_on(sp.commit(&cx)));
    assert_eq!(probe.statements_matching("RELEASE root_sp"), 1);
    assert_eq!(probe.rows_of("people"), 1);

    // The gate is free again.
    unwrap_outcome(block_on(db.execute(&cx, None, "DELETE FROM people", &[])));
    db.close();
}

#[test]
fn test_with_savepoint_driver_rolls_back_on_error() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let outcome: Outcome<(), Error> = block_on(db.with_savepoint(
        &cx,
        "sp_fail",
        async |sp: &mut sqlgate::Savepoint<'_>| {
            match sp
                .insert(
                    &cx,
                    None,
                    "people",
                    &[("id", Value::Integer(3)), ("name", "x".into())],
                    None,
                )
                .await
            {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            Outcome::Err(Error::query("abandon", None))
        },
    ));
    expect_err(outcome);
    assert_eq!(probe.statements_matching("ROLLBACK TO sp_fail"), 1);
    assert_eq!(probe.rows_of("people"), 0);
    db.close();
}

#[test]
fn test_explicit_lock_override_on_transaction_ops() {
    let cx = test_cx();
    let (db, probe) = open_with_people();

    let mut txn = unwrap_outcome(block_on(db.begin(&cx, TransactionKind::Deferred)));
    // An explicitly unlocked read inside a transaction touches neither the
    // gate nor the BEGIN state.
    unwrap_outcome(block_on(txn.raw_query(
        &cx,
        Some(LockMode::None),
        "SELECT * FROM people",
        &[],
    )));
    assert_eq!(probe.statements_matching("BEGIN"), 0);
    unwrap_outcome(block_on(txn.commit(&cx)));

    // Delete with builder options goes through the changes() follow-up.
    unwrap_outcome(block_on(db.insert(
        &cx,
        None,
        "people",
        &[("id", Value::Integer(1)), ("name", "A".into())],
        None,
    )));
    let removed = unwrap_outcome(block_on(db.delete(
        &cx,
        None,
        "people",
        &WhereOptions::new()
            .where_clause("id = ?")
            .args(vec![Value::Integer(1)]),
    )));
    assert_eq!(removed, 1);
    db.close();
}
