//! Crash and restart scenarios. A "crash" is simulated by abandoning an
//! engine without completing its transactions and opening a second
//! engine over the same data directory.

use serial_test::serial;
use tempfile::tempdir;

mod common;

#[test]
#[serial]
fn test_redo_recovers_a_committed_but_unflushed_insert() {
    let dir = tempdir().unwrap();
    {
        let (engine, table) = common::open_engine(dir.path(), 16);
        let safe = engine.begin().unwrap();
        engine
            .insert_tuple(safe, table, common::row(&engine, table, 1, 100))
            .unwrap();
        engine.commit(safe).unwrap();

        // Commit record reaches the log, but the page never reaches the
        // table file: the crash happens before transaction completion.
        let tid = engine.begin().unwrap();
        engine
            .insert_tuple(tid, table, common::row(&engine, table, 2, 200))
            .unwrap();
        engine.wal().log_commit(tid).unwrap();
    }

    let (engine, table) = common::open_engine(dir.path(), 16);
    engine.recover().unwrap();
    assert_eq!(common::read_all(&engine, table), vec![(1, 100), (2, 200)]);
}

#[test]
#[serial]
fn test_undo_erases_an_uncommitted_flushed_insert() {
    let dir = tempdir().unwrap();
    {
        let (engine, table) = common::open_engine(dir.path(), 16);
        let safe = engine.begin().unwrap();
        engine
            .insert_tuple(safe, table, common::row(&engine, table, 1, 100))
            .unwrap();
        engine.commit(safe).unwrap();

        // The uncommitted page reaches the table file before the crash.
        let tid = engine.begin().unwrap();
        engine
            .insert_tuple(tid, table, common::row(&engine, table, 2, 200))
            .unwrap();
        engine.pool().flush_pages(tid).unwrap();
    }

    let (engine, table) = common::open_engine(dir.path(), 16);
    engine.recover().unwrap();
    assert_eq!(common::read_all(&engine, table), vec![(1, 100)]);
}

#[test]
#[serial]
fn test_recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    {
        let (engine, table) = common::open_engine(dir.path(), 16);
        let tid = engine.begin().unwrap();
        engine
            .insert_tuple(tid, table, common::row(&engine, table, 1, 100))
            .unwrap();
        engine.wal().log_commit(tid).unwrap();

        let loser = engine.begin().unwrap();
        engine
            .insert_tuple(loser, table, common::row(&engine, table, 2, 200))
            .unwrap();
        engine.pool().flush_pages(loser).unwrap();
    }

    let (engine, table) = common::open_engine(dir.path(), 16);
    engine.recover().unwrap();
    engine.recover().unwrap();
    assert_eq!(common::read_all(&engine, table), vec![(1, 100)]);
}

#[test]
#[serial]
fn test_an_aborted_transaction_stays_aborted_across_recovery() {
    let dir = tempdir().unwrap();
    {
        let (engine, table) = common::open_engine(dir.path(), 16);
        let tid = engine.begin().unwrap();
        engine
            .insert_tuple(tid, table, common::row(&engine, table, 1, 100))
            .unwrap();
        engine.abort(tid).unwrap();
    }

    // The abort's update record must never be redone.
    let (engine, table) = common::open_engine(dir.path(), 16);
    engine.recover().unwrap();
    assert_eq!(common::read_all(&engine, table), vec![]);
}

#[test]
#[serial]
fn test_recovery_retires_the_replayed_log() {
    let dir = tempdir().unwrap();
    {
        let (engine, table) = common::open_engine(dir.path(), 16);
        let safe = engine.begin().unwrap();
        engine
            .insert_tuple(safe, table, common::row(&engine, table, 1, 100))
            .unwrap();
        engine.commit(safe).unwrap();

        let loser = engine.begin().unwrap();
        engine
            .insert_tuple(loser, table, common::row(&engine, table, 2, 200))
            .unwrap();
        engine.pool().flush_pages(loser).unwrap();
    }

    // Recovery ends in a checkpoint: the replayed records are truncated
    // away, so no later transaction can collide with a logged id.
    let wal_path = dir.path().join("engine.wal");
    let before = std::fs::metadata(&wal_path).unwrap().len();
    let (engine, table) = common::open_engine(dir.path(), 16);
    engine.recover().unwrap();
    let after = std::fs::metadata(&wal_path).unwrap().len();
    assert!(after < before, "log kept its replayed records: {before} -> {after}");

    // New work over the truncated log survives a further crash, and the
    // undone insert never resurfaces.
    let tid = engine.begin().unwrap();
    engine
        .insert_tuple(tid, table, common::row(&engine, table, 3, 300))
        .unwrap();
    engine.wal().log_commit(tid).unwrap();
    drop(engine);

    let (engine, table) = common::open_engine(dir.path(), 16);
    engine.recover().unwrap();
    assert_eq!(common::read_all(&engine, table), vec![(1, 100), (3, 300)]);
}

#[test]
#[serial]
fn test_checkpoint_then_crash() {
    let dir = tempdir().unwrap();
    {
        let (engine, table) = common::open_engine(dir.path(), 16);
        let tid = engine.begin().unwrap();
        engine
            .insert_tuple(tid, table, common::row(&engine, table, 1, 100))
            .unwrap();
        engine.commit(tid).unwrap();

        engine.checkpoint().unwrap();

        let tid = engine.begin().unwrap();
        engine
            .insert_tuple(tid, table, common::row(&engine, table, 2, 200))
            .unwrap();
        engine.wal().log_commit(tid).unwrap();
    }

    let (engine, table) = common::open_engine(dir.path(), 16);
    engine.recover().unwrap();
    assert_eq!(common::read_all(&engine, table), vec![(1, 100), (2, 200)]);
}

#[test]
#[serial]
fn test_checkpoint_truncates_the_log() {
    let dir = tempdir().unwrap();
    let (engine, table) = common::open_engine(dir.path(), 16);
    for i in 0..10 {
        let tid = engine.begin().unwrap();
        engine
            .insert_tuple(tid, table, common::row(&engine, table, i, 0))
            .unwrap();
        engine.commit(tid).unwrap();
    }
    let before = std::fs::metadata(dir.path().join("engine.wal")).unwrap().len();
    engine.checkpoint().unwrap();
    let after = std::fs::metadata(dir.path().join("engine.wal")).unwrap().len();
    assert!(after < before, "log did not shrink: {before} -> {after}");

    // The engine keeps working on the truncated log.
    let tid = engine.begin().unwrap();
    engine
        .insert_tuple(tid, table, common::row(&engine, table, 99, 0))
        .unwrap();
    engine.commit(tid).unwrap();
    assert_eq!(common::read_all(&engine, table).len(), 11);
}
