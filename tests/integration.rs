//! End-to-end scenarios against the public embedded API.

use jumpdb::{Buf, Db, OpenOptions, PutMode, Query, QueryType};

fn prefix(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

/// S1: open a fresh database, write through it, close, and reopen --
/// everything committed before close is still there.
#[test]
fn s1_open_put_close_reopen_round_trips_data() {
    let dir = tempfile::tempdir().unwrap();
    let p = prefix(&dir, "s1");
    {
        let db = Db::open(&p, OpenOptions::default()).unwrap();
        for i in 0..50u32 {
            db.put(format!("k{:03}", i).as_bytes(), Buf::valid(i.to_le_bytes().to_vec()))
                .unwrap();
        }
    }
    let db = Db::open(&p, OpenOptions::WRITER).unwrap();
    for i in 0..50u32 {
        assert_eq!(
            db.get(format!("k{:03}", i).as_bytes()).unwrap(),
            Buf::valid(i.to_le_bytes().to_vec())
        );
    }
}

/// S2: a transaction begun before a concurrent commit keeps reading its
/// original snapshot even after that commit lands.
#[test]
fn s2_in_flight_transaction_does_not_see_a_later_commit() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "s2"), OpenOptions::default()).unwrap();
    db.put(b"k", Buf::valid(b"v1".to_vec())).unwrap();

    let snapshot_tx = db.begin();
    assert_eq!(snapshot_tx.get(jumpdb::DEFAULT_TABLE, b"k").unwrap(), Buf::valid(b"v1".to_vec()));

    db.put(b"k", Buf::valid(b"v2".to_vec())).unwrap();

    // The already-open tx's snapshot is untouched by the later commit.
    assert_eq!(snapshot_tx.get(jumpdb::DEFAULT_TABLE, b"k").unwrap(), Buf::valid(b"v1".to_vec()));
    // A fresh transaction sees the new value.
    assert_eq!(db.get(b"k").unwrap(), Buf::valid(b"v2".to_vec()));
}

/// S3: two transactions that both touch the same key race to commit; the
/// loser gets `TxConflict` and must retry.
#[test]
fn s3_overlapping_writes_to_the_same_key_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "s3"), OpenOptions::default()).unwrap();
    db.put(b"k", Buf::valid(b"0".to_vec())).unwrap();

    let mut tx_a = db.begin();
    tx_a.put(jumpdb::DEFAULT_TABLE, b"k", Buf::valid(b"a".to_vec()), PutMode::Update).unwrap();

    let mut tx_b = db.begin();
    tx_b.put(jumpdb::DEFAULT_TABLE, b"k", Buf::valid(b"b".to_vec()), PutMode::Update).unwrap();

    tx_a.commit().unwrap();
    let result = tx_b.commit();
    assert!(matches!(result, Err(jumpdb::Error::TxConflict)));
    assert_eq!(db.get(b"k").unwrap(), Buf::valid(b"a".to_vec()));
}

/// S4: 400 inserts under one key preserve insertion order once the
/// duplicate run is promoted into its own subtree.
#[test]
fn s4_duplicate_key_inserts_preserve_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "s4"), OpenOptions::default()).unwrap();
    for i in 0..400u32 {
        db.put_table(
            jumpdb::DEFAULT_TABLE,
            b"dup",
            Buf::valid(i.to_le_bytes().to_vec()),
            PutMode::Insert,
        )
        .unwrap();
    }

    let mut tx = db.begin();
    let mut cur = tx.cursor(jumpdb::DEFAULT_TABLE, Query::exact(b"dup".to_vec())).unwrap();
    let mut seen = Vec::new();
    loop {
        let (k, v) = cur.get().unwrap();
        assert_eq!(k, b"dup");
        seen.push(u32::from_le_bytes(v.as_bytes().unwrap().try_into().unwrap()));
        if !cur.next() {
            break;
        }
        if seen.len() == 400 {
            break;
        }
    }
    assert_eq!(seen, (0..400u32).collect::<Vec<_>>());
}

/// S5: tables are independent namespaces; dropping one doesn't touch the
/// others, and a dropped or never-created table reports `TableNotFound`.
#[test]
fn s5_multi_table_create_drop_and_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "s5"), OpenOptions::default()).unwrap();

    db.table_create(b"users").unwrap();
    db.table_create(b"orders").unwrap();
    db.put_table(b"users", b"u1", Buf::valid(b"alice".to_vec()), PutMode::Insert).unwrap();
    db.put_table(b"orders", b"o1", Buf::valid(b"widget".to_vec()), PutMode::Insert).unwrap();

    assert_eq!(db.get_table(b"users", b"u1").unwrap(), Buf::valid(b"alice".to_vec()));
    assert_eq!(db.get_table(b"orders", b"o1").unwrap(), Buf::valid(b"widget".to_vec()));

    db.table_drop(b"orders").unwrap();
    assert!(matches!(db.get_table(b"orders", b"o1"), Err(jumpdb::Error::TableNotFound(_))));
    assert!(matches!(db.get_table(b"missing", b"x"), Err(jumpdb::Error::TableNotFound(_))));
    // Dropping one table leaves the other untouched.
    assert_eq!(db.get_table(b"users", b"u1").unwrap(), Buf::valid(b"alice".to_vec()));
}

/// S6: a rebase over a large, randomized key set is transparent to
/// readers -- every record is still there, at its latest value, and the
/// override chain has been reset.
#[test]
fn s6_rebase_over_many_randomized_keys_preserves_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "s6"), OpenOptions::default()).unwrap();

    // A fixed pseudo-random permutation (no external RNG dependency): a
    // linear congruential generator over a field of 10007 (prime, close
    // to 10000) to get a full-period, non-sequential insert order.
    let n: u64 = 10000;
    let field: u64 = 10007;
    let mut x: u64 = 1;
    let mut order = Vec::with_capacity(n as usize);
    for _ in 0..n {
        x = (x * 1103515245 + 12345) % field;
        if x < n {
            order.push(x as u32);
        }
    }

    for &i in &order {
        db.put(format!("{:05}", i).as_bytes(), Buf::valid(i.to_le_bytes().to_vec())).unwrap();
    }
    db.rebase(true).unwrap();
    for &i in &order {
        assert_eq!(
            db.get(format!("{:05}", i).as_bytes()).unwrap(),
            Buf::valid(i.to_le_bytes().to_vec())
        );
    }

    // A write after rebase still works against the freshly-reset index.
    db.put(b"post-rebase", Buf::valid(b"ok".to_vec())).unwrap();
    assert_eq!(db.get(b"post-rebase").unwrap(), Buf::valid(b"ok".to_vec()));
}

/// an empty key and an empty value both round-trip distinctly from
/// a SQL-style null value and from "no such record".
#[test]
fn boundary_empty_null_and_missing_values_are_distinguishable() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "boundary_empty"), OpenOptions::default()).unwrap();

    db.put(b"", Buf::valid(b"value-for-empty-key".to_vec())).unwrap();
    assert_eq!(db.get(b"").unwrap(), Buf::valid(b"value-for-empty-key".to_vec()));

    db.put(b"empty-value", Buf::valid(Vec::new())).unwrap();
    assert_eq!(db.get(b"empty-value").unwrap(), Buf::valid(Vec::new()));

    db.put(b"null-value", Buf::Null).unwrap();
    assert_eq!(db.get(b"null-value").unwrap(), Buf::Null);

    assert_eq!(db.get(b"never-written").unwrap(), Buf::Invalid);
}

/// keys near the maximum size are accepted; keys larger than a
/// page's body can ever hold are rejected outright.
#[test]
fn boundary_oversized_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "boundary_key"), OpenOptions::default()).unwrap();

    let reasonable_key = vec![b'k'; 500];
    db.put(&reasonable_key, Buf::valid(b"v".to_vec())).unwrap();
    assert_eq!(db.get(&reasonable_key).unwrap(), Buf::valid(b"v".to_vec()));

    let oversized_key = vec![b'k'; 8192];
    let err = db.put(&oversized_key, Buf::valid(b"v".to_vec()));
    assert!(err.is_err());
}

/// inserting enough records to force at least one leaf split still
/// yields every key in order.
#[test]
fn boundary_many_inserts_force_a_leaf_split_and_stay_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "boundary_split"), OpenOptions::default()).unwrap();

    for i in 0..300u32 {
        db.put_table(
            jumpdb::DEFAULT_TABLE,
            format!("{:05}", i).as_bytes(),
            Buf::valid(vec![0u8; 16]),
            PutMode::Insert,
        )
        .unwrap();
    }

    let mut tx = db.begin();
    let mut cur = tx.cursor(jumpdb::DEFAULT_TABLE, Query::front()).unwrap();
    let mut count = 0u32;
    loop {
        let (k, _) = cur.get().unwrap();
        assert_eq!(k, format!("{:05}", count).as_bytes());
        count += 1;
        if !cur.next() {
            break;
        }
    }
    assert_eq!(count, 300);
}

/// a transaction that reads but never writes commits trivially.
#[test]
fn boundary_read_only_transaction_commits_trivially() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "boundary_trivial"), OpenOptions::default()).unwrap();
    db.put(b"k", Buf::valid(b"v".to_vec())).unwrap();

    let tx = db.begin();
    assert_eq!(tx.get(jumpdb::DEFAULT_TABLE, b"k").unwrap(), Buf::valid(b"v".to_vec()));
    tx.commit().unwrap();
}

/// `QueryType::OrPrev`/`OrNext`/`Before`/`After` resolve correctly through
/// the public cursor API, not just the internal `position_for` helper.
#[test]
fn cursor_query_types_resolve_against_missing_keys() {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(&prefix(&dir, "query_types"), OpenOptions::default()).unwrap();
    for k in ["a", "c", "e"] {
        db.put(k.as_bytes(), Buf::valid(k.as_bytes().to_vec())).unwrap();
    }

    let mut tx = db.begin();
    let or_prev = tx
        .cursor(jumpdb::DEFAULT_TABLE, Query { key: b"d".to_vec(), qtype: QueryType::OrPrev })
        .unwrap();
    assert_eq!(or_prev.get().unwrap().0, b"c");

    let or_next = tx
        .cursor(jumpdb::DEFAULT_TABLE, Query { key: b"d".to_vec(), qtype: QueryType::OrNext })
        .unwrap();
    assert_eq!(or_next.get().unwrap().0, b"e");

    let before = tx
        .cursor(jumpdb::DEFAULT_TABLE, Query { key: b"c".to_vec(), qtype: QueryType::Before })
        .unwrap();
    assert_eq!(before.get().unwrap().0, b"a");

    let after = tx
        .cursor(jumpdb::DEFAULT_TABLE, Query { key: b"c".to_vec(), qtype: QueryType::After })
        .unwrap();
    assert_eq!(after.get().unwrap().0, b"e");
}
