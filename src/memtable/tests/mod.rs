use tempfile::tempdir;

use crate::memtable::{Memtable, MemtableError};
use crate::wal::new_wal_path;

fn new_memtable(dir: &std::path::Path, write_buffer_size: usize) -> Memtable {
    let path = new_wal_path(dir);
    Memtable::create(&path, None, write_buffer_size).unwrap()
}

#[test]
fn put_then_get_returns_the_value() {
    let dir = tempdir().unwrap();
    let mt = new_memtable(dir.path(), 1024 * 1024);

    mt.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    assert_eq!(mt.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(mt.get(b"missing").unwrap(), None);
}

#[test]
fn put_overwrites_previous_value_for_same_key() {
    let dir = tempdir().unwrap();
    let mt = new_memtable(dir.path(), 1024 * 1024);

    mt.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    mt.put(b"a".to_vec(), b"2".to_vec()).unwrap();
    assert_eq!(mt.get(b"a").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn scan_returns_keys_in_order_within_bounds() {
    let dir = tempdir().unwrap();
    let mt = new_memtable(dir.path(), 1024 * 1024);

    for k in [b"a", b"b", b"c", b"d"] {
        mt.put(k.to_vec(), b"v".to_vec()).unwrap();
    }

    let scanned = mt.scan(b"b", b"c").unwrap();
    assert_eq!(
        scanned,
        vec![(b"b".to_vec(), b"v".to_vec()), (b"c".to_vec(), b"v".to_vec())]
    );
}

#[test]
fn put_accepts_an_empty_key() {
    let dir = tempdir().unwrap();
    let mt = new_memtable(dir.path(), 1024 * 1024);

    mt.put(Vec::new(), b"v".to_vec()).unwrap();
    assert_eq!(mt.get(&[]).unwrap(), Some(b"v".to_vec()));
}

#[test]
fn put_past_write_buffer_size_requires_flush() {
    let dir = tempdir().unwrap();
    let mt = new_memtable(dir.path(), 8);

    mt.put(b"a".to_vec(), b"1234".to_vec()).unwrap();
    let err = mt.put(b"b".to_vec(), b"12345678".to_vec()).unwrap_err();
    assert!(matches!(err, MemtableError::FlushRequired));
}

#[test]
fn overwriting_a_key_still_counts_toward_the_write_buffer() {
    let dir = tempdir().unwrap();
    let mt = new_memtable(dir.path(), 6);

    mt.put(b"a".to_vec(), b"123".to_vec()).unwrap();
    // approximate_size only ever grows, so replacing the same key counts
    // again toward write_buffer_size instead of netting out.
    let err = mt.put(b"a".to_vec(), b"456".to_vec()).unwrap_err();
    assert!(matches!(err, MemtableError::FlushRequired));
    assert_eq!(mt.get(b"a").unwrap(), Some(b"123".to_vec()));
}

#[test]
fn reopening_the_same_wal_replays_all_writes() {
    let dir = tempdir().unwrap();
    let path = new_wal_path(dir.path());

    {
        let mt = Memtable::create(&path, None, 1024 * 1024).unwrap();
        mt.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        mt.put(b"b".to_vec(), b"2".to_vec()).unwrap();
    }

    let reopened = Memtable::new(&path, 1024 * 1024).unwrap();
    assert_eq!(reopened.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(reopened.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn iter_for_flush_yields_every_key_in_order_without_clearing_state() {
    let dir = tempdir().unwrap();
    let mt = new_memtable(dir.path(), 1024 * 1024);

    mt.put(b"c".to_vec(), b"3".to_vec()).unwrap();
    mt.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    mt.put(b"b".to_vec(), b"2".to_vec()).unwrap();

    let flushed = mt.iter_for_flush().unwrap();
    assert_eq!(
        flushed,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"3".to_vec()),
        ]
    );
    // Still fully readable afterwards.
    assert_eq!(mt.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn frozen_memtable_exposes_read_only_view() {
    let dir = tempdir().unwrap();
    let mt = new_memtable(dir.path(), 1024 * 1024);
    mt.put(b"a".to_vec(), b"1".to_vec()).unwrap();

    let frozen = mt.freeze();
    assert_eq!(frozen.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(frozen.iter_for_flush().unwrap(), vec![(b"a".to_vec(), b"1".to_vec())]);
}
