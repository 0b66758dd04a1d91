mod helpers;

use tempfile::tempdir;

use crate::wal::{Wal, WalError};
use helpers::{collect_iter, ManifestRecord, MemTableRecord};

#[test]
fn appends_and_replays_records_in_order() {
    let dir = tempdir().unwrap();
    let path = crate::wal::new_wal_path(dir.path());
    let wal = Wal::<MemTableRecord>::create(&path, None).unwrap();

    let records = vec![
        MemTableRecord {
            key: b"a".to_vec(),
            value: Some(b"1".to_vec()),
            timestamp: 1,
            deleted: false,
        },
        MemTableRecord {
            key: b"b".to_vec(),
            value: None,
            timestamp: 2,
            deleted: true,
        },
    ];
    for record in &records {
        wal.append(record).unwrap();
    }

    let replayed = collect_iter(&wal).unwrap();
    assert_eq!(replayed, records);
}

#[test]
fn replay_after_reopen_recovers_all_records() {
    let dir = tempdir().unwrap();
    let path = crate::wal::new_wal_path(dir.path());

    {
        let wal = Wal::<ManifestRecord>::create(&path, None).unwrap();
        wal.append(&ManifestRecord {
            id: 1,
            path: "/db/table-100".into(),
            creation_timestamp: 10,
        })
        .unwrap();
        wal.append(&ManifestRecord {
            id: 2,
            path: "/db/table-101".into(),
            creation_timestamp: 20,
        })
        .unwrap();
    }

    let reopened = Wal::<ManifestRecord>::open(&path).unwrap();
    let replayed = collect_iter(&reopened).unwrap();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].path, "/db/table-100");
    assert_eq!(replayed[1].path, "/db/table-101");
}

#[test]
fn open_rejects_path_without_timestamp_name() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("not-a-timestamp.wal");
    let err = Wal::<MemTableRecord>::create(&path, None).unwrap_err();
    assert!(matches!(err, WalError::Internal(_)));
}

#[test]
fn create_fails_if_path_already_exists() {
    let dir = tempdir().unwrap();
    let path = crate::wal::new_wal_path(dir.path());
    let _wal = Wal::<MemTableRecord>::create(&path, None).unwrap();

    let err = Wal::<MemTableRecord>::create(&path, None).unwrap_err();
    assert!(matches!(err, WalError::PathExists(p) if p == path));
}

#[test]
fn open_fails_if_path_is_missing() {
    let dir = tempdir().unwrap();
    let path = crate::wal::new_wal_path(dir.path());

    let err = Wal::<MemTableRecord>::open(&path).unwrap_err();
    assert!(matches!(err, WalError::PathMissing(p) if p == path));
}

#[test]
fn oversized_record_is_rejected() {
    let dir = tempdir().unwrap();
    let path = crate::wal::new_wal_path(dir.path());
    let wal = Wal::<MemTableRecord>::create(&path, Some(16)).unwrap();

    let record = MemTableRecord {
        key: vec![0u8; 64],
        value: Some(vec![0u8; 64]),
        timestamp: 1,
        deleted: false,
    };
    let err = wal.append(&record).unwrap_err();
    assert!(matches!(err, WalError::RecordTooLarge(_)));
}

#[test]
fn truncate_clears_records_but_keeps_header_valid() {
    let dir = tempdir().unwrap();
    let path = crate::wal::new_wal_path(dir.path());
    let mut wal = Wal::<MemTableRecord>::create(&path, None).unwrap();

    wal.append(&MemTableRecord {
        key: b"a".to_vec(),
        value: Some(b"1".to_vec()),
        timestamp: 1,
        deleted: false,
    })
    .unwrap();
    wal.truncate().unwrap();

    let replayed = collect_iter(&wal).unwrap();
    assert!(replayed.is_empty());

    wal.append(&MemTableRecord {
        key: b"b".to_vec(),
        value: Some(b"2".to_vec()),
        timestamp: 2,
        deleted: false,
    })
    .unwrap();
    let replayed = collect_iter(&wal).unwrap();
    assert_eq!(replayed.len(), 1);
}

#[test]
fn rotate_next_creates_a_new_empty_segment() {
    let dir = tempdir().unwrap();
    let path = crate::wal::new_wal_path(dir.path());
    let mut wal = Wal::<MemTableRecord>::create(&path, None).unwrap();

    wal.append(&MemTableRecord {
        key: b"a".to_vec(),
        value: Some(b"1".to_vec()),
        timestamp: 1,
        deleted: false,
    })
    .unwrap();

    let old_created_at = wal.created_at_us();
    let new_created_at = wal.rotate_next().unwrap();
    assert!(new_created_at > old_created_at);
    assert!(wal.path() != &path);

    let replayed = collect_iter(&wal).unwrap();
    assert!(replayed.is_empty());
}

#[test]
fn replay_stops_cleanly_at_a_truncated_trailing_record() {
    use std::io::Write;

    let dir = tempdir().unwrap();
    let path = crate::wal::new_wal_path(dir.path());

    {
        let wal = Wal::<MemTableRecord>::create(&path, None).unwrap();
        wal.append(&MemTableRecord {
            key: b"a".to_vec(),
            value: Some(b"1".to_vec()),
            timestamp: 1,
            deleted: false,
        })
        .unwrap();
    }

    // Append a few garbage bytes, simulating a crash mid-write of the next
    // record's length prefix.
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0xAB, 0xCD]).unwrap();
    file.sync_all().unwrap();

    let wal = Wal::<MemTableRecord>::open(&path).unwrap();
    let mut iter = wal.replay_iter().unwrap();
    let mut replayed = Vec::new();
    while let Some(res) = iter.next() {
        match res {
            Ok(record) => replayed.push(record),
            Err(_) => break,
        }
    }
    assert_eq!(replayed.len(), 1);
}
