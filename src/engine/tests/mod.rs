use tempfile::tempdir;

use crate::engine::{Engine, EngineConfig, EngineError};

fn small_config() -> EngineConfig {
    EngineConfig {
        nb_levels: 4,
        levels_ratio: 0.5,
        max_l0_sstables: 3,
        max_sstable_size: 256,
        block_size: 64,
    }
}

#[test]
fn put_then_get_returns_the_value() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(EngineConfig::default(), dir.path()).unwrap();

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"missing").unwrap(), None);
}

#[test]
fn put_overwrites_previous_value_for_same_key() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(EngineConfig::default(), dir.path()).unwrap();

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.put(b"a".to_vec(), b"2".to_vec()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn scan_returns_ordered_pairs_within_bounds() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(EngineConfig::default(), dir.path()).unwrap();

    for (k, v) in [(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")] {
        engine.put(k.to_vec(), v.to_vec()).unwrap();
    }

    let scanned = engine.scan(b"b", b"c").unwrap();
    assert_eq!(
        scanned,
        vec![(b"b".to_vec(), b"2".to_vec()), (b"c".to_vec(), b"3".to_vec())]
    );
}

#[test]
fn scan_rejects_an_inverted_range() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(EngineConfig::default(), dir.path()).unwrap();

    let err = engine.scan(b"z", b"a").unwrap_err();
    assert!(matches!(err, EngineError::RangeInvalid));
}

#[test]
fn flush_next_immutable_memtable_moves_data_into_level_zero() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(small_config(), dir.path()).unwrap();

    engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
    engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();

    // Nothing frozen yet, so there is nothing to flush.
    assert!(!engine.flush_next_immutable_memtable().unwrap());

    // Force a freeze by exhausting the configured active-memtable budget.
    for i in 0..20u32 {
        engine
            .put(format!("k{i}").into_bytes(), vec![b'x'; 32])
            .unwrap();
    }

    assert!(engine.flush_next_immutable_memtable().unwrap());
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn reopening_the_store_recovers_put_data_via_wal_replay() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::create(EngineConfig::default(), dir.path()).unwrap();
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(dir.path()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(engine.get(b"b").unwrap(), Some(b"2".to_vec()));
}

#[test]
fn reopening_without_close_still_replays_the_unflushed_wal() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::create(EngineConfig::default(), dir.path()).unwrap();
        engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        // Dropped without calling close(): the WAL on disk is the only
        // record of this write.
    }

    let engine = Engine::open(dir.path()).unwrap();
    assert_eq!(engine.get(b"a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn open_fails_when_directory_has_no_manifest() {
    let dir = tempdir().unwrap();
    let err = Engine::open(dir.path()).unwrap_err();
    assert!(matches!(err, EngineError::Manifest(_)));
}

#[test]
fn force_compaction_l0_merges_overlapping_sstables_into_level_one() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(small_config(), dir.path()).unwrap();

    for i in 0..30u32 {
        engine
            .put(format!("k{i:03}").into_bytes(), vec![b'v'; 16])
            .unwrap();
        // Freeze eagerly so several small memtables get flushed separately.
        if i % 5 == 4 {
            while engine.flush_next_immutable_memtable().unwrap() {}
        }
    }
    while engine.flush_next_immutable_memtable().unwrap() {}

    assert!(engine.force_compaction_l0().unwrap());

    for i in 0..30u32 {
        let key = format!("k{i:03}").into_bytes();
        assert_eq!(engine.get(&key).unwrap(), Some(vec![b'v'; 16]), "missing {i}");
    }
}

#[test]
fn force_compaction_level_rejects_level_zero_and_out_of_range_levels() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(small_config(), dir.path()).unwrap();

    assert!(matches!(
        engine.force_compaction_level(0).unwrap_err(),
        EngineError::Internal(_)
    ));
    assert!(matches!(
        engine.force_compaction_level(99).unwrap_err(),
        EngineError::Internal(_)
    ));
}

#[test]
fn force_compaction_level_on_an_empty_level_is_a_harmless_no_op() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(small_config(), dir.path()).unwrap();

    assert!(!engine.force_compaction_level(1).unwrap());
}

#[test]
fn close_flushes_every_pending_memtable() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(small_config(), dir.path()).unwrap();

    for i in 0..40u32 {
        engine
            .put(format!("k{i:03}").into_bytes(), vec![b'v'; 16])
            .unwrap();
    }
    engine.close().unwrap();

    // A fresh open should find everything in the manifest, not in a WAL.
    let engine = Engine::open(dir.path()).unwrap();
    for i in 0..40u32 {
        let key = format!("k{i:03}").into_bytes();
        assert_eq!(engine.get(&key).unwrap(), Some(vec![b'v'; 16]), "missing {i}");
    }
}

#[test]
fn scan_merges_results_across_memtable_and_sstable_layers() {
    let dir = tempdir().unwrap();
    let engine = Engine::create(small_config(), dir.path()).unwrap();

    for i in 0..20u32 {
        engine
            .put(format!("k{i:03}").into_bytes(), vec![b'v'; 16])
            .unwrap();
    }
    while engine.flush_next_immutable_memtable().unwrap() {}

    // Overwrite a handful of keys after the flush; the newer values live
    // only in the active memtable and must win over the flushed ones.
    engine.put(b"k005".to_vec(), b"updated".to_vec()).unwrap();
    engine.put(b"k010".to_vec(), b"updated".to_vec()).unwrap();

    let scanned = engine.scan(b"k000", b"k019").unwrap();
    assert_eq!(scanned.len(), 20);
    assert_eq!(
        scanned.iter().find(|(k, _)| k == b"k005").unwrap().1,
        b"updated".to_vec()
    );
    assert_eq!(
        scanned.iter().find(|(k, _)| k == b"k010").unwrap().1,
        b"updated".to_vec()
    );
    // Keys must come back in ascending order.
    let mut sorted = scanned.clone();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(scanned, sorted);
}

#[test]
fn compaction_cascades_down_through_configured_levels() {
    let dir = tempdir().unwrap();
    let config = EngineConfig {
        nb_levels: 3,
        levels_ratio: 0.1,
        max_l0_sstables: 2,
        max_sstable_size: 256,
        block_size: 64,
    };
    let engine = Engine::create(config, dir.path()).unwrap();

    for batch in 0..6u32 {
        for i in 0..5u32 {
            engine
                .put(format!("k{batch:02}{i:02}").into_bytes(), vec![b'v'; 16])
                .unwrap();
        }
        while engine.flush_next_immutable_memtable().unwrap() {}
    }

    // The L0-size trigger should already have folded level 0 into level 1
    // via `try_compact` running after each flush.
    for batch in 0..6u32 {
        for i in 0..5u32 {
            let key = format!("k{batch:02}{i:02}").into_bytes();
            assert_eq!(engine.get(&key).unwrap(), Some(vec![b'v'; 16]));
        }
    }
}
