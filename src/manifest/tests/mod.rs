use tempfile::tempdir;

use crate::manifest::{Manifest, ManifestConfig, ManifestError};
use crate::sstable::SSTableBuilder;

fn test_config() -> ManifestConfig {
    ManifestConfig {
        nb_levels: 4,
        levels_ratio: 0.1,
        max_l0_sstables: 10,
        max_sstable_size: 256 * 1024 * 1024,
        block_size: 64 * 1024,
    }
}

fn build_sstable(dir: &std::path::Path, name: &str, pairs: &[(&[u8], &[u8])]) -> String {
    let path = dir.join(name);
    let mut builder = SSTableBuilder::new(1024 * 1024, 64);
    for (k, v) in pairs {
        builder.add(k, v).unwrap();
    }
    builder.build(&path).unwrap();
    name.to_string()
}

#[test]
fn create_then_open_round_trips_the_header() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("MANIFEST");
    let config = test_config();

    {
        let manifest = Manifest::create(&path, config).unwrap();
        assert_eq!(manifest.config(), config);
    }

    let reopened = Manifest::open(&path).unwrap();
    assert_eq!(reopened.config(), config);
}

#[test]
fn create_fails_if_path_already_exists() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("MANIFEST");
    Manifest::create(&path, test_config()).unwrap();

    let err = Manifest::create(&path, test_config()).unwrap_err();
    assert!(matches!(err, ManifestError::PathExists(_)));
}

#[test]
fn open_fails_if_path_is_missing() {
    let dir = tempdir().unwrap();
    let err = Manifest::open(dir.path().join("MANIFEST")).unwrap_err();
    assert!(matches!(err, ManifestError::PathMissing(_)));
}

#[test]
fn flush_is_replayed_into_level_zero() {
    let dir = tempdir().unwrap();
    let manifest = Manifest::create(dir.path().join("MANIFEST"), test_config()).unwrap();

    let a = build_sstable(dir.path(), "1.sst", &[(b"a", b"1")]);
    let b = build_sstable(dir.path(), "2.sst", &[(b"b", b"2")]);
    manifest.append_flush(a).unwrap();
    manifest.append_flush(b).unwrap();

    let levels = manifest.reconstruct_sstables(dir.path()).unwrap();
    assert_eq!(levels.len(), 4);
    // Most recent flush sits at the head of level 0.
    let l0_names: Vec<String> = levels[0]
        .iter()
        .map(|t| t.path().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(l0_names, vec!["2.sst".to_string(), "1.sst".to_string()]);
}

#[test]
fn compaction_removes_inputs_from_source_level_and_prepends_outputs_downstream() {
    let dir = tempdir().unwrap();
    let manifest = Manifest::create(dir.path().join("MANIFEST"), test_config()).unwrap();

    let l0_a = build_sstable(dir.path(), "1.sst", &[(b"a", b"1")]);
    let l0_b = build_sstable(dir.path(), "2.sst", &[(b"b", b"2")]);
    let l0_c = build_sstable(dir.path(), "3.sst", &[(b"c", b"3")]);
    manifest.append_flush(l0_a.clone()).unwrap();
    manifest.append_flush(l0_b.clone()).unwrap();
    manifest.append_flush(l0_c.clone()).unwrap();

    let merged = build_sstable(dir.path(), "10.sst", &[(b"a", b"1"), (b"b", b"2")]);
    manifest
        .append_compaction(0, vec![l0_a, l0_b], vec![merged])
        .unwrap();

    let levels = manifest.reconstruct_sstables(dir.path()).unwrap();

    // Only the uncompacted level-0 table remains at level 0.
    let l0_names: Vec<String> = levels[0]
        .iter()
        .map(|t| t.path().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(l0_names, vec!["3.sst".to_string()]);

    // The compaction's output landed at level 1.
    let l1_names: Vec<String> = levels[1]
        .iter()
        .map(|t| t.path().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(l1_names, vec!["10.sst".to_string()]);
}

#[test]
fn compaction_at_the_last_level_folds_outputs_back_into_itself() {
    let dir = tempdir().unwrap();
    let config = test_config();
    let last_level = (config.nb_levels - 1) as u8;
    let manifest = Manifest::create(dir.path().join("MANIFEST"), config).unwrap();

    // Seed the last level directly via a compaction with no prior inputs.
    let seed = build_sstable(dir.path(), "5.sst", &[(b"a", b"1")]);
    manifest
        .append_compaction(last_level, vec![], vec![seed.clone()])
        .unwrap();

    let merged = build_sstable(dir.path(), "6.sst", &[(b"a", b"1"), (b"z", b"2")]);
    manifest
        .append_compaction(last_level, vec![seed], vec![merged])
        .unwrap();

    let levels = manifest.reconstruct_sstables(dir.path()).unwrap();
    let names: Vec<String> = levels[last_level as usize]
        .iter()
        .map(|t| t.path().file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["6.sst".to_string()]);
}

#[test]
fn reconstruct_fails_when_a_referenced_sstable_is_missing() {
    let dir = tempdir().unwrap();
    let manifest = Manifest::create(dir.path().join("MANIFEST"), test_config()).unwrap();
    manifest.append_flush("does-not-exist.sst".to_string()).unwrap();

    let err = manifest.reconstruct_sstables(dir.path()).unwrap_err();
    assert!(matches!(err, ManifestError::Inconsistent(_)));
}

#[test]
fn appends_are_durable_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("MANIFEST");
    let table = build_sstable(dir.path(), "1.sst", &[(b"a", b"1")]);

    {
        let manifest = Manifest::create(&path, test_config()).unwrap();
        manifest.append_flush(table).unwrap();
    }

    let reopened = Manifest::open(&path).unwrap();
    let levels = reopened.reconstruct_sstables(dir.path()).unwrap();
    assert_eq!(levels[0].len(), 1);
}
