use super::*;
use crate::compaction::CompactionFilter;
use kvtypes::VALUE_POINTER;
use std::path::Path;
use std::sync::Arc;
use stele::TableOptions;
use tempfile::tempdir;

fn test_opts(dir: &Path) -> LevelsOptions {
    LevelsOptions::new()
        .set_dir(dir.to_path_buf())
        .set_max_levels(5)
        .set_num_level_zero_tables(3)
        .set_num_level_zero_tables_stall(5)
        .set_level_one_size(1 << 20)
        .set_level_size_multiplier(10)
}

fn open(opts: LevelsOptions) -> (LevelsController, RefCounter<Oracle>, DiscardStats) {
    let orc = RefCounter::new(Oracle::new());
    let discard = DiscardStats::new();
    let lc = LevelsController::open(opts, orc.clone(), discard.clone()).unwrap();
    (lc, orc, discard)
}

fn data(v: &str) -> Value {
    Value::from_data(v.as_bytes().to_vec())
}

fn pointer(fid: u32, len: u32) -> Value {
    Value {
        meta: VALUE_POINTER,
        user_meta: 0,
        version: 0,
        value: ValuePointer {
            fid,
            len,
            offset: 0,
        }
        .encode(),
    }
}

fn build_table(dir: &Path, id: u64, entries: &[(&str, u64, Value)]) -> Table {
    let mut b = Builder::new(TableOptions::default());
    for (k, ts, v) in entries {
        b.insert(&key_with_ts(k.as_bytes(), *ts), v);
    }
    Table::create(new_filename(id, dir), b, &RateLimiter::unlimited()).unwrap()
}

/// Puts a table file in place and registers it in the manifest, before the
/// controller opens the directory.
fn seed_table(dir: &Path, id: u64, level: u32, entries: &[(&str, u64, Value)]) {
    drop(build_table(dir, id, entries));
    let manifest = Manifest::open(dir, false).unwrap();
    manifest
        .add_changes(vec![ManifestChange::Create { id, level }])
        .unwrap();
}

fn add_l0(lc: &LevelsController, dir: &Path, entries: &[(&str, u64, Value)]) {
    let id = lc.reserve_file_id();
    let t = build_table(dir, id, entries);
    lc.add_level0_table(t).unwrap();
}

fn prio(level: usize) -> CompactionPriority {
    CompactionPriority { level, score: 1.0 }
}

fn level_table_count(lc: &LevelsController, level: usize) -> usize {
    lc.core().levels[level].num_tables()
}

#[test]
fn level0_tables_compact_into_level1() {
    let dir = tempdir().unwrap();
    let (lc, _orc, _) = open(test_opts(dir.path()));

    add_l0(&lc, dir.path(), &[("a", 1, data("a1")), ("b", 1, data("b1"))]);
    add_l0(&lc, dir.path(), &[("b", 2, data("b2")), ("c", 2, data("c2"))]);
    add_l0(&lc, dir.path(), &[("c", 3, data("c3")), ("d", 3, data("d3"))]);

    let prios = lc.core().pick_compact_levels();
    assert_eq!(prios[0].level, 0);
    assert!(prios[0].score >= 1.0);

    assert!(lc.core().do_compact(&prios[0]).unwrap());

    assert_eq!(level_table_count(&lc, 0), 0);
    assert!(level_table_count(&lc, 1) >= 1);
    lc.core().validate().unwrap();

    // Newest version per user key wins on reads.
    let b = lc.get(&key_with_ts(b"b", u64::MAX)).unwrap();
    assert_eq!(b.version, 2);
    assert_eq!(b.value.as_ref(), b"b2");
    let c = lc.get(&key_with_ts(b"c", u64::MAX)).unwrap();
    assert_eq!(c.version, 3);
    assert_eq!(c.value.as_ref(), b"c3");
    // With no reader horizon set, old versions survive the merge.
    let b_old = lc.get(&key_with_ts(b"b", 1)).unwrap();
    assert_eq!(b_old.version, 1);
}

#[test]
fn level1_to_level2_keeps_only_visible_versions() {
    let dir = tempdir().unwrap();
    seed_table(
        dir.path(),
        10,
        1,
        &[
            ("a", 5, data("a5")),
            ("c", 5, data("c5")),
            ("f", 5, data("f5")),
            ("m", 5, data("m5")),
        ],
    );
    seed_table(
        dir.path(),
        11,
        2,
        &[("a", 1, data("a1")), ("f", 1, data("f1"))],
    );
    seed_table(
        dir.path(),
        12,
        2,
        &[("g", 1, data("g1")), ("n", 1, data("n1"))],
    );

    let (lc, orc, _) = open(test_opts(dir.path()));
    orc.update_min_read_ts(u64::MAX);

    assert!(lc.core().do_compact(&prio(1)).unwrap());

    assert_eq!(level_table_count(&lc, 1), 0);
    lc.core().validate().unwrap();

    // One version per user key: a5, c5, f5, g1, m5, n1.
    let total_keys: usize = {
        let inner = lc.core().levels[2].read();
        inner.tables.iter().map(|t| t.key_count()).sum()
    };
    assert_eq!(total_keys, 6);
    assert_eq!(
        lc.get(&key_with_ts(b"a", u64::MAX)).unwrap().value.as_ref(),
        b"a5"
    );
    assert_eq!(
        lc.get(&key_with_ts(b"g", u64::MAX)).unwrap().value.as_ref(),
        b"g1"
    );
    // The shadowed version is gone.
    assert!(lc.get(&key_with_ts(b"a", 1)).is_none());

    // The manifest dropped all three inputs and created the outputs at
    // level 2.
    let tables = lc.manifest().tables();
    assert!(!tables.contains_key(&10));
    assert!(!tables.contains_key(&11));
    assert!(!tables.contains_key(&12));
    assert!(tables.values().all(|tm| tm.level == 2));
    assert!(!tables.is_empty());
}

struct DropEverything;

impl CompactionFilter for DropEverything {
    fn filter(&mut self, _key: &[u8], _value: &[u8], _user_meta: u8) -> Decision {
        Decision::MarkTombstone
    }
}

#[test]
fn filter_tombstones_everything_without_overlap() {
    let dir = tempdir().unwrap();
    seed_table(
        dir.path(),
        10,
        1,
        &[("a", 5, data("a")), ("c", 5, data("c"))],
    );
    seed_table(dir.path(), 11, 2, &[("b", 1, data("b"))]);

    let opts = test_opts(dir.path()).set_compaction_filter_factory(Arc::new(|| {
        Box::new(DropEverything) as Box<dyn CompactionFilter>
    }));
    let (lc, orc, _) = open(opts);
    orc.update_min_read_ts(u64::MAX);

    assert!(lc.core().do_compact(&prio(1)).unwrap());

    // No survivors, no output tables; the manifest holds only deletions.
    assert_eq!(level_table_count(&lc, 1), 0);
    assert!(lc.manifest().tables().is_empty());
    assert!(lc.get(&key_with_ts(b"a", u64::MAX)).is_none());
    assert!(lc.get(&key_with_ts(b"c", u64::MAX)).is_none());
}

struct GuardAt {
    guard: &'static [u8],
}

impl CompactionFilter for GuardAt {
    fn guards(&self) -> Vec<Bytes> {
        vec![Bytes::from_static(self.guard)]
    }

    fn filter(&mut self, _key: &[u8], _value: &[u8], _user_meta: u8) -> Decision {
        Decision::Keep
    }
}

#[test]
fn guards_split_output_files() {
    let dir = tempdir().unwrap();
    let opts = test_opts(dir.path()).set_compaction_filter_factory(Arc::new(|| {
        Box::new(GuardAt { guard: b"m" }) as Box<dyn CompactionFilter>
    }));
    let (lc, _orc, _) = open(opts);

    let entries: Vec<(String, u64, Value)> = (b'a'..=b'z')
        .map(|c| ((c as char).to_string(), 1, data("v")))
        .collect();
    let borrowed: Vec<(&str, u64, Value)> = entries
        .iter()
        .map(|(k, ts, v)| (k.as_str(), *ts, v.clone()))
        .collect();
    add_l0(&lc, dir.path(), &borrowed);

    assert!(lc.core().do_compact(&prio(0)).unwrap());

    let inner = lc.core().levels[1].read();
    assert_eq!(inner.tables.len(), 2, "one split at the guard");
    assert_eq!(inner.tables[0].smallest().parse_key(), b"a");
    assert_eq!(inner.tables[0].biggest().parse_key(), b"l");
    assert_eq!(inner.tables[1].smallest().parse_key(), b"m");
    assert_eq!(inner.tables[1].biggest().parse_key(), b"z");
}

#[test]
fn admission_stalls_until_levels_recover() {
    let dir = tempdir().unwrap();
    let opts = test_opts(dir.path())
        .set_num_level_zero_tables(3)
        .set_num_level_zero_tables_stall(4);
    let (lc, _orc, _) = open(opts);

    for i in 0..4u64 {
        add_l0(
            &lc,
            dir.path(),
            &[("k", i + 1, data("v"))],
        );
    }
    assert_eq!(level_table_count(&lc, 0), 4);

    let (done_tx, done_rx) = crossbeam_channel::bounded(1);
    let lc2 = lc.clone();
    let id = lc.reserve_file_id();
    let blocked = build_table(dir.path(), id, &[("k", 9, data("v"))]);
    std::thread::spawn(move || {
        lc2.add_level0_table(blocked).unwrap();
        done_tx.send(()).unwrap();
    });

    // The admission must still be blocked after a generous delay.
    assert!(done_rx
        .recv_timeout(Duration::from_millis(200))
        .is_err());

    // Compacting level 0 away lifts the stall.
    assert!(lc.core().do_compact(&prio(0)).unwrap());
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("admission must resume after compaction");
    assert_eq!(level_table_count(&lc, 0), 1);
}

#[test]
fn overlapping_reservations_admit_exactly_one() {
    let dir = tempdir().unwrap();
    seed_table(
        dir.path(),
        20,
        3,
        &[("a", 1, data("1")), ("c", 1, data("1")), ("e", 1, data("1"))],
    );
    seed_table(dir.path(), 21, 3, &[("x", 1, data("1")), ("z", 1, data("1"))]);
    let (lc, _orc, _) = open(test_opts(dir.path()));
    let core = lc.core();

    let mut cd1 = CompactDef::new(core.levels[3].clone(), core.levels[4].clone());
    cd1.this_range = KeyRange::new(key_with_ts(b"a", u64::MAX), key_with_ts(b"e", 0));
    cd1.next_range = cd1.this_range.clone();
    assert!(core.cstatus.compare_and_add(&cd1));

    // A second worker racing for an overlapping range loses.
    let mut cd2 = CompactDef::new(core.levels[3].clone(), core.levels[4].clone());
    cd2.this_range = KeyRange::new(key_with_ts(b"b", u64::MAX), key_with_ts(b"d", 0));
    cd2.next_range = cd2.this_range.clone();
    assert!(!core.cstatus.compare_and_add(&cd2));

    // The loser's planner picks the other, unreserved table instead.
    let mut cd3 = CompactDef::new(core.levels[3].clone(), core.levels[4].clone());
    assert!(core.fill_tables(&mut cd3));
    assert_eq!(cd3.top.len(), 1);
    assert_eq!(cd3.top[0].id(), 21);
    core.cstatus.delete(&cd3);

    // Releasing the first reservation frees the range.
    core.cstatus.delete(&cd1);
    assert!(core.cstatus.compare_and_add(&cd2));
    core.cstatus.delete(&cd2);
}

#[test]
fn empty_bottom_moves_table_down() {
    let dir = tempdir().unwrap();
    seed_table(dir.path(), 10, 1, &[("a", 1, data("a")), ("c", 1, data("c"))]);
    let (lc, _orc, _) = open(test_opts(dir.path()));

    assert!(lc.core().do_compact(&prio(1)).unwrap());

    // Same file, one level deeper; no rewrite happened.
    assert_eq!(level_table_count(&lc, 1), 0);
    let inner = lc.core().levels[2].read();
    assert_eq!(inner.tables.len(), 1);
    assert_eq!(inner.tables[0].id(), 10);
    drop(inner);
    assert_eq!(lc.manifest().tables()[&10].level, 2);
    assert!(new_filename(10, dir.path()).exists());
    assert_eq!(
        lc.get(&key_with_ts(b"a", u64::MAX)).unwrap().value.as_ref(),
        b"a"
    );
}

#[test]
fn tombstone_dropped_when_nothing_deeper() {
    let dir = tempdir().unwrap();
    seed_table(
        dir.path(),
        10,
        1,
        &[
            ("a", 1, data("live")),
            ("k", 5, Value::tombstone()),
            ("z", 1, data("live")),
        ],
    );
    seed_table(dir.path(), 11, 2, &[("k", 3, data("old"))]);

    let (lc, orc, _) = open(test_opts(dir.path()));
    orc.update_min_read_ts(u64::MAX);

    assert!(lc.core().do_compact(&prio(1)).unwrap());

    // No deeper level holds k, so the tombstone and everything it shadowed
    // are gone.
    assert!(lc.get(&key_with_ts(b"k", u64::MAX)).is_none());
    assert_eq!(
        lc.get(&key_with_ts(b"a", u64::MAX)).unwrap().value.as_ref(),
        b"live"
    );
}

#[test]
fn tombstone_kept_while_deeper_versions_exist() {
    let dir = tempdir().unwrap();
    seed_table(
        dir.path(),
        10,
        1,
        &[
            ("a", 1, data("live")),
            ("k", 5, Value::tombstone()),
            ("z", 1, data("live")),
        ],
    );
    seed_table(dir.path(), 11, 2, &[("k", 3, data("old"))]);
    seed_table(dir.path(), 12, 3, &[("k", 1, data("older"))]);

    let (lc, orc, _) = open(test_opts(dir.path()));
    orc.update_min_read_ts(u64::MAX);

    assert!(lc.core().do_compact(&prio(1)).unwrap());

    // Level 3 still holds k@1, so the deletion marker must survive to keep
    // shadowing it.
    let v = lc.get(&key_with_ts(b"k", u64::MAX)).unwrap();
    assert!(v.is_deleted());
    assert_eq!(v.version, 5);
}

#[test]
fn dropped_value_pointers_feed_gc_stats() {
    let dir = tempdir().unwrap();
    seed_table(
        dir.path(),
        10,
        1,
        &[("k", 5, data("new")), ("k", 3, pointer(9, 100))],
    );
    seed_table(dir.path(), 11, 2, &[("k", 1, pointer(9, 50))]);

    let (lc, orc, discard) = open(test_opts(dir.path()));
    orc.update_min_read_ts(u64::MAX);

    assert!(lc.core().do_compact(&prio(1)).unwrap());

    assert_eq!(discard.discard_bytes(9), 150);
    assert_eq!(discard.max_discard(), Some((9, 150)));
    assert_eq!(
        lc.get(&key_with_ts(b"k", u64::MAX)).unwrap().value.as_ref(),
        b"new"
    );
}

#[test]
fn level0_priority_suppressed_while_reserved() {
    let dir = tempdir().unwrap();
    let (lc, _orc, _) = open(test_opts(dir.path()));

    for i in 0..3u64 {
        add_l0(&lc, dir.path(), &[("k", i + 1, data("v"))]);
    }
    let core = lc.core();
    assert!(core.pick_compact_levels().iter().any(|p| p.level == 0));

    let mut cd = CompactDef::new(core.levels[0].clone(), core.levels[1].clone());
    assert!(core.fill_tables_l0(&mut cd));
    // With the infinite range reserved, level 0 drops out of the planner.
    assert!(!core.pick_compact_levels().iter().any(|p| p.level == 0));
    core.cstatus.delete(&cd);
    assert!(core.pick_compact_levels().iter().any(|p| p.level == 0));
}

#[test]
fn delta_size_discounts_running_compactions() {
    let dir = tempdir().unwrap();
    // A tiny level-1 target so a single seeded table trips the score.
    let opts = test_opts(dir.path()).set_level_one_size(50);
    seed_table(dir.path(), 10, 1, &[("a", 1, data("aaaaaaaaaa"))]);
    let (lc, _orc, _) = open(opts);
    let core = lc.core();

    assert!(core
        .pick_compact_levels()
        .iter()
        .any(|p| p.level == 1 && p.score >= 1.0));

    // Reserving the level-0 infinite range with the whole level-1 size as
    // incoming delta cancels level 1's urgency.
    let mut cd = CompactDef::new(core.levels[0].clone(), core.levels[1].clone());
    cd.this_range = KeyRange::infinite();
    cd.next_range = KeyRange::infinite();
    cd.this_size = core.levels[1].get_total_size() + 1024;
    assert!(core.cstatus.compare_and_add(&cd));
    assert_eq!(core.cstatus.delta_size(1), cd.this_size);
    assert!(!core.pick_compact_levels().iter().any(|p| p.level == 1));
    core.cstatus.delete(&cd);
    assert_eq!(core.cstatus.delta_size(1), 0);
}

#[test]
fn sub_compactions_cover_the_key_space() {
    let dir = tempdir().unwrap();
    let opts = test_opts(dir.path())
        .set_max_sub_compaction(3)
        .set_max_table_size(512);
    let (lc, orc, _) = open(opts);
    orc.update_min_read_ts(u64::MAX);

    // First wave builds a populated level 1.
    let first: Vec<(String, u64, Value)> = (0..60u32)
        .map(|i| (format!("key{:03}", i), 1, data("0123456789abcdef")))
        .collect();
    let borrowed: Vec<(&str, u64, Value)> = first
        .iter()
        .map(|(k, ts, v)| (k.as_str(), *ts, v.clone()))
        .collect();
    add_l0(&lc, dir.path(), &borrowed);
    assert!(lc.core().do_compact(&prio(0)).unwrap());
    assert!(level_table_count(&lc, 1) > 1);

    // Second wave overlaps it, forcing a sharded merge.
    let second: Vec<(String, u64, Value)> = (0..60u32)
        .map(|i| (format!("key{:03}", i), 2, data("fedcba9876543210")))
        .collect();
    let borrowed: Vec<(&str, u64, Value)> = second
        .iter()
        .map(|(k, ts, v)| (k.as_str(), *ts, v.clone()))
        .collect();
    add_l0(&lc, dir.path(), &borrowed);
    assert!(lc.core().do_compact(&prio(0)).unwrap());

    assert_eq!(level_table_count(&lc, 0), 0);
    lc.core().validate().unwrap();
    for i in 0..60u32 {
        let key = format!("key{:03}", i);
        let v = lc
            .get(&key_with_ts(key.as_bytes(), u64::MAX))
            .unwrap_or_else(|| panic!("{} lost in sub-compaction", key));
        assert_eq!(v.version, 2, "{} must come from the second wave", key);
        assert_eq!(v.value.as_ref(), b"fedcba9876543210");
    }
}

#[test]
fn reopen_restores_levels_and_cleans_strays() {
    let dir = tempdir().unwrap();
    {
        let (lc, _orc, _) = open(test_opts(dir.path()));
        add_l0(&lc, dir.path(), &[("a", 1, data("a")), ("b", 1, data("b"))]);
        add_l0(&lc, dir.path(), &[("c", 2, data("c"))]);
        add_l0(&lc, dir.path(), &[("d", 3, data("d"))]);
        assert!(lc.core().do_compact(&prio(0)).unwrap());
        lc.close().unwrap();
    }

    // A leftover of an abandoned compaction.
    let stray = {
        let mut b = Builder::new(TableOptions::default());
        b.insert(&key_with_ts(b"zz", 1), &data("junk"));
        let t = Table::create(new_filename(999, dir.path()), b, &RateLimiter::unlimited())
            .unwrap();
        t.path().to_path_buf()
    };
    assert!(stray.exists());

    let (lc, _orc, _) = open(test_opts(dir.path()));
    assert!(!stray.exists(), "unreferenced table files are removed");
    assert_eq!(
        lc.get(&key_with_ts(b"a", u64::MAX)).unwrap().value.as_ref(),
        b"a"
    );
    assert_eq!(
        lc.get(&key_with_ts(b"d", u64::MAX)).unwrap().value.as_ref(),
        b"d"
    );

    // New file ids keep climbing past everything on disk.
    let infos = lc.get_table_info();
    let max_id = infos.iter().map(|ti| ti.id).max().unwrap();
    assert!(lc.reserve_file_id() > max_id);
}

#[test]
fn missing_referenced_file_fails_open() {
    let dir = tempdir().unwrap();
    {
        let (lc, _orc, _) = open(test_opts(dir.path()));
        add_l0(&lc, dir.path(), &[("a", 1, data("a"))]);
        lc.close().unwrap();
    }
    let infos_path = {
        let ids = get_id_map(dir.path()).unwrap();
        new_filename(*ids.iter().next().unwrap(), dir.path())
    };
    std::fs::remove_file(&infos_path).unwrap();

    let orc = RefCounter::new(Oracle::new());
    let err = LevelsController::open(test_opts(dir.path()), orc, DiscardStats::new());
    assert!(matches!(err, Err(Error::Corruption(_))));
}

#[test]
fn table_info_is_sorted_and_complete() {
    let dir = tempdir().unwrap();
    seed_table(dir.path(), 10, 1, &[("a", 1, data("a"))]);
    seed_table(dir.path(), 11, 2, &[("b", 1, data("b"))]);
    let (lc, _orc, _) = open(test_opts(dir.path()));
    add_l0(&lc, dir.path(), &[("c", 1, data("c"))]);

    let infos = lc.get_table_info();
    assert_eq!(infos.len(), 3);
    assert!(infos.windows(2).all(|w| (w[0].level, w[0].id) <= (w[1].level, w[1].id)));
    assert_eq!(infos[1].id, 10);
    assert_eq!(infos[1].left.parse_key(), b"a");
}
