// Copyright 2024-2025 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use assert_matches::assert_matches;
use strata_lib::changes::ChangeKind;
use strata_lib::error::FsError;
use testutils::TestFs;
use testutils::begin_txn;
use testutils::commit;
use testutils::create_file;
use testutils::write_file;

#[test]
fn test_list_transactions() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    assert!(fs.list_transactions().unwrap().is_empty());

    let txn_a = begin_txn(fs, 0);
    let txn_b = begin_txn(fs, 0);
    let listed = fs.list_transactions().unwrap();
    assert!(listed.contains(&txn_a));
    assert!(listed.contains(&txn_b));

    fs.abort_txn(&txn_a).unwrap();
    let listed = fs.list_transactions().unwrap();
    assert!(!listed.contains(&txn_a));
    assert!(listed.contains(&txn_b));

    commit(fs, &txn_b);
    assert!(fs.list_transactions().unwrap().is_empty());
}

#[test]
fn test_abort_reclaims_txn() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    create_file(&root, "/a/f", "doomed");
    fs.abort_txn(&txn_id).unwrap();

    assert_matches!(fs.open_txn(txn_id.as_str()), Err(FsError::NoSuchTxn { .. }));
    assert_eq!(fs.youngest_rev().unwrap(), 0);
    assert!(
        fs.revision_root(0)
            .unwrap()
            .dir_entries("/")
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_txn_props() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    fs.set_txn_prop(&txn_id, "log", Some("work in progress"))
        .unwrap();
    assert_eq!(
        fs.txn_prop(&txn_id, "log").unwrap().as_deref(),
        Some("work in progress")
    );
    fs.set_txn_prop(&txn_id, "log", None).unwrap();
    assert_eq!(fs.txn_prop(&txn_id, "log").unwrap(), None);
}

#[test]
fn test_open_txn() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    assert_eq!(fs.open_txn(txn_id.as_str()).unwrap(), txn_id);
    assert_matches!(fs.open_txn("zz"), Err(FsError::NoSuchTxn { .. }));
}

// Deleting and re-creating a path within one txn aggregates to a single
// replacement.
#[test]
fn test_delete_then_create_aggregates_to_replace() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    create_file(&root, "/a/f", "old");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    root.delete("/a/f").unwrap();
    root.make_file("/a/f").unwrap();
    write_file(&root, "/a/f", "new");

    let changed = root.paths_changed().unwrap();
    let entry = &changed["/a/f"];
    assert_eq!(entry.kind, ChangeKind::Replace);
    assert!(entry.text_mod);

    commit(fs, &txn_id);
    let changed = fs.revision_root(2).unwrap().paths_changed().unwrap();
    assert_eq!(changed["/a/f"].kind, ChangeKind::Replace);
    assert!(changed["/a/f"].text_mod);
}

#[test]
fn test_add_then_delete_cancels_out() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_file("/x").unwrap();
    root.delete("/x").unwrap();
    assert!(!root.paths_changed().unwrap().contains_key("/x"));
}

#[test]
fn test_paths_changed_kinds() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/d").unwrap();
    create_file(&root, "/d/f", "1");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    write_file(&root, "/d/f", "2");
    root.change_node_prop("/d", "k", Some("v")).unwrap();
    root.make_file("/d/g").unwrap();
    let changed = root.paths_changed().unwrap();
    assert_eq!(changed["/d/f"].kind, ChangeKind::Modify);
    assert!(changed["/d/f"].text_mod);
    assert!(!changed["/d/f"].prop_mod);
    assert_eq!(changed["/d"].kind, ChangeKind::Modify);
    assert!(changed["/d"].prop_mod);
    assert_eq!(changed["/d/g"].kind, ChangeKind::Add);
}

#[test]
fn test_revision_count_tracks_youngest() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    for expected_rev in 1..=3u64 {
        let txn_id = begin_txn(fs, expected_rev - 1);
        let root = fs.txn_root(&txn_id).unwrap();
        root.make_dir(&format!("/d{expected_rev}")).unwrap();
        assert_eq!(commit(fs, &txn_id), expected_rev);
        assert_eq!(fs.youngest_rev().unwrap(), expected_rev);
        assert_matches!(
            fs.revision_root(expected_rev + 1),
            Err(FsError::DanglingRev { .. })
        );
    }
}

// Revision dates never go backwards.
#[test]
fn test_monotonic_revision_dates() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    for rev in 1..=3u64 {
        let txn_id = begin_txn(fs, rev - 1);
        let root = fs.txn_root(&txn_id).unwrap();
        root.make_dir(&format!("/d{rev}")).unwrap();
        commit(fs, &txn_id);
    }
    let dates: Vec<String> = (0..=3u64)
        .map(|rev| {
            fs.revision_prop(rev, strata_lib::revisions::PROP_REVISION_DATE)
                .unwrap()
                .unwrap()
        })
        .collect();
    // RFC 3339 timestamps in UTC compare correctly as strings.
    assert!(dates.windows(2).all(|pair| pair[0] <= pair[1]));
}
