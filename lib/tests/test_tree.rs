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
use pretty_assertions::assert_eq;
use strata_lib::copies;
use strata_lib::copies::CopyKind;
use strata_lib::delta;
use strata_lib::error::FsError;
use strata_lib::node_rev::NodeKind;
use strata_lib::trail;
use testutils::TestFs;
use testutils::begin_txn;
use testutils::commit;
use testutils::create_file;
use testutils::read_file;
use testutils::write_file;

const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

#[test]
fn test_trivial_create() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;

    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    root.make_file("/a/f").unwrap();
    write_file(&root, "/a/f", "hello");
    assert_eq!(root.file_md5("/a/f").unwrap(), HELLO_MD5);

    let new_rev = commit(fs, &txn_id);
    assert_eq!(new_rev, 1);

    let rev_root = fs.revision_root(1).unwrap();
    assert_eq!(read_file(&rev_root, "/a/f"), "hello");
    assert_eq!(rev_root.file_md5("/a/f").unwrap(), HELLO_MD5);
    assert_eq!(rev_root.file_length("/a/f").unwrap(), 5);
    let entries = rev_root.dir_entries("/").unwrap();
    assert_eq!(entries.keys().collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(entries["a"].1, NodeKind::Dir);
}

#[test]
fn test_path_canonicalization() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("a//b///").unwrap_err();
    root.make_dir("a").unwrap();
    root.make_dir("a//b///").unwrap();
    assert_eq!(root.check_path("/a/b").unwrap(), Some(NodeKind::Dir));
    assert_eq!(root.node_created_path("a/b/").unwrap(), "/a/b");
}

#[test]
fn test_delete_root_dir() {
    let test_fs = TestFs::init();
    let txn_id = begin_txn(&test_fs.fs, 0);
    let root = test_fs.fs.txn_root(&txn_id).unwrap();
    assert_matches!(root.delete("/"), Err(FsError::RootDir));
}

#[test]
fn test_make_existing_fails() {
    let test_fs = TestFs::init();
    let txn_id = begin_txn(&test_fs.fs, 0);
    let root = test_fs.fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    assert_matches!(root.make_dir("/a"), Err(FsError::AlreadyExists { .. }));
    assert_matches!(root.make_file("/a"), Err(FsError::AlreadyExists { .. }));
}

#[test]
fn test_missing_parent_fails() {
    let test_fs = TestFs::init();
    let txn_id = begin_txn(&test_fs.fs, 0);
    let root = test_fs.fs.txn_root(&txn_id).unwrap();
    assert_matches!(root.make_file("/no/f"), Err(FsError::NotFound { .. }));
}

#[test]
fn test_traverse_through_file_fails() {
    let test_fs = TestFs::init();
    let txn_id = begin_txn(&test_fs.fs, 0);
    let root = test_fs.fs.txn_root(&txn_id).unwrap();
    root.make_file("/f").unwrap();
    assert_matches!(
        root.make_dir("/f/sub"),
        Err(FsError::NotDirectory { ref path }) if path == "/f"
    );
    assert_eq!(root.check_path("/f/sub").unwrap(), None);
}

#[test]
fn test_delete() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    create_file(&root, "/a/f", "contents");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    assert_matches!(root.delete("/nope"), Err(FsError::NotFound { .. }));
    root.delete("/a").unwrap();
    assert_eq!(root.check_path("/a").unwrap(), None);
    commit(fs, &txn_id);

    let rev_root = fs.revision_root(2).unwrap();
    assert_eq!(rev_root.check_path("/a").unwrap(), None);
    assert_eq!(rev_root.check_path("/a/f").unwrap(), None);
    // History is unaffected.
    let old_root = fs.revision_root(1).unwrap();
    assert_eq!(read_file(&old_root, "/a/f"), "contents");
}

#[test]
fn test_copy_with_history() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    create_file(&root, "/a/f", "payload");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    let src_root = fs.revision_root(1).unwrap();
    root.copy(&src_root, "/a", "/b", true).unwrap();
    commit(fs, &txn_id);

    let rev_root = fs.revision_root(2).unwrap();
    assert_eq!(read_file(&rev_root, "/b/f"), "payload");
    assert_eq!(rev_root.node_created_path("/b").unwrap(), "/b");

    let copy_id = rev_root.node_id("/b").unwrap().copy_id().clone();
    assert!(!copy_id.is_unbranched());
    let copy = trail::retry_txn(fs, |trail| copies::get(trail, &copy_id)).unwrap();
    assert_eq!(copy.kind, CopyKind::Real);
    assert_eq!(copy.src_path.as_deref(), Some("/a"));

    // The source and the copy are related but on different branches.
    let src_id = rev_root.node_id("/a").unwrap();
    let dst_id = rev_root.node_id("/b").unwrap();
    assert!(src_id.is_related_to(&dst_id));
    assert!(!src_id.same_branch_as(&dst_id));
}

#[test]
fn test_copy_without_history_shares_node() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    create_file(&root, "/a/f", "payload");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    let src_root = fs.revision_root(1).unwrap();
    root.copy(&src_root, "/a", "/b", false).unwrap();
    commit(fs, &txn_id);

    let rev_root = fs.revision_root(2).unwrap();
    assert_eq!(
        rev_root.node_id("/a").unwrap(),
        rev_root.node_id("/b").unwrap()
    );
    assert!(!rev_root.contents_changed("/a", &rev_root, "/b").unwrap());
    assert!(!rev_root.props_changed("/a", &rev_root, "/b").unwrap());
}

#[test]
fn test_soft_copy_on_modification_inside_copied_tree() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;

    // r1: /d/a/f
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/d").unwrap();
    root.make_dir("/d/a").unwrap();
    create_file(&root, "/d/a/f", "one");
    commit(fs, &txn_id);

    // r2: copy /d/a -> /d/b (a real copy).
    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    let src = fs.revision_root(1).unwrap();
    root.copy(&src, "/d/a", "/d/b", true).unwrap();
    commit(fs, &txn_id);

    // r3: copy /d -> /e; /e/b is now a copy target sitting at a path
    // other than its created path.
    let txn_id = begin_txn(fs, 2);
    let root = fs.txn_root(&txn_id).unwrap();
    let src = fs.revision_root(2).unwrap();
    root.copy(&src, "/d", "/e", true).unwrap();
    commit(fs, &txn_id);

    // r4: first modification under /e/b forces a fresh soft copy id.
    let txn_id = begin_txn(fs, 3);
    let root = fs.txn_root(&txn_id).unwrap();
    write_file(&root, "/e/b/f", "two");
    commit(fs, &txn_id);

    let rev_root = fs.revision_root(4).unwrap();
    let b_copy_id = rev_root.node_id("/e/b").unwrap().copy_id().clone();
    let old_b_copy_id = fs
        .revision_root(3)
        .unwrap()
        .node_id("/e/b")
        .unwrap()
        .copy_id()
        .clone();
    let e_copy_id = rev_root.node_id("/e").unwrap().copy_id().clone();
    assert_ne!(b_copy_id, old_b_copy_id);
    assert_ne!(b_copy_id, e_copy_id);
    let copy = trail::retry_txn(fs, |trail| copies::get(trail, &b_copy_id)).unwrap();
    assert_eq!(copy.kind, CopyKind::Soft);
    assert_eq!(copy.src_path.as_deref(), Some("/d/b"));
    assert_eq!(read_file(&rev_root, "/e/b/f"), "two");
    // The sibling copy of the same history is untouched.
    assert_eq!(read_file(&rev_root, "/d/b/f"), "one");
}

#[test]
fn test_node_props() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_file("/f").unwrap();
    root.change_node_prop("/f", "color", Some("blue")).unwrap();
    root.change_node_prop("/f", "mood", Some("gone")).unwrap();
    root.change_node_prop("/f", "mood", None).unwrap();
    commit(fs, &txn_id);

    let rev_root = fs.revision_root(1).unwrap();
    assert_eq!(rev_root.node_prop("/f", "color").unwrap().as_deref(), Some("blue"));
    assert_eq!(rev_root.node_prop("/f", "mood").unwrap(), None);
    assert_eq!(rev_root.node_proplist("/f").unwrap().len(), 1);
}

#[test]
fn test_rename_keeps_node_identity() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    root.make_dir("/b").unwrap();
    create_file(&root, "/a/f", "moving");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    let old_id = root.node_id("/a/f").unwrap();
    root.rename("/a/f", "/b/g").unwrap();
    assert_eq!(root.check_path("/a/f").unwrap(), None);
    assert_eq!(read_file(&root, "/b/g"), "moving");
    assert_eq!(
        root.node_id("/b/g").unwrap().node_id(),
        old_id.node_id()
    );
    commit(fs, &txn_id);

    let rev_root = fs.revision_root(2).unwrap();
    assert_eq!(rev_root.check_path("/a/f").unwrap(), None);
    assert_eq!(read_file(&rev_root, "/b/g"), "moving");
}

#[test]
fn test_apply_textdelta() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    create_file(&root, "/f", "the quick brown fox");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    let base_md5 = root.file_md5("/f").unwrap();
    let mut applier = root
        .apply_textdelta("/f", Some(&base_md5), None)
        .unwrap();
    for window in delta::encode(b"the quick brown fox", b"the quick red fox") {
        applier.apply_window(&window);
    }
    applier.close().unwrap();
    assert_eq!(read_file(&root, "/f"), "the quick red fox");
    commit(fs, &txn_id);
    assert_eq!(
        read_file(&fs.revision_root(2).unwrap(), "/f"),
        "the quick red fox"
    );
}

#[test]
fn test_apply_textdelta_base_checksum_mismatch() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    create_file(&root, "/f", "contents");
    assert_matches!(
        root.apply_textdelta("/f", Some(HELLO_MD5), None),
        Err(FsError::ChecksumMismatch { .. })
    );
}

#[test]
fn test_apply_text_result_checksum_mismatch() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    create_file(&root, "/f", "original");

    let mut writer = root.apply_text("/f", Some(HELLO_MD5)).unwrap();
    writer.write(b"not hello");
    assert_matches!(writer.close(), Err(FsError::ChecksumMismatch { .. }));
    // The failed write did not replace the contents.
    assert_eq!(read_file(&root, "/f"), "original");
}

#[test]
fn test_mutation_requires_txn_root() {
    let test_fs = TestFs::init();
    let rev_root = test_fs.fs.revision_root(0).unwrap();
    assert_matches!(rev_root.make_dir("/a"), Err(FsError::NotTxnRoot));
    assert_matches!(rev_root.delete("/a"), Err(FsError::NotTxnRoot));
}
