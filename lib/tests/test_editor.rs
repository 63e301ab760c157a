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

use std::cell::Cell;
use std::collections::BTreeMap;

use assert_matches::assert_matches;
use strata_lib::editor::ElementEditor;
use strata_lib::editor::NodeContent;
use strata_lib::editor::PathEditor;
use strata_lib::element::BranchRef;
use strata_lib::element::Payload;
use strata_lib::error::FsError;
use strata_lib::node_rev::NodeKind;
use testutils::TestFs;
use testutils::begin_txn;
use testutils::commit;
use testutils::create_file;
use testutils::read_file;

#[test]
fn test_path_editor_drive() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);

    let mut editor = PathEditor::new(fs, &txn_id).unwrap();
    editor.mk(NodeKind::Dir, "/", "src").unwrap();
    editor.mk(NodeKind::File, "/src", "main.rs").unwrap();
    editor
        .put(
            "/src/main.rs",
            &NodeContent::File {
                text: b"fn main() {}".to_vec(),
            },
        )
        .unwrap();
    editor
        .put(
            "/src",
            &NodeContent::Dir {
                props: BTreeMap::from([("lang".to_string(), "rust".to_string())]),
            },
        )
        .unwrap();
    editor.complete().unwrap();

    commit(fs, &txn_id);
    let rev_root = fs.revision_root(1).unwrap();
    assert_eq!(read_file(&rev_root, "/src/main.rs"), "fn main() {}");
    assert_eq!(
        rev_root.node_prop("/src", "lang").unwrap().as_deref(),
        Some("rust")
    );
}

#[test]
fn test_path_editor_preconditions() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;

    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/d").unwrap();
    create_file(&root, "/d/f", "existing");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let mut editor = PathEditor::new(fs, &txn_id).unwrap();

    // mk: parent must exist, sibling name must be free, name must be a
    // single component.
    assert_matches!(
        editor.mk(NodeKind::Dir, "/missing", "x"),
        Err(FsError::NotFound { .. })
    );
    assert_matches!(
        editor.mk(NodeKind::Dir, "/d", "f"),
        Err(FsError::AlreadyExists { .. })
    );
    assert_matches!(
        editor.mk(NodeKind::Dir, "/", "a/b"),
        Err(FsError::NotSinglePathComponent { .. })
    );
    assert_matches!(
        editor.mk(NodeKind::Dir, "/d/f", "x"),
        Err(FsError::NotDirectory { .. })
    );

    // cp: source must exist in the named revision.
    assert_matches!(
        editor.cp(1, "/nope", "/d", "copy"),
        Err(FsError::NotFound { .. })
    );
    assert_matches!(
        editor.cp(1, "/d/f", "/d", "f"),
        Err(FsError::AlreadyExists { .. })
    );

    // mv: source must exist in the txn.
    assert_matches!(
        editor.mv("/nope", "/d", "x"),
        Err(FsError::NotFound { .. })
    );

    // rm: target must exist.
    assert_matches!(editor.rm("/nope"), Err(FsError::NotFound { .. }));

    // put: node must exist and match the content kind.
    assert_matches!(
        editor.put("/nope", &NodeContent::File { text: vec![] }),
        Err(FsError::NotFound { .. })
    );
    assert_matches!(
        editor.put(
            "/d",
            &NodeContent::File { text: vec![] }
        ),
        Err(FsError::NotFile { .. })
    );
    assert_matches!(
        editor.put(
            "/d/f",
            &NodeContent::Dir {
                props: BTreeMap::new()
            }
        ),
        Err(FsError::NotDirectory { .. })
    );
}

#[test]
fn test_path_editor_rm_refuses_created_descendants() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let mut editor = PathEditor::new(fs, &txn_id).unwrap();
    editor.mk(NodeKind::Dir, "/", "d").unwrap();
    editor.mk(NodeKind::File, "/d", "f").unwrap();
    assert_matches!(editor.rm("/d"), Err(FsError::Malformed(_)));
    // Removing the created leaf itself is fine, and unblocks the parent.
    editor.rm("/d/f").unwrap();
    editor.rm("/d").unwrap();
}

#[test]
fn test_path_editor_cp_and_mv() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_dir("/a").unwrap();
    create_file(&root, "/a/f", "payload");
    commit(fs, &txn_id);

    let txn_id = begin_txn(fs, 1);
    let mut editor = PathEditor::new(fs, &txn_id).unwrap();
    editor.cp(1, "/a", "/", "a-copy").unwrap();
    editor.mv("/a-copy/f", "/", "moved").unwrap();
    editor.complete().unwrap();
    commit(fs, &txn_id);

    let rev_root = fs.revision_root(2).unwrap();
    assert_eq!(read_file(&rev_root, "/moved"), "payload");
    assert_eq!(rev_root.check_path("/a-copy/f").unwrap(), None);
    assert_eq!(read_file(&rev_root, "/a/f"), "payload");
}

#[test]
fn test_editor_cancellation() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);

    let calls = Cell::new(0u32);
    let mut editor = PathEditor::new(fs, &txn_id)
        .unwrap()
        .with_cancel(Box::new(|| {
            calls.set(calls.get() + 1);
            calls.get() > 1
        }));
    // The first operation runs; the second sees the cancellation.
    editor.mk(NodeKind::Dir, "/", "kept").unwrap();
    assert_matches!(
        editor.mk(NodeKind::Dir, "/", "dropped"),
        Err(FsError::Cancelled)
    );
}

#[test]
fn test_editor_rejects_operations_after_complete() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let txn_id = begin_txn(fs, 0);
    let mut editor = PathEditor::new(fs, &txn_id).unwrap();
    editor.complete().unwrap();
    assert_matches!(
        editor.mk(NodeKind::Dir, "/", "late"),
        Err(FsError::Malformed(_))
    );
    assert_matches!(editor.complete(), Err(FsError::Malformed(_)));

    let mut editor = PathEditor::new(fs, &txn_id).unwrap();
    editor.abort().unwrap();
    assert_matches!(editor.rm("/x"), Err(FsError::Malformed(_)));
}

#[test]
fn test_element_editor_drive() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;

    let mut editor = ElementEditor::new(fs, 0).unwrap();
    let dir_eid = editor.new_eid().unwrap();
    let file_eid = editor.new_eid().unwrap();
    editor
        .alter(
            "B0",
            dir_eid,
            0,
            "trunk",
            Payload::Dir {
                props: BTreeMap::new(),
            },
        )
        .unwrap();
    editor
        .alter(
            "B0",
            file_eid,
            dir_eid,
            "README",
            Payload::File {
                props: BTreeMap::new(),
                text: b"hello".to_vec(),
            },
        )
        .unwrap();
    let mut rev_root = editor.complete().unwrap();

    // Local eids were finalized onto the positive range.
    let (first, next) = rev_root.eid_range();
    assert_eq!(first, 0);
    assert_eq!(next, 3);
    let branch = rev_root.root_branch();
    let readme = branch.eid_by_path("trunk/README").unwrap();
    assert!(readme > 0);

    rev_root.set_rev(1);
    strata_lib::branch::store(fs, &mut rev_root).unwrap();
    let loaded = strata_lib::branch::load(fs, 1).unwrap();
    assert_eq!(
        loaded.root_branch().eid_by_path("trunk/README"),
        Some(readme)
    );
}

#[test]
fn test_element_editor_independent_deletes_purge_orphans() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let mut editor = ElementEditor::new(fs, 0).unwrap();
    let dir_eid = editor.new_eid().unwrap();
    let file_eid = editor.new_eid().unwrap();
    editor
        .alter(
            "B0",
            dir_eid,
            0,
            "dir",
            Payload::Dir {
                props: BTreeMap::new(),
            },
        )
        .unwrap();
    editor
        .alter(
            "B0",
            file_eid,
            dir_eid,
            "f",
            Payload::File {
                props: BTreeMap::new(),
                text: vec![],
            },
        )
        .unwrap();
    // Deleting only the directory leaves the file an orphan; completion
    // purges it.
    editor.delete("B0", dir_eid).unwrap();
    let rev_root = editor.complete().unwrap();
    assert_eq!(rev_root.root_branch().elements().len(), 1);
}

#[test]
fn test_element_editor_copy_one_and_copy_tree() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let src = BranchRef {
        rev: 0,
        branch_id: "B0".to_string(),
        eid: 0,
    };

    let mut editor = ElementEditor::new(fs, 0).unwrap();
    // copy_one requires a local eid from this edit.
    assert_matches!(
        editor.copy_one(&src, "B0", 5, 0, "bad", None),
        Err(FsError::Malformed(_))
    );
    let local = editor.new_eid().unwrap();
    editor.copy_one(&src, "B0", local, 0, "shallow", None).unwrap();
    // A shallow copy stays editable.
    editor
        .alter(
            "B0",
            local,
            0,
            "shallow-renamed",
            Payload::Dir {
                props: BTreeMap::new(),
            },
        )
        .unwrap();

    // A tree copy is immutable within the edit.
    editor.copy_tree(&src, "B0", 0, "deep").unwrap();
    let deep_eid = {
        let branch = editor.rev_root().root_branch();
        branch.eid_by_path("deep").unwrap()
    };
    assert_matches!(
        editor.alter(
            "B0",
            deep_eid,
            0,
            "deep-renamed",
            Payload::Dir {
                props: BTreeMap::new()
            },
        ),
        Err(FsError::Malformed(_))
    );
    editor.complete().unwrap();
}

#[test]
fn test_element_editor_cancellation() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    let mut editor = ElementEditor::new(fs, 0)
        .unwrap()
        .with_cancel(Box::new(|| true));
    assert_matches!(editor.new_eid(), Err(FsError::Cancelled));
}
