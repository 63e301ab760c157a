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

use strata_lib::error::FsResult;
use strata_lib::fs::Filesystem;
use strata_lib::id::RepId;
use strata_lib::id::Revnum;
use strata_lib::node_rev;
use strata_lib::rep;
use strata_lib::rep::RepKind;
use strata_lib::trail;
use strata_lib::trail::Trail;
use testutils::TestFs;
use testutils::begin_txn;
use testutils::commit;
use testutils::read_file;
use testutils::write_file;

fn content(rev: Revnum) -> String {
    format!("{rev:02} bytes of file text that stay the same length")
}

// Builds 33 revisions each changing the same file, so the file node at
// r33 has 32 predecessors.
fn build_chain(fs: &Filesystem) {
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_file("/f").unwrap();
    write_file(&root, "/f", &content(1));
    commit(fs, &txn_id);
    for rev in 2..=33 {
        let txn_id = begin_txn(fs, rev - 1);
        let root = fs.txn_root(&txn_id).unwrap();
        write_file(&root, "/f", &content(rev));
        assert_eq!(commit(fs, &txn_id), rev);
    }
}

fn data_rep_at(fs: &Filesystem, rev: Revnum) -> RepId {
    let id = fs.revision_root(rev).unwrap().node_id("/f").unwrap();
    trail::retry_txn(fs, |trail| {
        Ok(node_rev::get(trail, &id)?
            .data_rep_id
            .clone()
            .expect("file has contents"))
    })
    .unwrap()
}

// Number of window applications needed to materialize the rep, along the
// longest chunk chain.
fn window_apps(trail: &mut Trail<'_>, rep_id: &RepId) -> FsResult<u64> {
    let representation = rep::get(trail, rep_id)?;
    match representation.kind {
        RepKind::Fulltext { .. } => Ok(0),
        RepKind::Delta { chunks } => {
            let mut deepest = 0;
            for chunk in &chunks {
                deepest = deepest.max(1 + window_apps(trail, &chunk.rep_id)?);
            }
            Ok(deepest)
        }
    }
}

fn apps_at(fs: &Filesystem, rev: Revnum) -> u64 {
    let rep_id = data_rep_at(fs, rev);
    trail::retry_txn(fs, |trail| window_apps(trail, &rep_id)).unwrap()
}

fn delta_bases_at(fs: &Filesystem, rev: Revnum) -> Vec<RepId> {
    let rep_id = data_rep_at(fs, rev);
    trail::retry_txn(fs, |trail| {
        Ok(match rep::get(trail, &rep_id)?.kind {
            RepKind::Fulltext { .. } => vec![],
            RepKind::Delta { chunks } => chunks.iter().map(|chunk| chunk.rep_id.clone()).collect(),
        })
    })
    .unwrap()
}

#[test]
fn test_skip_delta_chain() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    build_chain(fs);

    // Every revision of the file reconstructs exactly, digests verified.
    for rev in 1..=33 {
        let root = fs.revision_root(rev).unwrap();
        assert_eq!(read_file(&root, "/f"), content(rev), "at r{rev}");
    }

    // The head of the chain stays fulltext.
    assert_eq!(apps_at(fs, 33), 0);

    // Committing the 32nd successor redeltified the predecessors at
    // distances 4, 8, and 16 directly against the head.
    let head_rep = data_rep_at(fs, 33);
    for skipped_rev in [17, 25, 29] {
        let bases = delta_bases_at(fs, skipped_rev);
        assert!(!bases.is_empty(), "r{skipped_rev} is deltified");
        assert!(
            bases.iter().all(|base| *base == head_rep),
            "r{skipped_rev} is a delta against the head"
        );
        assert_eq!(apps_at(fs, skipped_rev), 1);
    }

    // A short chain is never redeltified beyond its immediate
    // predecessor: the node with two predecessors still points at the
    // node with three.
    let next_rep = data_rep_at(fs, 4);
    let bases = delta_bases_at(fs, 3);
    assert!(bases.iter().all(|base| *base == next_rep));

    // The skip pattern bounds reconstruction cost for every revision.
    for rev in 1..=33 {
        let apps = apps_at(fs, rev);
        assert!(apps <= 16, "r{rev} takes {apps} window applications");
    }
}

#[test]
fn test_deltify_preserves_contents_and_digest() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;

    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    root.make_file("/f").unwrap();
    write_file(&root, "/f", "first version of the text");
    commit(fs, &txn_id);
    let md5_before = fs.revision_root(1).unwrap().file_md5("/f").unwrap();

    let txn_id = begin_txn(fs, 1);
    let root = fs.txn_root(&txn_id).unwrap();
    write_file(&root, "/f", "second version of the text");
    commit(fs, &txn_id);

    // r1's rep became a delta against r2's, contents and digest intact.
    let bases = delta_bases_at(fs, 1);
    assert_eq!(bases, vec![data_rep_at(fs, 2)]);
    let root = fs.revision_root(1).unwrap();
    assert_eq!(read_file(&root, "/f"), "first version of the text");
    assert_eq!(root.file_md5("/f").unwrap(), md5_before);
}
