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

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use strata_lib::branch;
use strata_lib::branch::RevisionRoot;
use strata_lib::element::Element;
use strata_lib::element::Payload;
use strata_lib::element::ROOT_PARENT_EID;
use testutils::TestFs;

fn dir_payload() -> Payload {
    Payload::Dir {
        props: BTreeMap::new(),
    }
}

fn file_payload(text: &str) -> Payload {
    Payload::File {
        props: BTreeMap::new(),
        text: text.as_bytes().to_vec(),
    }
}

#[test]
fn test_serialize_parse_roundtrip() {
    let mut rev_root = RevisionRoot::new(Some(7), Some(6));
    let trunk = rev_root.allocate_eid();
    let readme = rev_root.allocate_eid();
    let sub_outer = rev_root.allocate_eid();
    let sub_root = rev_root.allocate_eid();
    let branch = rev_root.get_branch_mut("B0").unwrap();
    branch
        .update_element(trunk, Element::new(0, "trunk", dir_payload()))
        .unwrap();
    branch
        .update_element(readme, Element::new(trunk, "README", file_payload("hi")))
        .unwrap();
    branch
        .update_element(sub_outer, Element::subbranch_root(trunk, "feature"))
        .unwrap();
    let sub_id = rev_root.add_new_branch("B0", sub_outer, sub_root).unwrap();
    rev_root
        .get_branch_mut(&sub_id)
        .unwrap()
        .update_element(
            sub_root,
            Element {
                parent_eid: ROOT_PARENT_EID,
                name: String::new(),
                payload: Some(dir_payload()),
            },
        )
        .unwrap();

    let serialized = rev_root.serialize();
    let mut parsed = RevisionRoot::parse(&serialized).unwrap();
    assert_eq!(parsed.rev(), Some(7));
    assert_eq!(parsed.eid_range(), rev_root.eid_range());
    assert_eq!(parsed.serialize(), serialized);

    let parsed_branch = parsed.get_branch("B0").unwrap();
    assert_eq!(parsed_branch.path_by_eid(readme).as_deref(), Some("trunk/README"));
    assert_eq!(parsed_branch.eid_by_path("trunk/README"), Some(readme));
    assert!(
        parsed_branch
            .get_element(sub_outer)
            .unwrap()
            .is_subbranch_root()
    );
    assert_eq!(
        parsed.branch_root_path(&sub_id).as_deref(),
        Some("trunk/feature")
    );
}

#[test]
fn test_parse_resolves_payloads_as_references() {
    let mut rev_root = RevisionRoot::new(Some(3), Some(2));
    let eid = rev_root.allocate_eid();
    rev_root
        .get_branch_mut("B0")
        .unwrap()
        .update_element(eid, Element::new(0, "doc", file_payload("text")))
        .unwrap();
    let parsed = RevisionRoot::parse(&rev_root.serialize()).unwrap();
    match parsed
        .get_branch("B0")
        .unwrap()
        .get_element(eid)
        .unwrap()
        .payload
        .as_ref()
        .unwrap()
    {
        Payload::Reference(reference) => {
            assert_eq!(reference.rev, 3);
            assert_eq!(reference.branch_id, "B0");
            assert_eq!(reference.eid, eid);
        }
        payload => panic!("expected a reference payload, got {payload:?}"),
    }
}

// After a purge, every element's parent chain reaches the branch root.
#[test]
fn test_purge_connectivity_invariant() {
    let mut rev_root = RevisionRoot::new(None, Some(0));
    let keep = rev_root.allocate_eid();
    let doomed_parent = rev_root.allocate_eid();
    let doomed_child = rev_root.allocate_eid();
    let branch = rev_root.get_branch_mut("B0").unwrap();
    branch
        .update_element(keep, Element::new(0, "keep", dir_payload()))
        .unwrap();
    branch
        .update_element(doomed_parent, Element::new(0, "doomed", dir_payload()))
        .unwrap();
    branch
        .update_element(
            doomed_child,
            Element::new(doomed_parent, "below", file_payload("x")),
        )
        .unwrap();
    branch.delete_element(doomed_parent);
    rev_root.purge_r("B0");

    let branch = rev_root.get_branch("B0").unwrap();
    for (&eid, _) in branch.elements() {
        assert!(
            branch.path_by_eid(eid).is_some(),
            "e{eid} is disconnected after purge"
        );
    }
    assert!(branch.get_element(doomed_child).is_none());
    assert!(branch.get_element(keep).is_some());
}

#[test]
fn test_instantiate_subtree_into_other_root() {
    let mut source = RevisionRoot::new(Some(1), Some(0));
    let dir = source.allocate_eid();
    let file = source.allocate_eid();
    let branch = source.get_branch_mut("B0").unwrap();
    branch
        .update_element(dir, Element::new(0, "lib", dir_payload()))
        .unwrap();
    branch
        .update_element(file, Element::new(dir, "mod.rs", file_payload("code")))
        .unwrap();
    let subtree = source.get_subtree("B0", dir).unwrap();

    let mut target = RevisionRoot::new(None, Some(1));
    // Keep the allocator ahead of the imported eids.
    while target.eid_range().1 <= source.eid_range().1 {
        target.allocate_eid();
    }
    target
        .instantiate_subtree("B0", 0, "imported", &subtree)
        .unwrap();
    let branch = target.get_branch("B0").unwrap();
    assert_eq!(branch.eid_by_path("imported"), Some(dir));
    assert_eq!(branch.eid_by_path("imported/mod.rs"), Some(file));
}

#[test]
fn test_map_add_subtree_allocates_fresh_eids() {
    let mut rev_root = RevisionRoot::new(None, Some(0));
    let dir = rev_root.allocate_eid();
    let file = rev_root.allocate_eid();
    let branch = rev_root.get_branch_mut("B0").unwrap();
    branch
        .update_element(dir, Element::new(0, "src", dir_payload()))
        .unwrap();
    branch
        .update_element(file, Element::new(dir, "main.rs", file_payload("fn")))
        .unwrap();
    let subtree = rev_root.get_subtree("B0", dir).unwrap();

    let new_root = rev_root
        .map_add_subtree("B0", None, 0, "src-copy", &subtree)
        .unwrap();
    assert_ne!(new_root, dir);
    let branch = rev_root.get_branch("B0").unwrap();
    assert_eq!(branch.eid_by_path("src-copy"), Some(new_root));
    let copied_file = branch.eid_by_path("src-copy/main.rs").unwrap();
    assert_ne!(copied_file, file);
    // The original is untouched.
    assert_eq!(branch.eid_by_path("src/main.rs"), Some(file));
}

#[test]
fn test_store_and_load_metadata() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;

    let mut rev_root = branch::load(fs, 0).unwrap().begin_edit();
    let eid = rev_root.allocate_local_eid();
    rev_root
        .get_branch_mut("B0")
        .unwrap()
        .update_element(eid, Element::new(0, "trunk", dir_payload()))
        .unwrap();
    rev_root.finalize_eids();
    rev_root.set_rev(1);
    branch::store(fs, &mut rev_root).unwrap();

    let loaded = branch::load(fs, 1).unwrap();
    assert_eq!(loaded.rev(), Some(1));
    assert_eq!(loaded.eid_range(), (0, 2));
    assert_eq!(
        loaded.root_branch().eid_by_path("trunk"),
        Some(1)
    );
}
