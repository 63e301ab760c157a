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

//! Branch states and revision roots of the element-identity layer.
//!
//! A branch state maps element ids to `(parent, name, payload)` records;
//! a revision root owns a set of branch states plus the eid allocator.
//! Moves, copies, and sub-branches are expressed as independent
//! per-element edits. Revision roots serialize to a line-oriented text
//! form persisted in the `metadata` table, keyed `"r<N>"`.

use std::collections::BTreeMap;

use itertools::Itertools as _;

use crate::element::BranchRef;
use crate::element::Eid;
use crate::element::Element;
use crate::element::Payload;
use crate::element::ROOT_PARENT_EID;
use crate::error::FsError;
use crate::error::FsResult;
use crate::fs::Filesystem;
use crate::id::Revnum;
use crate::path;
use crate::tables;
use crate::trail;

/// The branch metadata written for revision 0 at repository creation.
pub const DEFAULT_R0_METADATA: &str = "r0: eids 0 1 branches 1\n\
                                       B0 root-eid 0 at .\n\
                                       e0: normal -1 .\n";

/// One branch's element mapping.
#[derive(Clone, Debug)]
pub struct BranchState {
    id: String,
    root_eid: Eid,
    /// `(outer branch id, outer eid)`; None for a top-level branch.
    outer: Option<(String, Eid)>,
    elements: BTreeMap<Eid, Element>,
}

impl BranchState {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root_eid(&self) -> Eid {
        self.root_eid
    }

    pub fn outer(&self) -> Option<(&str, Eid)> {
        self.outer.as_ref().map(|(id, eid)| (id.as_str(), *eid))
    }

    pub fn elements(&self) -> &BTreeMap<Eid, Element> {
        &self.elements
    }

    pub fn get_element(&self, eid: Eid) -> Option<&Element> {
        self.elements.get(&eid)
    }

    fn validate(&self, eid: Eid, element: &Element) -> FsResult<()> {
        let is_root = eid == self.root_eid;
        if is_root != (element.parent_eid == ROOT_PARENT_EID) {
            return Err(FsError::Malformed(format!(
                "element e{eid} parent must be {} for a branch root",
                ROOT_PARENT_EID
            )));
        }
        if is_root != element.name.is_empty() {
            return Err(FsError::Malformed(format!(
                "element e{eid} name must be empty iff it is the branch root"
            )));
        }
        if !is_root && !path::is_single_path_component(&element.name) {
            return Err(FsError::NotSinglePathComponent {
                name: element.name.clone(),
            });
        }
        Ok(())
    }

    /// Sets or replaces element `eid`.
    pub fn update_element(&mut self, eid: Eid, element: Element) -> FsResult<()> {
        self.validate(eid, &element)?;
        self.elements.insert(eid, element);
        Ok(())
    }

    pub fn delete_element(&mut self, eid: Eid) {
        self.elements.remove(&eid);
    }

    /// Removes elements whose parent chain does not reach the root
    /// element, iterating to a fixed point. Cyclic clusters disconnected
    /// from the root are not detected.
    pub fn purge_orphans(&mut self) {
        loop {
            let orphans: Vec<Eid> = self
                .elements
                .iter()
                .filter(|&(&eid, element)| {
                    eid != self.root_eid && !self.elements.contains_key(&element.parent_eid)
                })
                .map(|(&eid, _)| eid)
                .collect();
            if orphans.is_empty() {
                return;
            }
            for eid in orphans {
                self.elements.remove(&eid);
            }
        }
    }

    /// The element's path relative to the branch root, or None if any
    /// ancestor is missing. Callable only when the branch state has no
    /// dangling parent eids; purge orphans first.
    pub fn path_by_eid(&self, eid: Eid) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        let mut cursor = eid;
        while cursor != self.root_eid {
            let element = self.elements.get(&cursor)?;
            parts.push(&element.name);
            cursor = element.parent_eid;
        }
        Some(parts.iter().rev().join("/"))
    }

    /// The eid living at `relpath`, or None. A linear scan.
    pub fn eid_by_path(&self, relpath: &str) -> Option<Eid> {
        self.elements
            .keys()
            .find(|&&eid| self.path_by_eid(eid).as_deref() == Some(relpath))
            .copied()
    }
}

/// A self-contained view of one subtree of a branch: an orphan-free
/// element map rooted at `root_eid`, plus any sub-branches rooted below
/// it.
#[derive(Clone, Debug)]
pub struct Subtree {
    pub root_eid: Eid,
    pub elements: BTreeMap<Eid, Element>,
    pub subbranches: BTreeMap<Eid, Subtree>,
}

impl Subtree {
    fn path_by_eid(&self, eid: Eid) -> Option<String> {
        let mut parts: Vec<&str> = Vec::new();
        let mut cursor = eid;
        while cursor != self.root_eid {
            let element = self.elements.get(&cursor)?;
            parts.push(&element.name);
            cursor = element.parent_eid;
        }
        Some(parts.iter().rev().join("/"))
    }
}

/// A revision root: the branch states of one revision (or of one
/// in-progress edit), plus the eid allocator.
#[derive(Clone, Debug)]
pub struct RevisionRoot {
    /// None while uncommitted.
    rev: Option<Revnum>,
    base_rev: Option<Revnum>,
    first_eid: Eid,
    next_eid: Eid,
    branches: Vec<BranchState>,
}

impl RevisionRoot {
    /// A fresh root holding the default single branch `B0` with root
    /// element e0.
    pub fn new(rev: Option<Revnum>, base_rev: Option<Revnum>) -> Self {
        let mut root_branch = BranchState {
            id: "B0".to_string(),
            root_eid: 0,
            outer: None,
            elements: BTreeMap::new(),
        };
        root_branch.elements.insert(
            0,
            Element {
                parent_eid: ROOT_PARENT_EID,
                name: String::new(),
                payload: Some(Payload::Dir {
                    props: BTreeMap::new(),
                }),
            },
        );
        Self {
            rev,
            base_rev,
            first_eid: 0,
            next_eid: 1,
            branches: vec![root_branch],
        }
    }

    pub fn rev(&self) -> Option<Revnum> {
        self.rev
    }

    pub fn base_rev(&self) -> Option<Revnum> {
        self.base_rev
    }

    pub fn set_rev(&mut self, rev: Revnum) {
        self.rev = Some(rev);
    }

    /// A working copy of this root for a new edit based on it.
    pub fn begin_edit(&self) -> Self {
        let mut edit = self.clone();
        edit.base_rev = self.rev;
        edit.rev = None;
        edit
    }

    pub fn eid_range(&self) -> (Eid, Eid) {
        (self.first_eid, self.next_eid)
    }

    pub fn branches(&self) -> impl Iterator<Item = &BranchState> {
        self.branches.iter()
    }

    /// The revision root's top-level branch.
    pub fn root_branch(&self) -> &BranchState {
        self.branches
            .iter()
            .find(|branch| branch.outer.is_none())
            .expect("a revision root always has a top-level branch")
    }

    pub fn get_branch(&self, branch_id: &str) -> Option<&BranchState> {
        self.branches.iter().find(|branch| branch.id == branch_id)
    }

    pub fn get_branch_mut(&mut self, branch_id: &str) -> Option<&mut BranchState> {
        self.branches
            .iter_mut()
            .find(|branch| branch.id == branch_id)
    }

    /// Allocates a committed-range eid.
    pub fn allocate_eid(&mut self) -> Eid {
        let eid = self.next_eid;
        self.next_eid += 1;
        eid
    }

    /// Allocates a transaction-local (negative) eid, to be remapped by
    /// [`finalize_eids`](Self::finalize_eids) at commit.
    pub fn allocate_local_eid(&mut self) -> Eid {
        self.first_eid -= 1;
        self.first_eid
    }

    /// Remaps every transaction-local eid onto a fresh positive range.
    pub fn finalize_eids(&mut self) {
        if self.first_eid >= 0 {
            return;
        }
        let base = self.next_eid;
        // -1 maps to base, -2 to base + 1, and so on.
        let remap = |eid: Eid| if eid < 0 { base + (-1 - eid) } else { eid };
        for branch in &mut self.branches {
            branch.root_eid = remap(branch.root_eid);
            if let Some((_, outer_eid)) = &mut branch.outer {
                *outer_eid = remap(*outer_eid);
            }
            branch.elements = branch
                .elements
                .iter()
                .map(|(&eid, element)| {
                    let mut element = element.clone();
                    if element.parent_eid != ROOT_PARENT_EID {
                        element.parent_eid = remap(element.parent_eid);
                    }
                    (remap(eid), element)
                })
                .collect();
        }
        self.next_eid = base + -self.first_eid;
        self.first_eid = 0;
    }

    /// The branch-root path of `branch_id` relative to the repository
    /// root, or None while an outer element is dangling.
    pub fn branch_root_path(&self, branch_id: &str) -> Option<String> {
        let branch = self.get_branch(branch_id)?;
        match &branch.outer {
            None => Some(String::new()),
            Some((outer_id, outer_eid)) => {
                let outer = self.get_branch(outer_id)?;
                let outer_root = self.branch_root_path(outer_id)?;
                let within = outer.path_by_eid(*outer_eid)?;
                Some(join_relpath(&outer_root, &within))
            }
        }
    }

    /// Creates a new branch rooted at `outer_branch:outer_eid`. The root
    /// element must be populated by the caller (or via
    /// [`instantiate_subtree`](Self::instantiate_subtree)). No branch may
    /// already sit at that outer element.
    pub fn add_new_branch(
        &mut self,
        outer_branch_id: &str,
        outer_eid: Eid,
        root_eid: Eid,
    ) -> FsResult<String> {
        if self.get_branch(outer_branch_id).is_none() {
            return Err(FsError::Malformed(format!(
                "no branch '{outer_branch_id}'"
            )));
        }
        if self.get_subbranch_at_eid(outer_branch_id, outer_eid).is_some() {
            return Err(FsError::Malformed(format!(
                "branch '{outer_branch_id}' already has a subbranch at e{outer_eid}"
            )));
        }
        let id = format!("{outer_branch_id}.{outer_eid}");
        self.branches.push(BranchState {
            id: id.clone(),
            root_eid,
            outer: Some((outer_branch_id.to_string(), outer_eid)),
            elements: BTreeMap::new(),
        });
        Ok(id)
    }

    /// The immediate sub-branches of `branch_id`.
    pub fn subbranches_of(&self, branch_id: &str) -> Vec<&BranchState> {
        self.branches
            .iter()
            .filter(|branch| {
                branch
                    .outer
                    .as_ref()
                    .is_some_and(|(outer_id, _)| outer_id == branch_id)
            })
            .collect()
    }

    /// The sub-branch whose root sits at `branch_id:eid`, if any.
    pub fn get_subbranch_at_eid(&self, branch_id: &str, eid: Eid) -> Option<&BranchState> {
        self.branches.iter().find(|branch| {
            branch
                .outer
                .as_ref()
                .is_some_and(|(outer_id, outer_eid)| outer_id == branch_id && *outer_eid == eid)
        })
    }

    /// Deletes `branch_id` and, recursively, every branch nested inside
    /// it.
    pub fn delete_branch_r(&mut self, branch_id: &str) {
        let nested: Vec<String> = self
            .subbranches_of(branch_id)
            .iter()
            .map(|branch| branch.id.clone())
            .collect();
        for id in nested {
            self.delete_branch_r(&id);
        }
        self.branches.retain(|branch| branch.id != branch_id);
    }

    /// Purges orphan elements in `branch_id` and its sub-branches, and
    /// deletes sub-branches whose root element is gone.
    pub fn purge_r(&mut self, branch_id: &str) {
        if let Some(branch) = self.get_branch_mut(branch_id) {
            branch.purge_orphans();
        }
        let subbranches: Vec<(String, Eid)> = self
            .subbranches_of(branch_id)
            .iter()
            .map(|branch| (branch.id.clone(), branch.outer.as_ref().unwrap().1))
            .collect();
        for (sub_id, outer_eid) in subbranches {
            let root_present = self
                .get_branch(branch_id)
                .is_some_and(|branch| branch.elements.contains_key(&outer_eid));
            if root_present {
                self.purge_r(&sub_id);
            } else {
                self.delete_branch_r(&sub_id);
            }
        }
    }

    /// A self-contained view of the subtree of `branch_id` rooted at
    /// `eid`, orphan-free, with the root element's parent and name
    /// cleared, and nested sub-branches included.
    pub fn get_subtree(&self, branch_id: &str, eid: Eid) -> FsResult<Subtree> {
        let branch = self
            .get_branch(branch_id)
            .ok_or_else(|| FsError::Malformed(format!("no branch '{branch_id}'")))?;
        let root_element = branch
            .get_element(eid)
            .ok_or_else(|| FsError::Malformed(format!("no element e{eid} in '{branch_id}'")))?;
        let mut subtree = Subtree {
            root_eid: eid,
            elements: branch.elements.clone(),
            subbranches: BTreeMap::new(),
        };
        subtree.elements.insert(
            eid,
            Element {
                parent_eid: ROOT_PARENT_EID,
                name: String::new(),
                payload: root_element.payload.clone(),
            },
        );
        // Keep only the elements path-wise at or below EID.
        let keep: Vec<Eid> = subtree
            .elements
            .keys()
            .filter(|&&e| subtree.path_by_eid(e).is_some())
            .copied()
            .collect();
        subtree.elements.retain(|e, _| keep.contains(e));

        for sub in self.subbranches_of(branch_id) {
            let outer_eid = sub.outer.as_ref().unwrap().1;
            if subtree.elements.contains_key(&outer_eid) {
                subtree
                    .subbranches
                    .insert(outer_eid, self.get_subtree(&sub.id, sub.root_eid)?);
            }
        }
        Ok(subtree)
    }

    /// Writes each element of `subtree` into `branch_id` under
    /// `(parent_eid, name)`, keeping element ids, and recursively
    /// branching each nested subtree.
    pub fn instantiate_subtree(
        &mut self,
        branch_id: &str,
        parent_eid: Eid,
        name: &str,
        subtree: &Subtree,
    ) -> FsResult<()> {
        let root_element = subtree
            .elements
            .get(&subtree.root_eid)
            .ok_or_else(|| FsError::Malformed("subtree has no root element".to_string()))?;
        {
            let branch = self
                .get_branch_mut(branch_id)
                .ok_or_else(|| FsError::Malformed(format!("no branch '{branch_id}'")))?;
            branch.update_element(
                subtree.root_eid,
                Element {
                    parent_eid,
                    name: name.to_string(),
                    payload: root_element.payload.clone(),
                },
            )?;
            for (&eid, element) in &subtree.elements {
                if eid != subtree.root_eid {
                    branch.update_element(eid, element.clone())?;
                }
            }
        }
        for (&outer_eid, nested) in &subtree.subbranches {
            self.branch_nested(branch_id, outer_eid, nested)?;
        }
        Ok(())
    }

    // Branches SUBTREE as a new sub-branch of BRANCH_ID at OUTER_EID.
    fn branch_nested(
        &mut self,
        branch_id: &str,
        outer_eid: Eid,
        subtree: &Subtree,
    ) -> FsResult<()> {
        let sub_id = self.add_new_branch(branch_id, outer_eid, subtree.root_eid)?;
        for (&eid, element) in &subtree.elements {
            self.get_branch_mut(&sub_id)
                .expect("just added")
                .update_element(eid, element.clone())?;
        }
        for (&nested_outer_eid, deeper) in &subtree.subbranches {
            self.branch_nested(&sub_id, nested_outer_eid, deeper)?;
        }
        Ok(())
    }

    /// Like [`instantiate_subtree`](Self::instantiate_subtree), but
    /// allocating fresh eids for every non-root element. Used for O(N)
    /// deep copies without history preservation. Subtrees containing
    /// sub-branches are not supported.
    pub fn map_add_subtree(
        &mut self,
        branch_id: &str,
        to_eid: Option<Eid>,
        parent_eid: Eid,
        name: &str,
        subtree: &Subtree,
    ) -> FsResult<Eid> {
        if !subtree.subbranches.is_empty() {
            return Err(FsError::Unsupported(
                "adding or copying a subtree containing subbranches is not implemented"
                    .to_string(),
            ));
        }
        let root_eid = to_eid.unwrap_or_else(|| self.allocate_eid());
        let root_element = subtree
            .elements
            .get(&subtree.root_eid)
            .ok_or_else(|| FsError::Malformed("subtree has no root element".to_string()))?;
        self.get_branch_mut(branch_id)
            .ok_or_else(|| FsError::Malformed(format!("no branch '{branch_id}'")))?
            .update_element(
                root_eid,
                Element {
                    parent_eid,
                    name: name.to_string(),
                    payload: root_element.payload.clone(),
                },
            )?;
        // Recurse over the immediate children.
        let children: Vec<(Eid, Element)> = subtree
            .elements
            .iter()
            .filter(|(_, element)| element.parent_eid == subtree.root_eid)
            .map(|(&eid, element)| (eid, element.clone()))
            .collect();
        for (child_eid, child) in children {
            let child_subtree = Subtree {
                root_eid: child_eid,
                elements: subtree.elements.clone(),
                subbranches: BTreeMap::new(),
            };
            self.map_add_subtree(branch_id, None, root_eid, &child.name, &child_subtree)?;
        }
        Ok(root_eid)
    }
}

fn join_relpath(base: &str, rel: &str) -> String {
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{rel}"),
    }
}

// Serialization. The grammar, LF-terminated ASCII:
//
//   r<rev>: eids <first> <next> branches <N>
//   <branch-id> root-eid <root-eid> at <path or ".">
//   e<eid>: (normal|subbranch|none) <parent-eid> <name or "." or "(null)">
//   ... one e-line for every eid in [first, next) ...
//   (branch header + e-lines repeated for each of the N branches)

impl RevisionRoot {
    /// Serializes this revision root. Orphan elements are purged as a
    /// side effect of the element walk.
    pub fn serialize(&mut self) -> String {
        let rev = self.rev.map_or(-1, |rev| rev as i64);
        let mut out = format!(
            "r{rev}: eids {} {} branches {}\n",
            self.first_eid,
            self.next_eid,
            self.branches.len()
        );
        let branch_ids: Vec<String> = self.branches.iter().map(|b| b.id.clone()).collect();
        for branch_id in branch_ids {
            let root_path = self
                .branch_root_path(&branch_id)
                .unwrap_or_default();
            let branch = self.get_branch_mut(&branch_id).expect("listed above");
            branch.purge_orphans();
            let branch = self.get_branch(&branch_id).expect("listed above");
            out.push_str(&format!(
                "{} root-eid {} at {}\n",
                branch.id,
                branch.root_eid,
                if root_path.is_empty() { "." } else { &root_path }
            ));
            for eid in self.first_eid..self.next_eid {
                let line = match branch.get_element(eid) {
                    Some(element) => {
                        let kind = if element.is_subbranch_root() {
                            "subbranch"
                        } else {
                            "normal"
                        };
                        let name = if element.name.is_empty() {
                            "."
                        } else {
                            &element.name
                        };
                        format!("e{eid}: {kind} {} {name}\n", element.parent_eid)
                    }
                    None => format!("e{eid}: none -1 (null)\n"),
                };
                out.push_str(&line);
            }
        }
        out
    }

    /// Parses the serialized form back into a revision root. Normal
    /// elements get reference payloads pointing at the serialized
    /// revision.
    pub fn parse(input: &str) -> FsResult<Self> {
        let malformed = |detail: &str| FsError::Malformed(format!("revision root: {detail}"));
        let mut lines = input.lines();
        let header = lines.next().ok_or_else(|| malformed("missing header"))?;
        let (rev, first_eid, next_eid, num_branches) = parse_header(header)
            .ok_or_else(|| malformed("bad header line"))?;
        let mut rev_root = Self {
            rev,
            base_rev: rev.and_then(|rev| rev.checked_sub(1)),
            first_eid,
            next_eid,
            branches: Vec::new(),
        };
        for _ in 0..num_branches {
            let branch_line = lines.next().ok_or_else(|| malformed("missing branch line"))?;
            let (branch_id, root_eid) =
                parse_branch_line(branch_line).ok_or_else(|| malformed("bad branch line"))?;
            let outer = parse_branch_id(&branch_id);
            let mut branch = BranchState {
                id: branch_id.clone(),
                root_eid,
                outer,
                elements: BTreeMap::new(),
            };
            for _ in first_eid..next_eid {
                let element_line = lines.next().ok_or_else(|| malformed("missing element"))?;
                let (eid, kind, parent_eid, name) = parse_element_line(element_line)
                    .ok_or_else(|| malformed("bad element line"))?;
                match kind {
                    ElementKind::None => {}
                    ElementKind::Subbranch => {
                        branch.elements.insert(
                            eid,
                            Element {
                                parent_eid,
                                name,
                                payload: None,
                            },
                        );
                    }
                    ElementKind::Normal => {
                        branch.elements.insert(
                            eid,
                            Element {
                                parent_eid,
                                name,
                                payload: Some(Payload::Reference(BranchRef {
                                    rev: rev.unwrap_or(0),
                                    branch_id: branch_id.clone(),
                                    eid,
                                })),
                            },
                        );
                    }
                }
            }
            rev_root.branches.push(branch);
        }
        Ok(rev_root)
    }
}

fn parse_header(line: &str) -> Option<(Option<Revnum>, Eid, Eid, usize)> {
    let rest = line.strip_prefix('r')?;
    let (rev_str, rest) = rest.split_once(": eids ")?;
    let rev: i64 = rev_str.parse().ok()?;
    let rev = (rev >= 0).then_some(rev as Revnum);
    let (eids, branches) = rest.split_once(" branches ")?;
    let (first, next) = eids.split_once(' ')?;
    Some((
        rev,
        first.parse().ok()?,
        next.parse().ok()?,
        branches.parse().ok()?,
    ))
}

fn parse_branch_line(line: &str) -> Option<(String, Eid)> {
    let (branch_id, rest) = line.split_once(" root-eid ")?;
    let (root_eid, _path) = rest.split_once(" at ")?;
    Some((branch_id.to_string(), root_eid.parse().ok()?))
}

// "B0" and "B<n>" are top-level; "B0.14.27" nests at eid 27 of "B0.14".
fn parse_branch_id(branch_id: &str) -> Option<(String, Eid)> {
    let (outer, eid) = branch_id.rsplit_once('.')?;
    Some((outer.to_string(), eid.parse().ok()?))
}

enum ElementKind {
    Normal,
    Subbranch,
    None,
}

fn parse_element_line(line: &str) -> Option<(Eid, ElementKind, Eid, String)> {
    let rest = line.strip_prefix('e')?;
    let (eid, rest) = rest.split_once(": ")?;
    let mut parts = rest.splitn(3, ' ');
    let kind = match parts.next()? {
        "normal" => ElementKind::Normal,
        "subbranch" => ElementKind::Subbranch,
        "none" => ElementKind::None,
        _ => return None,
    };
    let parent_eid: Eid = parts.next()?.parse().ok()?;
    let name = match parts.next()? {
        "." => String::new(),
        "(null)" => String::new(),
        name => name.to_string(),
    };
    Some((eid.parse().ok()?, kind, parent_eid, name))
}

/// Loads the branch metadata of `rev` from the `metadata` table.
pub fn load(fs: &Filesystem, rev: Revnum) -> FsResult<RevisionRoot> {
    let raw = trail::retry_txn(fs, |trail| {
        tables::metadata_get(trail, &format!("r{rev}"))
    })?
    .ok_or(FsError::DanglingRev { rev })?;
    let text = String::from_utf8(raw)
        .map_err(|_| FsError::Corrupt(format!("branch metadata of r{rev} is not UTF-8")))?;
    RevisionRoot::parse(&text)
}

/// Stores the branch metadata of a committed revision root.
pub fn store(fs: &Filesystem, rev_root: &mut RevisionRoot) -> FsResult<()> {
    let rev = rev_root
        .rev()
        .ok_or_else(|| FsError::Malformed("cannot store an uncommitted revision root".to_string()))?;
    let serialized = rev_root.serialize();
    trail::retry_txn(fs, |trail| {
        tables::metadata_set(trail, &format!("r{rev}"), serialized.as_bytes())
    })
}
