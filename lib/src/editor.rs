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

//! Editor façades over the tree and branch layers.
//!
//! Two styles coexist: [`PathEditor`] drives ordered, path-addressed
//! operations against a transaction root; [`ElementEditor`] drives
//! unordered, independent per-element changes against a branch revision
//! root. Both poll an optional cancellation callback before every
//! operation, reject operations after `complete`/`abort`, and in debug
//! builds log one line per call.

use std::collections::BTreeSet;

use tracing::debug;

use crate::branch;
use crate::branch::RevisionRoot;
use crate::dag::Proplist;
use crate::element::BranchRef;
use crate::element::Eid;
use crate::element::Element;
use crate::element::Payload;
use crate::error::FsError;
use crate::error::FsResult;
use crate::fs::Filesystem;
use crate::id::Revnum;
use crate::id::TxnId;
use crate::node_rev::NodeKind;
use crate::path;
use crate::tree::Root;

/// Cancellation poll: returns true to abort the edit.
pub type CancelFn<'a> = Box<dyn Fn() -> bool + 'a>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EditorState {
    Open,
    Completed,
    Aborted,
}

/// Content handed to [`PathEditor::put`].
#[derive(Clone, Debug)]
pub enum NodeContent {
    File { text: Vec<u8> },
    Dir { props: Proplist },
}

impl NodeContent {
    fn kind(&self) -> NodeKind {
        match self {
            Self::File { .. } => NodeKind::File,
            Self::Dir { .. } => NodeKind::Dir,
        }
    }
}

/// The ordered path-based editor. Operations are sequenced; each
/// addresses nodes by path within the transaction (or, for copy sources,
/// within a committed revision).
pub struct PathEditor<'fs> {
    root: Root<'fs>,
    cancel: Option<CancelFn<'fs>>,
    state: EditorState,
    /// Paths created by this edit, for the rm precondition.
    created: BTreeSet<String>,
}

impl<'fs> PathEditor<'fs> {
    pub fn new(fs: &'fs Filesystem, txn_id: &TxnId) -> FsResult<Self> {
        Ok(Self {
            root: Root::open_txn(fs, txn_id)?,
            cancel: None,
            state: EditorState::Open,
            created: BTreeSet::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelFn<'fs>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn root(&self) -> &Root<'fs> {
        &self.root
    }

    fn check(&self, op: &str, args: &str) -> FsResult<()> {
        if self.state != EditorState::Open {
            return Err(FsError::Malformed(format!(
                "editor operation '{op}' after the edit finished"
            )));
        }
        if let Some(cancel) = &self.cancel
            && cancel()
        {
            return Err(FsError::Cancelled);
        }
        if cfg!(debug_assertions) {
            debug!(target: "editor", "{op} {args}");
        }
        Ok(())
    }

    /// Creates a new file or directory named `name` under `parent_loc`.
    /// The parent must exist in the txn and must not already contain
    /// `name`.
    pub fn mk(&mut self, kind: NodeKind, parent_loc: &str, name: &str) -> FsResult<()> {
        self.check("mk", &format!("{kind:?} {parent_loc} {name}"))?;
        let new_path = self.child_path(parent_loc, name)?;
        match kind {
            NodeKind::Dir => self.root.make_dir(&new_path)?,
            NodeKind::File => self.root.make_file(&new_path)?,
        }
        self.created.insert(new_path);
        Ok(())
    }

    /// Copies `from_path@from_rev` to `name` under `parent_loc`,
    /// preserving history.
    pub fn cp(
        &mut self,
        from_rev: Revnum,
        from_path: &str,
        parent_loc: &str,
        name: &str,
    ) -> FsResult<()> {
        self.check("cp", &format!("{from_path}@{from_rev} {parent_loc} {name}"))?;
        let new_path = self.child_path(parent_loc, name)?;
        let src_root = Root::open_revision(self.root.fs(), from_rev)?;
        if src_root.check_path(from_path)?.is_none() {
            return Err(FsError::NotFound {
                path: path::canonicalize(from_path),
            });
        }
        self.root.copy(&src_root, from_path, &new_path, true)?;
        self.created.insert(new_path);
        Ok(())
    }

    /// Moves `from_loc` to `name` under `new_parent_loc`. The source must
    /// exist in the txn; the destination must not.
    pub fn mv(&mut self, from_loc: &str, new_parent_loc: &str, name: &str) -> FsResult<()> {
        self.check("mv", &format!("{from_loc} {new_parent_loc} {name}"))?;
        let from = path::canonicalize(from_loc);
        if self.root.check_path(&from)?.is_none() {
            return Err(FsError::NotFound { path: from });
        }
        let new_path = self.child_path(new_parent_loc, name)?;
        self.root.rename(&from, &new_path)?;
        if self.created.remove(&from) {
            self.created.insert(new_path);
        }
        Ok(())
    }

    /// Deletes `loc`. The node must exist in the txn, and nothing this
    /// edit created may live beneath it.
    pub fn rm(&mut self, loc: &str) -> FsResult<()> {
        self.check("rm", loc)?;
        let canon = path::canonicalize(loc);
        if self.root.check_path(&canon)?.is_none() {
            return Err(FsError::NotFound { path: canon });
        }
        if let Some(created) = self
            .created
            .iter()
            .find(|created| path::is_child(&canon, created))
        {
            return Err(FsError::Malformed(format!(
                "cannot rm '{canon}': this edit created '{created}' beneath it"
            )));
        }
        self.root.delete(&canon)?;
        self.created.remove(&canon);
        Ok(())
    }

    /// Sets the content of `loc`, which must exist in the final state
    /// and match the content's kind.
    pub fn put(&mut self, loc: &str, content: &NodeContent) -> FsResult<()> {
        self.check("put", loc)?;
        let canon = path::canonicalize(loc);
        let kind = self
            .root
            .check_path(&canon)?
            .ok_or_else(|| FsError::NotFound {
                path: canon.clone(),
            })?;
        if kind != content.kind() {
            return Err(match kind {
                NodeKind::File => FsError::NotDirectory {
                    path: canon.clone(),
                },
                NodeKind::Dir => FsError::NotFile {
                    path: canon.clone(),
                },
            });
        }
        match content {
            NodeContent::File { text } => {
                let mut writer = self.root.apply_text(&canon, None)?;
                writer.write(text);
                writer.close()
            }
            NodeContent::Dir { props } => {
                let current = self.root.node_proplist(&canon)?;
                for name in current.keys() {
                    if !props.contains_key(name) {
                        self.root.change_node_prop(&canon, name, None)?;
                    }
                }
                for (name, value) in props {
                    if current.get(name) != Some(value) {
                        self.root
                            .change_node_prop(&canon, name, Some(value.as_str()))?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Finishes the edit. The transaction itself remains open for the
    /// caller to commit.
    pub fn complete(&mut self) -> FsResult<()> {
        self.check("complete", "")?;
        self.state = EditorState::Completed;
        Ok(())
    }

    pub fn abort(&mut self) -> FsResult<()> {
        self.check("abort", "")?;
        self.state = EditorState::Aborted;
        Ok(())
    }

    fn child_path(&self, parent_loc: &str, name: &str) -> FsResult<String> {
        if !path::is_single_path_component(name) {
            return Err(FsError::NotSinglePathComponent {
                name: name.to_string(),
            });
        }
        let parent = path::canonicalize(parent_loc);
        match self.root.check_path(&parent)? {
            Some(NodeKind::Dir) => {}
            Some(NodeKind::File) => return Err(FsError::NotDirectory { path: parent }),
            None => return Err(FsError::NotFound { path: parent }),
        }
        let new_path = path::join(&parent, name);
        if self.root.check_path(&new_path)?.is_some() {
            return Err(FsError::AlreadyExists { path: new_path });
        }
        Ok(new_path)
    }
}

/// The element-based editor: unordered, independent per-element changes
/// against a working branch revision root loaded from a base revision.
pub struct ElementEditor<'fs> {
    fs: &'fs Filesystem,
    rev_root: RevisionRoot,
    cancel: Option<CancelFn<'fs>>,
    state: EditorState,
    /// Roots of immutable tree copies made by copy_tree; nothing below
    /// them may be edited further within this edit.
    frozen: Vec<(String, Eid)>,
}

impl<'fs> ElementEditor<'fs> {
    pub fn new(fs: &'fs Filesystem, base_rev: Revnum) -> FsResult<Self> {
        let rev_root = branch::load(fs, base_rev)?.begin_edit();
        Ok(Self {
            fs,
            rev_root,
            cancel: None,
            state: EditorState::Open,
            frozen: Vec::new(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancelFn<'fs>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn fs(&self) -> &'fs Filesystem {
        self.fs
    }

    pub fn rev_root(&self) -> &RevisionRoot {
        &self.rev_root
    }

    fn check(&self, op: &str, args: &str) -> FsResult<()> {
        if self.state != EditorState::Open {
            return Err(FsError::Malformed(format!(
                "editor operation '{op}' after the edit finished"
            )));
        }
        if let Some(cancel) = &self.cancel
            && cancel()
        {
            return Err(FsError::Cancelled);
        }
        if cfg!(debug_assertions) {
            debug!(target: "editor", "{op} {args}");
        }
        Ok(())
    }

    fn check_not_frozen(&self, branch_id: &str, eid: Eid) -> FsResult<()> {
        for (frozen_branch, frozen_root) in &self.frozen {
            if frozen_branch != branch_id {
                continue;
            }
            let mut cursor = eid;
            loop {
                if cursor == *frozen_root {
                    return Err(FsError::Malformed(format!(
                        "element e{eid} lies in an immutable tree copy"
                    )));
                }
                let parent = self
                    .rev_root
                    .get_branch(branch_id)
                    .and_then(|branch| branch.get_element(cursor))
                    .map(|element| element.parent_eid);
                match parent {
                    Some(parent) if parent != crate::element::ROOT_PARENT_EID => cursor = parent,
                    _ => break,
                }
            }
        }
        Ok(())
    }

    /// Allocates a transaction-local element id, valid within this edit.
    pub fn new_eid(&mut self) -> FsResult<Eid> {
        self.check("new_eid", "")?;
        Ok(self.rev_root.allocate_local_eid())
    }

    /// Sets one element: its parent, name, and payload, independently of
    /// any other edit.
    pub fn alter(
        &mut self,
        branch_id: &str,
        eid: Eid,
        new_parent_eid: Eid,
        new_name: &str,
        new_payload: Payload,
    ) -> FsResult<()> {
        self.check("alter", &format!("{branch_id} e{eid}"))?;
        self.check_not_frozen(branch_id, eid)?;
        let branch = self
            .rev_root
            .get_branch_mut(branch_id)
            .ok_or_else(|| FsError::Malformed(format!("no branch '{branch_id}'")))?;
        branch.update_element(eid, Element::new(new_parent_eid, new_name, new_payload))
    }

    /// Deletes one element. Elements left without a parent are purged at
    /// completion.
    pub fn delete(&mut self, branch_id: &str, eid: Eid) -> FsResult<()> {
        self.check("delete", &format!("{branch_id} e{eid}"))?;
        self.check_not_frozen(branch_id, eid)?;
        let branch = self
            .rev_root
            .get_branch_mut(branch_id)
            .ok_or_else(|| FsError::Malformed(format!("no branch '{branch_id}'")))?;
        branch.delete_element(eid);
        Ok(())
    }

    /// Makes an editable shallow copy of `src` as `local_eid`: the new
    /// element lives at `(new_parent_eid, new_name)` with `new_payload`,
    /// and may be edited further within this edit. `local_eid` must come
    /// from [`new_eid`](Self::new_eid).
    pub fn copy_one(
        &mut self,
        src: &BranchRef,
        branch_id: &str,
        local_eid: Eid,
        new_parent_eid: Eid,
        new_name: &str,
        new_payload: Option<Payload>,
    ) -> FsResult<()> {
        self.check(
            "copy_one",
            &format!("{}@r{} -> {branch_id} e{local_eid}", src.branch_id, src.rev),
        )?;
        if local_eid >= 0 {
            return Err(FsError::Malformed(format!(
                "copy_one target e{local_eid} is not a local eid of this edit"
            )));
        }
        let payload = new_payload.unwrap_or_else(|| Payload::Reference(src.clone()));
        let branch = self
            .rev_root
            .get_branch_mut(branch_id)
            .ok_or_else(|| FsError::Malformed(format!("no branch '{branch_id}'")))?;
        branch.update_element(local_eid, Element::new(new_parent_eid, new_name, payload))
    }

    /// Makes an O(1) immutable deep copy of the tree at `src`: a single
    /// reference element standing for the whole subtree. The copy cannot
    /// be modified further within this edit.
    pub fn copy_tree(
        &mut self,
        src: &BranchRef,
        branch_id: &str,
        new_parent_eid: Eid,
        new_name: &str,
    ) -> FsResult<()> {
        self.check(
            "copy_tree",
            &format!("{}@r{} -> {branch_id}/{new_name}", src.branch_id, src.rev),
        )?;
        let eid = self.rev_root.allocate_local_eid();
        let branch = self
            .rev_root
            .get_branch_mut(branch_id)
            .ok_or_else(|| FsError::Malformed(format!("no branch '{branch_id}'")))?;
        branch.update_element(
            eid,
            Element::new(new_parent_eid, new_name, Payload::Reference(src.clone())),
        )?;
        self.frozen.push((branch_id.to_string(), eid));
        Ok(())
    }

    /// Finishes the edit: purges orphans, finalizes transaction-local
    /// eids onto a fresh positive range, and returns the resulting
    /// revision root for the caller to commit and store.
    pub fn complete(&mut self) -> FsResult<RevisionRoot> {
        self.check("complete", "")?;
        self.state = EditorState::Completed;
        let root_branch_id = self.rev_root.root_branch().id().to_string();
        self.rev_root.purge_r(&root_branch_id);
        self.rev_root.finalize_eids();
        Ok(self.rev_root.clone())
    }

    pub fn abort(&mut self) -> FsResult<()> {
        self.check("abort", "")?;
        self.state = EditorState::Aborted;
        Ok(())
    }
}
