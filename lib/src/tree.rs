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

//! The tree layer: path traversal over the DAG, just-in-time cloning,
//! the mutation surface, and the commit-time three-way merge.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::changes;
use crate::changes::Change;
use crate::changes::ChangeKind;
use crate::changes::PathChange;
use crate::copies;
use crate::copies::Copy;
use crate::copies::CopyKind;
use crate::dag;
use crate::dag::DagNode;
use crate::dag::Proplist;
use crate::delta;
use crate::error::FsError;
use crate::error::FsResult;
use crate::fs::Filesystem;
use crate::id::NodeRevId;
use crate::id::Revnum;
use crate::id::TxnId;
use crate::lock;
use crate::node_rev;
use crate::node_rev::NodeKind;
use crate::path;
use crate::rep;
use crate::revisions;
use crate::trail;
use crate::trail::Trail;
use crate::transactions;

#[derive(Clone, Debug)]
enum RootKind {
    Revision(Revnum),
    Txn(TxnId),
}

/// A root from which paths are resolved: either a committed revision's
/// immutable tree, or an in-progress transaction's mutable tree.
#[derive(Debug)]
pub struct Root<'fs> {
    fs: &'fs Filesystem,
    kind: RootKind,
    // Path -> node cache, populated for revision roots only. Revision
    // trees are immutable, so committed entries never go stale. Txn roots
    // are not cached: a second root open against the same txn would not
    // see invalidations done through this one. Entries added mid-trail
    // are registered on the trail's undo chain and evicted if that trail
    // fails, so a retry never sees state from an aborted attempt; the
    // shared handle is what lets the eviction closure outlive this root's
    // borrow.
    node_cache: Rc<RefCell<HashMap<String, DagNode>>>,
}

impl Filesystem {
    /// Opens the immutable tree of a committed revision.
    pub fn revision_root(&self, rev: Revnum) -> FsResult<Root<'_>> {
        Root::open_revision(self, rev)
    }

    /// Opens the mutable tree of an in-progress transaction.
    pub fn txn_root(&self, txn_id: &TxnId) -> FsResult<Root<'_>> {
        Root::open_txn(self, txn_id)
    }
}

impl<'fs> Root<'fs> {
    /// Opens the root of a committed revision.
    pub fn open_revision(fs: &'fs Filesystem, rev: Revnum) -> FsResult<Self> {
        trail::retry_txn(fs, |trail| {
            revisions::get(trail, rev)?;
            Ok(())
        })?;
        Ok(Self {
            fs,
            kind: RootKind::Revision(rev),
            node_cache: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    /// Opens the root of an in-progress transaction.
    pub fn open_txn(fs: &'fs Filesystem, txn_id: &TxnId) -> FsResult<Self> {
        trail::retry_txn(fs, |trail| {
            transactions::get_mutable(trail, txn_id)?;
            Ok(())
        })?;
        Ok(Self {
            fs,
            kind: RootKind::Txn(txn_id.clone()),
            node_cache: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    pub fn fs(&self) -> &'fs Filesystem {
        self.fs
    }

    pub fn is_txn_root(&self) -> bool {
        matches!(self.kind, RootKind::Txn(_))
    }

    pub fn revision(&self) -> Option<Revnum> {
        match &self.kind {
            RootKind::Revision(rev) => Some(*rev),
            RootKind::Txn(_) => None,
        }
    }

    pub fn txn_id(&self) -> Option<&TxnId> {
        match &self.kind {
            RootKind::Txn(txn_id) => Some(txn_id),
            RootKind::Revision(_) => None,
        }
    }

    fn require_txn(&self) -> FsResult<&TxnId> {
        self.txn_id().ok_or(FsError::NotTxnRoot)
    }

    fn root_node(&self, trail: &mut Trail<'_>) -> FsResult<DagNode> {
        match &self.kind {
            RootKind::Revision(rev) => dag::revision_root(trail, *rev),
            RootKind::Txn(txn_id) => dag::txn_root(trail, txn_id),
        }
    }

    fn cache_get(&self, cache_path: &str) -> Option<DagNode> {
        match self.kind {
            RootKind::Revision(_) => self.node_cache.borrow().get(cache_path).cloned(),
            RootKind::Txn(_) => None,
        }
    }

    // Caches a node found mid-trail, with an undo-chain entry evicting it
    // again should the trail fail.
    fn cache_set(&self, trail: &mut Trail<'_>, cache_path: &str, node: &DagNode) {
        if !matches!(self.kind, RootKind::Revision(_)) {
            return;
        }
        if self
            .node_cache
            .borrow_mut()
            .insert(cache_path.to_string(), node.clone())
            .is_some()
        {
            // Entries that predate this trail stay put.
            return;
        }
        let cache = Rc::clone(&self.node_cache);
        let key = cache_path.to_string();
        trail.record_undo(move || {
            cache.borrow_mut().remove(&key);
        });
    }
}

/// Copy-id inheritance decision for one step of a parent path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CopyIdInherit {
    /// The child keeps its own copy id when made mutable.
    Own,
    /// The child adopts its parent's copy id.
    Parent,
    /// The child needs a fresh copy id and a soft copy row.
    New,
}

// One element of the leaf-first chain built by open_path. The chain
// always ends with an element for the root directory, whose entry is
// None.
struct ParentPath {
    /// The node at this level; None only for an absent optional leaf.
    node: Option<DagNode>,
    entry: Option<String>,
    parent: Option<Box<ParentPath>>,
    copy_inherit: CopyIdInherit,
    /// The pre-copy path to base a soft copy on, when inherit is New.
    copy_src_path: Option<String>,
}

impl ParentPath {
    fn path(&self) -> String {
        match (&self.parent, &self.entry) {
            (Some(parent), Some(entry)) => path::join(&parent.path(), entry),
            _ => "/".to_string(),
        }
    }
}

impl<'fs> Root<'fs> {
    // Chooses how the node at CHILD would inherit a copy id if made
    // mutable under TXN_ID. CHILD must have a parent.
    fn copy_inheritance(
        &self,
        trail: &mut Trail<'_>,
        child: &ParentPath,
        txn_id: &TxnId,
    ) -> FsResult<(CopyIdInherit, Option<String>)> {
        let child_node = child.node.as_ref().expect("child node exists");
        let parent_node = child
            .parent
            .as_ref()
            .and_then(|parent| parent.node.as_ref())
            .expect("child has a parent");

        // Already mutable: nothing to decide.
        if child_node.is_mutable(txn_id) {
            return Ok((CopyIdInherit::Own, None));
        }
        // Same branch as the parent, trivially or because the child has
        // never been a copy target.
        let child_copy = child_node.id().copy_id();
        if child_copy.is_unbranched() || child_copy == parent_node.id().copy_id() {
            return Ok((CopyIdInherit::Parent, None));
        }
        // The child carries a copy id of its own. Unless it is the actual
        // copy target, it merely sits inside a copied subtree and
        // inherits from the parent.
        let copy = copies::get(trail, child_copy)?;
        if copy.dst_noderev_id != *child_node.id() {
            return Ok((CopyIdInherit::Parent, None));
        }
        // The copy target was created at a different path than where we
        // found it: an affecting copy happened above it, so its clone
        // needs a fresh soft-copy id.
        let created_path = child_node.created_path().to_string();
        if created_path != child.path() {
            return Ok((CopyIdInherit::New, Some(created_path)));
        }
        Ok((CopyIdInherit::Own, None))
    }

    // Walks CANON from the root, building the leaf-first parent-path
    // chain. With LAST_OPTIONAL, a missing final component yields a chain
    // whose leaf node is None; all parents must exist regardless.
    // FOR_TXN requests copy-id inheritance annotations.
    fn open_path(
        &self,
        trail: &mut Trail<'_>,
        canon: &str,
        last_optional: bool,
        for_txn: Option<&TxnId>,
    ) -> FsResult<ParentPath> {
        let root_node = match self.cache_get("/") {
            Some(node) => node,
            None => {
                let node = self.root_node(trail)?;
                self.cache_set(trail, "/", &node);
                node
            }
        };
        let mut parent_path = ParentPath {
            node: Some(root_node),
            entry: None,
            parent: None,
            copy_inherit: CopyIdInherit::Own,
            copy_src_path: None,
        };
        let components: Vec<&str> = path::components(canon).collect();
        let mut path_so_far = "/".to_string();
        for (i, entry) in components.iter().enumerate() {
            let is_last = i + 1 == components.len();
            path_so_far = path::join(&path_so_far, entry);
            let here = parent_path.node.clone().expect("interior nodes exist");
            let child = match self.cache_get(&path_so_far) {
                Some(node) => Ok(node),
                None => dag::open(trail, &here, entry),
            };
            match child {
                Ok(child) => {
                    if !is_last && child.kind() != NodeKind::Dir {
                        return Err(FsError::NotDirectory {
                            path: path_so_far.clone(),
                        });
                    }
                    self.cache_set(trail, &path_so_far, &child);
                    let mut element = ParentPath {
                        node: Some(child),
                        entry: Some((*entry).to_string()),
                        parent: Some(Box::new(parent_path)),
                        copy_inherit: CopyIdInherit::Own,
                        copy_src_path: None,
                    };
                    if let Some(txn_id) = for_txn {
                        let (inherit, src_path) = self.copy_inheritance(trail, &element, txn_id)?;
                        element.copy_inherit = inherit;
                        element.copy_src_path = src_path;
                    }
                    parent_path = element;
                }
                Err(FsError::NotFound { .. }) if last_optional && is_last => {
                    return Ok(ParentPath {
                        node: None,
                        entry: Some((*entry).to_string()),
                        parent: Some(Box::new(parent_path)),
                        copy_inherit: CopyIdInherit::Own,
                        copy_src_path: None,
                    });
                }
                Err(FsError::NotFound { .. }) => {
                    return Err(FsError::NotFound {
                        path: canon.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(parent_path)
    }

    // Makes the node at PARENT_PATH mutable, cloning parents as needed
    // and adjusting the chain to refer to the clones.
    fn make_path_mutable(
        &self,
        trail: &mut Trail<'_>,
        parent_path: &mut ParentPath,
        txn_id: &TxnId,
    ) -> FsResult<()> {
        if parent_path
            .node
            .as_ref()
            .is_some_and(|node| node.is_mutable(txn_id))
        {
            return Ok(());
        }
        match &mut parent_path.parent {
            None => {
                parent_path.node = Some(dag::clone_root(trail, txn_id)?);
            }
            Some(parent) => {
                self.make_path_mutable(trail, parent, txn_id)?;
                let parent_node = parent.node.clone().expect("parent made mutable");
                let copy_id = match parent_path.copy_inherit {
                    CopyIdInherit::Own => None,
                    CopyIdInherit::Parent => Some(parent_node.id().copy_id().clone()),
                    CopyIdInherit::New => Some(copies::reserve_id(trail)?),
                };
                let original_id = parent_path
                    .node
                    .as_ref()
                    .expect("only existing nodes are made mutable")
                    .id()
                    .clone();
                let clone_path = parent.path();
                let entry = parent_path.entry.as_deref().expect("non-root has a name");
                let clone = dag::clone_child(
                    trail,
                    &parent_node,
                    &clone_path,
                    entry,
                    copy_id.as_ref(),
                    txn_id,
                )?;
                if parent_path.copy_inherit == CopyIdInherit::New {
                    let copy_id = copy_id.expect("reserved above");
                    copies::create(
                        trail,
                        &copy_id,
                        &Copy {
                            kind: CopyKind::Soft,
                            src_path: parent_path.copy_src_path.clone(),
                            src_txn_id: Some(original_id.txn_id().clone()),
                            dst_noderev_id: clone.id().clone(),
                        },
                    )?;
                    transactions::add_copy(trail, txn_id, &copy_id)?;
                }
                parent_path.node = Some(clone);
            }
        }
        Ok(())
    }

    // Resolves CANON to its node, erroring with NotFound if absent.
    fn get_dag(&self, trail: &mut Trail<'_>, canon: &str) -> FsResult<DagNode> {
        if let Some(node) = self.cache_get(canon) {
            return Ok(node);
        }
        let parent_path = self.open_path(trail, canon, false, None)?;
        Ok(parent_path.node.expect("open_path without flags"))
    }

    fn check_locks(
        &self,
        trail: &mut Trail<'_>,
        txn_id: &TxnId,
        canon: &str,
        recursive: bool,
    ) -> FsResult<()> {
        if transactions::get_prop(trail, txn_id, transactions::PROP_CHECK_LOCKS)?.is_some() {
            lock::allow_locked_operation(trail, canon, recursive)?;
        }
        Ok(())
    }
}

fn add_change(
    trail: &mut Trail<'_>,
    txn_id: &TxnId,
    canon: &str,
    noderev_id: &NodeRevId,
    kind: ChangeKind,
    text_mod: bool,
    prop_mod: bool,
) -> FsResult<()> {
    changes::add(
        trail,
        txn_id,
        &Change {
            path: canon.to_string(),
            noderev_id: noderev_id.clone(),
            kind,
            text_mod,
            prop_mod,
        },
    )
}

// Read surface.
impl<'fs> Root<'fs> {
    /// The kind of the node at `any_path`, or None if nothing is there.
    pub fn check_path(&self, any_path: &str) -> FsResult<Option<NodeKind>> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| match self.get_dag(trail, &canon) {
            Ok(node) => Ok(Some(node.kind())),
            Err(FsError::NotFound { .. } | FsError::NotDirectory { .. }) => Ok(None),
            Err(err) => Err(err),
        })
    }

    pub fn node_id(&self, any_path: &str) -> FsResult<NodeRevId> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            Ok(self.get_dag(trail, &canon)?.id().clone())
        })
    }

    pub fn node_kind(&self, any_path: &str) -> FsResult<NodeKind> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| Ok(self.get_dag(trail, &canon)?.kind()))
    }

    pub fn node_created_path(&self, any_path: &str) -> FsResult<String> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            Ok(self.get_dag(trail, &canon)?.created_path().to_string())
        })
    }

    /// The revision in which the node at `any_path` was committed; None
    /// for nodes still mutable in a transaction.
    pub fn node_created_rev(&self, any_path: &str) -> FsResult<Option<Revnum>> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            let node = self.get_dag(trail, &canon)?;
            dag::get_revision(trail, &node)
        })
    }

    pub fn node_proplist(&self, any_path: &str) -> FsResult<Proplist> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            let node = self.get_dag(trail, &canon)?;
            dag::get_proplist(trail, &node)
        })
    }

    pub fn node_prop(&self, any_path: &str, name: &str) -> FsResult<Option<String>> {
        Ok(self.node_proplist(any_path)?.get(name).cloned())
    }

    /// The entries of the directory at `any_path`, with each child's
    /// kind.
    pub fn dir_entries(
        &self,
        any_path: &str,
    ) -> FsResult<BTreeMap<String, (NodeRevId, NodeKind)>> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            let node = self.get_dag(trail, &canon)?;
            let entries = dag::dir_entries(trail, &node)?;
            let mut out = BTreeMap::new();
            for (name, id) in entries {
                let child = dag::get_node(trail, &id)?;
                out.insert(name, (id, child.kind()));
            }
            Ok(out)
        })
    }

    pub fn file_length(&self, any_path: &str) -> FsResult<u64> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            let node = self.get_dag(trail, &canon)?;
            dag::file_length(trail, &node)
        })
    }

    /// Hex MD5 of the file's contents as stored; the null digest when
    /// never set.
    pub fn file_md5(&self, any_path: &str) -> FsResult<String> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            let node = self.get_dag(trail, &canon)?;
            dag::file_checksum(trail, &node)
        })
    }

    pub fn file_contents(&self, any_path: &str) -> FsResult<Vec<u8>> {
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            let node = self.get_dag(trail, &canon)?;
            dag::get_contents(trail, &node)
        })
    }

    /// The aggregated changes recorded under this root's transaction:
    /// one entry per path reflecting the net effect.
    pub fn paths_changed(&self) -> FsResult<BTreeMap<String, PathChange>> {
        trail::retry_txn(self.fs, |trail| {
            let txn_id = match &self.kind {
                RootKind::Txn(txn_id) => txn_id.clone(),
                RootKind::Revision(rev) => revisions::get_txn_id(trail, *rev)?,
            };
            changes::fetch(trail, &txn_id)
        })
    }

    /// Whether the properties of the two nodes differ, judged by rep
    /// identity like the merge does.
    pub fn props_changed(
        &self,
        any_path: &str,
        other: &Root<'_>,
        other_path: &str,
    ) -> FsResult<bool> {
        Ok(self.things_changed(any_path, other, other_path)?.0)
    }

    /// Whether the contents of the two nodes differ, judged by rep
    /// identity.
    pub fn contents_changed(
        &self,
        any_path: &str,
        other: &Root<'_>,
        other_path: &str,
    ) -> FsResult<bool> {
        Ok(self.things_changed(any_path, other, other_path)?.1)
    }

    fn things_changed(
        &self,
        any_path: &str,
        other: &Root<'_>,
        other_path: &str,
    ) -> FsResult<(bool, bool)> {
        if !std::ptr::eq(self.fs, other.fs) {
            return Err(FsError::Corrupt(
                "cannot compare nodes from different filesystems".to_string(),
            ));
        }
        let canon = path::canonicalize(any_path);
        let other_canon = path::canonicalize(other_path);
        trail::retry_txn(self.fs, |trail| {
            let node = self.get_dag(trail, &canon)?;
            let other_node = other.get_dag(trail, &other_canon)?;
            dag::things_different(trail, &node, &other_node)
        })
    }
}

// Mutation surface. All of these require a txn root.
impl<'fs> Root<'fs> {
    fn make_node(&self, any_path: &str, kind: NodeKind) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            let mut parent_path = self.open_path(trail, &canon, true, Some(&txn_id))?;
            if parent_path.node.is_some() {
                return Err(FsError::AlreadyExists {
                    path: canon.clone(),
                });
            }
            self.check_locks(trail, &txn_id, &canon, false)?;
            let parent = parent_path.parent.as_mut().expect("leaf has a parent");
            self.make_path_mutable(trail, parent, &txn_id)?;
            let parent_node = parent.node.clone().expect("parent made mutable");
            let parent_canon = parent.path();
            let entry = parent_path.entry.as_deref().expect("leaf has a name");
            let child = match kind {
                NodeKind::Dir => dag::make_dir(trail, &parent_node, &parent_canon, entry, &txn_id),
                NodeKind::File => {
                    dag::make_file(trail, &parent_node, &parent_canon, entry, &txn_id)
                }
            }?;
            add_change(
                trail,
                &txn_id,
                &canon,
                child.id(),
                ChangeKind::Add,
                false,
                false,
            )
        })
    }

    pub fn make_dir(&self, any_path: &str) -> FsResult<()> {
        self.make_node(any_path, NodeKind::Dir)
    }

    pub fn make_file(&self, any_path: &str) -> FsResult<()> {
        self.make_node(any_path, NodeKind::File)
    }

    /// Deletes the node at `any_path`, reclaiming any mutable subtree.
    pub fn delete(&self, any_path: &str) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let canon = path::canonicalize(any_path);
        if canon == "/" {
            return Err(FsError::RootDir);
        }
        trail::retry_txn(self.fs, |trail| {
            let mut parent_path = self.open_path(trail, &canon, false, Some(&txn_id))?;
            self.check_locks(trail, &txn_id, &canon, true)?;
            let deleted_id = parent_path
                .node
                .as_ref()
                .expect("open_path without flags")
                .id()
                .clone();
            let parent = parent_path.parent.as_mut().expect("non-root path");
            self.make_path_mutable(trail, parent, &txn_id)?;
            let parent_node = parent.node.clone().expect("parent made mutable");
            let entry = parent_path.entry.as_deref().expect("non-root has a name");
            dag::delete(trail, &parent_node, entry, &txn_id)?;
            add_change(
                trail,
                &txn_id,
                &canon,
                &deleted_id,
                ChangeKind::Delete,
                false,
                false,
            )
        })
    }

    /// Copies `src_path` in `src_root` (a revision root) to `dst_path`
    /// in this txn. With `preserve_history`, the copy gets a fresh copy
    /// id and a real copy row; without, the destination entry simply
    /// points at the source node.
    pub fn copy(
        &self,
        src_root: &Root<'_>,
        src_path: &str,
        dst_path: &str,
        preserve_history: bool,
    ) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let src_rev = src_root.revision().ok_or(FsError::NotRevisionRoot)?;
        let src_canon = path::canonicalize(src_path);
        let dst_canon = path::canonicalize(dst_path);
        if dst_canon == "/" {
            return Err(FsError::RootDir);
        }
        trail::retry_txn(self.fs, |trail| {
            let from_node = src_root.get_dag(trail, &src_canon)?;
            let mut parent_path = self.open_path(trail, &dst_canon, true, Some(&txn_id))?;
            self.check_locks(trail, &txn_id, &dst_canon, true)?;
            let kind = if parent_path.node.is_some() {
                ChangeKind::Replace
            } else {
                ChangeKind::Add
            };
            let parent = parent_path.parent.as_mut().expect("non-root path");
            self.make_path_mutable(trail, parent, &txn_id)?;
            let parent_node = parent.node.clone().expect("parent made mutable");
            let entry = parent_path.entry.as_deref().expect("non-root has a name");
            dag::copy(
                trail,
                &parent_node,
                entry,
                &from_node,
                preserve_history,
                src_rev,
                &src_canon,
                &txn_id,
            )?;
            let new_node = dag::open(trail, &parent_node, entry)?;
            add_change(trail, &txn_id, &dst_canon, new_node.id(), kind, false, false)
        })
    }

    /// Moves the node at `from_path` to `to_path`, which must not yet
    /// exist. The node keeps its identity; the change records are a
    /// delete at the source and an add at the destination.
    pub fn rename(&self, from_path: &str, to_path: &str) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let from = path::canonicalize(from_path);
        let to = path::canonicalize(to_path);
        if from == "/" || to == "/" {
            return Err(FsError::RootDir);
        }
        if from == to || path::is_child(&from, &to) {
            return Err(FsError::Malformed(format!(
                "cannot move '{from}' into itself"
            )));
        }
        trail::retry_txn(self.fs, |trail| {
            let from_parent_path = self.open_path(trail, &from, false, Some(&txn_id))?;
            let mut to_parent_path = self.open_path(trail, &to, true, Some(&txn_id))?;
            if to_parent_path.node.is_some() {
                return Err(FsError::AlreadyExists { path: to.clone() });
            }
            self.check_locks(trail, &txn_id, &from, true)?;
            self.check_locks(trail, &txn_id, &to, true)?;
            let moved_id = from_parent_path
                .node
                .as_ref()
                .expect("open_path without flags")
                .id()
                .clone();
            let mut from_parent_path = from_parent_path;
            let from_parent = from_parent_path.parent.as_mut().expect("non-root path");
            self.make_path_mutable(trail, from_parent, &txn_id)?;
            let to_parent = to_parent_path.parent.as_mut().expect("non-root path");
            self.make_path_mutable(trail, to_parent, &txn_id)?;
            let to_parent_node = to_parent.node.clone().expect("parent made mutable");
            let to_entry = to_parent_path.entry.as_deref().expect("non-root has a name");
            dag::set_entry(trail, &to_parent_node, to_entry, &moved_id, &txn_id)?;
            // Re-read the source parent: linking the destination may have
            // rewritten it when both live in the same directory.
            let from_parent_node =
                dag::get_node(trail, from_parent.node.as_ref().expect("made mutable").id())?;
            let from_entry = from_parent_path
                .entry
                .as_deref()
                .expect("non-root has a name");
            dag::unlink(trail, &from_parent_node, from_entry, &txn_id)?;
            add_change(
                trail,
                &txn_id,
                &from,
                &moved_id,
                ChangeKind::Delete,
                false,
                false,
            )?;
            add_change(trail, &txn_id, &to, &moved_id, ChangeKind::Add, false, false)
        })
    }

    /// Sets or removes one property of the node at `any_path`.
    pub fn change_node_prop(
        &self,
        any_path: &str,
        name: &str,
        value: Option<&str>,
    ) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        let canon = path::canonicalize(any_path);
        trail::retry_txn(self.fs, |trail| {
            let mut parent_path = self.open_path(trail, &canon, false, Some(&txn_id))?;
            self.check_locks(trail, &txn_id, &canon, false)?;
            self.make_path_mutable(trail, &mut parent_path, &txn_id)?;
            let node = parent_path.node.clone().expect("made mutable");
            let mut props = dag::get_proplist(trail, &node)?;
            match value {
                Some(value) => {
                    props.insert(name.to_string(), value.to_string());
                }
                None => {
                    props.remove(name);
                }
            }
            dag::set_proplist(trail, &node, &props, &txn_id)?;
            add_change(
                trail,
                &txn_id,
                &canon,
                node.id(),
                ChangeKind::Modify,
                false,
                true,
            )
        })
    }

    // Shared closing path of apply_text and apply_textdelta: makes the
    // file mutable, streams the new contents into a fresh edit rep, and
    // promotes it with checksum verification.
    fn write_file_contents(
        &self,
        canon: &str,
        contents: &[u8],
        result_md5: Option<&str>,
    ) -> FsResult<()> {
        let txn_id = self.require_txn()?.clone();
        trail::retry_txn(self.fs, |trail| {
            let mut parent_path = self.open_path(trail, canon, false, Some(&txn_id))?;
            self.check_locks(trail, &txn_id, canon, false)?;
            self.make_path_mutable(trail, &mut parent_path, &txn_id)?;
            let node = parent_path.node.clone().expect("made mutable");
            let mut writer = dag::edit_stream(trail, &node, &txn_id)?;
            writer.write(contents)?;
            writer.close()?;
            dag::finalize_edits(trail, &node, result_md5, &txn_id)?;
            add_change(
                trail,
                &txn_id,
                canon,
                node.id(),
                ChangeKind::Modify,
                true,
                false,
            )
        })
    }

    /// Opens a writer replacing the contents of the file at `any_path`.
    /// The replacement happens when the writer is closed; `result_md5`,
    /// if given, must match the written bytes.
    pub fn apply_text(
        &self,
        any_path: &str,
        result_md5: Option<&str>,
    ) -> FsResult<FileWriter<'_, 'fs>> {
        self.require_txn()?;
        Ok(FileWriter {
            root: self,
            canon: path::canonicalize(any_path),
            result_md5: result_md5.map(str::to_string),
            buf: Vec::new(),
        })
    }

    /// Opens a window handler applying a delta against the file's
    /// current contents. `base_md5`, if given, must match the stored
    /// digest of those contents.
    pub fn apply_textdelta(
        &self,
        any_path: &str,
        base_md5: Option<&str>,
        result_md5: Option<&str>,
    ) -> FsResult<TextDeltaApplier<'_, 'fs>> {
        self.require_txn()?;
        let canon = path::canonicalize(any_path);
        let base = trail::retry_txn(self.fs, |trail| {
            let node = self.get_dag(trail, &canon)?;
            let stored = dag::file_checksum(trail, &node)?;
            if let Some(expected) = base_md5
                && !rep::is_null_digest(&stored)
                && expected != stored
            {
                return Err(FsError::ChecksumMismatch {
                    detail: format!("base text of '{canon}'"),
                    expected: expected.to_string(),
                    actual: stored,
                });
            }
            dag::get_contents(trail, &node)
        })?;
        Ok(TextDeltaApplier {
            root: self,
            canon,
            result_md5: result_md5.map(str::to_string),
            base,
            out: Vec::new(),
        })
    }
}

/// Buffered whole-text writer returned by [`Root::apply_text`].
pub struct FileWriter<'r, 'fs> {
    root: &'r Root<'fs>,
    canon: String,
    result_md5: Option<String>,
    buf: Vec<u8>,
}

impl FileWriter<'_, '_> {
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn close(self) -> FsResult<()> {
        self.root
            .write_file_contents(&self.canon, &self.buf, self.result_md5.as_deref())
    }
}

/// Window handler returned by [`Root::apply_textdelta`].
#[derive(Debug)]
pub struct TextDeltaApplier<'r, 'fs> {
    root: &'r Root<'fs>,
    canon: String,
    result_md5: Option<String>,
    base: Vec<u8>,
    out: Vec<u8>,
}

impl TextDeltaApplier<'_, '_> {
    pub fn apply_window(&mut self, window: &delta::Window) {
        self.out
            .extend_from_slice(&delta::apply(&self.base, window));
    }

    pub fn close(self) -> FsResult<()> {
        self.root
            .write_file_contents(&self.canon, &self.out, self.result_md5.as_deref())
    }
}

fn conflict(first_conflict: &mut String, conflict_path: &str) -> FsError {
    if first_conflict.is_empty() {
        first_conflict.push_str(conflict_path);
    }
    FsError::Conflict {
        path: first_conflict.clone(),
    }
}

// Sets TARGET's predecessor to SOURCE, absorbing the history between
// ancestor and source that the merge just reconciled.
fn update_ancestry(
    trail: &mut Trail<'_>,
    source_id: &NodeRevId,
    target_id: &NodeRevId,
    txn_id: &TxnId,
    source_pred_count: i64,
) -> FsResult<()> {
    if target_id.txn_id() != txn_id {
        return Err(FsError::NotMutable {
            id: target_id.to_string(),
        });
    }
    let mut noderev = node_rev::get(trail, target_id)?;
    noderev.predecessor_id = Some(source_id.clone());
    noderev.predecessor_count = if source_pred_count == -1 {
        -1
    } else {
        source_pred_count + 1
    };
    node_rev::put(trail, target_id, &noderev)
}

// The three-way merge, per directory, recursively. TARGET is the only
// mutable tree of the three.
fn merge(
    trail: &mut Trail<'_>,
    first_conflict: &mut String,
    target_path: &str,
    target: &DagNode,
    source: &DagNode,
    ancestor: &DagNode,
    txn_id: &TxnId,
) -> FsResult<()> {
    if ancestor.id() == target.id() {
        return Err(FsError::Corrupt(format!(
            "bad merge: target '{target_path}' has id '{}', same as ancestor",
            target.id()
        )));
    }
    // No change upstream, or the same change on both sides: nothing to
    // merge.
    if ancestor.id() == source.id() || source.id() == target.id() {
        return Ok(());
    }

    if source.kind() != NodeKind::Dir
        || target.kind() != NodeKind::Dir
        || ancestor.kind() != NodeKind::Dir
    {
        return Err(conflict(first_conflict, target_path));
    }

    // Property changes may only be committed on an up-to-date directory,
    // and upstream property changes conflict with any change here. The
    // comparison is on rep keys, not contents.
    {
        let target_nr = node_rev::get(trail, target.id())?;
        let ancestor_nr = node_rev::get(trail, ancestor.id())?;
        let source_nr = node_rev::get(trail, source.id())?;
        if target_nr.prop_rep_id != ancestor_nr.prop_rep_id
            || source_nr.prop_rep_id != ancestor_nr.prop_rep_id
        {
            return Err(conflict(first_conflict, target_path));
        }
    }

    let mut s_entries = dag::dir_entries(trail, source)?;
    let t_entries = dag::dir_entries(trail, target)?;
    let a_entries = dag::dir_entries(trail, ancestor)?;

    for (name, a_id) in &a_entries {
        let s_id = s_entries.remove(name);
        let t_id = t_entries.get(name).cloned();

        if s_id.as_ref() == Some(a_id) {
            // No upstream change to this entry.
            continue;
        }
        if t_id.as_ref() == Some(a_id) {
            // Only upstream changed it; absorb the change.
            match &s_id {
                Some(s_id) => dag::set_entry(trail, target, name, s_id, txn_id)?,
                None => dag::delete(trail, target, name, txn_id)?,
            }
            continue;
        }
        // Changed both upstream and here; merge or conflict.
        let entry_path = path::join(target_path, name);
        let (Some(s_id), Some(t_id)) = (s_id, t_id) else {
            // One side removed it while the other changed it.
            return Err(conflict(first_conflict, &entry_path));
        };
        // Replacements (node or branch identity changes) are incompatible
        // with any other edit, even an identical one.
        if !s_id.same_branch_as(a_id) || !t_id.same_branch_as(a_id) {
            return Err(conflict(first_conflict, &entry_path));
        }
        let s_node = dag::get_node(trail, &s_id)?;
        let t_node = dag::get_node(trail, &t_id)?;
        let a_node = dag::get_node(trail, a_id)?;
        if s_node.kind() == NodeKind::File
            || t_node.kind() == NodeKind::File
            || a_node.kind() == NodeKind::File
        {
            return Err(conflict(first_conflict, &entry_path));
        }
        merge(
            trail,
            first_conflict,
            &entry_path,
            &t_node,
            &s_node,
            &a_node,
            txn_id,
        )?;
    }

    // Entries added upstream but absent from the ancestor.
    for (name, s_id) in &s_entries {
        if t_entries.contains_key(name) {
            // Two additions are never auto-mergeable, even identical
            // ones.
            return Err(conflict(first_conflict, &path::join(target_path, name)));
        }
        dag::set_entry(trail, target, name, s_id, txn_id)?;
    }
    // Entries added only here are left alone.

    let source_pred_count = dag::get_predecessor_count(trail, source)?;
    update_ancestry(trail, source.id(), target.id(), txn_id, source_pred_count)
}

// Merges the changes between the txn's base and SOURCE into the txn,
// ratcheting the txn's base forward to SOURCE on success.
fn merge_into_txn(
    trail: &mut Trail<'_>,
    txn_id: &TxnId,
    source: &DagNode,
    first_conflict: &mut String,
) -> FsResult<()> {
    let txn_root_node = dag::txn_root(trail, txn_id)?;
    let ancestor_node = dag::txn_base_root(trail, txn_id)?;
    if ancestor_node.id() == txn_root_node.id() {
        // No changes in the txn since its base: just repeat SOURCE.
        transactions::set_base(trail, txn_id, source.id())?;
        transactions::set_root(trail, txn_id, source.id())?;
    } else {
        merge(
            trail,
            first_conflict,
            "/",
            &txn_root_node,
            source,
            &ancestor_node,
            txn_id,
        )?;
        let source_pred_count = dag::get_predecessor_count(trail, source)?;
        update_ancestry(
            trail,
            source.id(),
            txn_root_node.id(),
            txn_id,
            source_pred_count,
        )?;
        transactions::set_base(trail, txn_id, source.id())?;
    }
    Ok(())
}

// Re-verifies every lock affecting the txn's changed paths. Paths are
// visited parents-first so one recursive check covers its children.
fn verify_locks(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<()> {
    let changed = changes::fetch(trail, txn_id)?;
    let mut paths: Vec<&String> = changed.keys().collect();
    paths.sort_by(|a, b| path::compare(a.as_str(), b.as_str()));
    let mut last_recursed: Option<String> = None;
    for changed_path in paths {
        if let Some(recursed) = &last_recursed
            && path::is_child(recursed, changed_path)
        {
            continue;
        }
        let recurse = changed[changed_path].kind != ChangeKind::Modify;
        lock::allow_locked_operation(trail, changed_path, recurse)?;
        if recurse {
            last_recursed = Some(changed_path.clone());
        }
    }
    Ok(())
}

// The single-trail commit attempt: holds the youngest-revision read
// lock, verifies the txn is up to date, re-verifies locks, and appends
// the revision.
fn commit_body(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<Revnum> {
    let youngest = revisions::youngest(trail)?;
    let youngest_txn = revisions::get_txn_id(trail, youngest)?;
    let youngest_root_id = transactions::get(trail, &youngest_txn)?.root_id;
    let txn_base_id = transactions::get(trail, txn_id)?.base_id;
    if youngest_root_id != txn_base_id {
        return Err(FsError::TxnOutOfDate {
            txn_id: txn_id.as_str().to_string(),
        });
    }
    if transactions::get_prop(trail, txn_id, transactions::PROP_CHECK_LOCKS)?.is_some() {
        verify_locks(trail, txn_id)?;
    }
    dag::commit_txn(trail, txn_id)
}

/// Commits TXN_ID, repeatedly rebasing it onto the youngest revision
/// until the append wins the race or a conflict is found. On success the
/// new revision's representations are skip-deltified.
pub(crate) fn commit_txn(fs: &Filesystem, txn_id: &TxnId) -> FsResult<Revnum> {
    let mut first_conflict = String::new();
    loop {
        // Take the youngest revision in its own short trail so the main
        // merge work doesn't hold the revisions table lock.
        let youngish = trail::retry_txn(fs, revisions::youngest)?;
        let youngish_root_node =
            trail::retry_txn(fs, |trail| dag::revision_root(trail, youngish))?;

        trail::retry_txn(fs, |trail| {
            merge_into_txn(trail, txn_id, &youngish_root_node, &mut first_conflict)
        })?;

        match trail::retry_txn(fs, |trail| commit_body(trail, txn_id)) {
            Ok(new_rev) => {
                deltify_revision(fs, new_rev)?;
                return Ok(new_rev);
            }
            Err(FsError::TxnOutOfDate { .. }) => {
                // Someone else committed while we were merging. Loop and
                // merge their changes too, unless nothing actually moved.
                let youngest = fs.youngest_rev()?;
                if youngest == youngish {
                    return Err(FsError::TxnOutOfDate {
                        txn_id: txn_id.as_str().to_string(),
                    });
                }
                debug!(txn = %txn_id, youngest, "commit raced, re-merging");
            }
            Err(err) => return Err(err),
        }
    }
}

// Skip-deltification sweep over the nodes a just-committed txn touched.
pub(crate) fn deltify_revision(fs: &Filesystem, rev: Revnum) -> FsResult<()> {
    trail::retry_txn(fs, |trail| {
        let txn_id = revisions::get_txn_id(trail, rev)?;
        let root = dag::revision_root(trail, rev)?;
        deltify_node(trail, &root, &txn_id)
    })
}

// Redeltifies the predecessors of NODE if NODE belongs to TXN_ID,
// recursing through directories first. Children of a node outside the
// txn cannot belong to it either.
fn deltify_node(trail: &mut Trail<'_>, node: &DagNode, txn_id: &TxnId) -> FsResult<()> {
    if node.id().txn_id() != txn_id {
        return Ok(());
    }
    if node.kind() == NodeKind::Dir {
        for child_id in dag::dir_entries(trail, node)?.values() {
            let child = dag::get_node(trail, child_id)?;
            deltify_node(trail, &child, txn_id)?;
        }
    }

    let pred_count = dag::get_predecessor_count(trail, node)?;
    if pred_count <= 0 {
        return Ok(());
    }

    // Redeltify the node's predecessors at power-of-two distances, so
    // that O(log N) window applications reach any revision in a chain of
    // N. Always redeltify the immediate predecessor; skip distance 2
    // unconditionally; touch the deeper levels only once the chain has
    // 32 predecessors; and never redeltify the oldest node revision of
    // the chain.
    let mut levels = vec![0u32];
    if pred_count >= 32 {
        let mut k = 1;
        while pred_count % (1i64 << k) == 0 {
            if k >= 2 && (1i64 << k) != pred_count {
                levels.push(k);
            }
            k += 1;
        }
    }

    let is_dir = node.kind() == NodeKind::Dir;
    let mut walked: i64 = 0;
    let mut pred_id = node.id().clone();
    for k in levels {
        let distance = 1i64 << k;
        while walked < distance {
            let noderev = node_rev::get(trail, &pred_id)?;
            pred_id = noderev.predecessor_id.ok_or_else(|| {
                FsError::Corrupt("faulty predecessor count in node chain".to_string())
            })?;
            walked += 1;
        }
        let pred_node = dag::get_node(trail, &pred_id)?;
        dag::deltify(trail, &pred_node, node, is_dir)?;
    }
    Ok(())
}
