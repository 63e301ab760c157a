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

//! Typed operations over the node-revision DAG.
//!
//! A [`DagNode`] is a light handle carrying a node revision's id, kind,
//! and created path; all state lives in the tables. Everything here runs
//! within a caller-supplied trail. The mutability rules are enforced at
//! this layer: a node revision is writable iff the txn component of its id
//! names the caller's active transaction.

use std::collections::BTreeMap;

use chrono::SecondsFormat;
use chrono::Utc;

use crate::changes;
use crate::copies;
use crate::copies::Copy;
use crate::copies::CopyKind;
use crate::error::FsError;
use crate::error::FsResult;
use crate::id::CopyId;
use crate::id::NodeRevId;
use crate::id::Revnum;
use crate::id::TxnId;
use crate::node_rev;
use crate::node_rev::NodeKind;
use crate::node_rev::NodeRevision;
use crate::path;
use crate::rep;
use crate::rep::RepWriter;
use crate::revisions;
use crate::revisions::Revision;
use crate::tables;
use crate::trail::Trail;
use crate::transactions;

/// Directory entry lists, name to node revision id.
pub type Entries = BTreeMap<String, NodeRevId>;

/// Property lists of nodes, transactions, and revisions.
pub type Proplist = BTreeMap<String, String>;

/// Handle onto one node revision.
#[derive(Clone, Debug)]
pub struct DagNode {
    id: NodeRevId,
    kind: NodeKind,
    created_path: String,
}

impl DagNode {
    pub fn id(&self) -> &NodeRevId {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn created_path(&self) -> &str {
        &self.created_path
    }

    pub fn is_mutable(&self, txn_id: &TxnId) -> bool {
        self.id.txn_id() == txn_id
    }
}

pub fn get_node(trail: &mut Trail<'_>, id: &NodeRevId) -> FsResult<DagNode> {
    let noderev = node_rev::get(trail, id)?;
    Ok(DagNode {
        id: id.clone(),
        kind: noderev.kind,
        created_path: noderev.created_path,
    })
}

/// The root directory of a committed revision.
pub fn revision_root(trail: &mut Trail<'_>, rev: Revnum) -> FsResult<DagNode> {
    let txn_id = revisions::get_txn_id(trail, rev)?;
    let txn = transactions::get(trail, &txn_id)?;
    get_node(trail, &txn.root_id)
}

/// The (possibly cloned) root directory of an in-progress transaction.
pub fn txn_root(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<DagNode> {
    let txn = transactions::get(trail, txn_id)?;
    get_node(trail, &txn.root_id)
}

/// The root of the revision the transaction was based on.
pub fn txn_base_root(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<DagNode> {
    let txn = transactions::get(trail, txn_id)?;
    get_node(trail, &txn.base_id)
}

/// The revision in which this node's transaction was committed, if any.
pub fn get_revision(trail: &mut Trail<'_>, node: &DagNode) -> FsResult<Option<Revnum>> {
    Ok(transactions::get(trail, node.id.txn_id())?.revision)
}

pub fn get_predecessor_id(trail: &mut Trail<'_>, node: &DagNode) -> FsResult<Option<NodeRevId>> {
    Ok(node_rev::get(trail, &node.id)?.predecessor_id)
}

pub fn get_predecessor_count(trail: &mut Trail<'_>, node: &DagNode) -> FsResult<i64> {
    Ok(node_rev::get(trail, &node.id)?.predecessor_count)
}

fn parse_entries(raw: &[u8]) -> FsResult<Entries> {
    if raw.is_empty() {
        return Ok(Entries::new());
    }
    serde_json::from_slice(raw)
        .map_err(|err| FsError::Corrupt(format!("malformed directory entries: {err}")))
}

fn entries_of(trail: &mut Trail<'_>, noderev: &NodeRevision) -> FsResult<Entries> {
    if noderev.kind != NodeKind::Dir {
        return Err(FsError::NotDirectory {
            path: noderev.created_path.clone(),
        });
    }
    match &noderev.data_rep_id {
        None => Ok(Entries::new()),
        Some(rep_id) => parse_entries(&rep::read_contents(trail, rep_id)?),
    }
}

/// The entries of a directory node. Errors with `NotDirectory` for files.
pub fn dir_entries(trail: &mut Trail<'_>, node: &DagNode) -> FsResult<Entries> {
    let noderev = node_rev::get(trail, &node.id)?;
    entries_of(trail, &noderev)
}

/// Opens the child named `name` of a directory node.
pub fn open(trail: &mut Trail<'_>, parent: &DagNode, name: &str) -> FsResult<DagNode> {
    if !path::is_single_path_component(name) {
        return Err(FsError::NotSinglePathComponent {
            name: name.to_string(),
        });
    }
    let entries = dir_entries(trail, parent)?;
    let id = entries.get(name).ok_or_else(|| FsError::NotFound {
        path: name.to_string(),
    })?;
    get_node(trail, id)
}

// Writes `entries` into PARENT's data rep, copy-on-writing the rep if it
// is shared, and rewrites the parent's node revision to match.
fn write_entries(
    trail: &mut Trail<'_>,
    parent: &DagNode,
    entries: &Entries,
    txn_id: &TxnId,
) -> FsResult<()> {
    let mut noderev = node_rev::get(trail, &parent.id)?;
    let mutable_rep = rep::get_mutable(trail, noderev.data_rep_id.as_ref(), txn_id)?;
    if noderev.data_rep_id.as_ref() != Some(&mutable_rep) {
        noderev.data_rep_id = Some(mutable_rep.clone());
        node_rev::put(trail, &parent.id, &noderev)?;
    }
    let raw = serde_json::to_vec(entries)
        .map_err(|err| FsError::Corrupt(format!("unencodable directory entries: {err}")))?;
    let mut writer = rep::write_stream(trail, &mutable_rep, txn_id, true)?;
    writer.write(&raw)?;
    writer.close()
}

/// Adds or replaces the entry `name -> id` in a mutable directory.
pub fn set_entry(
    trail: &mut Trail<'_>,
    parent: &DagNode,
    name: &str,
    id: &NodeRevId,
    txn_id: &TxnId,
) -> FsResult<()> {
    if parent.kind != NodeKind::Dir {
        return Err(FsError::NotDirectory {
            path: parent.created_path.clone(),
        });
    }
    if !parent.is_mutable(txn_id) {
        return Err(FsError::NotMutable {
            id: parent.id.to_string(),
        });
    }
    let mut entries = dir_entries(trail, parent)?;
    entries.insert(name.to_string(), id.clone());
    write_entries(trail, parent, &entries, txn_id)
}

// Creates a node revision for a new file or directory under PARENT and
// links it in. PARENT must be a mutable directory without an entry named
// NAME.
fn make_entry(
    trail: &mut Trail<'_>,
    parent: &DagNode,
    parent_path: &str,
    name: &str,
    kind: NodeKind,
    txn_id: &TxnId,
) -> FsResult<DagNode> {
    if !path::is_single_path_component(name) {
        return Err(FsError::NotSinglePathComponent {
            name: name.to_string(),
        });
    }
    if parent.kind != NodeKind::Dir {
        return Err(FsError::NotDirectory {
            path: parent.created_path.clone(),
        });
    }
    if !parent.is_mutable(txn_id) {
        return Err(FsError::NotMutable {
            id: parent.id.to_string(),
        });
    }
    let entries = dir_entries(trail, parent)?;
    if entries.contains_key(name) {
        return Err(FsError::AlreadyExists {
            path: path::join(parent_path, name),
        });
    }
    let created_path = path::join(parent_path, name);
    let noderev = match kind {
        NodeKind::Dir => NodeRevision::new_dir(&created_path),
        NodeKind::File => NodeRevision::new_file(&created_path),
    };
    let id = node_rev::create(trail, &noderev, parent.id.copy_id(), txn_id)?;
    let child = get_node(trail, &id)?;
    set_entry(trail, parent, name, &id, txn_id)?;
    Ok(child)
}

pub fn make_file(
    trail: &mut Trail<'_>,
    parent: &DagNode,
    parent_path: &str,
    name: &str,
    txn_id: &TxnId,
) -> FsResult<DagNode> {
    make_entry(trail, parent, parent_path, name, NodeKind::File, txn_id)
}

pub fn make_dir(
    trail: &mut Trail<'_>,
    parent: &DagNode,
    parent_path: &str,
    name: &str,
    txn_id: &TxnId,
) -> FsResult<DagNode> {
    make_entry(trail, parent, parent_path, name, NodeKind::Dir, txn_id)
}

/// Clones the child `name` of a mutable parent for mutation under
/// `txn_id`, rewriting the parent's entry to point at the clone. Returns
/// the existing child when it is already mutable. The clone keeps the
/// child's node id; its copy id is `copy_id` if supplied, else inherited.
pub fn clone_child(
    trail: &mut Trail<'_>,
    parent: &DagNode,
    parent_path: &str,
    name: &str,
    copy_id: Option<&CopyId>,
    txn_id: &TxnId,
) -> FsResult<DagNode> {
    if !parent.is_mutable(txn_id) {
        return Err(FsError::NotMutable {
            id: parent.id.to_string(),
        });
    }
    if !path::is_single_path_component(name) {
        return Err(FsError::NotSinglePathComponent {
            name: name.to_string(),
        });
    }
    let cur_entry = open(trail, parent, name)?;
    if cur_entry.is_mutable(txn_id) {
        return Ok(cur_entry);
    }
    let mut noderev = node_rev::get(trail, &cur_entry.id)?;
    noderev.predecessor_id = Some(cur_entry.id.clone());
    if noderev.predecessor_count != -1 {
        noderev.predecessor_count += 1;
    }
    noderev.created_path = path::join(parent_path, name);
    let new_id = node_rev::create_successor(trail, &cur_entry.id, &noderev, copy_id, txn_id)?;
    set_entry(trail, parent, name, &new_id, txn_id)?;
    get_node(trail, &new_id)
}

/// Ensures the transaction's root is a clone owned by the transaction,
/// cloning the base root on first call. Idempotent.
pub fn clone_root(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<DagNode> {
    let txn = transactions::get(trail, txn_id)?;
    if txn.root_id != txn.base_id {
        return get_node(trail, &txn.root_id);
    }
    let base_root_id = txn.base_id;
    let mut noderev = node_rev::get(trail, &base_root_id)?;
    noderev.predecessor_id = Some(base_root_id.clone());
    if noderev.predecessor_count != -1 {
        noderev.predecessor_count += 1;
    }
    let root_id = node_rev::create_successor(
        trail,
        &base_root_id,
        &noderev,
        Some(base_root_id.copy_id()),
        txn_id,
    )?;
    transactions::set_root(trail, txn_id, &root_id)?;
    get_node(trail, &root_id)
}

/// Removes one node revision row and any mutable reps it points at. The
/// node must be mutable under `txn_id`.
pub fn remove_node(trail: &mut Trail<'_>, id: &NodeRevId, txn_id: &TxnId) -> FsResult<()> {
    if id.txn_id() != txn_id {
        return Err(FsError::NotMutable { id: id.to_string() });
    }
    let noderev = node_rev::get(trail, id)?;
    for rep_id in [
        noderev.prop_rep_id.as_ref(),
        noderev.data_rep_id.as_ref(),
        noderev.edit_rep_id.as_ref(),
    ]
    .into_iter()
    .flatten()
    {
        rep::delete_if_mutable(trail, rep_id, txn_id)?;
    }
    if let Some(predecessor) = &noderev.predecessor_id {
        tables::delete_successor(trail, predecessor, id)?;
    }
    node_rev::delete(trail, id)
}

/// Recursively removes a node and its children iff mutable under
/// `txn_id`; immutable nodes are shared history and left alone.
pub fn delete_if_mutable(trail: &mut Trail<'_>, id: &NodeRevId, txn_id: &TxnId) -> FsResult<()> {
    let node = get_node(trail, id)?;
    if !node.is_mutable(txn_id) {
        return Ok(());
    }
    if node.kind == NodeKind::Dir {
        for child_id in dir_entries(trail, &node)?.values() {
            delete_if_mutable(trail, child_id, txn_id)?;
        }
    }
    remove_node(trail, id, txn_id)
}

/// Removes the entry `name` from a mutable directory, reclaiming any
/// mutable subtree beneath it. Fails with `NoSuchEntry` if absent.
pub fn delete(trail: &mut Trail<'_>, parent: &DagNode, name: &str, txn_id: &TxnId) -> FsResult<()> {
    if parent.kind != NodeKind::Dir {
        return Err(FsError::NotDirectory {
            path: parent.created_path.clone(),
        });
    }
    if !parent.is_mutable(txn_id) {
        return Err(FsError::NotMutable {
            id: parent.id.to_string(),
        });
    }
    if !path::is_single_path_component(name) {
        return Err(FsError::NotSinglePathComponent {
            name: name.to_string(),
        });
    }
    let mut entries = dir_entries(trail, parent)?;
    let id = entries.remove(name).ok_or_else(|| FsError::NoSuchEntry {
        name: name.to_string(),
    })?;
    delete_if_mutable(trail, &id, txn_id)?;
    write_entries(trail, parent, &entries, txn_id)
}

/// Removes the entry `name` from a mutable directory without reclaiming
/// the node it pointed at. Used by renames, which relink the node
/// elsewhere.
pub fn unlink(trail: &mut Trail<'_>, parent: &DagNode, name: &str, txn_id: &TxnId) -> FsResult<()> {
    if parent.kind != NodeKind::Dir {
        return Err(FsError::NotDirectory {
            path: parent.created_path.clone(),
        });
    }
    if !parent.is_mutable(txn_id) {
        return Err(FsError::NotMutable {
            id: parent.id.to_string(),
        });
    }
    let mut entries = dir_entries(trail, parent)?;
    entries.remove(name).ok_or_else(|| FsError::NoSuchEntry {
        name: name.to_string(),
    })?;
    write_entries(trail, parent, &entries, txn_id)
}

/// The full text of a file node.
pub fn get_contents(trail: &mut Trail<'_>, file: &DagNode) -> FsResult<Vec<u8>> {
    let noderev = require_file(trail, file)?;
    match &noderev.data_rep_id {
        None => Ok(vec![]),
        Some(rep_id) => rep::read_contents(trail, rep_id),
    }
}

pub fn file_length(trail: &mut Trail<'_>, file: &DagNode) -> FsResult<u64> {
    let noderev = require_file(trail, file)?;
    match &noderev.data_rep_id {
        None => Ok(0),
        Some(rep_id) => rep::contents_size(trail, rep_id),
    }
}

/// The stored digest of a file's contents; the null digest when the file
/// has no contents rep.
pub fn file_checksum(trail: &mut Trail<'_>, file: &DagNode) -> FsResult<String> {
    let noderev = require_file(trail, file)?;
    match &noderev.data_rep_id {
        None => Ok(rep::NULL_DIGEST.to_string()),
        Some(rep_id) => rep::contents_checksum(trail, rep_id),
    }
}

fn require_file(trail: &mut Trail<'_>, file: &DagNode) -> FsResult<NodeRevision> {
    let noderev = node_rev::get(trail, &file.id)?;
    if noderev.kind != NodeKind::File {
        return Err(FsError::NotFile {
            path: noderev.created_path,
        });
    }
    Ok(noderev)
}

/// Allocates a fresh mutable edit rep for the file (discarding any prior
/// one) and returns a writer into it. The replacement contents become
/// live only at [`finalize_edits`].
pub fn edit_stream<'a, 'fs>(
    trail: &'a mut Trail<'fs>,
    file: &DagNode,
    txn_id: &TxnId,
) -> FsResult<RepWriter<'a, 'fs>> {
    let mut noderev = node_rev::get(trail, &file.id)?;
    if noderev.kind != NodeKind::File {
        return Err(FsError::NotFile {
            path: noderev.created_path,
        });
    }
    if !file.is_mutable(txn_id) {
        return Err(FsError::NotMutable {
            id: file.id.to_string(),
        });
    }
    if let Some(edit_rep) = noderev.edit_rep_id.take() {
        rep::delete_if_mutable(trail, &edit_rep, txn_id)?;
    }
    let edit_rep = rep::get_mutable(trail, None, txn_id)?;
    noderev.edit_rep_id = Some(edit_rep.clone());
    node_rev::put(trail, &file.id, &noderev)?;
    rep::write_stream(trail, &edit_rep, txn_id, false)
}

/// Promotes the file's edit rep to its contents rep after verifying the
/// expected digest. A checksum mismatch is fatal to the surrounding
/// trail. A file without pending edits is left alone.
pub fn finalize_edits(
    trail: &mut Trail<'_>,
    file: &DagNode,
    expected_md5: Option<&str>,
    txn_id: &TxnId,
) -> FsResult<()> {
    let mut noderev = node_rev::get(trail, &file.id)?;
    if noderev.kind != NodeKind::File {
        return Err(FsError::NotFile {
            path: noderev.created_path,
        });
    }
    if !file.is_mutable(txn_id) {
        return Err(FsError::NotMutable {
            id: file.id.to_string(),
        });
    }
    let Some(edit_rep) = noderev.edit_rep_id.take() else {
        return Ok(());
    };
    if let Some(expected) = expected_md5 {
        let actual = rep::compute_checksum(trail, &edit_rep)?;
        if expected != actual {
            return Err(FsError::ChecksumMismatch {
                detail: format!("representation '{edit_rep}'"),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    let old_data_rep = noderev.data_rep_id.replace(edit_rep);
    node_rev::put(trail, &file.id, &noderev)?;
    if let Some(old_rep) = old_data_rep {
        rep::delete_if_mutable(trail, &old_rep, txn_id)?;
    }
    Ok(())
}

pub fn get_proplist(trail: &mut Trail<'_>, node: &DagNode) -> FsResult<Proplist> {
    let noderev = node_rev::get(trail, &node.id)?;
    match &noderev.prop_rep_id {
        None => Ok(Proplist::new()),
        Some(rep_id) => {
            let raw = rep::read_contents(trail, rep_id)?;
            if raw.is_empty() {
                return Ok(Proplist::new());
            }
            serde_json::from_slice(&raw)
                .map_err(|err| FsError::Corrupt(format!("malformed property list: {err}")))
        }
    }
}

pub fn set_proplist(
    trail: &mut Trail<'_>,
    node: &DagNode,
    props: &Proplist,
    txn_id: &TxnId,
) -> FsResult<()> {
    if !node.is_mutable(txn_id) {
        return Err(FsError::NotMutable {
            id: node.id.to_string(),
        });
    }
    let mut noderev = node_rev::get(trail, &node.id)?;
    let mutable_rep = rep::get_mutable(trail, noderev.prop_rep_id.as_ref(), txn_id)?;
    if noderev.prop_rep_id.as_ref() != Some(&mutable_rep) {
        noderev.prop_rep_id = Some(mutable_rep.clone());
        node_rev::put(trail, &node.id, &noderev)?;
    }
    let raw = serde_json::to_vec(props)
        .map_err(|err| FsError::Corrupt(format!("unencodable property list: {err}")))?;
    let mut writer = rep::write_stream(trail, &mutable_rep, txn_id, true)?;
    writer.write(&raw)?;
    writer.close()
}

/// Links `from_node` into `to_node` under `entry`. With
/// `preserve_history`, a real copy row and a successor node revision
/// under a fresh copy id are created; otherwise the entry simply points
/// at the source.
#[allow(clippy::too_many_arguments)]
pub fn copy(
    trail: &mut Trail<'_>,
    to_node: &DagNode,
    entry: &str,
    from_node: &DagNode,
    preserve_history: bool,
    from_rev: Revnum,
    from_path: &str,
    txn_id: &TxnId,
) -> FsResult<()> {
    let id = if preserve_history {
        let mut noderev = node_rev::get(trail, &from_node.id)?;
        let copy_id = copies::reserve_id(trail)?;
        noderev.predecessor_id = Some(from_node.id.clone());
        if noderev.predecessor_count != -1 {
            noderev.predecessor_count += 1;
        }
        noderev.created_path = path::join(to_node.created_path(), entry);
        let id =
            node_rev::create_successor(trail, &from_node.id, &noderev, Some(&copy_id), txn_id)?;
        let from_txn_id = revisions::get_txn_id(trail, from_rev)?;
        copies::create(
            trail,
            &copy_id,
            &Copy {
                kind: CopyKind::Real,
                src_path: Some(path::canonicalize(from_path)),
                src_txn_id: Some(from_txn_id),
                dst_noderev_id: id.clone(),
            },
        )?;
        transactions::add_copy(trail, txn_id, &copy_id)?;
        id
    } else {
        from_node.id.clone()
    };
    set_entry(trail, to_node, entry, &id, txn_id)
}

/// Redeltifies `target`'s reps against `source`'s where they differ.
/// Props always; data too unless `props_only`.
pub fn deltify(
    trail: &mut Trail<'_>,
    target: &DagNode,
    source: &DagNode,
    props_only: bool,
) -> FsResult<()> {
    let target_nr = node_rev::get(trail, &target.id)?;
    let source_nr = node_rev::get(trail, &source.id)?;
    if let (Some(target_rep), Some(source_rep)) = (&target_nr.prop_rep_id, &source_nr.prop_rep_id)
        && target_rep != source_rep
    {
        rep::deltify(trail, target_rep, source_rep)?;
    }
    if !props_only
        && let (Some(target_rep), Some(source_rep)) =
            (&target_nr.data_rep_id, &source_nr.data_rep_id)
        && target_rep != source_rep
    {
        rep::deltify(trail, target_rep, source_rep)?;
    }
    Ok(())
}

/// Whether two nodes differ in their property and content reps. Compares
/// rep keys only, not reconstructed bytes.
pub fn things_different(
    trail: &mut Trail<'_>,
    node1: &DagNode,
    node2: &DagNode,
) -> FsResult<(bool, bool)> {
    let nr1 = node_rev::get(trail, &node1.id)?;
    let nr2 = node_rev::get(trail, &node2.id)?;
    let props_changed = nr1.prop_rep_id != nr2.prop_rep_id;
    let contents_changed = nr1.data_rep_id != nr2.data_rep_id;
    Ok((props_changed, contents_changed))
}

/// Commits the transaction: appends a revision row, promotes the txn, and
/// stamps the revision date. The caller must already have verified the
/// txn is based on the youngest revision.
pub fn commit_txn(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<Revnum> {
    for prop in [
        transactions::PROP_CHECK_LOCKS,
        transactions::PROP_CHECK_OOD,
    ] {
        if transactions::get_prop(trail, txn_id, prop)?.is_some() {
            transactions::set_prop(trail, txn_id, prop, None)?;
        }
    }
    let new_rev = revisions::put(
        trail,
        &Revision {
            txn_id: txn_id.clone(),
        },
    )?;
    transactions::make_committed(trail, txn_id, new_rev)?;
    record_origins_and_checksums(trail, txn_id)?;
    // Fetch the date only now, so it is newer than any previous revision's.
    let date = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    revisions::set_prop(trail, new_rev, revisions::PROP_REVISION_DATE, Some(&date))?;
    Ok(new_rev)
}

// Walks the txn's raw change rows recording node-origin rows for nodes
// born in this txn and checksum-reps rows for finalized file contents.
fn record_origins_and_checksums(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<()> {
    for change in changes::fetch_raw(trail, txn_id)? {
        if change.noderev_id.txn_id() != txn_id {
            continue;
        }
        let noderev = match node_rev::get(trail, &change.noderev_id) {
            Ok(noderev) => noderev,
            // The row may be gone, e.g. added and then deleted again.
            Err(FsError::DanglingId { .. }) => continue,
            Err(err) => return Err(err),
        };
        if noderev.predecessor_id.is_none() {
            tables::set_node_origin(trail, change.noderev_id.node_id(), &change.noderev_id)?;
        }
        if change.text_mod
            && noderev.kind == NodeKind::File
            && let Some(data_rep) = &noderev.data_rep_id
        {
            let digest = rep::contents_checksum(trail, data_rep)?;
            if !rep::is_null_digest(&digest) {
                tables::set_checksum_rep(trail, &digest, data_rep)?;
            }
        }
    }
    Ok(())
}
