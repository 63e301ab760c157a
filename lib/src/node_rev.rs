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

//! The node-revision store: one row per `(node, copy, txn)` id.

use serde::Deserialize;
use serde::Serialize;

use crate::error::FsError;
use crate::error::FsResult;
use crate::id::CopyId;
use crate::id::NodeId;
use crate::id::NodeRevId;
use crate::id::RepId;
use crate::id::TxnId;
use crate::kv::KvError;
use crate::tables;
use crate::trail::Trail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
}

/// One versioned state of one node. Mutable only within the transaction
/// named by its id's txn component, and only while that transaction is in
/// progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRevision {
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeRevId>,
    /// Number of predecessors, `-1` when unknown.
    pub predecessor_count: i64,
    pub prop_rep_id: Option<RepId>,
    pub data_rep_id: Option<RepId>,
    /// In-progress replacement file contents; files only.
    pub edit_rep_id: Option<RepId>,
    pub created_path: String,
}

impl NodeRevision {
    pub fn new_dir(created_path: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Dir,
            predecessor_id: None,
            predecessor_count: 0,
            prop_rep_id: None,
            data_rep_id: None,
            edit_rep_id: None,
            created_path: created_path.into(),
        }
    }

    pub fn new_file(created_path: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::File,
            ..Self::new_dir(created_path)
        }
    }
}

pub fn get(trail: &mut Trail<'_>, id: &NodeRevId) -> FsResult<NodeRevision> {
    let table = trail.fs().tables().nodes.clone();
    let value = trail
        .kv()
        .get(&table, id.to_string().as_bytes())
        .map_err(|err| match err {
            KvError::NotFound => FsError::DanglingId { id: id.to_string() },
            err => err.into(),
        })?;
    serde_json::from_slice(&value)
        .map_err(|err| FsError::Corrupt(format!("malformed node revision '{id}': {err}")))
}

pub fn put(trail: &mut Trail<'_>, id: &NodeRevId, noderev: &NodeRevision) -> FsResult<()> {
    let table = trail.fs().tables().nodes.clone();
    let value = serde_json::to_vec(noderev)
        .map_err(|err| FsError::Corrupt(format!("unencodable node revision: {err}")))?;
    trail.kv().put(&table, id.to_string().as_bytes(), &value)?;
    Ok(())
}

/// Removes the row. Must only be called for mutable rows in a dying
/// transaction.
pub fn delete(trail: &mut Trail<'_>, id: &NodeRevId) -> FsResult<()> {
    let table = trail.fs().tables().nodes.clone();
    match trail.kv().delete(&table, id.to_string().as_bytes()) {
        Ok(()) => Ok(()),
        Err(KvError::NotFound) => Err(FsError::DanglingId { id: id.to_string() }),
        Err(err) => Err(err.into()),
    }
}

/// Stores `noderev` under a freshly allocated node id, returning the new
/// node-revision id `(fresh, copy_id, txn_id)`.
pub fn create(
    trail: &mut Trail<'_>,
    noderev: &NodeRevision,
    copy_id: &CopyId,
    txn_id: &TxnId,
) -> FsResult<NodeRevId> {
    let table = trail.fs().tables().nodes.clone();
    let node_id = NodeId::new(tables::allocate_key(trail, &table)?);
    let id = NodeRevId::new(node_id, copy_id.clone(), txn_id.clone());
    put(trail, &id, noderev)?;
    Ok(id)
}

/// Stores `noderev` as a successor of `predecessor`: the node id is kept,
/// the copy id is `copy_id` if given (else inherited from the
/// predecessor), and the txn component becomes `txn_id`. The successor
/// link is recorded in the `successors` table.
pub fn create_successor(
    trail: &mut Trail<'_>,
    predecessor: &NodeRevId,
    noderev: &NodeRevision,
    copy_id: Option<&CopyId>,
    txn_id: &TxnId,
) -> FsResult<NodeRevId> {
    let copy_id = copy_id.unwrap_or_else(|| predecessor.copy_id());
    let id = NodeRevId::new(
        predecessor.node_id().clone(),
        copy_id.clone(),
        txn_id.clone(),
    );
    put(trail, &id, noderev)?;
    tables::add_successor(trail, predecessor, &id)?;
    Ok(id)
}
