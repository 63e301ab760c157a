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

//! The `changes` table: raw per-path change rows keyed by transaction,
//! and their aggregation into one net change per path.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::FsError;
use crate::error::FsResult;
use crate::id::NodeRevId;
use crate::id::TxnId;
use crate::trail::Trail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Delete,
    Replace,
    Modify,
}

/// One raw change row, as recorded by the tree layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Change {
    pub path: String,
    pub noderev_id: NodeRevId,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
}

/// The net effect of all raw rows touching one path within a txn.
#[derive(Clone, Debug, PartialEq)]
pub struct PathChange {
    pub noderev_id: NodeRevId,
    pub kind: ChangeKind,
    pub text_mod: bool,
    pub prop_mod: bool,
}

/// Appends one raw row under `txn_id`.
pub fn add(trail: &mut Trail<'_>, txn_id: &TxnId, change: &Change) -> FsResult<()> {
    let table = trail.fs().tables().changes.clone();
    let value = serde_json::to_vec(change)
        .map_err(|err| FsError::Corrupt(format!("unencodable change record: {err}")))?;
    trail
        .kv()
        .add_dup(&table, txn_id.as_str().as_bytes(), &value)?;
    Ok(())
}

/// All raw rows for `txn_id`, in insertion order.
pub fn fetch_raw(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<Vec<Change>> {
    let table = trail.fs().tables().changes.clone();
    let rows = trail.kv().get_dups(&table, txn_id.as_str().as_bytes())?;
    rows.iter()
        .map(|row| {
            serde_json::from_slice(row).map_err(|err| {
                FsError::Corrupt(format!("malformed change record in txn '{txn_id}': {err}"))
            })
        })
        .collect()
}

/// Drops every raw row recorded under `txn_id`.
pub fn delete(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<()> {
    let table = trail.fs().tables().changes.clone();
    trail.kv().delete_dups(&table, txn_id.as_str().as_bytes())?;
    Ok(())
}

/// Fetches the aggregated changes of `txn_id`: one entry per path
/// reflecting the net effect of its raw rows.
pub fn fetch(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<BTreeMap<String, PathChange>> {
    Ok(aggregate(&fetch_raw(trail, txn_id)?))
}

fn aggregate(raw: &[Change]) -> BTreeMap<String, PathChange> {
    let mut first_ids: BTreeMap<String, NodeRevId> = BTreeMap::new();
    let mut net: BTreeMap<String, PathChange> = BTreeMap::new();
    for change in raw {
        if !net.contains_key(&change.path) {
            first_ids.insert(change.path.clone(), change.noderev_id.clone());
            net.insert(
                change.path.clone(),
                PathChange {
                    noderev_id: change.noderev_id.clone(),
                    kind: change.kind,
                    text_mod: change.text_mod,
                    prop_mod: change.prop_mod,
                },
            );
            continue;
        }
        if change.kind == ChangeKind::Delete && net[&change.path].kind == ChangeKind::Add {
            // The txn added the path and then removed it again; the net
            // effect on the ancestor tree is nothing.
            net.remove(&change.path);
            first_ids.remove(&change.path);
            continue;
        }
        let entry = net.get_mut(&change.path).expect("checked above");
        match change.kind {
            ChangeKind::Delete => entry.kind = ChangeKind::Delete,
            // A delete followed by an add collapses to a replacement, as
            // does any further add or replace.
            ChangeKind::Add | ChangeKind::Replace => entry.kind = ChangeKind::Replace,
            // A later modify keeps the existing kind; an add stays an add.
            ChangeKind::Modify => {}
        }
        entry.noderev_id = change.noderev_id.clone();
        entry.text_mod |= change.text_mod;
        entry.prop_mod |= change.prop_mod;
    }
    // A path whose final node revision differs from its first is a
    // replacement whatever the row kinds said.
    for (path, entry) in &mut net {
        if entry.kind == ChangeKind::Modify
            && first_ids.get(path).is_some_and(|first| *first != entry.noderev_id)
        {
            entry.kind = ChangeKind::Replace;
        }
    }
    net
}
