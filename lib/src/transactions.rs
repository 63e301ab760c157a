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

//! The `transactions` table.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::FsError;
use crate::error::FsResult;
use crate::id::CopyId;
use crate::id::NodeRevId;
use crate::id::Revnum;
use crate::id::TxnId;
use crate::kv::KvError;
use crate::tables;
use crate::trail::Trail;

/// Reserved txn property: verify locks on every mutation and at commit.
pub const PROP_CHECK_LOCKS: &str = "strata:check-locks";
/// Reserved txn property: reject mutations of out-of-date paths.
pub const PROP_CHECK_OOD: &str = "strata:check-ood";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    /// In progress; the only mutable state.
    Normal,
    Committed,
    Dead,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TxnKind,
    /// The revision this txn became, valid iff `kind` is `Committed`.
    pub revision: Option<Revnum>,
    pub props: BTreeMap<String, String>,
    /// The txn's current root, possibly a clone of `base_id`.
    pub root_id: NodeRevId,
    /// The root of the revision this txn was based on.
    pub base_id: NodeRevId,
    /// Copy ids reserved within this txn, to be reaped if it dies.
    pub copies: Vec<CopyId>,
}

/// Creates a fresh in-progress transaction whose root and base both point
/// at `root_id`.
pub fn create(trail: &mut Trail<'_>, root_id: &NodeRevId) -> FsResult<TxnId> {
    let table = trail.fs().tables().transactions.clone();
    let txn_id = TxnId::new(tables::allocate_key(trail, &table)?);
    let txn = Transaction {
        kind: TxnKind::Normal,
        revision: None,
        props: BTreeMap::new(),
        root_id: root_id.clone(),
        base_id: root_id.clone(),
        copies: vec![],
    };
    put(trail, &txn_id, &txn)?;
    Ok(txn_id)
}

pub fn get(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<Transaction> {
    let table = trail.fs().tables().transactions.clone();
    let value = trail
        .kv()
        .get(&table, txn_id.as_str().as_bytes())
        .map_err(|err| match err {
            KvError::NotFound => FsError::NoSuchTxn {
                txn_id: txn_id.as_str().to_string(),
            },
            err => err.into(),
        })?;
    serde_json::from_slice(&value)
        .map_err(|err| FsError::Corrupt(format!("malformed transaction '{txn_id}': {err}")))
}

/// Like [`get`], but additionally requires the txn to still be mutable.
pub fn get_mutable(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<Transaction> {
    let txn = get(trail, txn_id)?;
    if txn.kind != TxnKind::Normal {
        return Err(FsError::NoSuchTxn {
            txn_id: txn_id.as_str().to_string(),
        });
    }
    Ok(txn)
}

pub fn put(trail: &mut Trail<'_>, txn_id: &TxnId, txn: &Transaction) -> FsResult<()> {
    let table = trail.fs().tables().transactions.clone();
    let value = serde_json::to_vec(txn)
        .map_err(|err| FsError::Corrupt(format!("unencodable transaction: {err}")))?;
    trail.kv().put(&table, txn_id.as_str().as_bytes(), &value)?;
    Ok(())
}

pub fn delete(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<()> {
    let table = trail.fs().tables().transactions.clone();
    match trail.kv().delete(&table, txn_id.as_str().as_bytes()) {
        Ok(()) => Ok(()),
        Err(KvError::NotFound) => Err(FsError::NoSuchTxn {
            txn_id: txn_id.as_str().to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

/// Lists in-progress transactions; committed and dead rows are filtered
/// out.
pub fn list(trail: &mut Trail<'_>) -> FsResult<Vec<TxnId>> {
    let table = trail.fs().tables().transactions.clone();
    let mut cursor = trail.kv().cursor(&table)?;
    let mut txn_ids = Vec::new();
    let mut row = cursor.first();
    while let Some((key, value)) = row {
        if key != crate::base36::NEXT_KEY.as_bytes() {
            let txn: Transaction = serde_json::from_slice(&value).map_err(|err| {
                FsError::Corrupt(format!("malformed transaction row: {err}"))
            })?;
            if txn.kind == TxnKind::Normal {
                let key = String::from_utf8(key)
                    .map_err(|_| FsError::Corrupt("malformed transaction key".to_string()))?;
                txn_ids.push(TxnId::new(key));
            }
        }
        row = cursor.next();
    }
    Ok(txn_ids)
}

pub fn set_root(trail: &mut Trail<'_>, txn_id: &TxnId, root_id: &NodeRevId) -> FsResult<()> {
    let mut txn = get_mutable(trail, txn_id)?;
    if txn.root_id != *root_id {
        txn.root_id = root_id.clone();
        put(trail, txn_id, &txn)?;
    }
    Ok(())
}

pub fn set_base(trail: &mut Trail<'_>, txn_id: &TxnId, base_id: &NodeRevId) -> FsResult<()> {
    let mut txn = get_mutable(trail, txn_id)?;
    if txn.base_id != *base_id {
        txn.base_id = base_id.clone();
        put(trail, txn_id, &txn)?;
    }
    Ok(())
}

/// Registers a copy id reserved within the txn so that an aborted txn can
/// reap it.
pub fn add_copy(trail: &mut Trail<'_>, txn_id: &TxnId, copy_id: &CopyId) -> FsResult<()> {
    let mut txn = get_mutable(trail, txn_id)?;
    txn.copies.push(copy_id.clone());
    put(trail, txn_id, &txn)
}

pub fn get_prop(trail: &mut Trail<'_>, txn_id: &TxnId, name: &str) -> FsResult<Option<String>> {
    Ok(get(trail, txn_id)?.props.get(name).cloned())
}

/// Sets or removes one txn property. Committed transactions accept
/// property changes only through [`set_rev_prop`](crate::revisions).
pub fn set_prop(
    trail: &mut Trail<'_>,
    txn_id: &TxnId,
    name: &str,
    value: Option<&str>,
) -> FsResult<()> {
    let mut txn = get(trail, txn_id)?;
    match value {
        Some(value) => {
            txn.props.insert(name.to_string(), value.to_string());
        }
        None => {
            txn.props.remove(name);
        }
    }
    put(trail, txn_id, &txn)
}

/// Promotes an in-progress txn to committed state with its revision.
pub fn make_committed(trail: &mut Trail<'_>, txn_id: &TxnId, revision: Revnum) -> FsResult<()> {
    let mut txn = get_mutable(trail, txn_id)?;
    txn.kind = TxnKind::Committed;
    txn.revision = Some(revision);
    put(trail, txn_id, &txn)
}

/// Promotes an in-progress txn to dead state, making it eligible for
/// purging.
pub fn make_dead(trail: &mut Trail<'_>, txn_id: &TxnId) -> FsResult<()> {
    let mut txn = get_mutable(trail, txn_id)?;
    txn.kind = TxnKind::Dead;
    put(trail, txn_id, &txn)
}
