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

//! The record-numbered `revisions` table. Revision `r` lives at record
//! `r + 1`; revision properties live in the committed txn's proplist.

use serde::Deserialize;
use serde::Serialize;

use crate::error::FsError;
use crate::error::FsResult;
use crate::id::Revnum;
use crate::id::TxnId;
use crate::kv::KvError;
use crate::trail::Trail;
use crate::transactions;

/// The revision datestamp property, set at commit time.
pub const PROP_REVISION_DATE: &str = "svn:date";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Revision {
    pub txn_id: TxnId,
}

/// Appends a revision row, returning the new revision number.
pub fn put(trail: &mut Trail<'_>, revision: &Revision) -> FsResult<Revnum> {
    let table = trail.fs().tables().revisions.clone();
    let value = serde_json::to_vec(revision)
        .map_err(|err| FsError::Corrupt(format!("unencodable revision: {err}")))?;
    let recno = trail.kv().append(&table, &value)?;
    Ok(recno - 1)
}

pub fn get(trail: &mut Trail<'_>, rev: Revnum) -> FsResult<Revision> {
    let table = trail.fs().tables().revisions.clone();
    let value = trail.kv().recno_get(&table, rev + 1).map_err(|err| match err {
        KvError::NotFound => FsError::DanglingRev { rev },
        err => err.into(),
    })?;
    serde_json::from_slice(&value)
        .map_err(|err| FsError::Corrupt(format!("malformed revision r{rev}: {err}")))
}

/// The youngest revision number. Acquires a read lock on the revisions
/// table held until the trail ends, which is what serializes concurrent
/// commits.
pub fn youngest(trail: &mut Trail<'_>) -> FsResult<Revnum> {
    let table = trail.fs().tables().revisions.clone();
    let count = trail.kv().recno_count(&table)?;
    count
        .checked_sub(1)
        .ok_or_else(|| FsError::Corrupt("filesystem has no revisions".to_string()))
}

pub fn get_txn_id(trail: &mut Trail<'_>, rev: Revnum) -> FsResult<TxnId> {
    Ok(get(trail, rev)?.txn_id)
}

pub fn get_prop(trail: &mut Trail<'_>, rev: Revnum, name: &str) -> FsResult<Option<String>> {
    let txn_id = get_txn_id(trail, rev)?;
    transactions::get_prop(trail, &txn_id, name)
}

pub fn proplist(
    trail: &mut Trail<'_>,
    rev: Revnum,
) -> FsResult<std::collections::BTreeMap<String, String>> {
    let txn_id = get_txn_id(trail, rev)?;
    Ok(transactions::get(trail, &txn_id)?.props)
}

pub fn set_prop(
    trail: &mut Trail<'_>,
    rev: Revnum,
    name: &str,
    value: Option<&str>,
) -> FsResult<()> {
    let txn_id = get_txn_id(trail, rev)?;
    transactions::set_prop(trail, &txn_id, name, value)
}
