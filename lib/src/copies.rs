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

//! The `copies` table: one row per copy operation, real or soft.

use serde::Deserialize;
use serde::Serialize;

use crate::error::FsError;
use crate::error::FsResult;
use crate::id::CopyId;
use crate::id::NodeRevId;
use crate::id::TxnId;
use crate::kv::KvError;
use crate::tables;
use crate::trail::Trail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyKind {
    /// A user-requested copy.
    Real,
    /// The implicit branch recorded when a node inside a copied subtree is
    /// first modified.
    Soft,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Copy {
    pub kind: CopyKind,
    pub src_path: Option<String>,
    pub src_txn_id: Option<TxnId>,
    pub dst_noderev_id: NodeRevId,
}

/// Allocates a fresh copy id by bumping the table's next-key row.
pub fn reserve_id(trail: &mut Trail<'_>) -> FsResult<CopyId> {
    let table = trail.fs().tables().copies.clone();
    Ok(CopyId::new(tables::allocate_key(trail, &table)?))
}

pub fn create(trail: &mut Trail<'_>, copy_id: &CopyId, copy: &Copy) -> FsResult<()> {
    let table = trail.fs().tables().copies.clone();
    let value = serde_json::to_vec(copy)
        .map_err(|err| FsError::Corrupt(format!("unencodable copy record: {err}")))?;
    trail
        .kv()
        .put(&table, copy_id.as_str().as_bytes(), &value)?;
    Ok(())
}

pub fn get(trail: &mut Trail<'_>, copy_id: &CopyId) -> FsResult<Copy> {
    let table = trail.fs().tables().copies.clone();
    let value = trail
        .kv()
        .get(&table, copy_id.as_str().as_bytes())
        .map_err(|err| match err {
            KvError::NotFound => FsError::NoSuchCopy {
                copy_id: copy_id.as_str().to_string(),
            },
            err => err.into(),
        })?;
    serde_json::from_slice(&value)
        .map_err(|err| FsError::Corrupt(format!("malformed copy record '{copy_id}': {err}")))
}

pub fn delete(trail: &mut Trail<'_>, copy_id: &CopyId) -> FsResult<()> {
    let table = trail.fs().tables().copies.clone();
    match trail.kv().delete(&table, copy_id.as_str().as_bytes()) {
        Ok(()) => Ok(()),
        Err(KvError::NotFound) => Err(FsError::NoSuchCopy {
            copy_id: copy_id.as_str().to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}
