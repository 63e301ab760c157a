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

//! Table names, generated-key allocation, and the small auxiliary tables
//! that don't warrant modules of their own: `uuids`, `miscellaneous`,
//! `metadata`, `node-origins`, `successors`, and `checksum-reps`.

use crate::base36;
use crate::error::FsError;
use crate::error::FsResult;
use crate::id::NodeId;
use crate::id::NodeRevId;
use crate::id::RepId;
use crate::kv::KvError;
use crate::kv::Table;
use crate::trail::Trail;

pub(crate) const NODES: &str = "nodes";
pub(crate) const REVISIONS: &str = "revisions";
pub(crate) const TRANSACTIONS: &str = "transactions";
pub(crate) const COPIES: &str = "copies";
pub(crate) const CHANGES: &str = "changes";
pub(crate) const REPRESENTATIONS: &str = "representations";
pub(crate) const STRINGS: &str = "strings";
pub(crate) const UUIDS: &str = "uuids";
pub(crate) const LOCKS: &str = "locks";
pub(crate) const LOCK_TOKENS: &str = "lock-tokens";
pub(crate) const NODE_ORIGINS: &str = "node-origins";
pub(crate) const SUCCESSORS: &str = "successors";
pub(crate) const METADATA: &str = "metadata";
pub(crate) const MISCELLANEOUS: &str = "miscellaneous";
pub(crate) const CHECKSUM_REPS: &str = "checksum-reps";

// Reads the "next-key" row of a table of either keyed kind. Duplicate-key
// tables keep it as a single duplicate value.
fn read_next_key(trail: &mut Trail<'_>, table: &Table) -> FsResult<Option<Vec<u8>>> {
    match table.kind() {
        crate::kv::TableKind::Btree => match trail.kv().get(table, base36::NEXT_KEY.as_bytes()) {
            Ok(value) => Ok(Some(value)),
            Err(KvError::NotFound) => Ok(None),
            Err(err) => Err(err.into()),
        },
        crate::kv::TableKind::DupBtree => Ok(trail
            .kv()
            .get_dups(table, base36::NEXT_KEY.as_bytes())?
            .into_iter()
            .next()),
        crate::kv::TableKind::Recno => Err(FsError::Corrupt(format!(
            "record-numbered table '{}' has no key generator",
            table.name()
        ))),
    }
}

fn write_next_key(trail: &mut Trail<'_>, table: &Table, value: &str) -> FsResult<()> {
    match table.kind() {
        crate::kv::TableKind::Btree => {
            trail
                .kv()
                .put(table, base36::NEXT_KEY.as_bytes(), value.as_bytes())?;
        }
        crate::kv::TableKind::DupBtree => {
            trail.kv().delete_dups(table, base36::NEXT_KEY.as_bytes())?;
            trail
                .kv()
                .add_dup(table, base36::NEXT_KEY.as_bytes(), value.as_bytes())?;
        }
        crate::kv::TableKind::Recno => {
            return Err(FsError::Corrupt(format!(
                "record-numbered table '{}' has no key generator",
                table.name()
            )));
        }
    }
    Ok(())
}

/// Bumps the table's `"next-key"` row and returns the key it held. The
/// table must have been seeded with an initial next-key row at filesystem
/// creation.
pub(crate) fn allocate_key(trail: &mut Trail<'_>, table: &Table) -> FsResult<String> {
    let key = read_next_key(trail, table)?.ok_or_else(|| {
        FsError::Corrupt(format!("table '{}' has no next-key row", table.name()))
    })?;
    let key = String::from_utf8(key)
        .map_err(|_| FsError::Corrupt(format!("bad next-key in table '{}'", table.name())))?;
    if !base36::is_valid_key(&key) {
        return Err(FsError::Corrupt(format!(
            "bad next-key '{key}' in table '{}'",
            table.name()
        )));
    }
    write_next_key(trail, table, &base36::next_key(&key))?;
    Ok(key)
}

/// Writes the initial `"next-key"` row of a freshly created table.
pub(crate) fn seed_next_key(trail: &mut Trail<'_>, table: &Table) -> FsResult<()> {
    write_next_key(trail, table, base36::INITIAL_KEY)
}

/// The repository UUID, stored as record 1 of the `uuids` table.
pub fn get_uuid(trail: &mut Trail<'_>) -> FsResult<String> {
    let table = &trail.fs().tables().uuids;
    let value = trail.kv().recno_get(table, 1).map_err(|err| match err {
        KvError::NotFound => FsError::Corrupt("filesystem has no UUID".to_string()),
        err => err.into(),
    })?;
    String::from_utf8(value).map_err(|_| FsError::Corrupt("malformed UUID".to_string()))
}

pub fn set_uuid(trail: &mut Trail<'_>, uuid: &str) -> FsResult<()> {
    let table = trail.fs().tables().uuids.clone();
    match trail.kv().recno_put(&table, 1, uuid.as_bytes()) {
        Ok(()) => Ok(()),
        Err(KvError::NotFound) => {
            trail.kv().append(&table, uuid.as_bytes())?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

pub fn misc_get(trail: &mut Trail<'_>, key: &str) -> FsResult<Option<String>> {
    let table = &trail.fs().tables().miscellaneous;
    match trail.kv().get(table, key.as_bytes()) {
        Ok(value) => Ok(Some(String::from_utf8(value).map_err(|_| {
            FsError::Corrupt(format!("malformed miscellaneous row '{key}'"))
        })?)),
        Err(KvError::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub fn misc_set(trail: &mut Trail<'_>, key: &str, value: Option<&str>) -> FsResult<()> {
    let table = trail.fs().tables().miscellaneous.clone();
    match value {
        Some(value) => trail.kv().put(&table, key.as_bytes(), value.as_bytes())?,
        None => match trail.kv().delete(&table, key.as_bytes()) {
            Ok(()) | Err(KvError::NotFound) => {}
            Err(err) => return Err(err.into()),
        },
    }
    Ok(())
}

pub(crate) fn metadata_get(trail: &mut Trail<'_>, key: &str) -> FsResult<Option<Vec<u8>>> {
    let table = &trail.fs().tables().metadata;
    match trail.kv().get(table, key.as_bytes()) {
        Ok(value) => Ok(Some(value)),
        Err(KvError::NotFound) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn metadata_set(trail: &mut Trail<'_>, key: &str, value: &[u8]) -> FsResult<()> {
    let table = trail.fs().tables().metadata.clone();
    trail.kv().put(&table, key.as_bytes(), value)?;
    Ok(())
}

/// The node revision at which `node_id` first entered history.
pub fn get_node_origin(trail: &mut Trail<'_>, node_id: &NodeId) -> FsResult<NodeRevId> {
    let table = &trail.fs().tables().node_origins;
    let value = trail
        .kv()
        .get(table, node_id.as_str().as_bytes())
        .map_err(|err| match err {
            KvError::NotFound => FsError::NoSuchNodeOrigin {
                node_id: node_id.as_str().to_string(),
            },
            err => err.into(),
        })?;
    std::str::from_utf8(&value)
        .ok()
        .and_then(NodeRevId::parse)
        .ok_or_else(|| FsError::Corrupt(format!("malformed node origin for '{node_id}'")))
}

/// Records the origin of `node_id` unless one is already known.
pub(crate) fn set_node_origin(
    trail: &mut Trail<'_>,
    node_id: &NodeId,
    origin: &NodeRevId,
) -> FsResult<()> {
    let table = trail.fs().tables().node_origins.clone();
    match trail.kv().get(&table, node_id.as_str().as_bytes()) {
        Ok(_) => Ok(()),
        Err(KvError::NotFound) => {
            trail.kv().put(
                &table,
                node_id.as_str().as_bytes(),
                origin.to_string().as_bytes(),
            )?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Records `successor` as a known successor of `predecessor`.
pub(crate) fn add_successor(
    trail: &mut Trail<'_>,
    predecessor: &NodeRevId,
    successor: &NodeRevId,
) -> FsResult<()> {
    let table = trail.fs().tables().successors.clone();
    trail.kv().add_dup(
        &table,
        predecessor.to_string().as_bytes(),
        successor.to_string().as_bytes(),
    )?;
    Ok(())
}

/// Known successors of `predecessor`, in recording order.
pub fn get_successors(trail: &mut Trail<'_>, predecessor: &NodeRevId) -> FsResult<Vec<NodeRevId>> {
    let table = trail.fs().tables().successors.clone();
    let rows = trail
        .kv()
        .get_dups(&table, predecessor.to_string().as_bytes())?;
    rows.iter()
        .map(|row| {
            std::str::from_utf8(row)
                .ok()
                .and_then(NodeRevId::parse)
                .ok_or_else(|| {
                    FsError::Corrupt(format!("malformed successor row for '{predecessor}'"))
                })
        })
        .collect()
}

/// Drops one recorded successor, e.g. when the successor's transaction
/// dies.
pub(crate) fn delete_successor(
    trail: &mut Trail<'_>,
    predecessor: &NodeRevId,
    successor: &NodeRevId,
) -> FsResult<()> {
    let table = trail.fs().tables().successors.clone();
    let key = predecessor.to_string();
    let mut rows = trail.kv().get_dups(&table, key.as_bytes())?;
    let target = successor.to_string();
    rows.retain(|row| row != target.as_bytes());
    trail.kv().delete_dups(&table, key.as_bytes())?;
    for row in &rows {
        trail.kv().add_dup(&table, key.as_bytes(), row)?;
    }
    Ok(())
}

/// A representation known to carry content with the given MD5 digest.
pub fn get_checksum_rep(trail: &mut Trail<'_>, checksum: &str) -> FsResult<RepId> {
    let table = &trail.fs().tables().checksum_reps;
    let value = trail
        .kv()
        .get(table, checksum.as_bytes())
        .map_err(|err| match err {
            KvError::NotFound => FsError::NoSuchChecksumRep {
                checksum: checksum.to_string(),
            },
            err => err.into(),
        })?;
    String::from_utf8(value)
        .map(RepId::new)
        .map_err(|_| FsError::Corrupt(format!("malformed checksum-reps row '{checksum}'")))
}

/// Records `rep_id` as a representation carrying `checksum`. First writer
/// wins; later recordings of the same digest are ignored.
pub(crate) fn set_checksum_rep(
    trail: &mut Trail<'_>,
    checksum: &str,
    rep_id: &RepId,
) -> FsResult<()> {
    let table = trail.fs().tables().checksum_reps.clone();
    match trail.kv().get(&table, checksum.as_bytes()) {
        Ok(_) => Ok(()),
        Err(KvError::NotFound) => {
            trail
                .kv()
                .put(&table, checksum.as_bytes(), rep_id.as_str().as_bytes())?;
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
