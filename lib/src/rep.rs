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

//! The representation store.
//!
//! A representation is the stored form of a node revision's file text,
//! directory entry list, or property list: either a fulltext backed by one
//! string, or a delta chain whose chunks each name a predecessor
//! representation and a window string. Reads reconstruct the full logical
//! content and verify its MD5 against the stored digest.

use digest::Digest as _;
use md5::Md5;
use serde::Deserialize;
use serde::Serialize;

use crate::delta;
use crate::error::FsError;
use crate::error::FsResult;
use crate::id::RepId;
use crate::id::StringId;
use crate::id::TxnId;
use crate::kv::KvError;
use crate::strings;
use crate::tables;
use crate::trail::Trail;

/// The hex digest meaning "not set"; consumers accept any reconstruction.
pub const NULL_DIGEST: &str = "00000000000000000000000000000000";

/// Hex MD5 of `data`.
pub fn hex_digest(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

pub fn is_null_digest(digest: &str) -> bool {
    digest == NULL_DIGEST
}

/// One chunk of a delta representation: reconstructs `size` bytes at
/// `offset` of the target by applying the window in `string_id` against
/// the content produced by `rep_id`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeltaChunk {
    pub version: u32,
    pub offset: u64,
    pub size: u64,
    pub string_id: StringId,
    pub rep_id: RepId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RepKind {
    Fulltext { string_id: StringId },
    Delta { chunks: Vec<DeltaChunk> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Representation {
    /// The transaction under which this rep is mutable, or `None` once
    /// committed and immutable.
    pub txn_id: Option<TxnId>,
    /// 32 lowercase hex chars; [`NULL_DIGEST`] when not yet set.
    pub md5: String,
    pub kind: RepKind,
}

impl Representation {
    pub fn is_mutable(&self, txn_id: &TxnId) -> bool {
        self.txn_id.as_ref() == Some(txn_id)
    }
}

pub fn get(trail: &mut Trail<'_>, rep_id: &RepId) -> FsResult<Representation> {
    let table = trail.fs().tables().representations.clone();
    let value = trail
        .kv()
        .get(&table, rep_id.as_str().as_bytes())
        .map_err(|err| match err {
            KvError::NotFound => FsError::Corrupt(format!("no representation '{rep_id}'")),
            err => err.into(),
        })?;
    serde_json::from_slice(&value)
        .map_err(|err| FsError::Corrupt(format!("malformed representation '{rep_id}': {err}")))
}

pub fn put(trail: &mut Trail<'_>, rep_id: &RepId, rep: &Representation) -> FsResult<()> {
    let table = trail.fs().tables().representations.clone();
    let value = serde_json::to_vec(rep)
        .map_err(|err| FsError::Corrupt(format!("unencodable representation: {err}")))?;
    trail.kv().put(&table, rep_id.as_str().as_bytes(), &value)?;
    Ok(())
}

/// Allocates a fresh rep-id and stores `rep` under it.
pub fn create(trail: &mut Trail<'_>, rep: &Representation) -> FsResult<RepId> {
    let table = trail.fs().tables().representations.clone();
    let rep_id = RepId::new(tables::allocate_key(trail, &table)?);
    put(trail, &rep_id, rep)?;
    Ok(rep_id)
}

fn delete_row(trail: &mut Trail<'_>, rep_id: &RepId) -> FsResult<()> {
    let table = trail.fs().tables().representations.clone();
    match trail.kv().delete(&table, rep_id.as_str().as_bytes()) {
        Ok(()) => Ok(()),
        Err(KvError::NotFound) => Err(FsError::Corrupt(format!("no representation '{rep_id}'"))),
        Err(err) => Err(err.into()),
    }
}

/// Returns a rep-id that is mutable under `txn_id`. If `rep_id` is absent
/// or names a rep not mutable under `txn_id`, a fresh mutable fulltext rep
/// (backed by a fresh string) is allocated; otherwise `rep_id` is returned
/// unchanged.
pub fn get_mutable(
    trail: &mut Trail<'_>,
    rep_id: Option<&RepId>,
    txn_id: &TxnId,
) -> FsResult<RepId> {
    if let Some(rep_id) = rep_id {
        let rep = get(trail, rep_id)?;
        if rep.is_mutable(txn_id) {
            return Ok(rep_id.clone());
        }
    }
    let string_id = strings::create(trail)?;
    create(
        trail,
        &Representation {
            txn_id: Some(txn_id.clone()),
            md5: NULL_DIGEST.to_string(),
            kind: RepKind::Fulltext { string_id },
        },
    )
}

fn materialize(trail: &mut Trail<'_>, rep_id: &RepId) -> FsResult<Vec<u8>> {
    let rep = get(trail, rep_id)?;
    match &rep.kind {
        RepKind::Fulltext { string_id } => strings::read_all(trail, string_id),
        RepKind::Delta { chunks } => {
            let mut out = Vec::new();
            let mut chunks = chunks.clone();
            chunks.sort_by_key(|chunk| chunk.offset);
            for chunk in &chunks {
                if chunk.offset != out.len() as u64 {
                    return Err(FsError::Corrupt(format!(
                        "representation '{rep_id}' has a gap at offset {}",
                        chunk.offset
                    )));
                }
                let base = materialize(trail, &chunk.rep_id)?;
                let window_bytes = strings::read_all(trail, &chunk.string_id)?;
                let window: delta::Window = serde_json::from_slice(&window_bytes).map_err(|err| {
                    FsError::Corrupt(format!("malformed delta window in '{rep_id}': {err}"))
                })?;
                let reconstructed = delta::apply(&base, &window);
                if reconstructed.len() as u64 != chunk.size {
                    return Err(FsError::Corrupt(format!(
                        "delta chunk of '{rep_id}' produced {} bytes, expected {}",
                        reconstructed.len(),
                        chunk.size
                    )));
                }
                out.extend_from_slice(&reconstructed);
            }
            Ok(out)
        }
    }
}

/// Materializes the rep's full logical contents, verifying them against
/// the stored digest. A [`NULL_DIGEST`] disables verification.
pub fn read_contents(trail: &mut Trail<'_>, rep_id: &RepId) -> FsResult<Vec<u8>> {
    let rep = get(trail, rep_id)?;
    let contents = materialize(trail, rep_id)?;
    if !is_null_digest(&rep.md5) {
        let actual = hex_digest(&contents);
        if actual != rep.md5 {
            return Err(FsError::ChecksumMismatch {
                detail: format!("representation '{rep_id}'"),
                expected: rep.md5,
                actual,
            });
        }
    }
    Ok(contents)
}

/// Size of the rep's logical contents, without materializing fulltexts.
pub fn contents_size(trail: &mut Trail<'_>, rep_id: &RepId) -> FsResult<u64> {
    let rep = get(trail, rep_id)?;
    match &rep.kind {
        RepKind::Fulltext { string_id } => strings::size(trail, string_id),
        RepKind::Delta { chunks } => Ok(chunks.iter().map(|chunk| chunk.size).sum()),
    }
}

/// The stored digest of the rep.
pub fn contents_checksum(trail: &mut Trail<'_>, rep_id: &RepId) -> FsResult<String> {
    Ok(get(trail, rep_id)?.md5)
}

/// Digest computed from the rep's actual current contents.
pub fn compute_checksum(trail: &mut Trail<'_>, rep_id: &RepId) -> FsResult<String> {
    Ok(hex_digest(&materialize(trail, rep_id)?))
}

/// Opens a writer into the rep's backing string. The caller must have
/// obtained the rep through [`get_mutable`] first; writing to a rep that
/// is not mutable under `txn_id` is a programming error surfaced as
/// `Corrupt`.
pub fn write_stream<'a, 'fs>(
    trail: &'a mut Trail<'fs>,
    rep_id: &RepId,
    txn_id: &TxnId,
    truncate: bool,
) -> FsResult<RepWriter<'a, 'fs>> {
    let rep = get(trail, rep_id)?;
    if !rep.is_mutable(txn_id) {
        return Err(FsError::Corrupt(format!(
            "attempted to write to immutable representation '{rep_id}'"
        )));
    }
    let RepKind::Fulltext { string_id } = rep.kind else {
        return Err(FsError::Corrupt(format!(
            "attempted to write to deltified mutable representation '{rep_id}'"
        )));
    };
    if truncate {
        strings::clear(trail, &string_id)?;
    }
    Ok(RepWriter {
        trail,
        rep_id: rep_id.clone(),
        string_id,
        buf: Vec::new(),
    })
}

/// Buffered writer into a mutable fulltext rep. Closing the writer
/// refreshes the rep's stored digest from the final string contents.
pub struct RepWriter<'a, 'fs> {
    trail: &'a mut Trail<'fs>,
    rep_id: RepId,
    string_id: StringId,
    buf: Vec<u8>,
}

impl RepWriter<'_, '_> {
    pub fn write(&mut self, data: &[u8]) -> FsResult<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn close(self) -> FsResult<()> {
        let Self {
            trail,
            rep_id,
            string_id,
            buf,
        } = self;
        strings::append(trail, &string_id, &buf)?;
        let contents = strings::read_all(trail, &string_id)?;
        let mut rep = get(trail, &rep_id)?;
        rep.md5 = hex_digest(&contents);
        put(trail, &rep_id, &rep)
    }
}

fn backing_strings(rep: &Representation) -> Vec<StringId> {
    match &rep.kind {
        RepKind::Fulltext { string_id } => vec![string_id.clone()],
        RepKind::Delta { chunks } => chunks.iter().map(|chunk| chunk.string_id.clone()).collect(),
    }
}

/// Deletes the rep and its backing strings iff it is mutable under
/// `txn_id`; immutable reps are shared and left alone.
pub fn delete_if_mutable(trail: &mut Trail<'_>, rep_id: &RepId, txn_id: &TxnId) -> FsResult<()> {
    let rep = get(trail, rep_id)?;
    if !rep.is_mutable(txn_id) {
        return Ok(());
    }
    for string_id in backing_strings(&rep) {
        strings::delete(trail, &string_id)?;
    }
    delete_row(trail, rep_id)
}

/// Rewrites `target` as a delta against `base`, preserving its logical
/// contents and digest. Must not be called on reps reachable through a
/// mutable node.
pub fn deltify(trail: &mut Trail<'_>, target: &RepId, base: &RepId) -> FsResult<()> {
    if target == base {
        return Ok(());
    }
    let target_rep = get(trail, target)?;
    // Re-deltifying against the same immediate base would only churn
    // strings.
    if let RepKind::Delta { chunks } = &target_rep.kind
        && chunks.iter().all(|chunk| chunk.rep_id == *base)
    {
        return Ok(());
    }
    let target_contents = materialize(trail, target)?;
    let base_contents = materialize(trail, base)?;
    let old_strings = backing_strings(&target_rep);

    let mut chunks = Vec::new();
    for window in delta::encode(&base_contents, &target_contents) {
        let encoded = serde_json::to_vec(&window)
            .map_err(|err| FsError::Corrupt(format!("unencodable delta window: {err}")))?;
        let string_id = strings::create(trail)?;
        strings::append(trail, &string_id, &encoded)?;
        chunks.push(DeltaChunk {
            version: 0,
            offset: window.target_offset,
            size: window.target_len,
            string_id,
            rep_id: base.clone(),
        });
    }
    for string_id in old_strings {
        strings::delete(trail, &string_id)?;
    }
    let md5 = if is_null_digest(&target_rep.md5) {
        hex_digest(&target_contents)
    } else {
        target_rep.md5
    };
    put(
        trail,
        target,
        &Representation {
            txn_id: target_rep.txn_id,
            md5,
            kind: RepKind::Delta { chunks },
        },
    )
}
