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

//! Append-only byte-run storage.
//!
//! A string is a sequence of byte runs stored as duplicate rows of the
//! `strings` table under a generated string-id. Strings are immutable once
//! a transaction referencing them commits; within a transaction, a rep
//! marked mutable may re-stream its string.

use crate::error::FsResult;
use crate::id::StringId;
use crate::tables;
use crate::trail::Trail;

/// Runs are flushed at this granularity; a writer may produce shorter runs
/// on close.
const RUN_SIZE: usize = 64 * 1024;

/// Allocates a fresh, empty string.
pub fn create(trail: &mut Trail<'_>) -> FsResult<StringId> {
    let table = trail.fs().tables().strings.clone();
    let key = tables::allocate_key(trail, &table)?;
    Ok(StringId::new(key))
}

/// Appends one run of bytes to the string.
pub fn append(trail: &mut Trail<'_>, id: &StringId, data: &[u8]) -> FsResult<()> {
    let table = trail.fs().tables().strings.clone();
    trail.kv().add_dup(&table, id.as_str().as_bytes(), data)?;
    Ok(())
}

/// Discards the string's contents, leaving a zero-length string.
pub fn clear(trail: &mut Trail<'_>, id: &StringId) -> FsResult<()> {
    let table = trail.fs().tables().strings.clone();
    trail.kv().delete_dups(&table, id.as_str().as_bytes())?;
    Ok(())
}

/// Removes the string entirely.
pub fn delete(trail: &mut Trail<'_>, id: &StringId) -> FsResult<()> {
    clear(trail, id)
}

/// The string's full contents.
pub fn read_all(trail: &mut Trail<'_>, id: &StringId) -> FsResult<Vec<u8>> {
    let table = trail.fs().tables().strings.clone();
    let runs = trail.kv().get_dups(&table, id.as_str().as_bytes())?;
    Ok(runs.concat())
}

/// The string's contents from `offset` to the end.
pub fn read_from(trail: &mut Trail<'_>, id: &StringId, offset: u64) -> FsResult<Vec<u8>> {
    let mut contents = read_all(trail, id)?;
    let offset = (offset as usize).min(contents.len());
    contents.drain(..offset);
    Ok(contents)
}

/// Total size of the string in bytes.
pub fn size(trail: &mut Trail<'_>, id: &StringId) -> FsResult<u64> {
    let table = trail.fs().tables().strings.clone();
    let runs = trail.kv().get_dups(&table, id.as_str().as_bytes())?;
    Ok(runs.iter().map(|run| run.len() as u64).sum())
}

/// Logical copy: a fresh string whose contents equal the source's at the
/// time of the call. Future mutation of either string leaves the other
/// untouched.
pub fn copy(trail: &mut Trail<'_>, id: &StringId) -> FsResult<StringId> {
    let table = trail.fs().tables().strings.clone();
    let runs = trail.kv().get_dups(&table, id.as_str().as_bytes())?;
    let new_id = create(trail)?;
    for run in &runs {
        trail.kv().add_dup(&table, new_id.as_str().as_bytes(), run)?;
    }
    Ok(new_id)
}

/// Opens a buffered writer appending to the string.
pub fn write_stream<'a, 'fs>(
    trail: &'a mut Trail<'fs>,
    id: StringId,
) -> StringWriter<'a, 'fs> {
    StringWriter {
        trail,
        id,
        buf: Vec::new(),
    }
}

/// Buffered append-side writer for one string.
pub struct StringWriter<'a, 'fs> {
    trail: &'a mut Trail<'fs>,
    id: StringId,
    buf: Vec<u8>,
}

impl StringWriter<'_, '_> {
    pub fn write(&mut self, data: &[u8]) -> FsResult<()> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= RUN_SIZE {
            let run: Vec<u8> = self.buf.drain(..RUN_SIZE).collect();
            append(self.trail, &self.id, &run)?;
        }
        Ok(())
    }

    pub fn close(mut self) -> FsResult<StringId> {
        if !self.buf.is_empty() {
            let run = std::mem::take(&mut self.buf);
            append(self.trail, &self.id, &run)?;
        }
        Ok(self.id)
    }
}
