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

//! The error taxonomy shared by every layer of the engine.

use thiserror::Error;

use crate::kv::KvError;

pub type FsResult<T> = Result<T, FsError>;

/// Filesystem error. Every fallible operation in the engine returns one of
/// these kinds. `Deadlock` (surfaced through [`FsError::Store`]) is caught
/// and retried by the trail runner and never escapes it; everything else
/// propagates per the policy documented on each variant group.
#[derive(Debug, Error)]
pub enum FsError {
    // Structural errors. Always fatal to the enclosing trail.
    #[error("corrupt filesystem: {0}")]
    Corrupt(String),
    #[error("malformed data: {0}")]
    Malformed(String),
    #[error("expected filesystem format '{expected}', found '{found}'")]
    VersionMismatch { found: String, expected: String },

    // Lookup errors. Locally recoverable in `open_path(.., last_optional)`
    // and in lock expiry cleanup; elsewhere they propagate.
    #[error("path '{path}' not found")]
    NotFound { path: String },
    #[error("reference to non-existent node revision '{id}'")]
    DanglingId { id: String },
    #[error("reference to non-existent revision r{rev}")]
    DanglingRev { rev: u64 },
    #[error("no transaction named '{txn_id}'")]
    NoSuchTxn { txn_id: String },
    #[error("no copy with id '{copy_id}'")]
    NoSuchCopy { copy_id: String },
    #[error("no recorded origin for node id '{node_id}'")]
    NoSuchNodeOrigin { node_id: String },
    #[error("no representation recorded for checksum '{checksum}'")]
    NoSuchChecksumRep { checksum: String },
    #[error("no lock on path '{path}'")]
    NoSuchLock { path: String },
    #[error("bad lock token for path '{path}'")]
    BadLockToken { path: String },
    #[error("lock has expired: token '{token}'")]
    LockExpired { token: String },
    #[error("directory has no entry named '{name}'")]
    NoSuchEntry { name: String },

    // State errors.
    #[error("node revision '{id}' is not mutable")]
    NotMutable { id: String },
    #[error("path '{path}' already exists")]
    AlreadyExists { path: String },
    #[error("'{path}' is not a directory")]
    NotDirectory { path: String },
    #[error("'{path}' is not a file")]
    NotFile { path: String },
    #[error("name '{name}' is not a single path component")]
    NotSinglePathComponent { name: String },
    #[error("the root directory cannot be deleted or replaced")]
    RootDir,
    #[error("root is not a transaction root")]
    NotTxnRoot,
    #[error("root is not a revision root")]
    NotRevisionRoot,

    // Concurrency errors. `TxnOutOfDate` is caught by the commit loop;
    // `Conflict` carries the first conflicting path to the caller.
    #[error("transaction '{txn_id}' is out of date")]
    TxnOutOfDate { txn_id: String },
    #[error("conflict at '{path}'")]
    Conflict { path: String },

    // Integrity errors. Fatal, never silently recovered.
    #[error("checksum mismatch for {detail}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        detail: String,
        expected: String,
        actual: String,
    },

    // Operational errors.
    #[error("no authenticated username available")]
    NoUser,
    #[error("operation cancelled")]
    Cancelled,
    #[error("filesystem environment has panicked and must be recovered")]
    Panic,
    #[error("filesystem is already open")]
    AlreadyOpen,
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An error from the underlying key-value store.
    #[error(transparent)]
    Store(#[from] KvError),
}

impl FsError {
    /// Whether a deadlock marker appears anywhere in this error's cause
    /// chain. The trail runner retries on this condition; type identity of
    /// intermediate wrappers does not matter.
    pub fn is_deadlock(&self) -> bool {
        if matches!(self, Self::Store(KvError::Deadlock)) {
            return true;
        }
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            if matches!(err.downcast_ref::<KvError>(), Some(KvError::Deadlock)) {
                return true;
            }
            source = err.source();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_deadlock() {
        assert!(FsError::from(KvError::Deadlock).is_deadlock());
        assert!(!FsError::from(KvError::NotFound).is_deadlock());
        assert!(!FsError::Cancelled.is_deadlock());
        assert!(
            !FsError::Conflict {
                path: "/a".to_string()
            }
            .is_deadlock()
        );
    }
}
