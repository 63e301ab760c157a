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

//! Trails: the atomic unit of work against the store.
//!
//! A trail wraps one store transaction and an undo chain for in-memory
//! side effects. [`retry_txn`] runs a body inside a trail, retrying it from
//! scratch whenever a deadlock marker appears anywhere in the returned
//! error chain. Table writes roll back with the store transaction; any
//! mutation of memory that outlives the trail must instead be covered by
//! the undo chain, so a retried attempt starts from a clean slate. The
//! tree layer's node cache registers [`Trail::record_undo`] eviction for
//! entries it populates mid-trail, and the filesystem handle's UUID cache
//! is filled through [`Trail::record_on_success`] only once the read has
//! actually committed.

use tracing::debug;

use crate::error::FsError;
use crate::error::FsResult;
use crate::fs::Filesystem;
use crate::kv::KvTransaction;

/// When an undo-chain entry runs. An action that must run on both paths
/// is registered under both tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UndoWhen {
    /// Only when the trail aborts (including deadlock retries).
    OnFailure,
    /// Only when the trail commits.
    OnSuccess,
}

/// One attempt at a composed multi-table operation.
pub struct Trail<'fs> {
    fs: &'fs Filesystem,
    txn: KvTransaction,
    undo: Vec<(UndoWhen, Box<dyn FnOnce() + 'fs>)>,
}

impl<'fs> Trail<'fs> {
    pub fn fs(&self) -> &'fs Filesystem {
        self.fs
    }

    pub(crate) fn kv(&mut self) -> &mut KvTransaction {
        &mut self.txn
    }

    pub(crate) fn kv_ref(&self) -> &KvTransaction {
        &self.txn
    }

    /// Registers an undo action run if this trail fails. Actions run in the
    /// reverse of registration order.
    pub fn record_undo(&mut self, f: impl FnOnce() + 'fs) {
        self.undo.push((UndoWhen::OnFailure, Box::new(f)));
    }

    /// Registers an action run only when the trail commits.
    pub fn record_on_success(&mut self, f: impl FnOnce() + 'fs) {
        self.undo.push((UndoWhen::OnSuccess, Box::new(f)));
    }
}

fn run_undo(undo: Vec<(UndoWhen, Box<dyn FnOnce() + '_>)>, success: bool) {
    for (when, f) in undo.into_iter().rev() {
        let run = match when {
            UndoWhen::OnFailure => !success,
            UndoWhen::OnSuccess => success,
        };
        if run {
            f();
        }
    }
}

/// Runs `body` inside a trail holding a store transaction, committing on
/// success and retrying from scratch on deadlock. Any other error aborts
/// the transaction and propagates.
///
/// Panics if a trail transaction is already live on this filesystem
/// handle; nesting trails is a programming error.
pub fn retry_txn<'fs, T>(
    fs: &'fs Filesystem,
    body: impl FnMut(&mut Trail<'fs>) -> FsResult<T>,
) -> FsResult<T> {
    do_retry(fs, body, true)
}

/// Runs `body` inside a trail without a store transaction. Table accesses
/// run in autocommit mode; no locks are taken and no deadlock can occur.
pub fn retry<'fs, T>(
    fs: &'fs Filesystem,
    body: impl FnMut(&mut Trail<'fs>) -> FsResult<T>,
) -> FsResult<T> {
    do_retry(fs, body, false)
}

fn do_retry<'fs, T>(
    fs: &'fs Filesystem,
    mut body: impl FnMut(&mut Trail<'fs>) -> FsResult<T>,
    use_txn: bool,
) -> FsResult<T> {
    loop {
        if use_txn {
            assert!(
                !fs.in_txn_trail(),
                "attempted to nest trail transactions on one filesystem handle"
            );
            fs.set_in_txn_trail(true);
        }
        let mut trail = Trail {
            fs,
            txn: fs.begin_kv(use_txn),
            undo: Vec::new(),
        };
        let result = body(&mut trail);
        let Trail { txn, undo, .. } = trail;
        match result {
            Ok(value) => {
                run_undo(undo, true);
                // Reset before committing: a failed commit must not leave
                // the handle claiming a live trail.
                if use_txn {
                    fs.set_in_txn_trail(false);
                }
                txn.commit().map_err(FsError::from)?;
                return Ok(value);
            }
            Err(err) if err.is_deadlock() => {
                run_undo(undo, false);
                if use_txn {
                    fs.set_in_txn_trail(false);
                }
                txn.abort();
                debug!("trail deadlocked, retrying");
            }
            Err(err) => {
                run_undo(undo, false);
                if use_txn {
                    fs.set_in_txn_trail(false);
                }
                txn.abort();
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::kv::KvError;

    fn test_fs(name: &str) -> (tempfile::TempDir, Filesystem) {
        let dir = tempfile::Builder::new()
            .prefix(&format!("strata-trail-test-{name}-"))
            .tempdir()
            .unwrap();
        let fs = Filesystem::create(&dir.path().join("repo")).unwrap();
        (dir, fs)
    }

    #[test]
    fn test_undo_chain_across_deadlock_retry() {
        let (_dir, fs) = test_fs("retry");
        let log = RefCell::new(Vec::new());
        let log = &log;
        let mut attempts = 0;
        retry_txn(&fs, |trail| {
            attempts += 1;
            trail.record_undo(move || log.borrow_mut().push("undo"));
            trail.record_on_success(move || log.borrow_mut().push("success"));
            if attempts == 1 {
                Err(KvError::Deadlock.into())
            } else {
                Ok(())
            }
        })
        .unwrap();
        // The failed attempt ran only its undo action; the committed one
        // ran only its on-success action.
        assert_eq!(attempts, 2);
        assert_eq!(*log.borrow(), vec!["undo", "success"]);
    }

    #[test]
    fn test_failed_trail_runs_undo_in_reverse_order() {
        let (_dir, fs) = test_fs("reverse");
        let log = RefCell::new(Vec::new());
        let log = &log;
        let result: FsResult<()> = retry_txn(&fs, |trail| {
            trail.record_undo(move || log.borrow_mut().push("first"));
            trail.record_undo(move || log.borrow_mut().push("second"));
            trail.record_on_success(move || log.borrow_mut().push("never"));
            Err(FsError::Cancelled)
        });
        assert!(matches!(result, Err(FsError::Cancelled)));
        assert_eq!(*log.borrow(), vec!["second", "first"]);
    }
}
