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

//! Path-based advisory locks.
//!
//! Two tables: `locks` keyed by token, and `lock-tokens` keyed by path.
//! Directory paths are keyed with a trailing `/` so that prefix range
//! scans over descendants are unambiguous. Expiry is lazy: any read that
//! finds an expired lock deletes both rows.

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use rand::RngCore as _;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::FsError;
use crate::error::FsResult;
use crate::fs::Filesystem;
use crate::kv::KvError;
use crate::node_rev::NodeKind;
use crate::path;
use crate::trail;
use crate::trail::Trail;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lock {
    /// Opaque URI-safe token; unique per lock.
    pub token: String,
    pub path: String,
    pub kind: NodeKind,
    pub owner: String,
    pub comment: Option<String>,
    pub creation_date: DateTime<Utc>,
    pub expiration_date: Option<DateTime<Utc>>,
}

impl Lock {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|expiry| expiry < now)
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("opaquelocktoken:{}", hex::encode(bytes))
}

// The lock-tokens key under which a lock on PATH is filed.
fn token_key(lock_path: &str, kind: NodeKind) -> String {
    match kind {
        NodeKind::File => lock_path.to_string(),
        NodeKind::Dir => format!("{lock_path}/"),
    }
}

fn write_lock_rows(trail: &mut Trail<'_>, lock: &Lock) -> FsResult<()> {
    let tables = trail.fs().tables();
    let locks = tables.locks.clone();
    let lock_tokens = tables.lock_tokens.clone();
    let value = serde_json::to_vec(lock)
        .map_err(|err| FsError::Corrupt(format!("unencodable lock: {err}")))?;
    trail
        .kv()
        .put(&locks, lock.token.as_bytes(), &value)?;
    trail.kv().put(
        &lock_tokens,
        token_key(&lock.path, lock.kind).as_bytes(),
        lock.token.as_bytes(),
    )?;
    Ok(())
}

fn delete_lock_rows(trail: &mut Trail<'_>, lock: &Lock) -> FsResult<()> {
    let tables = trail.fs().tables();
    let locks = tables.locks.clone();
    let lock_tokens = tables.lock_tokens.clone();
    match trail.kv().delete(&locks, lock.token.as_bytes()) {
        Ok(()) | Err(KvError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }
    match trail
        .kv()
        .delete(&lock_tokens, token_key(&lock.path, lock.kind).as_bytes())
    {
        Ok(()) | Err(KvError::NotFound) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

// Reads the lock for TOKEN, lazily reaping it if expired.
fn lock_by_token(trail: &mut Trail<'_>, token: &str) -> FsResult<Lock> {
    let locks = trail.fs().tables().locks.clone();
    let value = trail
        .kv()
        .get(&locks, token.as_bytes())
        .map_err(|err| match err {
            KvError::NotFound => FsError::BadLockToken {
                path: token.to_string(),
            },
            err => err.into(),
        })?;
    let lock: Lock = serde_json::from_slice(&value)
        .map_err(|err| FsError::Corrupt(format!("malformed lock '{token}': {err}")))?;
    if lock.is_expired(Utc::now()) {
        debug!(token, path = %lock.path, "reaping expired lock");
        delete_lock_rows(trail, &lock)?;
        return Err(FsError::LockExpired {
            token: token.to_string(),
        });
    }
    Ok(lock)
}

// The token filed under PATH, checking both the file and directory key
// forms. `NoSuchLock` when neither row exists.
fn token_at_path(trail: &mut Trail<'_>, lock_path: &str) -> FsResult<String> {
    let lock_tokens = trail.fs().tables().lock_tokens.clone();
    for key in [
        token_key(lock_path, NodeKind::File),
        token_key(lock_path, NodeKind::Dir),
    ] {
        match trail.kv().get(&lock_tokens, key.as_bytes()) {
            Ok(value) => {
                return String::from_utf8(value).map_err(|_| {
                    FsError::Corrupt(format!("malformed lock token at '{lock_path}'"))
                });
            }
            Err(KvError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Err(FsError::NoSuchLock {
        path: lock_path.to_string(),
    })
}

// Reads the valid lock at PATH, lazily reaping broken or expired rows.
fn lock_at_path(trail: &mut Trail<'_>, lock_path: &str) -> FsResult<Lock> {
    let token = token_at_path(trail, lock_path)?;
    match lock_by_token(trail, &token) {
        Ok(lock) => Ok(lock),
        Err(FsError::BadLockToken { .. }) => {
            // A token row without its lock: reap it and report no lock.
            let lock_tokens = trail.fs().tables().lock_tokens.clone();
            for key in [
                token_key(lock_path, NodeKind::File),
                token_key(lock_path, NodeKind::Dir),
            ] {
                match trail.kv().delete(&lock_tokens, key.as_bytes()) {
                    Ok(()) | Err(KvError::NotFound) => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Err(FsError::NoSuchLock {
                path: lock_path.to_string(),
            })
        }
        Err(err) => Err(err),
    }
}

fn required_username(fs: &Filesystem) -> FsResult<String> {
    fs.access()
        .map(|access| access.username)
        .ok_or(FsError::NoUser)
}

/// Locks `lock_path`. An existing lock is an error unless `force` is set
/// (steal) or `current_token` names it and the caller owns it (refresh).
/// A positive `timeout_secs` sets an expiration date.
pub fn lock(
    fs: &Filesystem,
    lock_path: &str,
    kind: NodeKind,
    comment: Option<&str>,
    force: bool,
    timeout_secs: Option<u64>,
    current_token: Option<&str>,
) -> FsResult<Lock> {
    let lock_path = path::canonicalize(lock_path);
    let username = required_username(fs)?;
    trail::retry_txn(fs, |trail| {
        match lock_at_path(trail, &lock_path) {
            Ok(existing) => {
                let refreshing =
                    current_token == Some(existing.token.as_str()) && existing.owner == username;
                if !force && !refreshing {
                    return Err(FsError::AlreadyExists {
                        path: lock_path.clone(),
                    });
                }
                delete_lock_rows(trail, &existing)?;
            }
            Err(FsError::NoSuchLock { .. } | FsError::LockExpired { .. }) => {}
            Err(err) => return Err(err),
        }
        let now = Utc::now();
        let lock = Lock {
            token: generate_token(),
            path: lock_path.clone(),
            kind,
            owner: username.clone(),
            comment: comment.map(str::to_string),
            creation_date: now,
            expiration_date: timeout_secs
                .filter(|&secs| secs > 0)
                .map(|secs| now + TimeDelta::seconds(secs as i64)),
        };
        write_lock_rows(trail, &lock)?;
        Ok(lock)
    })
}

/// Removes the lock named by `token`. Without `force`, the caller must be
/// the lock's owner.
pub fn unlock(fs: &Filesystem, token: &str, force: bool) -> FsResult<()> {
    trail::retry_txn(fs, |trail| {
        let lock = lock_by_token(trail, token)?;
        if !force {
            let username = required_username(trail.fs())?;
            if lock.owner != username {
                return Err(FsError::BadLockToken {
                    path: lock.path.clone(),
                });
            }
        }
        delete_lock_rows(trail, &lock)
    })
}

/// The valid lock at `lock_path`, if any.
pub fn get_lock_from_path(fs: &Filesystem, lock_path: &str) -> FsResult<Lock> {
    let lock_path = path::canonicalize(lock_path);
    trail::retry_txn(fs, |trail| lock_at_path(trail, &lock_path))
}

/// The valid lock named by `token`.
pub fn get_lock_from_token(fs: &Filesystem, token: &str) -> FsResult<Lock> {
    trail::retry_txn(fs, |trail| lock_by_token(trail, token))
}

// Collects the valid locks on PATH and everything beneath it. The range
// scan can rediscover a directory lock on PATH itself, so results are
// deduplicated by token.
fn locks_below(trail: &mut Trail<'_>, lock_path: &str) -> FsResult<Vec<Lock>> {
    let mut found: Vec<Lock> = Vec::new();
    match lock_at_path(trail, lock_path) {
        Ok(lock) => found.push(lock),
        Err(FsError::NoSuchLock { .. } | FsError::LockExpired { .. }) => {}
        Err(err) => return Err(err),
    }
    let prefix = if lock_path == "/" {
        "/".to_string()
    } else {
        format!("{lock_path}/")
    };
    let lock_tokens = trail.fs().tables().lock_tokens.clone();
    let mut cursor = trail.kv().cursor(&lock_tokens)?;
    let mut row = cursor.seek_range(prefix.as_bytes());
    while let Some((key, value)) = row {
        if !key.starts_with(prefix.as_bytes()) {
            break;
        }
        let token = String::from_utf8(value)
            .map_err(|_| FsError::Corrupt("malformed lock token row".to_string()))?;
        if found.iter().any(|lock| lock.token == token) {
            row = cursor.next();
            continue;
        }
        match lock_by_token(trail, &token) {
            Ok(lock) => found.push(lock),
            Err(FsError::BadLockToken { .. } | FsError::LockExpired { .. }) => {}
            Err(err) => return Err(err),
        }
        row = cursor.next();
    }
    Ok(found)
}

/// All valid locks on `lock_path` or below. Empty when nothing beneath is
/// locked.
pub fn get_locks(fs: &Filesystem, lock_path: &str) -> FsResult<Vec<Lock>> {
    let lock_path = path::canonicalize(lock_path);
    trail::retry_txn(fs, |trail| locks_below(trail, &lock_path))
}

// Verifies the caller may touch one locked path: the authenticated user
// must own the lock and have supplied its token.
fn check_one(trail: &mut Trail<'_>, lock: &Lock, error_path: &str) -> FsResult<()> {
    let access = trail.fs().access().ok_or(FsError::NoUser)?;
    if lock.owner != access.username || !access.tokens.contains(&lock.token) {
        return Err(FsError::BadLockToken {
            path: error_path.to_string(),
        });
    }
    Ok(())
}

/// Called from mutation bodies of lock-checking transactions: verifies
/// that the operation on `lock_path` is permitted under any lock covering
/// it. With `recursive`, every descendant lock is checked too.
pub(crate) fn allow_locked_operation(
    trail: &mut Trail<'_>,
    lock_path: &str,
    recursive: bool,
) -> FsResult<()> {
    if recursive {
        for lock in locks_below(trail, lock_path)? {
            check_one(trail, &lock, &lock.path)?;
        }
        Ok(())
    } else {
        match lock_at_path(trail, lock_path) {
            Ok(lock) => check_one(trail, &lock, lock_path),
            Err(FsError::NoSuchLock { .. } | FsError::LockExpired { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
