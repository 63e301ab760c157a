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

use assert_matches::assert_matches;
use strata_lib::error::FsError;
use strata_lib::fs::AccessContext;
use strata_lib::fs::TxnFlags;
use strata_lib::node_rev::NodeKind;
use testutils::TestFs;
use testutils::begin_txn;
use testutils::commit;
use testutils::create_file;

#[test]
fn test_lock_requires_username() {
    let test_fs = TestFs::init();
    assert_matches!(
        test_fs
            .fs
            .lock("/f", NodeKind::File, None, false, None, None),
        Err(FsError::NoUser)
    );
}

#[test]
fn test_lock_and_lookup() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    fs.set_access(Some(AccessContext::new("alice")));

    let lock = fs
        .lock("/f.txt", NodeKind::File, Some("editing"), false, None, None)
        .unwrap();
    assert!(lock.token.starts_with("opaquelocktoken:"));
    assert_eq!(lock.owner, "alice");
    assert_eq!(lock.path, "/f.txt");
    assert_eq!(lock.expiration_date, None);

    let by_path = fs.get_lock("/f.txt").unwrap();
    assert_eq!(by_path.token, lock.token);
    let by_token = fs.get_lock_from_token(&lock.token).unwrap();
    assert_eq!(by_token.path, "/f.txt");

    // Locking an already-locked path fails without force.
    assert_matches!(
        fs.lock("/f.txt", NodeKind::File, None, false, None, None),
        Err(FsError::AlreadyExists { .. })
    );
    // Refreshing with the current token succeeds.
    let refreshed = fs
        .lock(
            "/f.txt",
            NodeKind::File,
            None,
            false,
            Some(3600),
            Some(&lock.token),
        )
        .unwrap();
    assert!(refreshed.expiration_date.is_some());
}

#[test]
fn test_unlock_ownership() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    fs.set_access(Some(AccessContext::new("alice")));
    let lock = fs
        .lock("/f", NodeKind::File, None, false, None, None)
        .unwrap();

    let other = test_fs.open_again();
    other.set_access(Some(AccessContext::new("mallory")));
    assert_matches!(
        other.unlock(&lock.token, false),
        Err(FsError::BadLockToken { .. })
    );
    // Breaking the lock is allowed with force.
    other.unlock(&lock.token, true).unwrap();
    assert_matches!(fs.get_lock("/f"), Err(FsError::NoSuchLock { .. }));
}

#[test]
fn test_lock_expiry_is_lazy() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    fs.set_access(Some(AccessContext::new("alice")));
    let lock = fs
        .lock("/f", NodeKind::File, None, false, Some(1), None)
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1200));

    assert_matches!(
        fs.get_lock_from_token(&lock.token),
        Err(FsError::LockExpired { .. })
    );
    // The expired rows were reaped; the path is now simply unlocked.
    assert_matches!(fs.get_lock("/f"), Err(FsError::NoSuchLock { .. }));
    fs.lock("/f", NodeKind::File, None, false, None, None)
        .unwrap();
}

#[test]
fn test_get_locks_scans_descendants() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;
    fs.set_access(Some(AccessContext::new("alice")));

    assert!(fs.get_locks("/proj").unwrap().is_empty());

    fs.lock("/proj", NodeKind::Dir, None, false, None, None)
        .unwrap();
    fs.lock("/proj/a.txt", NodeKind::File, None, false, None, None)
        .unwrap();
    fs.lock("/proj/sub/b.txt", NodeKind::File, None, false, None, None)
        .unwrap();
    fs.lock("/project-other", NodeKind::File, None, false, None, None)
        .unwrap();

    let locks = fs.get_locks("/proj").unwrap();
    let mut paths: Vec<&str> = locks.iter().map(|lock| lock.path.as_str()).collect();
    paths.sort_unstable();
    assert_eq!(paths, vec!["/proj", "/proj/a.txt", "/proj/sub/b.txt"]);

    let all = fs.get_locks("/").unwrap();
    assert_eq!(all.len(), 4);
}

// The lock hand-off scenario: a lock held by one session blocks another
// session's lock-checking txn until the lock is broken.
#[test]
fn test_lock_hand_off() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;

    // r1: the file to be locked.
    let txn_id = begin_txn(fs, 0);
    let root = fs.txn_root(&txn_id).unwrap();
    create_file(&root, "/locked.txt", "data");
    commit(fs, &txn_id);

    // Session 1 locks the file.
    let session1 = test_fs.open_again();
    session1.set_access(Some(AccessContext::new("alice")));
    let lock = session1
        .lock("/locked.txt", NodeKind::File, None, false, None, None)
        .unwrap();

    // Session 2, without the token, cannot modify it in a lock-checking
    // txn.
    let session2 = test_fs.open_again();
    session2.set_access(Some(AccessContext::new("bob")));
    let txn_id = session2
        .begin_txn(
            1,
            TxnFlags {
                check_locks: true,
                ..TxnFlags::default()
            },
        )
        .unwrap();
    let root = session2.txn_root(&txn_id).unwrap();
    assert_matches!(
        root.change_node_prop("/locked.txt", "k", Some("v")),
        Err(FsError::BadLockToken { ref path }) if path == "/locked.txt"
    );

    // Session 3 breaks the lock.
    let session3 = test_fs.open_again();
    session3.set_access(Some(AccessContext::new("admin")));
    session3.unlock(&lock.token, true).unwrap();

    // The same attempt in session 2 now succeeds.
    root.change_node_prop("/locked.txt", "k", Some("v"))
        .unwrap();
    session2.commit_txn(&txn_id).unwrap();
}

// The lock owner with the token presented may commit against the lock.
#[test]
fn test_lock_owner_with_token_passes() {
    let test_fs = TestFs::init();
    let fs = &test_fs.fs;

    let txn_id = begin_txn(fs, 0);
    create_file(&fs.txn_root(&txn_id).unwrap(), "/f", "data");
    commit(fs, &txn_id);

    fs.set_access(Some(AccessContext::new("alice")));
    let lock = fs
        .lock("/f", NodeKind::File, None, false, None, None)
        .unwrap();
    fs.set_access(Some(
        AccessContext::new("alice").with_token(&lock.token),
    ));

    let txn_id = fs
        .begin_txn(
            1,
            TxnFlags {
                check_locks: true,
                ..TxnFlags::default()
            },
        )
        .unwrap();
    let root = fs.txn_root(&txn_id).unwrap();
    root.change_node_prop("/f", "k", Some("v")).unwrap();
    assert_eq!(fs.commit_txn(&txn_id).unwrap(), 2);
}
