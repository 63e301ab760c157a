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

//! The filesystem handle: environment wiring, table set, repository
//! creation and opening, and transaction lifecycle entry points.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use rand::RngCore as _;
use tracing::debug;

use crate::branch;
use crate::changes;
use crate::copies;
use crate::copies::Copy;
use crate::copies::CopyKind;
use crate::dag;
use crate::error::FsError;
use crate::error::FsResult;
use crate::id::NodeRevId;
use crate::id::Revnum;
use crate::id::TxnId;
use crate::kv::Environment;
use crate::kv::KvTransaction;
use crate::kv::Table;
use crate::kv::TableKind;
use crate::lock;
use crate::lock::Lock;
use crate::node_rev;
use crate::node_rev::NodeKind;
use crate::node_rev::NodeRevision;
use crate::revisions;
use crate::revisions::Revision;
use crate::tables;
use crate::trail;
use crate::transactions;

/// Marker file inspected at open time to select the backend.
const FORMAT_FILE: &str = "format";
const FORMAT_CONTENTS: &str = "1 strata-kv\n";

/// Who is acting through this handle, for lock authorization.
#[derive(Clone, Debug)]
pub struct AccessContext {
    pub username: String,
    /// Lock tokens the caller presents.
    pub tokens: HashSet<String>,
}

impl AccessContext {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            tokens: HashSet::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tokens.insert(token.into());
        self
    }
}

/// Options for [`Filesystem::begin_txn`].
#[derive(Clone, Copy, Debug, Default)]
pub struct TxnFlags {
    /// Verify locks on every mutation and again at commit.
    pub check_locks: bool,
    /// Mark the txn for out-of-date verification by outer layers.
    pub check_ood: bool,
}

#[derive(Debug)]
pub(crate) struct Tables {
    pub nodes: Table,
    pub revisions: Table,
    pub transactions: Table,
    pub copies: Table,
    pub changes: Table,
    pub representations: Table,
    pub strings: Table,
    pub uuids: Table,
    pub locks: Table,
    pub lock_tokens: Table,
    pub node_origins: Table,
    pub successors: Table,
    pub metadata: Table,
    pub miscellaneous: Table,
    pub checksum_reps: Table,
}

impl Tables {
    fn open(env: &Environment, create: bool) -> FsResult<Self> {
        let open = |name: &str, kind: TableKind| {
            env.open_table(name, kind, create).map_err(|err| match err {
                crate::kv::KvError::NotFound => {
                    FsError::Corrupt(format!("filesystem is missing the '{name}' table"))
                }
                err => err.into(),
            })
        };
        Ok(Self {
            nodes: open(tables::NODES, TableKind::Btree)?,
            revisions: open(tables::REVISIONS, TableKind::Recno)?,
            transactions: open(tables::TRANSACTIONS, TableKind::Btree)?,
            copies: open(tables::COPIES, TableKind::Btree)?,
            changes: open(tables::CHANGES, TableKind::DupBtree)?,
            representations: open(tables::REPRESENTATIONS, TableKind::Btree)?,
            strings: open(tables::STRINGS, TableKind::DupBtree)?,
            uuids: open(tables::UUIDS, TableKind::Recno)?,
            locks: open(tables::LOCKS, TableKind::Btree)?,
            lock_tokens: open(tables::LOCK_TOKENS, TableKind::Btree)?,
            node_origins: open(tables::NODE_ORIGINS, TableKind::Btree)?,
            successors: open(tables::SUCCESSORS, TableKind::DupBtree)?,
            metadata: open(tables::METADATA, TableKind::Btree)?,
            miscellaneous: open(tables::MISCELLANEOUS, TableKind::Btree)?,
            checksum_reps: open(tables::CHECKSUM_REPS, TableKind::Btree)?,
        })
    }
}

/// One handle onto a repository. Handles are per-thread; the underlying
/// environment is shared and reference-counted across handles opened at
/// the same path.
pub struct Filesystem {
    repo_path: PathBuf,
    env: Environment,
    tables: Tables,
    in_txn_trail: Cell<bool>,
    access: RefCell<Option<AccessContext>>,
    // UUID memoized on this handle. Filled through the trail's on-success
    // chain, never from an attempt that was rolled back.
    uuid_cache: RefCell<Option<String>>,
}

fn generate_uuid() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

impl Filesystem {
    /// Creates a new repository at `repo_path` and returns a handle onto
    /// it. The path must not already contain one.
    pub fn create(repo_path: &Path) -> FsResult<Self> {
        let format_path = repo_path.join(FORMAT_FILE);
        if format_path.exists() {
            return Err(FsError::AlreadyExists {
                path: repo_path.display().to_string(),
            });
        }
        std::fs::create_dir_all(repo_path)
            .map_err(|err| FsError::Corrupt(format!("cannot create repository: {err}")))?;
        std::fs::write(&format_path, FORMAT_CONTENTS)
            .map_err(|err| FsError::Corrupt(format!("cannot write format file: {err}")))?;
        let env = Environment::open(repo_path);
        let tables = Tables::open(&env, true)?;
        let fs = Self {
            repo_path: repo_path.to_path_buf(),
            env,
            tables,
            in_txn_trail: Cell::new(false),
            access: RefCell::new(None),
            uuid_cache: RefCell::new(None),
        };
        fs.initialize()?;
        debug!(path = %repo_path.display(), "created filesystem");
        Ok(fs)
    }

    /// Opens an existing repository.
    pub fn open(repo_path: &Path) -> FsResult<Self> {
        let format = std::fs::read_to_string(repo_path.join(FORMAT_FILE)).map_err(|_| {
            FsError::Corrupt(format!(
                "'{}' is not a strata repository",
                repo_path.display()
            ))
        })?;
        if format != FORMAT_CONTENTS {
            return Err(FsError::VersionMismatch {
                found: format.trim().to_string(),
                expected: FORMAT_CONTENTS.trim().to_string(),
            });
        }
        let env = Environment::open(repo_path);
        if env.is_panicked() {
            return Err(FsError::Panic);
        }
        let tables = Tables::open(&env, true)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            env,
            tables,
            in_txn_trail: Cell::new(false),
            access: RefCell::new(None),
            uuid_cache: RefCell::new(None),
        })
    }

    // Seeds the key generators, the UUID, revision 0, and the branch
    // layer's r0 metadata.
    fn initialize(&self) -> FsResult<()> {
        let uuid = generate_uuid();
        trail::retry_txn(self, |trail| {
            let seed_tables = {
                let tables = trail.fs().tables();
                [
                    tables.nodes.clone(),
                    tables.transactions.clone(),
                    tables.copies.clone(),
                    tables.representations.clone(),
                    tables.strings.clone(),
                ]
            };
            for table in &seed_tables {
                tables::seed_next_key(trail, table)?;
            }
            tables::set_uuid(trail, &uuid)?;

            // Revision 0: an empty root directory at node revision 0.0.0,
            // owned by committed transaction "0" via copy "0".
            let nodes_table = trail.fs().tables().nodes.clone();
            let node_key = tables::allocate_key(trail, &nodes_table)?;
            if node_key != "0" {
                return Err(FsError::Corrupt(format!(
                    "initial node id is '{node_key}', not '0'"
                )));
            }
            let root_id = NodeRevId::parse("0.0.0").expect("static id");
            node_rev::put(trail, &root_id, &NodeRevision::new_dir("/"))?;
            let txn_id = transactions::create(trail, &root_id)?;
            if txn_id.as_str() != "0" {
                return Err(FsError::Corrupt(format!(
                    "initial transaction id is '{txn_id}', not '0'"
                )));
            }
            let copy_id = copies::reserve_id(trail)?;
            if copy_id.as_str() != "0" {
                return Err(FsError::Corrupt(format!(
                    "initial copy id is '{copy_id}', not '0'"
                )));
            }
            copies::create(
                trail,
                &copy_id,
                &Copy {
                    kind: CopyKind::Real,
                    src_path: None,
                    src_txn_id: None,
                    dst_noderev_id: root_id.clone(),
                },
            )?;
            let rev = revisions::put(
                trail,
                &Revision {
                    txn_id: txn_id.clone(),
                },
            )?;
            if rev != 0 {
                return Err(FsError::Corrupt(format!(
                    "initial revision number is {rev}, not 0"
                )));
            }
            transactions::make_committed(trail, &txn_id, rev)?;
            let date = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
            revisions::set_prop(trail, rev, revisions::PROP_REVISION_DATE, Some(&date))?;

            tables::metadata_set(trail, "r0", branch::DEFAULT_R0_METADATA.as_bytes())?;
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        &self.repo_path
    }

    pub(crate) fn env(&self) -> &Environment {
        &self.env
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }

    pub(crate) fn begin_kv(&self, locking: bool) -> KvTransaction {
        self.env.begin(locking)
    }

    pub(crate) fn in_txn_trail(&self) -> bool {
        self.in_txn_trail.get()
    }

    pub(crate) fn set_in_txn_trail(&self, value: bool) {
        self.in_txn_trail.set(value);
    }

    /// Sets the access context used for lock creation and verification.
    pub fn set_access(&self, access: Option<AccessContext>) {
        *self.access.borrow_mut() = access;
    }

    pub fn access(&self) -> Option<AccessContext> {
        self.access.borrow().clone()
    }

    pub fn uuid(&self) -> FsResult<String> {
        let cached = self.uuid_cache.borrow().clone();
        if let Some(uuid) = cached {
            return Ok(uuid);
        }
        trail::retry(self, |trail| {
            let uuid = tables::get_uuid(trail)?;
            let value = uuid.clone();
            trail.record_on_success(move || {
                *self.uuid_cache.borrow_mut() = Some(value);
            });
            Ok(uuid)
        })
    }

    pub fn set_uuid(&self, uuid: &str) -> FsResult<()> {
        trail::retry_txn(self, |trail| {
            tables::set_uuid(trail, uuid)?;
            let value = uuid.to_string();
            trail.record_on_success(move || {
                *self.uuid_cache.borrow_mut() = Some(value);
            });
            Ok(())
        })
    }

    /// The youngest committed revision.
    pub fn youngest_rev(&self) -> FsResult<Revnum> {
        trail::retry_txn(self, revisions::youngest)
    }

    pub fn revision_prop(&self, rev: Revnum, name: &str) -> FsResult<Option<String>> {
        trail::retry_txn(self, |trail| revisions::get_prop(trail, rev, name))
    }

    pub fn revision_proplist(&self, rev: Revnum) -> FsResult<BTreeMap<String, String>> {
        trail::retry_txn(self, |trail| revisions::proplist(trail, rev))
    }

    pub fn set_revision_prop(
        &self,
        rev: Revnum,
        name: &str,
        value: Option<&str>,
    ) -> FsResult<()> {
        trail::retry_txn(self, |trail| revisions::set_prop(trail, rev, name, value))
    }

    /// Begins a transaction based on `base_rev`.
    pub fn begin_txn(&self, base_rev: Revnum, flags: TxnFlags) -> FsResult<TxnId> {
        trail::retry_txn(self, |trail| {
            let base_txn_id = revisions::get_txn_id(trail, base_rev)?;
            let base_root = transactions::get(trail, &base_txn_id)?.root_id;
            let txn_id = transactions::create(trail, &base_root)?;
            if flags.check_locks {
                transactions::set_prop(
                    trail,
                    &txn_id,
                    transactions::PROP_CHECK_LOCKS,
                    Some("true"),
                )?;
            }
            if flags.check_ood {
                transactions::set_prop(trail, &txn_id, transactions::PROP_CHECK_OOD, Some("true"))?;
            }
            Ok(txn_id)
        })
    }

    /// Opens an existing in-progress transaction by name.
    pub fn open_txn(&self, name: &str) -> FsResult<TxnId> {
        let txn_id = TxnId::new(name);
        trail::retry_txn(self, |trail| {
            transactions::get_mutable(trail, &txn_id)?;
            Ok(())
        })?;
        Ok(txn_id)
    }

    pub fn list_transactions(&self) -> FsResult<Vec<TxnId>> {
        trail::retry_txn(self, transactions::list)
    }

    pub fn txn_prop(&self, txn_id: &TxnId, name: &str) -> FsResult<Option<String>> {
        trail::retry_txn(self, |trail| transactions::get_prop(trail, txn_id, name))
    }

    pub fn set_txn_prop(&self, txn_id: &TxnId, name: &str, value: Option<&str>) -> FsResult<()> {
        trail::retry_txn(self, |trail| {
            transactions::get_mutable(trail, txn_id)?;
            transactions::set_prop(trail, txn_id, name, value)
        })
    }

    /// Aborts an in-progress transaction, reclaiming its mutable nodes,
    /// representations, strings, and reserved copies.
    pub fn abort_txn(&self, txn_id: &TxnId) -> FsResult<()> {
        trail::retry_txn(self, |trail| {
            let txn = transactions::get_mutable(trail, txn_id)?;
            transactions::make_dead(trail, txn_id)?;
            dag::delete_if_mutable(trail, &txn.root_id, txn_id)?;
            for copy_id in &txn.copies {
                match copies::delete(trail, copy_id) {
                    Ok(()) | Err(FsError::NoSuchCopy { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
            changes::delete(trail, txn_id)?;
            transactions::delete(trail, txn_id)?;
            debug!(txn = %txn_id, "aborted transaction");
            Ok(())
        })
    }

    /// Commits an in-progress transaction, merging against the youngest
    /// revision as needed. See the tree layer's commit loop.
    pub fn commit_txn(&self, txn_id: &TxnId) -> FsResult<Revnum> {
        crate::tree::commit_txn(self, txn_id)
    }

    // Locks.

    pub fn lock(
        &self,
        lock_path: &str,
        kind: NodeKind,
        comment: Option<&str>,
        force: bool,
        timeout_secs: Option<u64>,
        current_token: Option<&str>,
    ) -> FsResult<Lock> {
        lock::lock(
            self,
            lock_path,
            kind,
            comment,
            force,
            timeout_secs,
            current_token,
        )
    }

    pub fn unlock(&self, token: &str, force: bool) -> FsResult<()> {
        lock::unlock(self, token, force)
    }

    pub fn get_lock(&self, lock_path: &str) -> FsResult<Lock> {
        lock::get_lock_from_path(self, lock_path)
    }

    pub fn get_lock_from_token(&self, token: &str) -> FsResult<Lock> {
        lock::get_lock_from_token(self, token)
    }

    pub fn get_locks(&self, lock_path: &str) -> FsResult<Vec<Lock>> {
        lock::get_locks(self, lock_path)
    }
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("path", &self.repo_path)
            .finish_non_exhaustive()
    }
}
