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

//! Test fixtures for the strata-lib integration tests.

use std::path::Path;

use strata_lib::fs::Filesystem;
use strata_lib::fs::TxnFlags;
use strata_lib::id::Revnum;
use strata_lib::id::TxnId;
use strata_lib::tree::Root;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("strata-test-")
        .tempdir()
        .unwrap()
}

/// A fresh repository in a temp directory, deleted on drop.
pub struct TestFs {
    pub fs: Filesystem,
    temp_dir: TempDir,
}

impl TestFs {
    pub fn init() -> Self {
        let temp_dir = new_temp_dir();
        let fs = Filesystem::create(&temp_dir.path().join("repo")).unwrap();
        Self { fs, temp_dir }
    }

    pub fn repo_path(&self) -> std::path::PathBuf {
        self.temp_dir.path().join("repo")
    }

    /// Opens a second handle onto the same repository, as another thread
    /// or session would.
    pub fn open_again(&self) -> Filesystem {
        Filesystem::open(&self.repo_path()).unwrap()
    }
}

/// Opens an existing repository at `repo_path`.
pub fn open_fs(repo_path: &Path) -> Filesystem {
    Filesystem::open(repo_path).unwrap()
}

/// Begins a plain transaction based on `base_rev`.
pub fn begin_txn(fs: &Filesystem, base_rev: Revnum) -> TxnId {
    fs.begin_txn(base_rev, TxnFlags::default()).unwrap()
}

/// Replaces the contents of the file at `path`, which must exist.
pub fn write_file(root: &Root<'_>, path: &str, contents: &str) {
    let mut writer = root.apply_text(path, None).unwrap();
    writer.write(contents.as_bytes());
    writer.close().unwrap();
}

/// Creates the file at `path` with the given contents.
pub fn create_file(root: &Root<'_>, path: &str, contents: &str) {
    root.make_file(path).unwrap();
    write_file(root, path, contents);
}

/// Reads the contents of the file at `path` as a string.
pub fn read_file(root: &Root<'_>, path: &str) -> String {
    String::from_utf8(root.file_contents(path).unwrap()).unwrap()
}

/// Commits a txn whose base is expected to still be current.
pub fn commit(fs: &Filesystem, txn_id: &TxnId) -> Revnum {
    fs.commit_txn(txn_id).unwrap()
}
