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

//! Library for Strata: a transactional versioned filesystem engine.
//!
//! The engine persists an append-only history of directory trees keyed by
//! monotonically increasing revisions, supports transactional edits with
//! concurrent-writer conflict detection, stores contents in a
//! content-addressed deltified representation store, and manages
//! path-based advisory locks.

#![deny(unused_must_use)]

pub mod base36;
pub mod branch;
pub mod changes;
pub mod copies;
pub mod dag;
pub mod delta;
pub mod editor;
pub mod element;
pub mod error;
pub mod fs;
pub mod id;
pub mod kv;
pub mod lock;
pub mod node_rev;
pub mod path;
pub mod rep;
pub mod revisions;
pub mod strings;
pub mod tables;
pub mod trail;
pub mod transactions;
pub mod tree;
