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

//! Tree elements of the branch layer.
//!
//! An element names one node identity within a branch. Elements are
//! independent of their path: moves and renames change only the parent
//! and name fields, never the element id.

use serde::Deserialize;
use serde::Serialize;

use crate::dag::Proplist;
use crate::id::Revnum;

/// Element identifier. Committed elements carry ids in the owning
/// revision root's `[first_eid, next_eid)` range; transaction-local
/// elements are negative until finalized.
pub type Eid = i64;

/// The parent eid of a branch's root element.
pub const ROOT_PARENT_EID: Eid = -1;

/// A reference to an element of a committed revision, to be resolved on
/// demand against the underlying node-revision store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    pub rev: Revnum,
    pub branch_id: String,
    pub eid: Eid,
}

/// What an element is. A subbranch root is expressed by the *absence* of
/// a payload on the element (see [`Element::payload`]), not by a variant
/// here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    File { props: Proplist, text: Vec<u8> },
    Dir { props: Proplist },
    Symlink { props: Proplist, target: String },
    /// Payload stored elsewhere; resolved lazily.
    Reference(BranchRef),
}

/// One element of a branch state.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    /// [`ROOT_PARENT_EID`] iff this is the branch's root element.
    pub parent_eid: Eid,
    /// Empty iff this is the branch's root element; otherwise a single
    /// path component.
    pub name: String,
    /// None marks a subbranch root element.
    pub payload: Option<Payload>,
}

impl Element {
    pub fn new(parent_eid: Eid, name: impl Into<String>, payload: Payload) -> Self {
        Self {
            parent_eid,
            name: name.into(),
            payload: Some(payload),
        }
    }

    pub fn subbranch_root(parent_eid: Eid, name: impl Into<String>) -> Self {
        Self {
            parent_eid,
            name: name.into(),
            payload: None,
        }
    }

    pub fn is_subbranch_root(&self) -> bool {
        self.payload.is_none()
    }
}
