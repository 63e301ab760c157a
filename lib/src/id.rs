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

#![expect(missing_docs)]

use serde::Deserialize;
use serde::Serialize;

use crate::base36;

/// A committed revision number. Revision 0 exists from repository creation.
pub type Revnum = u64;

// Defines a newtype over a generated base-36 table key. Types defined using
// this macro serialize transparently as their string form.
macro_rules! key_id_type {
    (   $(#[$attr:meta])*
        $vis:vis $name:ident
    ) => {
        $(#[$attr])*
        #[derive(
            Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        $vis struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The key following this one in base-36 order.
            pub fn next(&self) -> Self {
                Self(base36::next_key(&self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(&self.0)
            }
        }
    };
}

key_id_type!(
    /// Identity of a node across its whole lifetime. All revisions of the
    /// same node share a `NodeId`.
    pub NodeId
);
key_id_type!(
    /// Identity of a branch of a node's history. The id `"0"` designates
    /// "never branched".
    pub CopyId
);
key_id_type!(
    /// Identity of a transaction, in progress or committed.
    pub TxnId
);
key_id_type!(pub StringId);
key_id_type!(pub RepId);

impl CopyId {
    /// The copy id meaning "this node was never a copy target".
    pub fn unbranched() -> Self {
        Self("0".to_string())
    }

    pub fn is_unbranched(&self) -> bool {
        self.0 == "0"
    }
}

/// Identity of one node revision: the `(node, copy, txn)` triple. Two node
/// revision ids are *related* iff their node parts match. String form is
/// `<node>.<copy>.<txn>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeRevId {
    node: NodeId,
    copy: CopyId,
    txn: TxnId,
}

impl NodeRevId {
    pub fn new(node: NodeId, copy: CopyId, txn: TxnId) -> Self {
        Self { node, copy, txn }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn copy_id(&self) -> &CopyId {
        &self.copy
    }

    pub fn txn_id(&self) -> &TxnId {
        &self.txn
    }

    /// Whether `self` and `other` name revisions of the same node.
    pub fn is_related_to(&self, other: &Self) -> bool {
        self.node == other.node
    }

    /// Whether `self` and `other` lie on the same branch of the same node.
    pub fn same_branch_as(&self, other: &Self) -> bool {
        self.node == other.node && self.copy == other.copy
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let node = parts.next().filter(|s| base36::is_valid_key(s))?;
        let copy = parts.next().filter(|s| base36::is_valid_key(s))?;
        let txn = parts.next().filter(|s| base36::is_valid_key(s))?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            node: NodeId::new(node),
            copy: CopyId::new(copy),
            txn: TxnId::new(txn),
        })
    }
}

impl std::fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.node, self.copy, self.txn)
    }
}

impl std::fmt::Debug for NodeRevId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeRevId").field(&self.to_string()).finish()
    }
}

impl From<NodeRevId> for String {
    fn from(id: NodeRevId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for NodeRevId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid node revision id '{value}'"))
    }
}
