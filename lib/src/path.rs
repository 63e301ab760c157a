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

//! In-repository absolute paths.
//!
//! Canonical form: a leading `/`, no duplicate interior separators, no
//! trailing separator except for the root itself.

use std::cmp::Ordering;

/// Folds `path` into canonical absolute form. A missing leading slash is
/// supplied; empty input means the root.
pub fn canonicalize(path: &str) -> String {
    let mut canonical = String::with_capacity(path.len() + 1);
    canonical.push('/');
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if !canonical.ends_with('/') {
            canonical.push('/');
        }
        canonical.push_str(component);
    }
    canonical
}

/// Joins a canonical directory path and one entry name.
pub fn join(base: &str, name: &str) -> String {
    debug_assert!(base.starts_with('/'));
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Whether `name` can be a directory entry name.
pub fn is_single_path_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// The components of a canonical path, root excluded.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Whether `child` is strictly below `parent` (both canonical).
pub fn is_child(parent: &str, child: &str) -> bool {
    if parent == "/" {
        return child != "/" && child.starts_with('/');
    }
    child
        .strip_prefix(parent)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Orders paths so that a directory sorts immediately before everything
/// beneath it, by comparing the separator lower than any other byte.
pub fn compare(a: &str, b: &str) -> Ordering {
    let key = |c: u8| if c == b'/' { 0u16 } else { u16::from(c) + 1 };
    a.bytes().map(key).cmp(b.bytes().map(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize(""), "/");
        assert_eq!(canonicalize("/"), "/");
        assert_eq!(canonicalize("///"), "/");
        assert_eq!(canonicalize("a/b"), "/a/b");
        assert_eq!(canonicalize("/a//b/"), "/a/b");
        assert_eq!(canonicalize("/a/b///c"), "/a/b/c");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }

    #[test]
    fn test_is_single_path_component() {
        assert!(is_single_path_component("a"));
        assert!(is_single_path_component("a.txt"));
        assert!(!is_single_path_component(""));
        assert!(!is_single_path_component("."));
        assert!(!is_single_path_component(".."));
        assert!(!is_single_path_component("a/b"));
    }

    #[test]
    fn test_is_child() {
        assert!(is_child("/", "/a"));
        assert!(is_child("/a", "/a/b"));
        assert!(is_child("/a", "/a/b/c"));
        assert!(!is_child("/a", "/a"));
        assert!(!is_child("/a", "/ab"));
        assert!(!is_child("/", "/"));
    }

    #[test]
    fn test_compare_sorts_parents_first() {
        let mut paths = vec!["/a/b", "/a", "/a-x", "/a/b/c", "/b"];
        paths.sort_by(|a, b| compare(a, b));
        assert_eq!(paths, vec!["/a", "/a/b", "/a/b/c", "/a-x", "/b"]);
    }
}
