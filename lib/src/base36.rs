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

//! Base-36 table keys. Generated ids are lowercase alphanumeric strings
//! counting `0, 1, .., 9, a, .., z, 10, 11, ..`; each table carrying
//! generated ids stores the next unused key under the distinguished row
//! `"next-key"`.

use std::cmp::Ordering;

/// The distinguished row holding the next unused generated key.
pub const NEXT_KEY: &str = "next-key";

/// The initial generated key of a fresh table.
pub const INITIAL_KEY: &str = "0";

fn digit_value(c: u8) -> Option<u32> {
    match c {
        b'0'..=b'9' => Some(u32::from(c - b'0')),
        b'a'..=b'z' => Some(u32::from(c - b'a') + 10),
        _ => None,
    }
}

fn digit_char(value: u32) -> u8 {
    debug_assert!(value < 36);
    if value < 10 {
        b'0' + value as u8
    } else {
        b'a' + (value - 10) as u8
    }
}

/// Whether `key` is a well-formed base-36 key.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|c| digit_value(c).is_some())
}

/// Returns the key following `key`: `"0"` -> `"1"`, `"z"` -> `"10"`,
/// `"zz"` -> `"100"`.
pub fn next_key(key: &str) -> String {
    debug_assert!(is_valid_key(key));
    let mut digits: Vec<u8> = key.bytes().collect();
    let mut carry = true;
    for digit in digits.iter_mut().rev() {
        if !carry {
            break;
        }
        let value = digit_value(*digit).unwrap() + 1;
        if value == 36 {
            *digit = b'0';
        } else {
            *digit = digit_char(value);
            carry = false;
        }
    }
    if carry {
        digits.insert(0, b'1');
    }
    String::from_utf8(digits).unwrap()
}

/// Total order over base-36 keys: shorter keys sort first, equal lengths
/// compare lexicographically.
pub fn key_compare(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_key() {
        assert_eq!(next_key("0"), "1");
        assert_eq!(next_key("9"), "a");
        assert_eq!(next_key("z"), "10");
        assert_eq!(next_key("1z"), "20");
        assert_eq!(next_key("zz"), "100");
        assert_eq!(next_key("3yz"), "3z0");
    }

    #[test]
    fn test_key_compare() {
        assert_eq!(key_compare("3", "3"), Ordering::Equal);
        assert_eq!(key_compare("9", "10"), Ordering::Less);
        assert_eq!(key_compare("a", "9"), Ordering::Greater);
        assert_eq!(key_compare("z9", "za"), Ordering::Less);
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key("0"));
        assert!(is_valid_key("10a"));
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("A"));
        assert!(!is_valid_key("next-key"));
    }
}
