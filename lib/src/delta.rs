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

//! Windowed byte deltas.
//!
//! A delta is an ordered list of windows. Each window reconstructs one
//! contiguous span of the target from instructions that either copy a
//! range of the base or insert literal bytes. The matcher is a
//! common-prefix/common-suffix scan; the window framing is what the
//! representation layer depends on, the instruction stream is free to get
//! smarter later.

use serde::Deserialize;
use serde::Serialize;

/// Maximum number of target bytes one window reconstructs.
pub const WINDOW_SIZE: usize = 100 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Copy `len` bytes from the base, starting at `offset`.
    Copy { offset: u64, len: u64 },
    /// Insert the bytes verbatim.
    Insert(Vec<u8>),
}

/// One window of a delta, reconstructing `target_len` bytes at target
/// offset `target_offset`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub target_offset: u64,
    pub target_len: u64,
    pub ops: Vec<Instruction>,
}

/// Applies one window against the full base, yielding that window's span
/// of the target.
pub fn apply(base: &[u8], window: &Window) -> Vec<u8> {
    let mut out = Vec::with_capacity(window.target_len as usize);
    for op in &window.ops {
        match op {
            Instruction::Copy { offset, len } => {
                let start = *offset as usize;
                let end = start + *len as usize;
                out.extend_from_slice(&base[start..end]);
            }
            Instruction::Insert(bytes) => out.extend_from_slice(bytes),
        }
    }
    debug_assert_eq!(out.len() as u64, window.target_len);
    out
}

/// Applies a whole window list in target order.
pub fn apply_all(base: &[u8], windows: &[Window]) -> Vec<u8> {
    let mut out = Vec::new();
    for window in windows {
        debug_assert_eq!(window.target_offset as usize, out.len());
        out.extend_from_slice(&apply(base, window));
    }
    out
}

// A segment of the target in absolute target coordinates, before window
// framing.
enum Segment {
    Copy { base_offset: usize, len: usize },
    Insert { target_offset: usize, len: usize },
}

impl Segment {
    fn len(&self) -> usize {
        match self {
            Self::Copy { len, .. } | Self::Insert { len, .. } => *len,
        }
    }
}

/// Encodes `target` as windows against `base`.
pub fn encode(base: &[u8], target: &[u8]) -> Vec<Window> {
    let prefix = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = base.len().min(target.len()) - prefix;
    let suffix = base
        .iter()
        .rev()
        .zip(target.iter().rev())
        .take_while(|(a, b)| a == b)
        .take(max_suffix)
        .count();

    let mut segments = Vec::new();
    if prefix > 0 {
        segments.push(Segment::Copy {
            base_offset: 0,
            len: prefix,
        });
    }
    let middle = target.len() - prefix - suffix;
    if middle > 0 {
        segments.push(Segment::Insert {
            target_offset: prefix,
            len: middle,
        });
    }
    if suffix > 0 {
        segments.push(Segment::Copy {
            base_offset: base.len() - suffix,
            len: suffix,
        });
    }

    let mut windows = Vec::new();
    let mut window_start = 0usize;
    while window_start < target.len() || (target.is_empty() && windows.is_empty()) {
        let window_len = WINDOW_SIZE.min(target.len() - window_start);
        let window_end = window_start + window_len;
        let mut ops = Vec::new();
        let mut segment_start = 0usize;
        for segment in &segments {
            let segment_end = segment_start + segment.len();
            let clip_start = window_start.max(segment_start);
            let clip_end = window_end.min(segment_end);
            if clip_start < clip_end {
                let skip = clip_start - segment_start;
                let len = clip_end - clip_start;
                match segment {
                    Segment::Copy { base_offset, .. } => ops.push(Instruction::Copy {
                        offset: (base_offset + skip) as u64,
                        len: len as u64,
                    }),
                    Segment::Insert { target_offset, .. } => ops.push(Instruction::Insert(
                        target[target_offset + skip..target_offset + skip + len].to_vec(),
                    )),
                }
            }
            segment_start = segment_end;
        }
        windows.push(Window {
            target_offset: window_start as u64,
            target_len: window_len as u64,
            ops,
        });
        if window_len == 0 {
            break;
        }
        window_start = window_end;
    }
    windows
}
