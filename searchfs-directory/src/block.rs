// Copyright 2021-Present Datadog, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::{BTreeSet, HashSet};
use std::ops::Range;
use std::sync::Mutex;

/// Default block size of the read cache. Historical deployments also ran
/// with 4 KiB, 128 KiB and 256 KiB blocks, so this stays a construction
/// parameter of the directory.
pub const DEFAULT_BLOCK_SIZE: u64 = 1024 * 1024;

/// Returns the index of the block covering `offset`.
pub(crate) fn block_containing(offset: u64, block_size: u64) -> u64 {
    offset / block_size
}

/// Returns the byte range covered by `block_idx` in a file of `file_len`
/// bytes. The last block of a file may be short.
pub(crate) fn block_byte_range(block_idx: u64, block_size: u64, file_len: u64) -> Range<u64> {
    let start = block_idx * block_size;
    let end = (start + block_size).min(file_len);
    start..end
}

/// Returns the index of the last block of a non-empty file.
pub(crate) fn last_block(file_len: u64, block_size: u64) -> u64 {
    debug_assert!(file_len > 0);
    (file_len - 1) / block_size
}

/// Set of the block indices of a single remote file that are present in its
/// local sparse file.
///
/// One instance is shared, behind an `Arc`, between the directory's state
/// table and every reader (root and slices) of the file. Absent blocks are
/// simply not stored.
#[derive(Default)]
pub struct BlockMap {
    present: Mutex<HashSet<u64>>,
}

impl BlockMap {
    pub fn contains(&self, block_idx: u64) -> bool {
        self.present.lock().unwrap().contains(&block_idx)
    }

    /// Marks a block present. Only called after the block's bytes have been
    /// fully written to the sparse file.
    pub fn insert(&self, block_idx: u64) {
        self.present.lock().unwrap().insert(block_idx);
    }

    pub fn len(&self) -> usize {
        self.present.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.lock().unwrap().is_empty()
    }

    /// Returns a sorted snapshot of the present blocks.
    pub fn snapshot(&self) -> BTreeSet<u64> {
        self.present.lock().unwrap().iter().copied().collect()
    }
}

impl std::fmt::Debug for BlockMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMap")
            .field("present", &self.snapshot())
            .finish()
    }
}
