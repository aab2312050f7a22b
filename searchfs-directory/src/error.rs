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

use std::io;

use searchfs_storage::{StorageError, StorageErrorKind};
use thiserror::Error;

/// Directory error.
///
/// The `Closed`, `WriterNotOpen`, `RenameOpenWriter` and `LockHeld` variants
/// indicate caller bugs rather than environmental failures.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory is closed")]
    Closed,
    #[error("file `{0}` does not exist")]
    NotFound(String),
    #[error("writer for `{0}` is closed")]
    WriterNotOpen(String),
    #[error("cannot rename `{0}`: a writer is still open on it")]
    RenameOpenWriter(String),
    #[error("lock `{0}` is held by another process")]
    LockHeld(String),
    #[error(
        "block fetch for `{name}` returned {actual} bytes, expected {expected}"
    )]
    Consistency {
        name: String,
        expected: u64,
        actual: u64,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DirectoryError {
    /// Returns true if this error denotes a missing file, whichever tier
    /// reported it.
    pub fn is_not_found(&self) -> bool {
        match self {
            DirectoryError::NotFound(_) => true,
            DirectoryError::Storage(storage_err) => {
                storage_err.kind() == StorageErrorKind::NotFound
            }
            DirectoryError::Io(io_err) => io_err.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Generic Result type for directory operations.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
