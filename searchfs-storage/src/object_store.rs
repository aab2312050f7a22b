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

use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use searchfs_common::uri::Uri;

use crate::{OwnedBytes, PutPayload, StorageErrorKind, StorageResult};

/// A logical file name paired with the local path backing its upload or
/// download.
#[derive(Clone, Debug)]
pub struct FileTransfer {
    pub name: String,
    pub local_path: PathBuf,
}

/// Thin typed interface over a flat-key-space remote object store.
///
/// A store instance owns a key prefix: every `name` argument is a bare
/// logical file name, and implementations map it to `prefix + name`. Names
/// have no directory structure; a `/` inside a name is a literal character.
#[cfg_attr(any(test, feature = "testsuite"), mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Checks whether the store is reachable with the configured credentials.
    async fn check_connectivity(&self) -> anyhow::Result<()>;

    /// Lists all the objects under the store's prefix as `(name, size)`
    /// pairs, with the prefix stripped. The bare prefix marker object, if
    /// any, is filtered out.
    async fn list(&self) -> StorageResult<Vec<(String, u64)>>;

    /// Returns the size of an object in bytes.
    async fn file_num_bytes(&self, name: &str) -> StorageResult<u64>;

    /// Downloads a byte range of an object. Returns exactly
    /// `range.end - range.start` bytes or fails.
    async fn get_range(&self, name: &str, range: Range<u64>) -> StorageResult<OwnedBytes>;

    /// Downloads an entire object into a local file, returning the number of
    /// bytes written. `output_path` is expected to be a file path without any
    /// existing file yet.
    async fn copy_to_file(&self, name: &str, output_path: &Path) -> StorageResult<u64>;

    /// Uploads an object.
    async fn put(&self, name: &str, payload: Box<dyn PutPayload>) -> StorageResult<()>;

    /// Server-side copy of `from` to `to`.
    async fn copy(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Deletes an object. Returns Ok(()) if the object did not exist.
    async fn delete(&self, name: &str) -> StorageResult<()>;

    /// Uploads several local files concurrently. Waits for every in-flight
    /// transfer before returning; fails if any transfer failed.
    async fn bulk_upload(&self, uploads: &[FileTransfer]) -> StorageResult<()>;

    /// Downloads several objects into local files concurrently. Waits for
    /// every in-flight transfer before returning; fails if any transfer
    /// failed.
    async fn bulk_download(&self, downloads: &[FileTransfer]) -> StorageResult<()>;

    /// Returns whether an object exists.
    async fn exists(&self, name: &str) -> StorageResult<bool> {
        match self.file_num_bytes(name).await {
            Ok(_) => Ok(true),
            Err(storage_err) if storage_err.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(other_storage_err) => Err(other_storage_err),
        }
    }

    /// Returns a URI identifying the store.
    fn uri(&self) -> &Uri;
}
