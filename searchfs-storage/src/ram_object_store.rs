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

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use searchfs_common::uri::Uri;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::object_store::FileTransfer;
use crate::{
    FilePayload, ObjectStore, OwnedBytes, PutPayload, StorageErrorKind, StorageResult,
};

/// In-RAM implementation of the object store.
///
/// This implementation is mostly useful in unit tests.
#[derive(Clone)]
pub struct RamObjectStore {
    uri: Uri,
    files: Arc<RwLock<HashMap<String, OwnedBytes>>>,
}

impl fmt::Debug for RamObjectStore {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("RamObjectStore")
            .field("uri", &self.uri)
            .finish()
    }
}

impl Default for RamObjectStore {
    fn default() -> Self {
        Self {
            uri: Uri::from_well_formed("ram:///"),
            files: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl RamObjectStore {
    /// Creates a [`RamObjectStoreBuilder`].
    pub fn builder() -> RamObjectStoreBuilder {
        RamObjectStoreBuilder::default()
    }

    async fn put_data(&self, name: &str, payload: OwnedBytes) {
        self.files.write().await.insert(name.to_string(), payload);
    }

    async fn get_data(&self, name: &str) -> Option<OwnedBytes> {
        self.files.read().await.get(name).cloned()
    }

    /// Returns the names of the objects currently in the store.
    pub async fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn not_found(name: &str) -> crate::StorageError {
    StorageErrorKind::NotFound.with_error(anyhow!("missing object `{name}`"))
}

#[async_trait]
impl ObjectStore for RamObjectStore {
    async fn check_connectivity(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<(String, u64)>> {
        let files = self.files.read().await;
        let mut entries: Vec<(String, u64)> = files
            .iter()
            .map(|(name, bytes)| (name.clone(), bytes.len() as u64))
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn file_num_bytes(&self, name: &str) -> StorageResult<u64> {
        let bytes = self.get_data(name).await.ok_or_else(|| not_found(name))?;
        Ok(bytes.len() as u64)
    }

    async fn get_range(&self, name: &str, range: Range<u64>) -> StorageResult<OwnedBytes> {
        let bytes = self.get_data(name).await.ok_or_else(|| not_found(name))?;
        if range.end > bytes.len() as u64 {
            return Err(StorageErrorKind::Internal.with_error(anyhow!(
                "range {range:?} out of bounds for object `{name}` of {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes.slice(range.start as usize..range.end as usize))
    }

    async fn copy_to_file(&self, name: &str, output_path: &Path) -> StorageResult<u64> {
        let bytes = self.get_data(name).await.ok_or_else(|| not_found(name))?;
        let mut output_file = tokio::fs::File::create(output_path).await?;
        output_file.write_all(&bytes).await?;
        output_file.flush().await?;
        Ok(bytes.len() as u64)
    }

    async fn put(&self, name: &str, payload: Box<dyn PutPayload>) -> StorageResult<()> {
        let body = payload
            .byte_stream()
            .await?
            .collect()
            .await
            .map_err(|error| StorageErrorKind::Io.with_error(error))?
            .into_bytes();
        self.put_data(name, OwnedBytes::new(body.to_vec())).await;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let mut files = self.files.write().await;
        let bytes = files.get(from).cloned().ok_or_else(|| not_found(from))?;
        files.insert(to.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        self.files.write().await.remove(name);
        Ok(())
    }

    async fn bulk_upload(&self, uploads: &[FileTransfer]) -> StorageResult<()> {
        for upload in uploads {
            let payload = FilePayload::from_path(&upload.local_path).await?;
            self.put(&upload.name, Box::new(payload)).await?;
        }
        Ok(())
    }

    async fn bulk_download(&self, downloads: &[FileTransfer]) -> StorageResult<()> {
        for download in downloads {
            self.copy_to_file(&download.name, &download.local_path)
                .await?;
        }
        Ok(())
    }

    fn uri(&self) -> &Uri {
        &self.uri
    }
}

/// Builder to create a prepopulated [`RamObjectStore`]. Mostly useful for
/// tests.
#[derive(Default)]
pub struct RamObjectStoreBuilder {
    files: HashMap<String, OwnedBytes>,
}

impl RamObjectStoreBuilder {
    /// Adds an object to the store.
    pub fn put(mut self, name: &str, payload: &[u8]) -> Self {
        self.files
            .insert(name.to_string(), OwnedBytes::new(payload.to_vec()));
        self
    }

    /// Builds the store.
    pub fn build(self) -> RamObjectStore {
        RamObjectStore {
            uri: Uri::from_well_formed("ram:///"),
            files: Arc::new(RwLock::new(self.files)),
        }
    }
}
