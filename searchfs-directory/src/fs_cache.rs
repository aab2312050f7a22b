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

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use searchfs_common::ignore_error_kind;
use tracing::debug;

use crate::error::{DirectoryError, DirectoryResult};
use crate::index_input::FsIndexInput;
use crate::index_output::{IndexOutput, WriterRegistry};

/// Wrapper over the local cache directory.
///
/// The directory holds both fully-present files (Buffered and Synced states)
/// and sparse cache files (Cached state). The two kinds coexist by name:
/// every logical name is in exactly one state, so a name is never both.
pub struct FsCache {
    root: PathBuf,
}

impl FsCache {
    /// Opens the cache at `root`, creating the directory if absent.
    pub async fn open(root: &Path) -> DirectoryResult<FsCache> {
        tokio::fs::create_dir_all(root).await?;
        Ok(FsCache {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a logical name to its path under the cache directory.
    pub fn resolve_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Lists the names present in the cache directory, sorted.
    pub async fn list_all(&self) -> DirectoryResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    pub async fn exists(&self, name: &str) -> bool {
        tokio::fs::try_exists(self.resolve_path(name))
            .await
            .unwrap_or(false)
    }

    /// Length of the local file backing `name`. For a sparse cache file this
    /// is its logical length, which matches the remote object's length.
    pub async fn file_length(&self, name: &str) -> DirectoryResult<u64> {
        let metadata = tokio::fs::metadata(self.resolve_path(name)).await?;
        Ok(metadata.len())
    }

    /// Opens `name` for writing. Fails if the file already exists.
    pub async fn create_output(
        &self,
        name: &str,
        registry: WriterRegistry,
    ) -> DirectoryResult<IndexOutput> {
        let output = IndexOutput::create(name, &self.resolve_path(name), registry).await?;
        Ok(output)
    }

    /// Opens a fully-present local file for reading.
    pub async fn open_input(&self, name: &str) -> DirectoryResult<FsIndexInput> {
        FsIndexInput::open(name, &self.resolve_path(name)).await
    }

    /// Deletes `name` from the cache directory. Deleting a missing file is
    /// not an error.
    pub async fn delete(&self, name: &str) -> DirectoryResult<()> {
        debug!(name = %name, "delete local file");
        ignore_error_kind!(
            ErrorKind::NotFound,
            tokio::fs::remove_file(self.resolve_path(name)).await
        )?;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> DirectoryResult<()> {
        debug!(from = %from, to = %to, "rename local file");
        tokio::fs::rename(self.resolve_path(from), self.resolve_path(to)).await?;
        Ok(())
    }

    /// Takes the advisory exclusive lock named `name`. The lock is released
    /// when the returned guard is dropped.
    pub fn obtain_lock(&self, name: &str) -> DirectoryResult<DirectoryLock> {
        let lock_path = self.resolve_path(name);
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| DirectoryError::LockHeld(name.to_string()))?;
        debug!(name = %name, "obtained lock");
        Ok(DirectoryLock {
            name: name.to_string(),
            lock_file,
        })
    }
}

impl fmt::Debug for FsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsCache")
            .field("root", &self.root.display())
            .finish()
    }
}

/// Advisory exclusive file lock, released on drop.
pub struct DirectoryLock {
    name: String,
    lock_file: std::fs::File,
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        if let Err(error) = FileExt::unlock(&self.lock_file) {
            debug!(name = %self.name, error = %error, "failed to release lock");
        }
    }
}

impl fmt::Debug for DirectoryLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirectoryLock({:?})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::index_input::IndexInput;

    #[tokio::test]
    async fn test_fs_cache_create_list_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let registry = Arc::new(Mutex::new(HashSet::new()));

        let mut output = fs_cache
            .create_output("_0.fdt", registry.clone())
            .await
            .unwrap();
        output.write_bytes(b"stored fields").await.unwrap();
        output.close().await.unwrap();

        assert_eq!(fs_cache.list_all().await.unwrap(), vec!["_0.fdt"]);
        assert!(fs_cache.exists("_0.fdt").await);
        assert_eq!(fs_cache.file_length("_0.fdt").await.unwrap(), 13);

        fs_cache.delete("_0.fdt").await.unwrap();
        fs_cache.delete("_0.fdt").await.unwrap();
        assert!(!fs_cache.exists("_0.fdt").await);
    }

    #[tokio::test]
    async fn test_fs_cache_rename_then_read() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let registry = Arc::new(Mutex::new(HashSet::new()));

        let mut output = fs_cache
            .create_output("pending.seg", registry)
            .await
            .unwrap();
        output.write_bytes(&[0xAA; 100]).await.unwrap();
        output.close().await.unwrap();

        fs_cache.rename("pending.seg", "segments_1").await.unwrap();
        assert!(!fs_cache.exists("pending.seg").await);

        let mut input = fs_cache.open_input("segments_1").await.unwrap();
        let mut buf = vec![0u8; 100];
        input.read_bytes(&mut buf).await.unwrap();
        assert_eq!(buf, vec![0xAA; 100]);
    }

    #[tokio::test]
    async fn test_obtain_lock_is_exclusive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();

        let lock = fs_cache.obtain_lock("write.lock").unwrap();
        let relock_err = fs_cache.obtain_lock("write.lock").unwrap_err();
        assert!(matches!(relock_err, DirectoryError::LockHeld(_)));

        drop(lock);
        let _relock = fs_cache.obtain_lock("write.lock").unwrap();
    }
}
