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

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use searchfs_common::utf16_code_unit_cmp;
use searchfs_storage::{FileTransfer, ObjectStore, S3Config, S3ObjectStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::block::{BlockMap, DEFAULT_BLOCK_SIZE};
use crate::error::{DirectoryError, DirectoryResult};
use crate::fs_cache::{DirectoryLock, FsCache};
use crate::index_input::{IndexInput, S3IndexInput};
use crate::index_output::{IndexOutput, WriterRegistry};
use crate::prepopulate;

/// Suffix reserved for files that must never be uploaded.
const TEMP_SUFFIX: &str = "tmp";

/// Files the engine stages under this prefix are part of an uncommitted
/// segment and must never be uploaded either.
const PENDING_SEGMENTS_PREFIX: &str = "pending_segments";

fn is_temp_file(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX) || name.starts_with(PENDING_SEGMENTS_PREFIX)
}

fn default_block_size() -> u64 {
    DEFAULT_BLOCK_SIZE
}

/// Construction parameters of an [`S3Directory`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3DirectoryConfig {
    pub bucket: String,
    /// Common leading string of every remote key owned by the directory.
    /// Normalized to end in exactly one `/`.
    #[serde(default)]
    pub prefix: String,
    /// Local directory holding buffered files and sparse cache files.
    /// Created if absent.
    pub local_cache_path: PathBuf,
    /// Size of the read-cache block. Unit of cache presence.
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Ratio of the index the engine is allowed to pack into compound
    /// segment files. Kept at 0.0 so every logical file stays independently
    /// rangeable; the directory only exposes the knob.
    #[serde(default)]
    pub no_cfs_ratio: f64,
}

/// The state of one logical file. Names absent from the state table exist
/// only remotely.
#[derive(Clone)]
enum FileState {
    /// Exists only in the local cache directory; not uploaded yet.
    Buffered,
    /// Uploaded, and the complete local copy is authoritative.
    Synced,
    /// Exists remotely; the blocks listed in the map are present in the
    /// local sparse file.
    Cached(Arc<BlockMap>),
}

/// A file-namespace facade over an object store, for a segment-based search
/// index engine.
///
/// New files are buffered locally until the engine syncs them. Remote files
/// are served through a block-addressable read cache. The engine's commit
/// sequence (write files → `sync` → `rename` → `sync_meta_data`) maps onto
/// the store as upload → server-side copy + delete → upload-of-renamed.
pub struct S3Directory {
    object_store: Arc<dyn ObjectStore>,
    fs_cache: FsCache,
    block_size: u64,
    no_cfs_ratio: f64,
    is_open: AtomicBool,
    states: Mutex<HashMap<String, FileState>>,
    /// Names renamed since the last `sync_meta_data`.
    renamed: Mutex<HashSet<String>>,
    open_writers: WriterRegistry,
    temp_counter: AtomicU64,
}

impl S3Directory {
    /// Opens a directory over `s3://{bucket}/{prefix}`.
    pub async fn open(
        directory_config: &S3DirectoryConfig,
        s3_config: &S3Config,
    ) -> DirectoryResult<S3Directory> {
        let object_store = Arc::new(
            S3ObjectStore::new(s3_config, &directory_config.bucket, &directory_config.prefix)
                .await,
        );
        Self::open_with_store(
            object_store,
            &directory_config.local_cache_path,
            directory_config.block_size,
            directory_config.no_cfs_ratio,
        )
        .await
    }

    /// Opens a directory over an arbitrary object store.
    pub async fn open_with_store(
        object_store: Arc<dyn ObjectStore>,
        local_cache_path: &Path,
        block_size: u64,
        no_cfs_ratio: f64,
    ) -> DirectoryResult<S3Directory> {
        assert!(block_size > 0, "block_size must be positive");
        let fs_cache = FsCache::open(local_cache_path).await?;
        let remote_entries = object_store.list().await?;

        // Local files with no remote counterpart are buffer leftovers of a
        // previous process and are dropped. Files that do exist remotely are
        // kept on disk as warm shells; their bytes are re-fetched block by
        // block since the presence map starts empty.
        let remote_names: HashSet<&str> = remote_entries
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        for local_name in fs_cache.list_all().await? {
            if !remote_names.contains(local_name.as_str()) {
                debug!(name = %local_name, "removing orphan local file");
                fs_cache.delete(&local_name).await?;
            }
        }

        let warmed_objects =
            prepopulate::warm_up_cache(&object_store, &fs_cache, &remote_entries, block_size)
                .await;
        let states: HashMap<String, FileState> = warmed_objects
            .into_iter()
            .map(|(name, block_map)| (name, FileState::Cached(block_map)))
            .collect();
        info!(
            uri = %object_store.uri(),
            num_remote_objects = remote_entries.len(),
            block_size = block_size,
            "opened directory"
        );
        Ok(S3Directory {
            object_store,
            fs_cache,
            block_size,
            no_cfs_ratio,
            is_open: AtomicBool::new(true),
            states: Mutex::new(states),
            renamed: Mutex::new(HashSet::new()),
            open_writers: Arc::new(Mutex::new(HashSet::new())),
            temp_counter: AtomicU64::new(0),
        })
    }

    fn ensure_open(&self) -> DirectoryResult<()> {
        if self.is_open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(DirectoryError::Closed)
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Compound-file ratio the engine's merge policy should use. 0.0 keeps
    /// segment files standalone.
    pub fn no_cfs_ratio(&self) -> f64 {
        self.no_cfs_ratio
    }

    /// Present blocks of a Cached file, if the name is in Cached state.
    pub fn cached_blocks(&self, name: &str) -> Option<Arc<BlockMap>> {
        match self.states.lock().unwrap().get(name) {
            Some(FileState::Cached(block_map)) => Some(block_map.clone()),
            _ => None,
        }
    }

    /// Lists every logical file: the union of the remote objects and the
    /// buffered names, deduplicated, in UTF-16 code-unit order.
    pub async fn list_all(&self) -> DirectoryResult<Vec<String>> {
        self.ensure_open()?;
        let mut names: Vec<String> = self
            .object_store
            .list()
            .await?
            .into_iter()
            .map(|(name, _size)| name)
            .collect();
        {
            let states = self.states.lock().unwrap();
            names.extend(
                states
                    .iter()
                    .filter(|(_, state)| matches!(state, FileState::Buffered))
                    .map(|(name, _)| name.clone()),
            );
        }
        names.sort_unstable_by(|left, right| utf16_code_unit_cmp(left, right));
        names.dedup();
        debug!(names = ?names, "list_all");
        Ok(names)
    }

    pub async fn file_length(&self, name: &str) -> DirectoryResult<u64> {
        self.ensure_open()?;
        let is_local = self.states.lock().unwrap().contains_key(name);
        if is_local {
            // For a Cached name this is the sparse file's logical length,
            // which equals the remote length.
            self.fs_cache.file_length(name).await
        } else {
            let num_bytes = self.object_store.file_num_bytes(name).await?;
            Ok(num_bytes)
        }
    }

    /// Opens a buffered writer for a new file. Fails if the name already has
    /// a local file.
    pub async fn create_output(&self, name: &str) -> DirectoryResult<IndexOutput> {
        self.ensure_open()?;
        let output = self
            .fs_cache
            .create_output(name, self.open_writers.clone())
            .await?;
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), FileState::Buffered);
        Ok(output)
    }

    /// Opens a buffered writer under a fresh, reserved temp name of the form
    /// `<prefix>_<counter><suffix>tmp`. Retries on collision.
    pub async fn create_temp_output(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> DirectoryResult<IndexOutput> {
        self.ensure_open()?;
        loop {
            let counter = self.temp_counter.fetch_add(1, Ordering::Relaxed);
            let name = format!("{prefix}_{counter}{suffix}{TEMP_SUFFIX}");
            match self
                .fs_cache
                .create_output(&name, self.open_writers.clone())
                .await
            {
                Ok(output) => {
                    self.states
                        .lock()
                        .unwrap()
                        .insert(name, FileState::Buffered);
                    return Ok(output);
                }
                Err(DirectoryError::Io(io_err)) if io_err.kind() == ErrorKind::AlreadyExists => {
                    continue;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Opens a reader over `name`.
    ///
    /// Buffered and Synced files are read from their complete local copy.
    /// Anything else goes through the block cache; opening a Remote-only
    /// name transitions it to Cached.
    #[instrument(level = "debug", skip(self))]
    pub async fn open_input(&self, name: &str) -> DirectoryResult<Box<dyn IndexInput>> {
        self.ensure_open()?;
        enum Route {
            Local,
            Cached { block_map: Arc<BlockMap>, created: bool },
        }
        let route = {
            let mut states = self.states.lock().unwrap();
            match states.get(name) {
                Some(FileState::Buffered) | Some(FileState::Synced) => Route::Local,
                Some(FileState::Cached(block_map)) => Route::Cached {
                    block_map: block_map.clone(),
                    created: false,
                },
                None => {
                    let block_map = Arc::new(BlockMap::default());
                    states.insert(name.to_string(), FileState::Cached(block_map.clone()));
                    Route::Cached {
                        block_map,
                        created: true,
                    }
                }
            }
        };
        match route {
            Route::Local => {
                let input = self.fs_cache.open_input(name).await?;
                Ok(Box::new(input))
            }
            Route::Cached { block_map, created } => {
                let open_res = S3IndexInput::open(
                    name,
                    self.object_store.clone(),
                    &self.fs_cache,
                    block_map,
                    self.block_size,
                )
                .await;
                match open_res {
                    Ok(input) => Ok(Box::new(input)),
                    Err(error) => {
                        // a speculative Cached entry for a missing file must
                        // not survive, or the state table would report a
                        // name the directory does not list
                        if created {
                            self.states.lock().unwrap().remove(name);
                        }
                        Err(error)
                    }
                }
            }
        }
    }

    /// Makes the named buffered files durable by uploading them. Temp files
    /// are silently skipped.
    #[instrument(level = "debug", skip(self))]
    pub async fn sync(&self, names: &[&str]) -> DirectoryResult<()> {
        self.ensure_open()?;
        let uploads: Vec<FileTransfer> = {
            let states = self.states.lock().unwrap();
            names
                .iter()
                .filter(|name| !is_temp_file(name))
                .filter(|name| matches!(states.get(**name), Some(FileState::Buffered)))
                .map(|name| FileTransfer {
                    name: name.to_string(),
                    local_path: self.fs_cache.resolve_path(name),
                })
                .collect()
        };
        if uploads.is_empty() {
            return Ok(());
        }
        self.object_store.bulk_upload(&uploads).await?;
        let mut states = self.states.lock().unwrap();
        for upload in &uploads {
            if let Some(state) = states.get_mut(&upload.name) {
                *state = FileState::Synced;
            }
        }
        Ok(())
    }

    /// Renames a file. On the store a rename is a server-side copy followed
    /// by a delete. The destination is remembered for the next
    /// `sync_meta_data`.
    #[instrument(level = "debug", skip(self))]
    pub async fn rename(&self, from: &str, to: &str) -> DirectoryResult<()> {
        self.ensure_open()?;
        if self.open_writers.lock().unwrap().contains(from) {
            return Err(DirectoryError::RenameOpenWriter(from.to_string()));
        }
        let state_opt = self.states.lock().unwrap().get(from).cloned();
        match state_opt {
            Some(FileState::Buffered) => {
                self.fs_cache.rename(from, to).await?;
            }
            Some(FileState::Synced) | Some(FileState::Cached(_)) => {
                self.fs_cache.rename(from, to).await?;
                self.object_store.copy(from, to).await?;
                self.object_store.delete(from).await?;
            }
            None => {
                self.object_store.copy(from, to).await?;
                self.object_store.delete(from).await?;
            }
        }
        {
            let mut states = self.states.lock().unwrap();
            if let Some(state) = states.remove(from) {
                states.insert(to.to_string(), state);
            }
        }
        self.renamed.lock().unwrap().insert(to.to_string());
        Ok(())
    }

    /// Uploads whatever was renamed since the last flush and is still only
    /// local.
    ///
    /// The engine renames its pending segments file to its committed name as
    /// the visibility barrier of a commit; uploading at that barrier makes
    /// remote visibility match commit semantics.
    #[instrument(level = "debug", skip(self))]
    pub async fn sync_meta_data(&self) -> DirectoryResult<()> {
        self.ensure_open()?;
        let renamed_names: Vec<String> = self.renamed.lock().unwrap().iter().cloned().collect();
        let uploads: Vec<FileTransfer> = {
            let states = self.states.lock().unwrap();
            renamed_names
                .iter()
                .filter(|name| matches!(states.get(*name), Some(FileState::Buffered)))
                .map(|name| FileTransfer {
                    name: name.clone(),
                    local_path: self.fs_cache.resolve_path(name),
                })
                .collect()
        };
        if !uploads.is_empty() {
            self.object_store.bulk_upload(&uploads).await?;
            let mut states = self.states.lock().unwrap();
            for upload in &uploads {
                if let Some(state) = states.get_mut(&upload.name) {
                    *state = FileState::Synced;
                }
            }
        }
        self.renamed.lock().unwrap().clear();
        Ok(())
    }

    /// Deletes a file from every tier that holds it.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete_file(&self, name: &str) -> DirectoryResult<()> {
        self.ensure_open()?;
        let state_opt = self.states.lock().unwrap().remove(name);
        self.renamed.lock().unwrap().remove(name);
        match state_opt {
            Some(FileState::Buffered) => {
                // never uploaded, nothing to delete remotely
                self.fs_cache.delete(name).await?;
            }
            Some(FileState::Synced) | Some(FileState::Cached(_)) => {
                self.fs_cache.delete(name).await?;
                self.object_store.delete(name).await?;
            }
            None => {
                self.object_store.delete(name).await?;
            }
        }
        Ok(())
    }

    /// Takes the engine's advisory write lock.
    pub fn obtain_lock(&self, name: &str) -> DirectoryResult<DirectoryLock> {
        self.ensure_open()?;
        self.fs_cache.obtain_lock(name)
    }

    /// Deletions are never deferred.
    pub fn get_pending_deletions(&self) -> HashSet<String> {
        HashSet::new()
    }

    /// Closes the directory. Every subsequent operation fails.
    pub fn close(&self) {
        info!(uri = %self.object_store.uri(), "closing directory");
        self.is_open.store(false, Ordering::Release);
        self.states.lock().unwrap().clear();
        self.renamed.lock().unwrap().clear();
    }
}

impl fmt::Debug for S3Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Directory")
            .field("uri", self.object_store.uri())
            .field("block_size", &self.block_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use searchfs_storage::RamObjectStore;

    use super::*;

    async fn empty_directory(local_cache_path: &Path) -> S3Directory {
        S3Directory::open_with_store(
            Arc::new(RamObjectStore::default()),
            local_cache_path,
            1024,
            0.0,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_is_temp_file() {
        assert!(is_temp_file("_0.cfs_42tmp"));
        assert!(is_temp_file("pending_segments_1"));
        assert!(!is_temp_file("segments_1"));
        assert!(!is_temp_file("_0.tmp.cfs"));
    }

    #[tokio::test]
    async fn test_temp_output_names_are_reserved_and_retry_on_collision() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = empty_directory(temp_dir.path()).await;

        let mut first = directory.create_temp_output("_0", ".cfs").await.unwrap();
        assert_eq!(first.name(), "_0_0.cfstmp");
        first.close().await.unwrap();

        // occupy the next counter value behind the directory's back
        std::fs::write(temp_dir.path().join("_0_1.cfstmp"), b"squatter").unwrap();
        let mut second = directory.create_temp_output("_0", ".cfs").await.unwrap();
        assert_eq!(second.name(), "_0_2.cfstmp");
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = empty_directory(temp_dir.path()).await;
        directory.close();

        assert!(matches!(
            directory.list_all().await.unwrap_err(),
            DirectoryError::Closed
        ));
        assert!(matches!(
            directory.create_output("x").await.unwrap_err(),
            DirectoryError::Closed
        ));
        assert!(matches!(
            directory.open_input("x").await.unwrap_err(),
            DirectoryError::Closed
        ));
        assert!(matches!(
            directory.sync(&["x"]).await.unwrap_err(),
            DirectoryError::Closed
        ));
        assert!(matches!(
            directory.rename("x", "y").await.unwrap_err(),
            DirectoryError::Closed
        ));
        assert!(matches!(
            directory.sync_meta_data().await.unwrap_err(),
            DirectoryError::Closed
        ));
        assert!(matches!(
            directory.delete_file("x").await.unwrap_err(),
            DirectoryError::Closed
        ));
        assert!(matches!(
            directory.obtain_lock("write.lock").unwrap_err(),
            DirectoryError::Closed
        ));
    }

    #[tokio::test]
    async fn test_create_output_twice_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = empty_directory(temp_dir.path()).await;

        let mut output = directory.create_output("_0.fdt").await.unwrap();
        output.close().await.unwrap();
        let create_err = directory.create_output("_0.fdt").await.unwrap_err();
        assert!(matches!(create_err, DirectoryError::Io(_)));
    }

    #[tokio::test]
    async fn test_rename_of_open_writer_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = empty_directory(temp_dir.path()).await;

        let mut output = directory.create_output("_0.fdt").await.unwrap();
        let rename_err = directory.rename("_0.fdt", "_1.fdt").await.unwrap_err();
        assert!(matches!(rename_err, DirectoryError::RenameOpenWriter(_)));

        output.close().await.unwrap();
        directory.rename("_0.fdt", "_1.fdt").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_pending_deletions_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = empty_directory(temp_dir.path()).await;
        assert!(directory.get_pending_deletions().is_empty());
    }

    #[tokio::test]
    async fn test_open_input_of_missing_file_leaves_no_state_behind() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = empty_directory(temp_dir.path()).await;

        let open_err = directory.open_input("ghost.bin").await.unwrap_err();
        assert!(open_err.is_not_found());
        assert!(directory.cached_blocks("ghost.bin").is_none());
        assert!(directory.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_config_defaults() {
        let config: S3DirectoryConfig = serde_json::from_str(
            r#"{"bucket": "my-index", "local_cache_path": "/var/cache/searchfs"}"#,
        )
        .unwrap();
        assert_eq!(config.prefix, "");
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.no_cfs_ratio, 0.0);
    }
}
