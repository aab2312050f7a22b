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

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use searchfs_storage::ObjectStore;
use tracing::{debug, warn};

use crate::block::{block_byte_range, last_block, BlockMap};
use crate::error::DirectoryResult;
use crate::fs_cache::FsCache;
use crate::local_file::LocalFile;

/// Bound on the number of objects warmed concurrently, so that warming a
/// large index does not exhaust the storage client.
const WARM_UP_CONCURRENCY: usize = 32;

/// Fetches the first and the last block of every remote object into its
/// sparse cache file.
///
/// Segment files carry their codec magic in the head and their checksum
/// footer in the tail, so any initial read almost certainly touches those
/// two blocks; fetching them up front in parallel amortizes the latency.
/// The middle of each file stays on demand.
///
/// Per-object failures are logged and leave the object remote-only; cold
/// reads will fetch lazily.
pub(crate) async fn warm_up_cache(
    object_store: &Arc<dyn ObjectStore>,
    fs_cache: &FsCache,
    remote_entries: &[(String, u64)],
    block_size: u64,
) -> Vec<(String, Arc<BlockMap>)> {
    let warmed_objects: Vec<Option<(String, Arc<BlockMap>)>> =
        stream::iter(remote_entries.iter().map(|(name, size)| {
            let object_store = object_store.clone();
            async move {
                match warm_up_object(&object_store, fs_cache, name, *size, block_size).await {
                    Ok(block_map) => {
                        debug!(name = %name, blocks = ?block_map.snapshot(), "warmed up object");
                        Some((name.clone(), block_map))
                    }
                    Err(error) => {
                        warn!(name = %name, error = %error, "cache warm-up failed for object");
                        None
                    }
                }
            }
        }))
        .buffer_unordered(WARM_UP_CONCURRENCY)
        .collect()
        .await;
    warmed_objects.into_iter().flatten().collect()
}

async fn warm_up_object(
    object_store: &Arc<dyn ObjectStore>,
    fs_cache: &FsCache,
    name: &str,
    size: u64,
    block_size: u64,
) -> DirectoryResult<Arc<BlockMap>> {
    let sparse_file = LocalFile::open_rw(&fs_cache.resolve_path(name)).await?;
    let block_map = Arc::new(BlockMap::default());
    if size == 0 {
        sparse_file.set_len(0).await?;
        return Ok(block_map);
    }
    let first_block_range = block_byte_range(0, block_size, size);
    let last_block_idx = last_block(size, block_size);
    if last_block_idx == 0 {
        let first_bytes = object_store.get_range(name, first_block_range).await?;
        sparse_file.write_all_at(0, first_bytes.to_vec()).await?;
        block_map.insert(0);
    } else {
        let last_block_range = block_byte_range(last_block_idx, block_size, size);
        let (first_bytes, last_bytes) = tokio::try_join!(
            object_store.get_range(name, first_block_range),
            object_store.get_range(name, last_block_range.clone()),
        )?;
        sparse_file.write_all_at(0, first_bytes.to_vec()).await?;
        sparse_file
            .write_all_at(last_block_range.start, last_bytes.to_vec())
            .await?;
        block_map.insert(0);
        block_map.insert(last_block_idx);
    }
    // normalizes stale shells left over from a previous process
    sparse_file.set_len(size).await?;
    Ok(block_map)
}

#[cfg(test)]
mod tests {
    use searchfs_storage::RamObjectStore;

    use super::*;

    #[tokio::test]
    async fn test_warm_up_fetches_first_and_last_blocks() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let object_store: Arc<dyn ObjectStore> = Arc::new(
            RamObjectStore::builder()
                .put("small.bin", &[7u8; 100])
                .put("one_block.bin", &[8u8; 1024])
                .put("large.bin", &vec![9u8; 5000])
                .put("empty.bin", b"")
                .build(),
        );
        let remote_entries = object_store.list().await.unwrap();

        let mut warmed = warm_up_cache(&object_store, &fs_cache, &remote_entries, 1024).await;
        warmed.sort_by(|left, right| left.0.cmp(&right.0));

        let blocks: Vec<(String, Vec<u64>)> = warmed
            .iter()
            .map(|(name, block_map)| {
                (name.clone(), block_map.snapshot().into_iter().collect())
            })
            .collect();
        assert_eq!(
            blocks,
            vec![
                ("empty.bin".to_string(), vec![]),
                ("large.bin".to_string(), vec![0, 4]),
                ("one_block.bin".to_string(), vec![0]),
                ("small.bin".to_string(), vec![0]),
            ]
        );

        // every sparse file is sized to its remote length
        assert_eq!(fs_cache.file_length("small.bin").await.unwrap(), 100);
        assert_eq!(fs_cache.file_length("one_block.bin").await.unwrap(), 1024);
        assert_eq!(fs_cache.file_length("large.bin").await.unwrap(), 5000);
        assert_eq!(fs_cache.file_length("empty.bin").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_warm_up_failure_leaves_object_remote_only() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(RamObjectStore::builder().put("ok.bin", &[1u8; 10]).build());
        // claim an object the store does not have: its warm-up fails, the
        // others proceed
        let remote_entries = vec![
            ("ok.bin".to_string(), 10u64),
            ("ghost.bin".to_string(), 10u64),
        ];

        let warmed = warm_up_cache(&object_store, &fs_cache, &remote_entries, 1024).await;
        assert_eq!(warmed.len(), 1);
        assert_eq!(warmed[0].0, "ok.bin");
    }
}
