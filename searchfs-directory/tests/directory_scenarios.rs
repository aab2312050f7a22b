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

//! End-to-end write/commit/read scenarios of the directory, driven against
//! an in-memory object store.

use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use searchfs_common::uri::Uri;
use searchfs_directory::{IndexInput, S3Directory};
use searchfs_storage::{
    FileTransfer, ObjectStore, OwnedBytes, PutPayload, RamObjectStore, StorageResult,
};

const BLOCK_SIZE: u64 = 1024;

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn open_directory(
    object_store: Arc<dyn ObjectStore>,
    local_cache_path: &Path,
) -> S3Directory {
    S3Directory::open_with_store(object_store, local_cache_path, BLOCK_SIZE, 0.0)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_write_commit_cycle() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ram_store = Arc::new(RamObjectStore::default());
    let directory = open_directory(ram_store.clone(), temp_dir.path()).await;

    let payload: Vec<u8> = (0u16..256)
        .map(|value| value as u8)
        .collect::<Vec<u8>>()
        .repeat(10);
    assert_eq!(payload.len(), 2560);

    let mut output = directory.create_output("seg.fdt").await.unwrap();
    output.write_bytes(&payload).await.unwrap();
    output.close().await.unwrap();

    directory.sync(&["seg.fdt"]).await.unwrap();

    let remote_bytes = ram_store.get_range("seg.fdt", 0..2560).await.unwrap();
    assert_eq!(remote_bytes.as_slice(), &payload[..]);
    assert_eq!(ram_store.file_num_bytes("seg.fdt").await.unwrap(), 2560);
    assert_eq!(directory.list_all().await.unwrap(), vec!["seg.fdt"]);
    assert_eq!(directory.file_length("seg.fdt").await.unwrap(), 2560);
}

#[tokio::test]
async fn test_cold_random_read() {
    let temp_dir = tempfile::tempdir().unwrap();
    let payload = pattern_bytes(10_000);
    let ram_store = Arc::new(RamObjectStore::builder().put("big.bin", &payload).build());
    let directory = open_directory(ram_store, temp_dir.path()).await;

    let mut input = directory.open_input("big.bin").await.unwrap();
    input.seek(5000).unwrap();
    let mut buf = vec![0u8; 100];
    input.read_bytes(&mut buf).await.unwrap();
    for (pos, byte) in buf.iter().enumerate() {
        assert_eq!(*byte, ((5000 + pos) % 251) as u8);
    }

    // first and last blocks were pre-populated, the middle one was fetched
    // by the read
    let blocks = directory.cached_blocks("big.bin").unwrap().snapshot();
    assert!(blocks.contains(&0));
    assert!(blocks.contains(&4));
    assert!(blocks.contains(&9));
}

#[tokio::test]
async fn test_slice_correctness() {
    let temp_dir = tempfile::tempdir().unwrap();
    let payload = pattern_bytes(10_000);
    let ram_store = Arc::new(RamObjectStore::builder().put("big.bin", &payload).build());
    let directory = open_directory(ram_store, temp_dir.path()).await;

    let mut input = directory.open_input("big.bin").await.unwrap();
    input.seek(5000).unwrap();

    let mut slice = input.slice("s", 2000, 4000).unwrap();
    slice.seek(0).unwrap();
    let mut buf = vec![0u8; 4000];
    slice.read_bytes(&mut buf).await.unwrap();
    assert_eq!(&buf[..], &payload[2000..6000]);
    assert_eq!(input.file_pointer(), 5000);
}

#[tokio::test]
async fn test_rename_visibility_of_synced_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ram_store = Arc::new(RamObjectStore::default());
    let directory = open_directory(ram_store.clone(), temp_dir.path()).await;

    let mut output = directory.create_output("pending.seg").await.unwrap();
    output.write_bytes(&[0xAA; 100]).await.unwrap();
    output.close().await.unwrap();
    directory.sync(&["pending.seg"]).await.unwrap();

    directory.rename("pending.seg", "segments_1").await.unwrap();
    directory.sync_meta_data().await.unwrap();

    let remote_names = ram_store.list_names().await;
    assert!(remote_names.contains(&"segments_1".to_string()));
    assert!(!remote_names.contains(&"pending.seg".to_string()));

    let listed = directory.list_all().await.unwrap();
    assert!(listed.contains(&"segments_1".to_string()));
    assert!(!listed.contains(&"pending.seg".to_string()));

    let mut input = directory.open_input("segments_1").await.unwrap();
    let mut buf = vec![0u8; 100];
    input.read_bytes(&mut buf).await.unwrap();
    assert_eq!(buf, vec![0xAA; 100]);
}

#[tokio::test]
async fn test_rename_of_buffered_file_uploads_at_sync_meta_data() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ram_store = Arc::new(RamObjectStore::default());
    let directory = open_directory(ram_store.clone(), temp_dir.path()).await;

    let mut output = directory.create_output("pending_segments_1").await.unwrap();
    output.write_bytes(b"commit point").await.unwrap();
    output.close().await.unwrap();

    directory
        .rename("pending_segments_1", "segments_1")
        .await
        .unwrap();
    // renamed but never passed to sync: nothing uploaded yet
    assert!(ram_store.list_names().await.is_empty());

    directory.sync_meta_data().await.unwrap();
    assert_eq!(ram_store.list_names().await, vec!["segments_1".to_string()]);
    assert_eq!(
        ram_store
            .get_range("segments_1", 0..12)
            .await
            .unwrap()
            .as_slice(),
        b"commit point"
    );
}

#[tokio::test]
async fn test_rename_of_remote_only_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let payload = pattern_bytes(3000);
    let ram_store = Arc::new(RamObjectStore::default());
    let directory = open_directory(ram_store.clone(), temp_dir.path()).await;

    // the object appears remotely after open, so the directory has no local
    // state for it
    ram_store
        .put("old.bin", Box::new(payload.clone()))
        .await
        .unwrap();
    directory.rename("old.bin", "new.bin").await.unwrap();

    let remote_names = ram_store.list_names().await;
    assert_eq!(remote_names, vec!["new.bin".to_string()]);

    let mut input = directory.open_input("new.bin").await.unwrap();
    let mut buf = vec![0u8; 3000];
    input.read_bytes(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_delete_of_cached_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let payload = pattern_bytes(5000);
    let ram_store = Arc::new(RamObjectStore::builder().put("x", &payload).build());
    let directory = open_directory(ram_store.clone(), temp_dir.path()).await;

    // warmed up: "x" is Cached with blocks {0, 4} on disk
    assert!(directory.cached_blocks("x").is_some());
    let sparse_path = temp_dir.path().join("x");
    assert!(sparse_path.exists());

    directory.delete_file("x").await.unwrap();

    assert!(!sparse_path.exists());
    assert!(directory.cached_blocks("x").is_none());
    assert!(ram_store.list_names().await.is_empty());

    let open_err = directory.open_input("x").await.unwrap_err();
    assert!(open_err.is_not_found());
}

#[tokio::test]
async fn test_temp_files_are_never_uploaded() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ram_store = Arc::new(RamObjectStore::default());
    let directory = open_directory(ram_store.clone(), temp_dir.path()).await;

    let mut temp_output = directory.create_temp_output("_0", ".pos").await.unwrap();
    temp_output.write_bytes(b"scratch").await.unwrap();
    let temp_name = temp_output.name().to_string();
    temp_output.close().await.unwrap();

    let mut pending_output = directory.create_output("pending_segments_1").await.unwrap();
    pending_output.write_bytes(b"pending").await.unwrap();
    pending_output.close().await.unwrap();

    directory
        .sync(&[temp_name.as_str(), "pending_segments_1"])
        .await
        .unwrap();
    assert!(ram_store.list_names().await.is_empty());
}

#[tokio::test]
async fn test_list_all_is_sorted_and_deduplicated() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ram_store = Arc::new(
        RamObjectStore::builder()
            .put("_0.si", b"a")
            .put("_10.si", b"b")
            .put("_2.si", b"c")
            .build(),
    );
    let directory = open_directory(ram_store, temp_dir.path()).await;

    // one synced file (present locally AND remotely) plus one buffered file
    let mut synced_output = directory.create_output("_1.si").await.unwrap();
    synced_output.write_bytes(b"d").await.unwrap();
    synced_output.close().await.unwrap();
    directory.sync(&["_1.si"]).await.unwrap();

    let mut buffered_output = directory.create_output("_1.fdt").await.unwrap();
    buffered_output.write_bytes(b"e").await.unwrap();
    buffered_output.close().await.unwrap();

    let names = directory.list_all().await.unwrap();
    assert_eq!(names, vec!["_0.si", "_1.fdt", "_1.si", "_10.si", "_2.si"]);
}

#[tokio::test]
async fn test_file_length_per_state() {
    let temp_dir = tempfile::tempdir().unwrap();
    let payload = pattern_bytes(4321);
    let ram_store = Arc::new(RamObjectStore::builder().put("cached.bin", &payload).build());
    let directory = open_directory(ram_store.clone(), temp_dir.path()).await;

    // Cached: the sparse file's logical length equals the remote length
    assert_eq!(directory.file_length("cached.bin").await.unwrap(), 4321);

    let mut output = directory.create_output("buffered.bin").await.unwrap();
    output.write_bytes(&[1u8; 17]).await.unwrap();
    output.close().await.unwrap();
    assert_eq!(directory.file_length("buffered.bin").await.unwrap(), 17);

    directory.sync(&["buffered.bin"]).await.unwrap();
    assert_eq!(directory.file_length("buffered.bin").await.unwrap(), 17);

    let missing_err = directory.file_length("missing.bin").await.unwrap_err();
    assert!(missing_err.is_not_found());
}

/// Counts range GETs so warm-up effectiveness is observable.
#[derive(Debug)]
struct CountingObjectStore {
    inner: RamObjectStore,
    num_get_range_calls: AtomicU64,
}

impl CountingObjectStore {
    fn new(inner: RamObjectStore) -> Self {
        Self {
            inner,
            num_get_range_calls: AtomicU64::new(0),
        }
    }

    fn get_range_calls(&self) -> u64 {
        self.num_get_range_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStore for CountingObjectStore {
    async fn check_connectivity(&self) -> anyhow::Result<()> {
        self.inner.check_connectivity().await
    }

    async fn list(&self) -> StorageResult<Vec<(String, u64)>> {
        self.inner.list().await
    }

    async fn file_num_bytes(&self, name: &str) -> StorageResult<u64> {
        self.inner.file_num_bytes(name).await
    }

    async fn get_range(&self, name: &str, range: Range<u64>) -> StorageResult<OwnedBytes> {
        self.num_get_range_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.get_range(name, range).await
    }

    async fn copy_to_file(&self, name: &str, output_path: &Path) -> StorageResult<u64> {
        self.inner.copy_to_file(name, output_path).await
    }

    async fn put(&self, name: &str, payload: Box<dyn PutPayload>) -> StorageResult<()> {
        self.inner.put(name, payload).await
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.copy(from, to).await
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        self.inner.delete(name).await
    }

    async fn bulk_upload(&self, uploads: &[FileTransfer]) -> StorageResult<()> {
        self.inner.bulk_upload(uploads).await
    }

    async fn bulk_download(&self, downloads: &[FileTransfer]) -> StorageResult<()> {
        self.inner.bulk_download(downloads).await
    }

    fn uri(&self) -> &Uri {
        self.inner.uri()
    }
}

#[tokio::test]
async fn test_prepopulation_makes_initial_reads_free() {
    let temp_dir = tempfile::tempdir().unwrap();
    let small_payload = pattern_bytes(600);
    let large_payload = pattern_bytes(2000);
    let counting_store = Arc::new(CountingObjectStore::new(
        RamObjectStore::builder()
            .put("small.bin", &small_payload)
            .put("large.bin", &large_payload)
            .build(),
    ));
    let directory = open_directory(counting_store.clone(), temp_dir.path()).await;

    // one GET for the single-block object, two for the two-block object
    assert_eq!(counting_store.get_range_calls(), 3);
    assert_eq!(
        directory
            .cached_blocks("small.bin")
            .unwrap()
            .snapshot()
            .into_iter()
            .collect::<Vec<_>>(),
        vec![0]
    );
    assert_eq!(
        directory
            .cached_blocks("large.bin")
            .unwrap()
            .snapshot()
            .into_iter()
            .collect::<Vec<_>>(),
        vec![0, 1]
    );

    // reads confined to the warmed blocks issue no further GETs
    let mut small_input = directory.open_input("small.bin").await.unwrap();
    let mut buf = vec![0u8; 600];
    small_input.read_bytes(&mut buf).await.unwrap();
    assert_eq!(buf, small_payload);

    let mut large_input = directory.open_input("large.bin").await.unwrap();
    large_input.seek(1500).unwrap();
    let mut tail_buf = vec![0u8; 500];
    large_input.read_bytes(&mut tail_buf).await.unwrap();
    assert_eq!(&tail_buf[..], &large_payload[1500..]);

    assert_eq!(counting_store.get_range_calls(), 3);
}

#[tokio::test]
async fn test_stale_local_shell_is_resized_and_refetched() {
    let temp_dir = tempfile::tempdir().unwrap();
    // a previous process left a shell with the wrong length and garbage
    // bytes
    std::fs::write(temp_dir.path().join("seg.bin"), vec![0xFFu8; 999]).unwrap();

    let payload = pattern_bytes(3000);
    let ram_store = Arc::new(RamObjectStore::builder().put("seg.bin", &payload).build());
    let directory = open_directory(ram_store, temp_dir.path()).await;

    assert_eq!(directory.file_length("seg.bin").await.unwrap(), 3000);
    let mut input = directory.open_input("seg.bin").await.unwrap();
    let mut buf = vec![0u8; 3000];
    input.read_bytes(&mut buf).await.unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_orphan_local_files_are_dropped_on_open() {
    let temp_dir = tempfile::tempdir().unwrap();
    std::fs::write(temp_dir.path().join("orphan.tmp"), b"leftover").unwrap();

    let ram_store = Arc::new(RamObjectStore::default());
    let directory = open_directory(ram_store, temp_dir.path()).await;

    assert!(!temp_dir.path().join("orphan.tmp").exists());
    assert!(directory.list_all().await.unwrap().is_empty());
}
