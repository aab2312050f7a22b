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
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use searchfs_storage::ObjectStore;
use tracing::debug;

use crate::block::{block_byte_range, block_containing, last_block, BlockMap};
use crate::error::{DirectoryError, DirectoryResult};
use crate::fs_cache::FsCache;
use crate::local_file::LocalFile;

/// Random-access reader over one logical file.
///
/// A reader has an independent position within its window. Slices share the
/// parent's underlying file handle; the handle is released once the root
/// reader and every slice are dropped.
#[async_trait]
pub trait IndexInput: Send + Sync + fmt::Debug {
    /// Length of this reader's window.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current position, relative to the window.
    fn file_pointer(&self) -> u64;

    /// Moves the position to `pos`, relative to the window.
    fn seek(&mut self, pos: u64) -> DirectoryResult<()>;

    async fn read_byte(&mut self) -> DirectoryResult<u8>;

    /// Reads exactly `buffer.len()` bytes at the current position and
    /// advances it.
    async fn read_bytes(&mut self, buffer: &mut [u8]) -> DirectoryResult<()>;

    /// Returns a reader over the `[offset, offset + length)` window of this
    /// reader, with an independent position starting at 0.
    fn slice(
        &self,
        description: &str,
        offset: u64,
        length: u64,
    ) -> DirectoryResult<Box<dyn IndexInput>>;
}

fn check_seek(pos: u64, window_len: u64) -> DirectoryResult<()> {
    if pos > window_len {
        return Err(DirectoryError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("seek to {pos} is past the end of the {window_len}-byte window"),
        )));
    }
    Ok(())
}

fn check_read(position: u64, read_len: usize, window_len: u64) -> DirectoryResult<()> {
    if position + read_len as u64 > window_len {
        return Err(DirectoryError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "read of {read_len} bytes at position {position} is past the end of the \
                 {window_len}-byte window"
            ),
        )));
    }
    Ok(())
}

fn check_slice(offset: u64, length: u64, window_len: u64) -> DirectoryResult<()> {
    if offset + length > window_len {
        return Err(DirectoryError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("slice [{offset}, {}) is out of the {window_len}-byte window", offset + length),
        )));
    }
    Ok(())
}

/// Reader over a fully-present local file (Buffered or Synced state).
pub struct FsIndexInput {
    name: String,
    file: Arc<LocalFile>,
    slice_offset: u64,
    length: u64,
    position: u64,
}

impl FsIndexInput {
    pub(crate) async fn open(name: &str, path: &Path) -> DirectoryResult<FsIndexInput> {
        let file = LocalFile::open_read(path).await?;
        let length = file.len()?;
        Ok(FsIndexInput {
            name: name.to_string(),
            file: Arc::new(file),
            slice_offset: 0,
            length,
            position: 0,
        })
    }
}

#[async_trait]
impl IndexInput for FsIndexInput {
    fn len(&self) -> u64 {
        self.length
    }

    fn file_pointer(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: u64) -> DirectoryResult<()> {
        check_seek(pos, self.length)?;
        self.position = pos;
        Ok(())
    }

    async fn read_byte(&mut self) -> DirectoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf).await?;
        Ok(buf[0])
    }

    async fn read_bytes(&mut self, buffer: &mut [u8]) -> DirectoryResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        check_read(self.position, buffer.len(), self.length)?;
        let absolute_offset = self.slice_offset + self.position;
        let bytes = self
            .file
            .read_exact_at(absolute_offset, buffer.len())
            .await?;
        buffer.copy_from_slice(&bytes);
        self.position += buffer.len() as u64;
        Ok(())
    }

    fn slice(
        &self,
        _description: &str,
        offset: u64,
        length: u64,
    ) -> DirectoryResult<Box<dyn IndexInput>> {
        check_slice(offset, length, self.length)?;
        Ok(Box::new(FsIndexInput {
            name: self.name.clone(),
            file: self.file.clone(),
            slice_offset: self.slice_offset + offset,
            length,
            position: 0,
        }))
    }
}

impl fmt::Debug for FsIndexInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FsIndexInput(name={:?}, offset={}, len={})",
            self.name, self.slice_offset, self.length
        )
    }
}

/// Block-cached reader over a remote file.
///
/// The file's body lives remotely; a local sparse file of the same logical
/// length caches whatever blocks have been fetched. Every read first makes
/// the blocks it touches resident, then reads the bytes from the sparse
/// file. The block-presence map is shared with sibling slices, so a block
/// fetched through one slice is a hit for all the others.
pub struct S3IndexInput {
    name: String,
    object_store: Arc<dyn ObjectStore>,
    sparse_file: Arc<LocalFile>,
    block_map: Arc<BlockMap>,
    block_size: u64,
    total_length: u64,
    slice_offset: u64,
    length: u64,
    position: u64,
}

impl S3IndexInput {
    /// Opens the root reader for `name`.
    ///
    /// Sizes the sparse file to the remote length if it does not match:
    /// the last block is fetched and written, which both places the footer
    /// bytes and extends the file over a hole. The written block is not
    /// recorded in the presence map here; the warm-up pass is responsible
    /// for what it marks, and a later read of the block fetches it again.
    pub(crate) async fn open(
        name: &str,
        object_store: Arc<dyn ObjectStore>,
        fs_cache: &FsCache,
        block_map: Arc<BlockMap>,
        block_size: u64,
    ) -> DirectoryResult<S3IndexInput> {
        let total_length = object_store.file_num_bytes(name).await?;
        let sparse_file = LocalFile::open_rw(&fs_cache.resolve_path(name)).await?;
        if sparse_file.len()? != total_length {
            if total_length > 0 {
                let last_block_range =
                    block_byte_range(last_block(total_length, block_size), block_size, total_length);
                let bytes = object_store
                    .get_range(name, last_block_range.clone())
                    .await?;
                let expected = last_block_range.end - last_block_range.start;
                if bytes.len() as u64 != expected {
                    return Err(DirectoryError::Consistency {
                        name: name.to_string(),
                        expected,
                        actual: bytes.len() as u64,
                    });
                }
                sparse_file
                    .write_all_at(last_block_range.start, bytes.to_vec())
                    .await?;
            }
            sparse_file.set_len(total_length).await?;
        }
        debug!(name = %name, len = total_length, "open block-cached input");
        Ok(S3IndexInput {
            name: name.to_string(),
            object_store,
            sparse_file: Arc::new(sparse_file),
            block_map,
            block_size,
            total_length,
            slice_offset: 0,
            length: total_length,
            position: 0,
        })
    }

    /// Makes every block touched by `[range.start, range.end)` (absolute
    /// file offsets) resident in the sparse file.
    ///
    /// A failed fetch never marks its block present. Two readers racing on
    /// the same absent block may both fetch it; both write the same bytes at
    /// the same offset, so the sparse file stays intact.
    async fn ensure_blocks_resident(&self, range: std::ops::Range<u64>) -> DirectoryResult<()> {
        if range.is_empty() {
            return Ok(());
        }
        let first_block = block_containing(range.start, self.block_size);
        let last_touched_block = block_containing(range.end - 1, self.block_size);
        for block_idx in first_block..=last_touched_block {
            if self.block_map.contains(block_idx) {
                continue;
            }
            let block_range = block_byte_range(block_idx, self.block_size, self.total_length);
            debug!(
                name = %self.name,
                block_idx = block_idx,
                range = ?block_range,
                "block cache miss"
            );
            let bytes = self
                .object_store
                .get_range(&self.name, block_range.clone())
                .await?;
            let expected = block_range.end - block_range.start;
            if bytes.len() as u64 != expected {
                return Err(DirectoryError::Consistency {
                    name: self.name.clone(),
                    expected,
                    actual: bytes.len() as u64,
                });
            }
            self.sparse_file
                .write_all_at(block_range.start, bytes.to_vec())
                .await?;
            self.block_map.insert(block_idx);
        }
        Ok(())
    }
}

#[async_trait]
impl IndexInput for S3IndexInput {
    fn len(&self) -> u64 {
        self.length
    }

    fn file_pointer(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: u64) -> DirectoryResult<()> {
        check_seek(pos, self.length)?;
        self.position = pos;
        Ok(())
    }

    async fn read_byte(&mut self) -> DirectoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf).await?;
        Ok(buf[0])
    }

    async fn read_bytes(&mut self, buffer: &mut [u8]) -> DirectoryResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        check_read(self.position, buffer.len(), self.length)?;
        let absolute_offset = self.slice_offset + self.position;
        // Fill every touched block first so the delegated read never
        // observes a hole.
        self.ensure_blocks_resident(absolute_offset..absolute_offset + buffer.len() as u64)
            .await?;
        let bytes = self
            .sparse_file
            .read_exact_at(absolute_offset, buffer.len())
            .await?;
        buffer.copy_from_slice(&bytes);
        self.position += buffer.len() as u64;
        Ok(())
    }

    fn slice(
        &self,
        description: &str,
        offset: u64,
        length: u64,
    ) -> DirectoryResult<Box<dyn IndexInput>> {
        check_slice(offset, length, self.length)?;
        debug!(name = %self.name, slice = %description, offset = offset, length = length, "slice");
        Ok(Box::new(S3IndexInput {
            name: self.name.clone(),
            object_store: self.object_store.clone(),
            sparse_file: self.sparse_file.clone(),
            block_map: self.block_map.clone(),
            block_size: self.block_size,
            total_length: self.total_length,
            slice_offset: self.slice_offset + offset,
            length,
            position: 0,
        }))
    }
}

impl fmt::Debug for S3IndexInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S3IndexInput(name={:?}, offset={}, len={})",
            self.name, self.slice_offset, self.length
        )
    }
}

#[cfg(test)]
mod tests {
    use searchfs_storage::RamObjectStore;

    use super::*;

    fn pattern_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn cached_input(
        store_payload: &[u8],
        block_size: u64,
        fs_cache: &FsCache,
    ) -> (S3IndexInput, Arc<BlockMap>) {
        let object_store: Arc<dyn ObjectStore> = Arc::new(
            RamObjectStore::builder()
                .put("big.bin", store_payload)
                .build(),
        );
        let block_map = Arc::new(BlockMap::default());
        let input = S3IndexInput::open(
            "big.bin",
            object_store,
            fs_cache,
            block_map.clone(),
            block_size,
        )
        .await
        .unwrap();
        (input, block_map)
    }

    #[tokio::test]
    async fn test_read_equivalence_on_random_offsets() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let payload = pattern_bytes(10_000);
        let (mut input, _block_map) = cached_input(&payload, 1024, &fs_cache).await;

        for (offset, len) in [(0u64, 10usize), (5000, 100), (1020, 10), (9990, 10)] {
            let mut buf = vec![0u8; len];
            input.seek(offset).unwrap();
            input.read_bytes(&mut buf).await.unwrap();
            assert_eq!(&buf[..], &payload[offset as usize..offset as usize + len]);
        }
    }

    #[tokio::test]
    async fn test_miss_marks_touched_blocks_present() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let payload = pattern_bytes(10_000);
        let (mut input, block_map) = cached_input(&payload, 1024, &fs_cache).await;

        let mut buf = vec![0u8; 100];
        input.seek(5000).unwrap();
        input.read_bytes(&mut buf).await.unwrap();
        assert_eq!(
            block_map.snapshot().into_iter().collect::<Vec<_>>(),
            vec![4]
        );
    }

    #[tokio::test]
    async fn test_sequential_read_populates_every_block() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let payload = pattern_bytes(10_000);
        let (mut input, block_map) = cached_input(&payload, 1024, &fs_cache).await;

        let mut full = vec![0u8; 10_000];
        input.read_bytes(&mut full).await.unwrap();
        assert_eq!(full, payload);
        assert_eq!(
            block_map.snapshot().into_iter().collect::<Vec<_>>(),
            (0..10).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_slice_reads_window_and_leaves_parent_position() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let payload = pattern_bytes(10_000);
        let (mut input, _block_map) = cached_input(&payload, 1024, &fs_cache).await;

        input.seek(123).unwrap();
        let mut slice = input.slice("s", 2000, 4000).unwrap();
        assert_eq!(slice.len(), 4000);
        assert_eq!(slice.file_pointer(), 0);

        let mut buf = vec![0u8; 4000];
        slice.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &payload[2000..6000]);
        assert_eq!(slice.file_pointer(), 4000);
        assert_eq!(input.file_pointer(), 123);
    }

    #[tokio::test]
    async fn test_slice_of_slice_composes_offsets() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let payload = pattern_bytes(10_000);
        let (input, _block_map) = cached_input(&payload, 1024, &fs_cache).await;

        let slice = input.slice("outer", 2000, 6000).unwrap();
        let mut inner = slice.slice("inner", 1000, 2000).unwrap();
        let mut buf = vec![0u8; 2000];
        inner.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &payload[3000..5000]);
    }

    #[tokio::test]
    async fn test_sibling_slices_share_the_block_map() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let payload = pattern_bytes(8192);
        let (input, block_map) = cached_input(&payload, 1024, &fs_cache).await;

        let mut left = input.slice("left", 0, 2048).unwrap();
        let mut right = input.slice("right", 4096, 2048).unwrap();
        let mut buf = vec![0u8; 2048];
        left.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &payload[..2048]);
        right.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &payload[4096..6144]);

        assert_eq!(
            block_map.snapshot().into_iter().collect::<Vec<_>>(),
            vec![0, 1, 4, 5]
        );
    }

    #[tokio::test]
    async fn test_read_past_window_end_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let payload = pattern_bytes(100);
        let (mut input, _block_map) = cached_input(&payload, 1024, &fs_cache).await;

        input.seek(90).unwrap();
        let mut buf = vec![0u8; 20];
        let read_err = input.read_bytes(&mut buf).await.unwrap_err();
        assert!(matches!(read_err, DirectoryError::Io(_)));
        assert!(input.seek(101).is_err());
    }

    #[tokio::test]
    async fn test_open_missing_file_is_not_found() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let object_store: Arc<dyn ObjectStore> = Arc::new(RamObjectStore::default());

        let open_err = S3IndexInput::open(
            "missing.bin",
            object_store,
            &fs_cache,
            Arc::new(BlockMap::default()),
            1024,
        )
        .await
        .unwrap_err();
        assert!(open_err.is_not_found());
    }

    #[tokio::test]
    async fn test_open_sizes_sparse_file_to_remote_length() {
        let temp_dir = tempfile::tempdir().unwrap();
        let fs_cache = FsCache::open(temp_dir.path()).await.unwrap();
        let payload = pattern_bytes(2500);
        let (_input, block_map) = cached_input(&payload, 1024, &fs_cache).await;

        assert_eq!(fs_cache.file_length("big.bin").await.unwrap(), 2500);
        // sizing the file is not the same as marking its blocks present
        assert!(block_map.is_empty());
    }
}
