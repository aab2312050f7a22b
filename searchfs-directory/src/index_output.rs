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

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::error::{DirectoryError, DirectoryResult};

/// Names with a writer currently open. The directory refuses to rename them.
pub(crate) type WriterRegistry = Arc<Mutex<HashSet<String>>>;

/// Append-only writer bound to one buffered file.
///
/// Bytes go straight to the local file; a rolling CRC32 is accumulated over
/// everything written. The directory's state entry for the name is unchanged
/// by `close`.
pub struct IndexOutput {
    name: String,
    writer: Option<BufWriter<tokio::fs::File>>,
    crc: crc32fast::Hasher,
    bytes_written: u64,
    registry: WriterRegistry,
}

impl IndexOutput {
    pub(crate) async fn create(
        name: &str,
        path: &Path,
        registry: WriterRegistry,
    ) -> std::io::Result<IndexOutput> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        registry.lock().unwrap().insert(name.to_string());
        debug!(name = %name, "create output");
        Ok(IndexOutput {
            name: name.to_string(),
            writer: Some(BufWriter::new(file)),
            crc: crc32fast::Hasher::new(),
            bytes_written: 0,
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of bytes written so far.
    pub fn file_pointer(&self) -> u64 {
        self.bytes_written
    }

    /// CRC32 of everything written so far.
    pub fn checksum(&self) -> u64 {
        self.crc.clone().finalize() as u64
    }

    pub async fn write_byte(&mut self, byte: u8) -> DirectoryResult<()> {
        self.write_bytes(&[byte]).await
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> DirectoryResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DirectoryError::WriterNotOpen(self.name.clone()))?;
        writer.write_all(bytes).await?;
        self.crc.update(bytes);
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flushes and closes the underlying file, releasing the handle.
    pub async fn close(&mut self) -> DirectoryResult<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| DirectoryError::WriterNotOpen(self.name.clone()))?;
        writer.flush().await?;
        writer.into_inner().shutdown().await?;
        self.registry.lock().unwrap().remove(&self.name);
        debug!(name = %self.name, num_bytes = self.bytes_written, "close output");
        Ok(())
    }
}

impl Drop for IndexOutput {
    fn drop(&mut self) {
        self.registry.lock().unwrap().remove(&self.name);
    }
}

impl std::fmt::Debug for IndexOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexOutput")
            .field("name", &self.name)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WriterRegistry {
        Arc::new(Mutex::new(HashSet::new()))
    }

    #[tokio::test]
    async fn test_index_output_writes_and_checksums() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("_0.fdt");
        let mut output = IndexOutput::create("_0.fdt", &path, registry()).await.unwrap();

        output.write_bytes(b"hello ").await.unwrap();
        output.write_bytes(b"world").await.unwrap();
        assert_eq!(output.file_pointer(), 11);
        assert_eq!(output.checksum(), crc32fast::hash(b"hello world") as u64);
        output.close().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_index_output_rejects_write_after_close() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("_0.fdx");
        let mut output = IndexOutput::create("_0.fdx", &path, registry()).await.unwrap();
        output.close().await.unwrap();

        let write_err = output.write_byte(1).await.unwrap_err();
        assert!(matches!(write_err, DirectoryError::WriterNotOpen(_)));
    }

    #[tokio::test]
    async fn test_index_output_registers_open_writer() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("_0.si");
        let writer_registry = registry();
        let mut output = IndexOutput::create("_0.si", &path, writer_registry.clone())
            .await
            .unwrap();
        assert!(writer_registry.lock().unwrap().contains("_0.si"));

        output.close().await.unwrap();
        assert!(!writer_registry.lock().unwrap().contains("_0.si"));
    }

    #[tokio::test]
    async fn test_index_output_refuses_existing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("_0.cfe");
        std::fs::write(&path, b"already there").unwrap();

        let create_err = IndexOutput::create("_0.cfe", &path, registry())
            .await
            .unwrap_err();
        assert_eq!(create_err.kind(), std::io::ErrorKind::AlreadyExists);
    }
}
