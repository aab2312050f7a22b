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

use std::fs::File as StdFile;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::FileExt as StdFileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt as StdFileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::spawn_blocking;

fn read_at_once(file: &StdFile, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    #[cfg(unix)]
    {
        StdFileExt::read_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        StdFileExt::seek_read(file, buf, offset)
    }
}

fn write_at_once(file: &StdFile, buf: &[u8], offset: u64) -> io::Result<usize> {
    #[cfg(unix)]
    {
        StdFileExt::write_at(file, buf, offset)
    }
    #[cfg(windows)]
    {
        StdFileExt::seek_write(file, buf, offset)
    }
}

fn read_at_exact(file: &StdFile, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut num_bytes_read = 0;
    while num_bytes_read < buf.len() {
        let read_len = read_at_once(file, &mut buf[num_bytes_read..], offset + num_bytes_read as u64)?;
        if read_len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_at returned zero bytes",
            ));
        }
        num_bytes_read += read_len;
    }
    Ok(())
}

fn write_at_all(file: &StdFile, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let num_bytes_written = write_at_once(file, buf, offset)?;
        if num_bytes_written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write_at returned zero bytes",
            ));
        }
        offset += num_bytes_written as u64;
        buf = &buf[num_bytes_written..];
    }
    Ok(())
}

/// Shared handle over one local file, read and written at absolute offsets.
///
/// Positional I/O runs on the blocking thread pool. Reads can proceed
/// concurrently; writes are serialized by a per-file mutex so two block
/// fills never interleave.
pub(crate) struct LocalFile {
    path: PathBuf,
    file: Arc<StdFile>,
    write_lock: Mutex<()>,
}

impl LocalFile {
    /// Opens the file read-only.
    pub async fn open_read(path: &Path) -> io::Result<LocalFile> {
        let path = path.to_path_buf();
        let file = spawn_blocking({
            let path = path.clone();
            move || StdFile::open(path)
        })
        .await
        .map_err(io::Error::other)??;
        Ok(LocalFile {
            path,
            file: Arc::new(file),
            write_lock: Mutex::new(()),
        })
    }

    /// Opens the file read-write, creating it if absent.
    pub async fn open_rw(path: &Path) -> io::Result<LocalFile> {
        let path = path.to_path_buf();
        let file = spawn_blocking({
            let path = path.clone();
            move || {
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)
            }
        })
        .await
        .map_err(io::Error::other)??;
        Ok(LocalFile {
            path,
            file: Arc::new(file),
            write_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Truncates or extends the file to `len` bytes. Extension leaves a
    /// hole.
    pub async fn set_len(&self, len: u64) -> io::Result<()> {
        let _write_guard = self.write_lock.lock().await;
        let file = self.file.clone();
        spawn_blocking(move || file.set_len(len))
            .await
            .map_err(io::Error::other)?
    }

    /// Reads exactly `len` bytes at `offset`.
    pub async fn read_exact_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let file = self.file.clone();
        spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            read_at_exact(&file, offset, &mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(io::Error::other)?
    }

    /// Writes all of `bytes` at `offset`.
    pub async fn write_all_at(&self, offset: u64, bytes: Vec<u8>) -> io::Result<()> {
        let _write_guard = self.write_lock.lock().await;
        let file = self.file.clone();
        spawn_blocking(move || write_at_all(&file, offset, &bytes))
            .await
            .map_err(io::Error::other)?
    }
}

impl std::fmt::Debug for LocalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFile")
            .field("path", &self.path.display())
            .finish()
    }
}
