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
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;

/// PutPayload is the data source of an upload.
#[async_trait]
pub trait PutPayload: PutPayloadClone + Send + Sync {
    /// Returns the total length of the payload.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieves the complete byte stream.
    async fn byte_stream(&self) -> io::Result<ByteStream>;
}

pub trait PutPayloadClone {
    fn box_clone(&self) -> Box<dyn PutPayload>;
}

impl<T> PutPayloadClone for T
where T: 'static + PutPayload + Clone
{
    fn box_clone(&self) -> Box<dyn PutPayload> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn PutPayload> {
    fn clone(&self) -> Box<dyn PutPayload> {
        self.box_clone()
    }
}

#[async_trait]
impl PutPayload for Vec<u8> {
    fn len(&self) -> u64 {
        self.len() as u64
    }

    async fn byte_stream(&self) -> io::Result<ByteStream> {
        Ok(ByteStream::from(self.clone()))
    }
}

/// Payload backed by a local file. The length is captured at construction;
/// the file is expected to be immutable for the lifetime of the payload.
#[derive(Clone)]
pub struct FilePayload {
    path: PathBuf,
    len: u64,
}

impl FilePayload {
    pub async fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(FilePayload {
            path: path.to_path_buf(),
            len: metadata.len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PutPayload for FilePayload {
    fn len(&self) -> u64 {
        self.len
    }

    async fn byte_stream(&self) -> io::Result<ByteStream> {
        ByteStream::from_path(&self.path).await.map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_file_payload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("payload");
        let mut file = tokio::fs::File::create(&file_path).await.unwrap();
        file.write_all(b"abcdefgh").await.unwrap();
        file.flush().await.unwrap();

        let payload = FilePayload::from_path(&file_path).await.unwrap();
        assert_eq!(payload.len(), 8);
        let bytes = payload
            .byte_stream()
            .await
            .unwrap()
            .collect()
            .await
            .unwrap()
            .into_bytes();
        assert_eq!(&bytes[..], b"abcdefgh");
    }
}
