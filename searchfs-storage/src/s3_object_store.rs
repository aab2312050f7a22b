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
use std::future::Future;
use std::ops::Range;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;
use std::{env, fmt};

use anyhow::anyhow;
use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::{GetObjectError, GetObjectOutput};
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Object, ObjectVersion};
use aws_sdk_s3::Client as S3Client;
use futures::{stream, StreamExt};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use searchfs_aws::retry::{aws_retry, AwsRetryable};
use searchfs_common::retry::{retry, Retry, RetryParams};
use searchfs_common::uri::Uri;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument};

use crate::object_store::FileTransfer;
use crate::{
    FilePayload, ObjectStore, OwnedBytes, PutPayload, S3Config, StorageError, StorageErrorKind,
    StorageResult,
};

/// Limits the number of concurrent requests to the object store. Some
/// S3-compatible stores (R2, SeaweedFS...) return errors when too many
/// concurrent requests are emitted.
static REQUEST_SEMAPHORE: Lazy<Semaphore> = Lazy::new(|| {
    let num_permits: usize = env::var("SEARCHFS_S3_MAX_CONCURRENCY")
        .as_deref()
        .unwrap_or("10000")
        .parse()
        .expect("SEARCHFS_S3_MAX_CONCURRENCY value should be a number");
    Semaphore::new(num_permits)
});

/// Number of files moved concurrently by `bulk_upload` / `bulk_download`.
const BULK_TRANSFER_CONCURRENCY: usize = 10;

/// S3-backed object store.
///
/// All object keys are of the form `prefix + name` where `prefix` either is
/// empty or ends in exactly one `/`.
pub struct S3ObjectStore {
    s3_client: S3Client,
    uri: Uri,
    bucket: String,
    prefix: String,
    retry_params: RetryParams,
    // Fed by `list`, consulted by `file_num_bytes`, kept in sync by
    // `put`/`copy`/`delete`.
    metadata_cache: Mutex<HashMap<String, u64>>,
}

impl fmt::Debug for S3ObjectStore {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish()
    }
}

async fn create_s3_client(s3_config: &S3Config) -> S3Client {
    let sdk_config = searchfs_aws::get_sdk_config().await;
    let mut s3_builder = aws_sdk_s3::config::Builder::from(sdk_config);

    if let Some(region) = s3_config.region.clone() {
        s3_builder = s3_builder.region(Region::new(region));
    }
    if let (Some(access_key_id), Some(secret_access_key)) = (
        s3_config.access_key_id.clone(),
        s3_config.secret_access_key.clone(),
    ) {
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            None,
            None,
            "searchfs-config",
        );
        s3_builder = s3_builder.credentials_provider(credentials);
    }
    s3_builder = s3_builder.force_path_style(s3_config.force_path_style_access());

    if let Some(endpoint) = s3_config.endpoint() {
        info!(endpoint=%endpoint, "using custom S3 endpoint");
        s3_builder = s3_builder.endpoint_url(endpoint);
    }
    S3Client::from_conf(s3_builder.build())
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed_prefix = prefix.trim_end_matches('/');
    if trimmed_prefix.is_empty() {
        String::new()
    } else {
        format!("{trimmed_prefix}/")
    }
}

pub fn parse_s3_uri(uri: &Uri) -> Option<(String, String)> {
    static S3_URI_PTN: OnceCell<Regex> = OnceCell::new();

    let captures = S3_URI_PTN
        .get_or_init(|| {
            // s3://bucket/prefix
            Regex::new(r"s3://(?P<bucket>[^/]+)(/(?P<prefix>.+))?")
                .expect("the regular expression should compile")
        })
        .captures(uri.as_str())?;

    let bucket = captures.name("bucket")?.as_str().to_string();
    let prefix = captures
        .name("prefix")
        .map(|prefix_match| prefix_match.as_str().to_string())
        .unwrap_or_default();
    Some((bucket, prefix))
}

impl S3ObjectStore {
    /// Creates an object store working against `bucket` with all keys under
    /// `prefix`.
    pub async fn new(s3_config: &S3Config, bucket: impl Into<String>, prefix: &str) -> Self {
        let s3_client = create_s3_client(s3_config).await;
        let bucket = bucket.into();
        let prefix = normalize_prefix(prefix);
        let uri = Uri::from_well_formed(format!("s3://{bucket}/{prefix}"));
        Self {
            s3_client,
            uri,
            bucket,
            prefix,
            retry_params: RetryParams::default(),
            metadata_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Creates an object store from an `s3://bucket/prefix` URI.
    pub async fn from_uri(s3_config: &S3Config, uri: &Uri) -> anyhow::Result<Self> {
        let (bucket, prefix) = parse_s3_uri(uri)
            .ok_or_else(|| anyhow!("failed to extract bucket name from S3 URI `{uri}`"))?;
        Ok(Self::new(s3_config, bucket, &prefix).await)
    }

    /// Builds a store around a preconfigured client. Only useful in tests.
    #[cfg(any(test, feature = "testsuite"))]
    pub fn from_client(s3_client: S3Client, bucket: impl Into<String>, prefix: &str) -> Self {
        let bucket = bucket.into();
        let prefix = normalize_prefix(prefix);
        let uri = Uri::from_well_formed(format!("s3://{bucket}/{prefix}"));
        Self {
            s3_client,
            uri,
            bucket,
            prefix,
            retry_params: RetryParams::for_test(),
            metadata_cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    async fn create_get_object_request(
        &self,
        name: &str,
        range_opt: Option<Range<u64>>,
        version_id: Option<String>,
    ) -> Result<GetObjectOutput, SdkError<GetObjectError>> {
        let key = self.key(name);
        let range_str = range_opt.map(|range| format!("bytes={}-{}", range.start, range.end - 1));

        self.s3_client
            .get_object()
            .bucket(self.bucket.clone())
            .key(key)
            .set_range(range_str)
            .set_version_id(version_id)
            .send()
            .await
    }

    /// Covers the window in which a rename's copy + delete has propagated
    /// asymmetrically: the plain read observes `NoSuchKey` while the key is
    /// still addressable under a version id.
    async fn get_most_recent_version(
        &self,
        name: &str,
        range_opt: Option<Range<u64>>,
    ) -> StorageResult<GetObjectOutput> {
        let key = self.key(name);
        debug!(key = %key, "key not found, retrying against its most recent version");
        let versions_output = aws_retry(&self.retry_params, || async {
            self.s3_client
                .list_object_versions()
                .bucket(self.bucket.clone())
                .prefix(key.clone())
                .send()
                .await
        })
        .await?;
        let versions: Vec<&ObjectVersion> = versions_output
            .versions()
            .iter()
            .filter(|version| version.key() == Some(key.as_str()))
            .collect();
        let version_id = versions
            .iter()
            .find(|version| version.is_latest().unwrap_or(false))
            .or_else(|| versions.first())
            .and_then(|version| version.version_id())
            .map(str::to_string)
            .ok_or_else(|| {
                StorageErrorKind::NotFound
                    .with_error(anyhow!("no version found for key `{key}`"))
            })?;
        let get_object_output = aws_retry(&self.retry_params, || {
            self.create_get_object_request(name, range_opt.clone(), Some(version_id.clone()))
        })
        .await?;
        Ok(get_object_output)
    }

    async fn get_object_output(
        &self,
        name: &str,
        range_opt: Option<Range<u64>>,
    ) -> StorageResult<GetObjectOutput> {
        let get_object_res = aws_retry(&self.retry_params, || {
            self.create_get_object_request(name, range_opt.clone(), None)
        })
        .await;
        match get_object_res {
            Ok(get_object_output) => Ok(get_object_output),
            Err(sdk_error) if sdk_error.code() == Some("NoSuchKey") => {
                self.get_most_recent_version(name, range_opt).await
            }
            Err(sdk_error) => Err(sdk_error.into()),
        }
    }

    async fn get_to_vec(
        &self,
        name: &str,
        range_opt: Option<Range<u64>>,
    ) -> StorageResult<Vec<u8>> {
        let capacity = range_opt
            .as_ref()
            .map(|range| (range.end - range.start) as usize)
            .unwrap_or(0);
        let get_object_output = self.get_object_output(name, range_opt).await?;
        let mut buf: Vec<u8> = Vec::with_capacity(capacity);
        download_all(get_object_output.body, &mut buf).await?;
        Ok(buf)
    }

    fn list_objects_into_entries(&self, objects: Vec<Object>) -> Vec<(String, u64)> {
        let mut entries = Vec::with_capacity(objects.len());
        let mut metadata_cache = self.metadata_cache.lock().unwrap();
        for object in objects {
            let Some(key) = object.key() else {
                continue;
            };
            // The bare prefix marker object is not a logical file.
            if key == self.prefix {
                continue;
            }
            let Some(name) = key.strip_prefix(&self.prefix) else {
                continue;
            };
            let size = object.size().unwrap_or(0) as u64;
            metadata_cache.insert(name.to_string(), size);
            entries.push((name.to_string(), size));
        }
        entries
    }
}

async fn download_all(byte_stream: ByteStream, output: &mut Vec<u8>) -> std::io::Result<()> {
    output.clear();
    let mut body_stream_reader = BufReader::new(byte_stream.into_async_read());
    tokio::io::copy_buf(&mut body_stream_reader, output).await?;
    // When downloading a whole object, the Vec capacity is not properly set.
    output.shrink_to_fit();
    Ok(())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn check_connectivity(&self) -> anyhow::Result<()> {
        // we ignore the error as we never close the semaphore
        let _permit = REQUEST_SEMAPHORE.acquire().await;
        self.s3_client
            .list_objects_v2()
            .bucket(self.bucket.clone())
            .max_keys(1)
            .send()
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn list(&self) -> StorageResult<Vec<(String, u64)>> {
        let _permit = REQUEST_SEMAPHORE.acquire().await;
        let objects = aws_retry(&self.retry_params, || async {
            let mut page_stream = self
                .s3_client
                .list_objects_v2()
                .bucket(self.bucket.clone())
                .prefix(self.prefix.clone())
                .into_paginator()
                .send();
            let mut objects: Vec<Object> = Vec::new();
            while let Some(page_res) = page_stream.next().await {
                let page = page_res?;
                objects.extend(page.contents.unwrap_or_default());
            }
            Ok::<_, SdkError<ListObjectsV2Error>>(objects)
        })
        .await?;
        Ok(self.list_objects_into_entries(objects))
    }

    async fn file_num_bytes(&self, name: &str) -> StorageResult<u64> {
        if let Some(size) = self.metadata_cache.lock().unwrap().get(name) {
            return Ok(*size);
        }
        let _permit = REQUEST_SEMAPHORE.acquire().await;
        let bucket = self.bucket.clone();
        let key = self.key(name);
        let head_object_output = aws_retry(&self.retry_params, || async {
            self.s3_client
                .head_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
        })
        .await?;
        let num_bytes = head_object_output.content_length().unwrap_or(0) as u64;
        self.metadata_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), num_bytes);
        Ok(num_bytes)
    }

    #[instrument(level = "debug", skip(self, range), fields(range.start = range.start, range.end = range.end))]
    async fn get_range(&self, name: &str, range: Range<u64>) -> StorageResult<OwnedBytes> {
        let _permit = REQUEST_SEMAPHORE.acquire().await;
        let requested_len = range.end - range.start;
        let bytes = self
            .get_to_vec(name, Some(range.clone()))
            .await
            .map_err(|err| {
                err.add_context(format!(
                    "failed to fetch slice {:?} for object: {}{}",
                    range, self.uri, name,
                ))
            })?;
        if bytes.len() as u64 != requested_len {
            return Err(StorageErrorKind::Internal.with_error(anyhow!(
                "range get for `{}` returned {} bytes, expected {}",
                name,
                bytes.len(),
                requested_len
            )));
        }
        Ok(OwnedBytes::new(bytes))
    }

    #[instrument(level = "debug", skip(self, output_path))]
    async fn copy_to_file(&self, name: &str, output_path: &Path) -> StorageResult<u64> {
        let _permit = REQUEST_SEMAPHORE.acquire().await;
        let get_object_output = self.get_object_output(name, None).await?;
        let mut body_read = BufReader::new(get_object_output.body.into_async_read());
        let mut dest_file = tokio::fs::File::create(output_path).await?;
        let num_bytes_copied = tokio::io::copy_buf(&mut body_read, &mut dest_file).await?;
        dest_file.flush().await?;
        Ok(num_bytes_copied)
    }

    async fn put(&self, name: &str, payload: Box<dyn PutPayload>) -> StorageResult<()> {
        let _permit = REQUEST_SEMAPHORE.acquire().await;
        let key = self.key(name);
        let total_len = payload.len();
        retry(&self.retry_params, || async {
            let body = payload
                .byte_stream()
                .await
                .map_err(|io_error| Retry::Permanent(StorageError::from(io_error)))?;
            self.s3_client
                .put_object()
                .bucket(self.bucket.clone())
                .key(&key)
                .body(body)
                .content_length(total_len as i64)
                .send()
                .await
                .map_err(|sdk_error| {
                    if sdk_error.is_retryable() {
                        Retry::Transient(StorageError::from(sdk_error))
                    } else {
                        Retry::Permanent(StorageError::from(sdk_error))
                    }
                })?;
            Ok(())
        })
        .await
        .map_err(Retry::into_inner)?;
        self.metadata_cache
            .lock()
            .unwrap()
            .insert(name.to_string(), total_len);
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> StorageResult<()> {
        let _permit = REQUEST_SEMAPHORE.acquire().await;
        let copy_source = format!("{}/{}", self.bucket, self.key(from));
        aws_retry(&self.retry_params, || async {
            self.s3_client
                .copy_object()
                .copy_source(copy_source.clone())
                .bucket(self.bucket.clone())
                .key(self.key(to))
                .send()
                .await
        })
        .await?;
        let mut metadata_cache = self.metadata_cache.lock().unwrap();
        if let Some(size) = metadata_cache.get(from).copied() {
            metadata_cache.insert(to.to_string(), size);
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> StorageResult<()> {
        let _permit = REQUEST_SEMAPHORE.acquire().await;
        let bucket = self.bucket.clone();
        let key = self.key(name);
        let delete_res = aws_retry(&self.retry_params, || async {
            self.s3_client
                .delete_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
        })
        .await;
        self.metadata_cache.lock().unwrap().remove(name);

        match delete_res {
            Ok(_) => Ok(()),
            Err(error) if error.code() == Some("NoSuchKey") => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn bulk_upload(&self, uploads: &[FileTransfer]) -> StorageResult<()> {
        let upload_futures: Vec<_> = uploads.iter().map(|upload| self.upload_one(upload)).collect();
        let upload_results: Vec<StorageResult<()>> = stream::iter(upload_futures)
            .buffer_unordered(BULK_TRANSFER_CONCURRENCY)
            .collect()
            .await;
        upload_results
            .into_iter()
            .collect::<StorageResult<Vec<()>>>()?;
        Ok(())
    }

    async fn bulk_download(&self, downloads: &[FileTransfer]) -> StorageResult<()> {
        let download_futures: Vec<_> = downloads
            .iter()
            .map(|download| self.download_one(download))
            .collect();
        let download_results: Vec<StorageResult<u64>> = stream::iter(download_futures)
            .buffer_unordered(BULK_TRANSFER_CONCURRENCY)
            .collect()
            .await;
        download_results
            .into_iter()
            .collect::<StorageResult<Vec<u64>>>()?;
        Ok(())
    }

    fn uri(&self) -> &Uri {
        &self.uri
    }
}

impl S3ObjectStore {
    fn upload_one<'a>(
        &'a self,
        upload: &'a FileTransfer,
    ) -> Pin<Box<dyn Future<Output = StorageResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let payload = FilePayload::from_path(&upload.local_path).await?;
            self.put(&upload.name, Box::new(payload))
                .await
                .map_err(|error| error.add_context(format!("failed to upload `{}`", upload.name)))
        })
    }

    fn download_one<'a>(
        &'a self,
        download: &'a FileTransfer,
    ) -> Pin<Box<dyn Future<Output = StorageResult<u64>> + Send + 'a>> {
        Box::pin(async move {
            self.copy_to_file(&download.name, &download.local_path)
                .await
                .map_err(|error| {
                    error.add_context(format!("failed to download `{}`", download.name))
                })
        })
    }
}
