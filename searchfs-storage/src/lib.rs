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

//! `searchfs-storage` exposes the [`ObjectStore`] trait, a thin typed
//! interface over a flat-key-space remote object store, together with its S3
//! implementation and an in-memory implementation for tests.
//!
//! The S3 implementation layers three behaviors the directory above depends
//! on:
//! - request retry with exponential backoff for transient failures,
//! - a versioned re-read on `NoSuchKey` to mask the asymmetric propagation
//!   window of copy+delete renames,
//! - a list-fed metadata cache so `file_num_bytes` rarely issues a HEAD.

#![deny(clippy::disallowed_methods)]

mod config;
mod error;
mod object_store;
mod payload;
mod ram_object_store;
mod s3_object_store;

pub use ownedbytes::OwnedBytes;

pub use self::config::S3Config;
pub use self::error::{StorageError, StorageErrorKind, StorageResult};
#[cfg(any(test, feature = "testsuite"))]
pub use self::object_store::MockObjectStore;
pub use self::object_store::{FileTransfer, ObjectStore};
pub use self::payload::{FilePayload, PutPayload};
pub use self::ram_object_store::{RamObjectStore, RamObjectStoreBuilder};
pub use self::s3_object_store::S3ObjectStore;
