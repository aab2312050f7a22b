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

//! `searchfs-directory` synthesizes a POSIX-ish file directory on top of a
//! flat-key-space object store, for consumption by a segment-based search
//! index engine.
//!
//! Every logical file is in exactly one of four states:
//! - **Buffered**: written locally, not uploaded yet;
//! - **Synced**: uploaded, with an authoritative local copy;
//! - **Cached**: remote, with some blocks of its body present in a local
//!   sparse file;
//! - **Remote-only**: remote, with no local footprint.
//!
//! [`S3Directory`] routes every directory operation to the right tier and
//! maps the engine's commit protocol (write → sync → rename →
//! sync_meta_data) onto the object store. [`S3IndexInput`] serves random
//! reads of Cached files, filling sparse-file holes block by block on miss.

#![deny(clippy::disallowed_methods)]

mod block;
mod error;
mod fs_cache;
mod index_input;
mod index_output;
mod local_file;
mod prepopulate;
mod s3_directory;

pub use self::block::{BlockMap, DEFAULT_BLOCK_SIZE};
pub use self::error::{DirectoryError, DirectoryResult};
pub use self::fs_cache::{DirectoryLock, FsCache};
pub use self::index_input::{FsIndexInput, IndexInput, S3IndexInput};
pub use self::index_output::IndexOutput;
pub use self::s3_directory::{S3Directory, S3DirectoryConfig};
