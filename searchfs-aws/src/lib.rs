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

#![deny(clippy::disallowed_methods)]

pub mod retry;

use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::config::Region;
use tokio::sync::OnceCell;

pub const DEFAULT_AWS_REGION: Region = Region::from_static("us-east-1");

/// Initializes and returns the process-wide AWS config.
///
/// SDK-level retries are disabled; the storage layer retries with its own
/// backoff.
pub async fn get_sdk_config() -> &'static SdkConfig {
    static SDK_CONFIG: OnceCell<SdkConfig> = OnceCell::const_new();

    SDK_CONFIG
        .get_or_init(|| async {
            aws_config::defaults(BehaviorVersion::latest())
                .retry_config(RetryConfig::disabled())
                .load()
                .await
        })
        .await
}
