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

use std::fmt::{Debug, Display};
use std::future::Future;

use aws_sdk_s3::error::SdkError;
use futures::TryFutureExt;
use searchfs_common::retry::{retry, RetryParams, Retryable};

/// Transient/permanent classification for AWS SDK errors, consumed by the
/// retry loop in the storage layer.
pub trait AwsRetryable {
    fn is_retryable(&self) -> bool {
        false
    }
}

impl<E> AwsRetryable for SdkError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            SdkError::ConstructionFailure(_) => false,
            SdkError::TimeoutError(_) => true,
            SdkError::DispatchFailure(failure) => failure.is_io() || failure.is_timeout(),
            SdkError::ResponseError(_) => true,
            SdkError::ServiceError(service_error) => {
                let status = service_error.raw().status();
                status.is_server_error() || status.as_u16() == 429 /* TOO_MANY_REQUESTS */
            }
            _ => false,
        }
    }
}

struct AwsRetryableWrapper<E>(E);

impl<E> Retryable for AwsRetryableWrapper<E>
where E: AwsRetryable
{
    fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }
}

impl<E: Display> Display for AwsRetryableWrapper<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

pub async fn aws_retry<U, E, Fut>(retry_params: &RetryParams, f: impl Fn() -> Fut) -> Result<U, E>
where
    Fut: Future<Output = Result<U, E>>,
    E: AwsRetryable + Display + Debug + 'static,
{
    retry(retry_params, || f().map_err(AwsRetryableWrapper))
        .await
        .map_err(|error| error.0)
}
