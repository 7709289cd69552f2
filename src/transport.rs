// Copyright 2026 The Lattice Project Developers
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

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::{
    error::TransportError,
    requests::{IncomingResponse, OutgoingRequest, Transport},
};

/// Tunables of the [`RetryingTransport`] backoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    /// How many times a failed request is retried before the error is
    /// surfaced.
    pub max_retries: u32,
    /// The delay before the first retry; doubled on every further retry.
    pub initial_delay: Duration,
    /// The upper bound the doubling delay saturates at.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// A [`Transport`] wrapper retrying network-level failures with exponential
/// backoff.
///
/// Only [`TransportError::Network`] is retried; a rejection by the server or
/// a mismatched response is surfaced immediately.
#[derive(Debug)]
pub struct RetryingTransport<T> {
    inner: T,
    config: RetryConfig,
}

impl<T: Transport> RetryingTransport<T> {
    /// Wrap the given transport using the default [`RetryConfig`].
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, RetryConfig::default())
    }

    /// Wrap the given transport with the given retry configuration.
    pub fn with_config(inner: T, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<T: Transport> Transport for RetryingTransport<T> {
    async fn send(&self, request: OutgoingRequest) -> Result<IncomingResponse, TransportError> {
        let mut delay = self.config.initial_delay;
        let mut attempt = 0;

        loop {
            match self.inner.send(request.clone()).await {
                Err(TransportError::Network(reason)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        reason,
                        "The request failed on the network level, retrying"
                    );

                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.max_delay);
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;

    use super::*;
    use crate::requests::PublishOneTimeKeysResponse;

    /// A transport failing a configurable number of times before answering.
    #[derive(Debug)]
    struct FlakyTransport {
        failures: AtomicU32,
        error: fn(String) -> TransportError,
    }

    impl FlakyTransport {
        fn new(failures: u32, error: fn(String) -> TransportError) -> Self {
            Self { failures: AtomicU32::new(failures), error }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(
            &self,
            _: OutgoingRequest,
        ) -> Result<IncomingResponse, TransportError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |failures| {
                    failures.checked_sub(1)
                })
                .is_ok()
            {
                Err((self.error)("connection reset".to_owned()))
            } else {
                Ok(PublishOneTimeKeysResponse { one_time_key_count: 0 }.into())
            }
        }
    }

    fn request() -> OutgoingRequest {
        crate::requests::ClaimOneTimeKeyRequest {
            user_id: "@bob:example.org".into(),
            device_id: "BOBDEVICE".into(),
        }
        .into()
    }

    fn quick_retries() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn network_failures_are_retried() {
        let transport = RetryingTransport::with_config(
            FlakyTransport::new(2, TransportError::Network),
            quick_retries(),
        );

        transport.send(request()).await.expect("The request should succeed after retries");
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let transport = RetryingTransport::with_config(
            FlakyTransport::new(10, TransportError::Network),
            quick_retries(),
        );

        assert_matches!(transport.send(request()).await, Err(TransportError::Network(_)));
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let flaky = FlakyTransport::new(1, TransportError::Rejected);
        let transport = RetryingTransport::with_config(flaky, quick_retries());

        assert_matches!(transport.send(request()).await, Err(TransportError::Rejected(_)));

        // The wrapped transport would answer now, proving a single attempt
        // was made.
        transport.send(request()).await.expect("The second call should reach the server");
    }
}
