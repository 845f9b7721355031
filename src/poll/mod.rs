// This file is part of the terraform-provider-converge project
//
// Copyright (C) ANEO, 2024-2024. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License")
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

//! Poll a remote resource until it converges.
//!
//! A [`PollRequest`] is built right after a mutating call returns. Its
//! [`PollRequest::wait_for`] method repeatedly asks a [`StatusSource`] for the
//! current status label until one of these happens:
//! - the label is a target `continuous_target_occurrence` times in a row,
//! - the label is neither pending nor target,
//! - the fetch fails,
//! - the timeout elapses or the caller cancels.

use std::collections::BTreeSet;
use std::future;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod error;

pub use error::PollError;

/// Label used for a resource that could not be found yet
pub const RESPONSE_NOT_FOUND: &str = "ResponseNotFound";

/// Consecutive not-found observations tolerated while pending
pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;

/// Result of a single successful status fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<S> {
    Found { snapshot: S, status: String },
    NotFound,
}

/// Injected status-fetch function.
///
/// Returning `Ok(Observation::NotFound)` marks propagation lag and is retried.
/// Returning `Err` is fatal for the poll.
#[async_trait]
pub trait StatusSource: Send + Sync {
    type Snapshot: Send;

    async fn fetch(&self) -> Result<Observation<Self::Snapshot>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converged<S> {
    /// Last fetched snapshot, `None` if convergence was reached on a not-found observation
    pub snapshot: Option<S>,
    pub status: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    pub pending: BTreeSet<String>,
    pub target: BTreeSet<String>,
    pub interval: Duration,
    pub min_wait: Duration,
    pub delay: Duration,
    pub timeout: Duration,
    pub continuous_target_occurrence: u32,
    pub not_found_status: String,
    pub not_found_checks: Option<u32>,
}

impl Default for PollRequest {
    fn default() -> Self {
        Self {
            pending: Default::default(),
            target: Default::default(),
            interval: Duration::from_secs(10),
            min_wait: Duration::ZERO,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(30 * 60),
            continuous_target_occurrence: 1,
            not_found_status: RESPONSE_NOT_FOUND.to_owned(),
            not_found_checks: Some(DEFAULT_NOT_FOUND_CHECKS),
        }
    }
}

/// What the poll loop knows when it is interrupted from the outside
#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    last_status: Option<String>,
}

enum Interrupted {
    Deadline,
    Cancelled,
}

enum Classified {
    Target,
    Pending,
    Unexpected,
}

impl PollRequest {
    pub fn new<P, T>(pending: P, target: T) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Time to sleep between two fetches
    pub fn wait(&self) -> Duration {
        self.interval.max(self.min_wait)
    }

    fn classify(&self, status: &str) -> Classified {
        if self.target.contains(status) {
            Classified::Target
        } else if self.pending.contains(status) {
            Classified::Pending
        } else {
            Classified::Unexpected
        }
    }

    /// Block until the source converges, fails, or the request times out
    pub async fn wait_for<S>(
        &self,
        source: &S,
        cancel: &CancellationToken,
    ) -> Result<Converged<S::Snapshot>, PollError>
    where
        S: StatusSource + ?Sized,
    {
        let start = Instant::now();
        let mut progress = Progress::default();

        // A timeout too large to be represented never expires
        let deadline = start.checked_add(self.timeout);
        let expired = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => future::pending().await,
            }
        };

        let interrupted = tokio::select! {
            outcome = self.poll_loop(source, &mut progress) => return outcome,
            _ = expired => Interrupted::Deadline,
            _ = cancel.cancelled() => Interrupted::Cancelled,
        };

        Err(match interrupted {
            Interrupted::Deadline => PollError::Timeout {
                elapsed: start.elapsed(),
                attempts: progress.attempts,
                last_status: progress.last_status,
                target: self.target.iter().cloned().collect(),
            },
            Interrupted::Cancelled => PollError::Cancelled {
                attempts: progress.attempts,
                last_status: progress.last_status,
            },
        })
    }

    async fn poll_loop<S>(
        &self,
        source: &S,
        progress: &mut Progress,
    ) -> Result<Converged<S::Snapshot>, PollError>
    where
        S: StatusSource + ?Sized,
    {
        let required = self.continuous_target_occurrence.max(1);
        let mut occurrences = 0;
        let mut not_found = 0;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        loop {
            progress.attempts += 1;
            let (snapshot, status) = match source.fetch().await {
                Ok(Observation::Found { snapshot, status }) => {
                    not_found = 0;
                    (Some(snapshot), status)
                }
                Ok(Observation::NotFound) => {
                    not_found += 1;
                    (None, self.not_found_status.clone())
                }
                Err(source) => {
                    return Err(PollError::FetchFailed {
                        attempts: progress.attempts,
                        source,
                    })
                }
            };
            debug!(
                attempt = progress.attempts,
                status = status.as_str(),
                "status observed"
            );

            match self.classify(&status) {
                Classified::Target => {
                    occurrences += 1;
                    if occurrences >= required {
                        return Ok(Converged {
                            snapshot,
                            status,
                            attempts: progress.attempts,
                        });
                    }
                }
                Classified::Pending => {
                    occurrences = 0;
                    if let Some(checks) = self.not_found_checks {
                        if not_found > checks {
                            return Err(PollError::NotFound {
                                attempts: progress.attempts,
                                checks,
                            });
                        }
                    }
                }
                Classified::Unexpected => {
                    return Err(PollError::UnexpectedStatus {
                        status,
                        attempts: progress.attempts,
                        expected: self.pending.union(&self.target).cloned().collect(),
                    })
                }
            }
            progress.last_status = Some(status);

            sleep(self.wait()).await;
        }
    }
}
