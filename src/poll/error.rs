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

use std::time::Duration;

use thiserror::Error;

/// Terminal failure of a poll
#[derive(Debug, Error)]
pub enum PollError {
    #[error(
        "timeout after {elapsed:?} and {attempts} attempts while waiting for one of [{}] (last status: {})",
        .target.join(", "),
        .last_status.as_deref().unwrap_or("none")
    )]
    Timeout {
        elapsed: Duration,
        attempts: u32,
        last_status: Option<String>,
        target: Vec<String>,
    },

    #[error(
        "cancelled after {attempts} attempts (last status: {})",
        .last_status.as_deref().unwrap_or("none")
    )]
    Cancelled {
        attempts: u32,
        last_status: Option<String>,
    },

    #[error(
        "unexpected status `{status}` after {attempts} attempts, expected one of [{}]",
        .expected.join(", ")
    )]
    UnexpectedStatus {
        status: String,
        attempts: u32,
        expected: Vec<String>,
    },

    #[error("failed to fetch status after {attempts} attempts: {source:#}")]
    FetchFailed {
        attempts: u32,
        source: anyhow::Error,
    },

    #[error("resource still not found after {checks} checks ({attempts} attempts)")]
    NotFound { attempts: u32, checks: u32 },
}

impl PollError {
    /// The remote side reported a definitive failure, as opposed to still provisioning
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedStatus { .. } | Self::FetchFailed { .. } | Self::NotFound { .. }
        )
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Timeout { attempts, .. }
            | Self::Cancelled { attempts, .. }
            | Self::UnexpectedStatus { attempts, .. }
            | Self::FetchFailed { attempts, .. }
            | Self::NotFound { attempts, .. } => *attempts,
        }
    }

    /// Last status label observed before the poll stopped, if any
    pub fn last_status(&self) -> Option<&str> {
        match self {
            Self::Timeout { last_status, .. } | Self::Cancelled { last_status, .. } => {
                last_status.as_deref()
            }
            Self::UnexpectedStatus { status, .. } => Some(status),
            Self::FetchFailed { .. } | Self::NotFound { .. } => None,
        }
    }
}
