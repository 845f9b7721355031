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

use std::borrow::Cow;
use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tf_provider::value::{Value, ValueList, ValueNumber, ValueString};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Connection;
use crate::converge_provider::{seconds_or, PollDefaults};
use crate::poll::{
    Converged, Observation, PollError, PollRequest, StatusSource, DEFAULT_NOT_FOUND_CHECKS,
    RESPONSE_NOT_FOUND,
};
use crate::utils::{WithCmd, WithEnv};

use super::state::{StateStatus, StateWait};
use super::with_env;

/// Label used when the status output holds no status
pub const MISSING_STATUS: &str = "Unknown";

/// Status fetched by running the `read_status` command over a connection
pub(super) struct CmdStatus<'s, 'a, T: Connection> {
    pub(super) connect: &'s T,
    pub(super) config: &'s T::Config<'a>,
    pub(super) status: &'s StateStatus<'a>,
    pub(super) env: &'s [(Cow<'s, str>, Cow<'s, str>)],
}

#[async_trait]
impl<'s, 'a, T: Connection> StatusSource for CmdStatus<'s, 'a, T> {
    type Snapshot = String;

    async fn fetch(&self) -> Result<Observation<String>> {
        let res = self
            .connect
            .execute(
                self.config,
                self.status.cmd(),
                self.status.dir(),
                with_env(self.env, self.status.env()),
            )
            .await?;

        if res.status != 0 {
            if self.status.is_not_found(res.status) {
                debug!(code = res.status, "status command reported a missing resource");
                return Ok(Observation::NotFound);
            }
            return Err(anyhow!(
                "`read_status` failed with status code {}: {}",
                res.status,
                res.stderr.trim_end()
            ));
        }

        let mut snapshot = res.stdout;
        if snapshot.ends_with('\n') {
            snapshot.pop();
        }
        let status = parse_status(
            &snapshot,
            self.status.status_path.as_deref_option(),
            self.status
                .missing_status
                .as_deref_option()
                .unwrap_or(MISSING_STATUS),
        )?;

        Ok(Observation::Found { snapshot, status })
    }
}

impl<'a> StateStatus<'a> {
    fn is_not_found(&self, code: i32) -> bool {
        self.not_found_exit_codes
            .iter()
            .flatten()
            .any(|expected| {
                matches!(expected, Value::Value(expected) if *expected == i64::from(code))
            })
    }
}

/// Extract the status label from the output of the status command.
///
/// Without `path`, the trimmed output is the label. With `path`, the output is parsed
/// as JSON and the label is the value found at this JSON pointer.
/// An absent or empty label is replaced by `missing`.
pub(super) fn parse_status(output: &str, path: Option<&str>, missing: &str) -> Result<String> {
    let label = match path {
        None | Some("") => output.trim().to_owned(),
        Some(path) => {
            let json = serde_json::from_str::<serde_json::Value>(output)
                .context("`read_status` output is not valid JSON")?;
            match json.pointer(path) {
                None | Some(serde_json::Value::Null) => String::new(),
                Some(serde_json::Value::String(label)) => label.trim().to_owned(),
                Some(other) => other.to_string(),
            }
        }
    };

    if label.is_empty() {
        Ok(missing.to_owned())
    } else {
        Ok(label)
    }
}

/// Non-negative count, saturated to `u32::MAX`
fn count(value: &ValueNumber) -> Option<u32> {
    match value {
        Value::Value(n) if *n >= 0 => Some(u32::try_from(*n).unwrap_or(u32::MAX)),
        _ => None,
    }
}

impl<'a> StateWait<'a> {
    pub(super) fn request(&self, defaults: &PollDefaults) -> PollRequest {
        let labels = |labels: &ValueList<ValueString<'a>>| -> BTreeSet<String> {
            labels
                .iter()
                .flatten()
                .filter_map(|label| label.as_deref_option())
                .map(str::to_owned)
                .collect()
        };

        PollRequest {
            pending: labels(&self.pending),
            target: labels(&self.target),
            interval: seconds_or(&self.interval, defaults.interval),
            min_wait: seconds_or(&self.min_wait, defaults.min_wait),
            delay: seconds_or(&self.delay, Default::default()),
            timeout: seconds_or(&self.timeout, defaults.timeout),
            continuous_target_occurrence: count(&self.continuous_target_occurrence)
                .filter(|n| *n > 0)
                .unwrap_or(1),
            not_found_status: self
                .not_found_status
                .as_deref_option()
                .unwrap_or(RESPONSE_NOT_FOUND)
                .to_owned(),
            not_found_checks: Some(
                count(&self.not_found_checks).unwrap_or(DEFAULT_NOT_FOUND_CHECKS),
            ),
        }
    }
}

/// Observe the resource once, or until convergence if a wait block is given
pub(super) async fn converge<'a, T: Connection>(
    source: &CmdStatus<'_, 'a, T>,
    wait: &Value<StateWait<'a>>,
    defaults: &PollDefaults,
    cancel: &CancellationToken,
) -> Result<Converged<String>, PollError> {
    if let Value::Value(wait) = wait {
        let request = wait.request(defaults);
        debug!(
            pending = ?request.pending,
            target = ?request.target,
            timeout = ?request.timeout,
            "waiting for convergence"
        );
        return request.wait_for(source, cancel).await;
    }

    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(PollError::Cancelled {
                attempts: 0,
                last_status: None,
            })
        }
        fetched = source.fetch() => fetched,
    };

    match fetched {
        Ok(Observation::Found { snapshot, status }) => Ok(Converged {
            snapshot: Some(snapshot),
            status,
            attempts: 1,
        }),
        Ok(Observation::NotFound) => Ok(Converged {
            snapshot: None,
            status: RESPONSE_NOT_FOUND.to_owned(),
            attempts: 1,
        }),
        Err(err) => Err(PollError::FetchFailed {
            attempts: 1,
            source: err,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::connection::local::ConnectionLocal;

    use super::*;

    #[test]
    fn plain_output_is_trimmed() {
        assert_eq!(parse_status("  Ready\n", None, MISSING_STATUS).unwrap(), "Ready");
    }

    #[test]
    fn empty_output_is_missing() {
        assert_eq!(parse_status("\n", None, MISSING_STATUS).unwrap(), "Unknown");
        assert_eq!(parse_status("", Some(""), "Absent").unwrap(), "Absent");
    }

    #[test]
    fn json_pointer_selects_the_label() {
        let output = r#"{"id": "/rules/r1", "properties": {"state": "InProgress"}}"#;
        assert_eq!(
            parse_status(output, Some("/properties/state"), MISSING_STATUS).unwrap(),
            "InProgress"
        );
    }

    #[test]
    fn missing_properties_is_unknown() {
        let output = r#"{"id": "/rules/r1"}"#;
        assert_eq!(
            parse_status(output, Some("/properties/state"), MISSING_STATUS).unwrap(),
            "Unknown"
        );
        let output = r#"{"id": "/rules/r1", "properties": null}"#;
        assert_eq!(
            parse_status(output, Some("/properties/state"), MISSING_STATUS).unwrap(),
            "Unknown"
        );
    }

    #[test]
    fn non_string_labels_are_rendered_as_json() {
        assert_eq!(
            parse_status(r#"{"ready": true}"#, Some("/ready"), MISSING_STATUS).unwrap(),
            "true"
        );
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_status("Ready", Some("/state"), MISSING_STATUS).is_err());
    }

    #[test]
    fn wait_block_falls_back_on_defaults() {
        let wait = StateWait {
            pending: Value::Value(vec![Value::Value(Cow::from("InProgress"))]),
            target: Value::Value(vec![Value::Value(Cow::from("Ready"))]),
            interval: Value::Null,
            min_wait: Value::Value(60),
            continuous_target_occurrence: Value::Value(5),
            ..Default::default()
        };
        let defaults = PollDefaults::default();

        let request = wait.request(&defaults);

        assert_eq!(
            request,
            PollRequest {
                min_wait: Duration::from_secs(60),
                continuous_target_occurrence: 5,
                ..PollRequest::new(["InProgress"], ["Ready"])
            }
        );
    }

    #[test]
    fn out_of_range_counts_saturate() {
        let wait = StateWait {
            target: Value::Value(vec![Value::Value(Cow::from("Ready"))]),
            continuous_target_occurrence: Value::Value(1 << 32),
            not_found_checks: Value::Value(i64::MAX),
            ..Default::default()
        };

        let request = wait.request(&PollDefaults::default());

        assert_eq!(request.continuous_target_occurrence, u32::MAX);
        assert_eq!(request.not_found_checks, Some(u32::MAX));
    }

    #[tokio::test]
    async fn cancelled_single_fetch_stops_the_command() {
        let status = StateStatus {
            cmd: Value::Value(Cow::from("sleep 5")),
            ..Default::default()
        };
        let source = CmdStatus {
            connect: &ConnectionLocal::default(),
            config: &Default::default(),
            status: &status,
            env: &[],
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = std::time::Instant::now();
        let err = converge(&source, &Value::Null, &PollDefaults::default(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PollError::Cancelled {
                attempts: 0,
                last_status: None
            }
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn exit_codes_mark_not_found() {
        let status = StateStatus {
            not_found_exit_codes: Value::Value(vec![Value::Value(4), Value::Value(44)]),
            ..Default::default()
        };

        assert!(status.is_not_found(44));
        assert!(!status.is_not_found(1));
        assert!(!StateStatus::default().is_not_found(4));
    }
}
