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

use std::collections::BTreeSet;

use async_trait::async_trait;
use tf_provider::value::{Value, ValueNumber, ValueString};
use tf_provider::{AttributePath, Diagnostics};

use crate::connection::Connection;
use crate::converge_provider::MAX_SECONDS;
use crate::utils::WithValidate;

use super::data_source::GenericCmdDataSource;
use super::resource::GenericCmdResource;
use super::state::{DataSourceState, ResourceState, StateCmd, StateStatus, StateWait};

#[async_trait]
impl<'a> WithValidate for StateCmd<'a> {
    async fn validate(&self, diags: &mut Diagnostics, attr_path: AttributePath) {
        if let Value::Value(cmd) = &self.cmd {
            if cmd.is_empty() {
                diags.error_short("`cmd` should not be empty", attr_path.attribute("cmd"));
            }
        }
    }
}

#[async_trait]
impl<'a> WithValidate for StateStatus<'a> {
    async fn validate(&self, diags: &mut Diagnostics, attr_path: AttributePath) {
        match &self.cmd {
            Value::Value(cmd) if cmd.is_empty() => {
                diags.error_short(
                    "`cmd` should not be empty",
                    attr_path.clone().attribute("cmd"),
                );
            }
            Value::Null => {
                diags.error_short(
                    "`cmd` should not be null",
                    attr_path.clone().attribute("cmd"),
                );
            }
            _ => (),
        }

        if let Value::Value(path) = &self.status_path {
            if !path.is_empty() && !path.starts_with('/') {
                diags.error(
                    "`status_path` is not a JSON pointer",
                    format!("`{path}` should start with `/`, for instance `/properties/state`"),
                    attr_path.clone().attribute("status_path"),
                );
            }
        }

        for (i, code) in self.not_found_exit_codes.iter().flatten().enumerate() {
            if let Value::Value(code) = code {
                if !(1..=255).contains(code) {
                    diags.error_short(
                        format!("`{code}` is not a failure exit code"),
                        attr_path
                            .clone()
                            .attribute("not_found_exit_codes")
                            .index(i as i64),
                    );
                }
            }
        }
    }
}

fn check_range(
    diags: &mut Diagnostics,
    attr_path: &AttributePath,
    name: &str,
    value: &ValueNumber,
    min: i64,
    max: i64,
) {
    if let Value::Value(value) = value {
        if !(min..=max).contains(value) {
            diags.error_short(
                format!("`{name}` should be between {min} and {max}"),
                attr_path.clone().attribute(name.to_owned()),
            );
        }
    }
}

fn known_labels<'l>(labels: &'l [ValueString<'_>]) -> BTreeSet<&'l str> {
    labels
        .iter()
        .filter_map(|label| label.as_deref_option())
        .collect()
}

#[async_trait]
impl<'a> WithValidate for StateWait<'a> {
    async fn validate(&self, diags: &mut Diagnostics, attr_path: AttributePath) {
        if let Value::Value(target) = &self.target {
            if target.is_empty() {
                diags.error_short(
                    "`target` should not be empty",
                    attr_path.clone().attribute("target"),
                );
            }
            if let Value::Value(pending) = &self.pending {
                let target = known_labels(target);
                for label in known_labels(pending).intersection(&target) {
                    diags.error(
                        "Status is both pending and target",
                        format!("`{label}` cannot be in both `pending` and `target`"),
                        attr_path.clone().attribute("pending"),
                    );
                }
            }
        }

        let max_count = i64::from(u32::MAX);
        for (name, value, min, max) in [
            ("interval", &self.interval, 0, MAX_SECONDS),
            ("min_wait", &self.min_wait, 0, MAX_SECONDS),
            ("delay", &self.delay, 0, MAX_SECONDS),
            ("timeout", &self.timeout, 1, MAX_SECONDS),
            (
                "continuous_target_occurrence",
                &self.continuous_target_occurrence,
                1,
                max_count,
            ),
            ("not_found_checks", &self.not_found_checks, 0, max_count),
        ] {
            check_range(diags, &attr_path, name, value, min, max);
        }
    }
}

async fn validate_block<B: WithValidate + Sync>(
    diags: &mut Diagnostics,
    block: &Value<B>,
    attr_path: AttributePath,
) {
    if let Value::Value(block) = block {
        block.validate(diags, attr_path.index(0)).await;
    }
}

impl<T: Connection> GenericCmdResource<T> {
    pub(super) async fn validate<'a>(
        &self,
        diags: &mut Diagnostics,
        state: &ResourceState<'a, T>,
        attr_path: AttributePath,
    ) {
        if state.read_status.is_null() {
            diags.error_short(
                "`read_status` block is required",
                attr_path.clone().attribute("read_status"),
            );
        }
        validate_block(diags, &state.read_status, attr_path.clone().attribute("read_status")).await;
        for (name, block) in [
            ("create", &state.create),
            ("update", &state.update),
            ("destroy", &state.destroy),
        ] {
            validate_block(diags, block, attr_path.clone().attribute(name)).await;
        }
        for (name, block) in [
            ("create_wait", &state.create_wait),
            ("update_wait", &state.update_wait),
            ("destroy_wait", &state.destroy_wait),
        ] {
            validate_block(diags, block, attr_path.clone().attribute(name)).await;
        }

        for (i, name) in state.lock.iter().flatten().enumerate() {
            if let Value::Value(name) = name {
                if name.is_empty() {
                    diags.error_short(
                        "Lock names should not be empty",
                        attr_path.clone().attribute("lock").index(i as i64),
                    );
                }
            }
        }

        if let Value::Value(connect) = &state.connect {
            self.connect
                .validate(diags, attr_path.attribute("connect").index(0), connect)
                .await;
        }
    }
}

impl<T: Connection> GenericCmdDataSource<T> {
    pub(super) async fn validate<'a>(
        &self,
        diags: &mut Diagnostics,
        state: &DataSourceState<'a, T>,
        attr_path: AttributePath,
    ) {
        if state.read_status.is_null() {
            diags.error_short(
                "`read_status` block is required",
                attr_path.clone().attribute("read_status"),
            );
        }
        validate_block(diags, &state.read_status, attr_path.clone().attribute("read_status")).await;
        validate_block(diags, &state.wait, attr_path.clone().attribute("wait")).await;

        if let Value::Value(connect) = &state.connect {
            self.connect
                .validate(diags, attr_path.attribute("connect").index(0), connect)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use super::*;

    fn labels(labels: &[&'static str]) -> Value<Vec<Value<Cow<'static, str>>>> {
        Value::Value(
            labels
                .iter()
                .map(|label| Value::Value(Cow::from(*label)))
                .collect(),
        )
    }

    #[tokio::test]
    async fn valid_wait_block() {
        let wait = StateWait {
            pending: labels(&["Initializing", "InProgress"]),
            target: labels(&["Ready"]),
            timeout: Value::Value(1800),
            continuous_target_occurrence: Value::Value(5),
            ..Default::default()
        };
        let mut diags = Diagnostics::default();

        wait.validate(&mut diags, AttributePath::new("create_wait"))
            .await;

        assert!(diags.errors.is_empty());
    }

    #[tokio::test]
    async fn overlapping_and_out_of_range_wait_block() {
        let wait = StateWait {
            pending: labels(&["InProgress", "Ready"]),
            target: labels(&["Ready"]),
            timeout: Value::Value(0),
            continuous_target_occurrence: Value::Value(0),
            interval: Value::Unknown,
            ..Default::default()
        };
        let mut diags = Diagnostics::default();

        wait.validate(&mut diags, AttributePath::new("create_wait"))
            .await;

        // overlap, timeout, continuous_target_occurrence
        assert_eq!(diags.errors.len(), 3);
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let wait = StateWait {
            target: labels(&["Ready"]),
            timeout: Value::Value(i64::MAX),
            interval: Value::Value(MAX_SECONDS),
            continuous_target_occurrence: Value::Value(1 << 32),
            ..Default::default()
        };
        let mut diags = Diagnostics::default();

        wait.validate(&mut diags, AttributePath::new("create_wait"))
            .await;

        // timeout, continuous_target_occurrence
        assert_eq!(diags.errors.len(), 2);
    }

    #[tokio::test]
    async fn empty_target_is_rejected() {
        let wait = StateWait {
            target: labels(&[]),
            ..Default::default()
        };
        let mut diags = Diagnostics::default();

        wait.validate(&mut diags, AttributePath::new("wait")).await;

        assert_eq!(diags.errors.len(), 1);
    }

    #[tokio::test]
    async fn status_block_checks() {
        let status = StateStatus {
            cmd: Value::Value(Cow::from("")),
            status_path: Value::Value(Cow::from("properties.state")),
            not_found_exit_codes: Value::Value(vec![Value::Value(0), Value::Value(4)]),
            ..Default::default()
        };
        let mut diags = Diagnostics::default();

        status
            .validate(&mut diags, AttributePath::new("read_status"))
            .await;

        assert_eq!(diags.errors.len(), 3);
    }
}
