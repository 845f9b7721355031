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

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use tf_provider::value::{Value, ValueNumber};
use tf_provider::{
    map, Attribute, AttributeConstraint, AttributePath, AttributeType, Block, Description,
    Diagnostics, Provider, Schema,
};

use crate::{
    cmd::{GenericCmdDataSource, GenericCmdResource},
    connection::local::ConnectionLocal,
    locks::NamedLocks,
};

/// Poll settings used when a wait block leaves them unset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDefaults {
    pub interval: Duration,
    pub min_wait: Duration,
    pub timeout: Duration,
}

impl Default for PollDefaults {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            min_wait: Duration::ZERO,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Handles shared between the provider and every resource it serves
#[derive(Debug, Default, Clone)]
pub struct ProviderContext {
    pub defaults: Arc<RwLock<PollDefaults>>,
    pub locks: Arc<NamedLocks>,
    pub stop: CancellationToken,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub default_interval: ValueNumber,
    pub default_min_wait: ValueNumber,
    pub default_timeout: ValueNumber,
}

/// Largest number of seconds accepted for a poll setting (about 10 years)
pub(crate) const MAX_SECONDS: i64 = 10 * 366 * 24 * 60 * 60;

/// Convert a number of seconds, falling back on `default` when null or unknown
pub(crate) fn seconds_or(value: &ValueNumber, default: Duration) -> Duration {
    match value {
        Value::Value(seconds) if *seconds >= 0 => {
            Duration::from_secs((*seconds).min(MAX_SECONDS) as u64)
        }
        _ => default,
    }
}

impl ProviderConfig {
    fn defaults(&self) -> PollDefaults {
        let base = PollDefaults::default();
        PollDefaults {
            interval: seconds_or(&self.default_interval, base.interval),
            min_wait: seconds_or(&self.default_min_wait, base.min_wait),
            timeout: seconds_or(&self.default_timeout, base.timeout),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ConvergeProvider {
    context: ProviderContext,
}

impl ConvergeProvider {
    pub fn new(stop: CancellationToken) -> Self {
        Self {
            context: ProviderContext {
                stop,
                ..Default::default()
            },
        }
    }
}

fn seconds_attribute(description: &str) -> Attribute {
    Attribute {
        attr_type: AttributeType::Number,
        description: Description::plain(description),
        constraint: AttributeConstraint::Optional,
        ..Default::default()
    }
}

#[async_trait]
impl Provider for ConvergeProvider {
    type Config<'a> = ProviderConfig;
    type MetaState<'a> = tf_provider::ValueEmpty;

    fn schema(&self, _diags: &mut Diagnostics) -> Option<Schema> {
        Some(Schema {
            version: 1,
            block: Block {
                attributes: map! {
                    "default_interval" => seconds_attribute("Default number of seconds between two status fetches (default: 10)"),
                    "default_min_wait" => seconds_attribute("Default minimum number of seconds between two status fetches (default: 0)"),
                    "default_timeout" => seconds_attribute("Default number of seconds to wait for convergence (default: 1800)"),
                },
                description: Description::plain("converge"),
                ..Default::default()
            },
        })
    }

    async fn validate<'a>(&self, diags: &mut Diagnostics, config: Self::Config<'a>) -> Option<()> {
        for (name, value) in [
            ("default_interval", &config.default_interval),
            ("default_min_wait", &config.default_min_wait),
            ("default_timeout", &config.default_timeout),
        ] {
            if let Value::Value(seconds) = value {
                if !(0..=MAX_SECONDS).contains(seconds) {
                    diags.error_short(
                        format!("`{name}` should be between 0 and {MAX_SECONDS}"),
                        AttributePath::new(name),
                    );
                }
            }
        }
        if config.default_timeout == Value::Value(0) {
            diags.error_short(
                "`default_timeout` must be positive",
                AttributePath::new("default_timeout"),
            );
        }

        if diags.errors.is_empty() {
            Some(())
        } else {
            None
        }
    }

    async fn configure<'a>(
        &self,
        _diags: &mut Diagnostics,
        terraform_version: String,
        config: Self::Config<'a>,
    ) -> Option<()> {
        let defaults = config.defaults();
        info!(
            terraform_version = terraform_version.as_str(),
            interval = ?defaults.interval,
            min_wait = ?defaults.min_wait,
            timeout = ?defaults.timeout,
            "provider configured"
        );
        *self.context.defaults.write() = defaults;
        Some(())
    }

    fn get_resources(
        &self,
        _diags: &mut Diagnostics,
    ) -> Option<std::collections::HashMap<String, Box<dyn tf_provider::resource::DynamicResource>>>
    {
        Some(map! {
            "local_cmd" => GenericCmdResource::new(ConnectionLocal::default(), self.context.clone()),
        })
    }

    fn get_data_sources(
        &self,
        _diags: &mut Diagnostics,
    ) -> Option<
        std::collections::HashMap<String, Box<dyn tf_provider::data_source::DynamicDataSource>>,
    > {
        Some(map! {
            "local_status" => GenericCmdDataSource::new(ConnectionLocal::default(), self.context.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_config_keeps_defaults() {
        assert_eq!(ProviderConfig::default().defaults(), PollDefaults::default());
    }

    #[test]
    fn config_overrides_defaults() {
        let config = ProviderConfig {
            default_interval: Value::Value(2),
            default_min_wait: Value::Null,
            default_timeout: Value::Value(60),
        };
        assert_eq!(
            config.defaults(),
            PollDefaults {
                interval: Duration::from_secs(2),
                min_wait: Duration::ZERO,
                timeout: Duration::from_secs(60),
            }
        );
    }

    #[tokio::test]
    async fn configure_updates_shared_defaults() {
        let provider = ConvergeProvider::default();
        let shared = provider.context.defaults.clone();
        let mut diags = Diagnostics::default();

        provider
            .configure(
                &mut diags,
                "1.6.0".to_owned(),
                ProviderConfig {
                    default_timeout: Value::Value(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(shared.read().timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn negative_seconds_are_rejected() {
        let provider = ConvergeProvider::default();
        let mut diags = Diagnostics::default();

        let res = provider
            .validate(
                &mut diags,
                ProviderConfig {
                    default_interval: Value::Value(-1),
                    ..Default::default()
                },
            )
            .await;

        assert!(res.is_none());
        assert_eq!(diags.errors.len(), 1);
    }

    #[tokio::test]
    async fn oversized_timeout_is_rejected() {
        let provider = ConvergeProvider::default();
        let mut diags = Diagnostics::default();

        let res = provider
            .validate(
                &mut diags,
                ProviderConfig {
                    default_timeout: Value::Value(i64::MAX),
                    ..Default::default()
                },
            )
            .await;

        assert!(res.is_none());
        assert_eq!(diags.errors.len(), 1);
    }

    #[test]
    fn seconds_are_capped() {
        assert_eq!(
            seconds_or(&Value::Value(i64::MAX), Duration::ZERO),
            Duration::from_secs(MAX_SECONDS as u64)
        );
        assert_eq!(seconds_or(&Value::Value(-1), Duration::ZERO), Duration::ZERO);
    }
}
