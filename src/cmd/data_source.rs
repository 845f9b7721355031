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
use std::fmt::Debug;

use async_trait::async_trait;
use tracing::debug;

use tf_provider::{AttributePath, DataSource, Diagnostics, Schema, Value, ValueEmpty};

use crate::connection::Connection;
use crate::converge_provider::ProviderContext;
use crate::utils::{WithNormalize, WithSchema};

use super::state::DataSourceState;
use super::status::{self, CmdStatus};
use super::{prepare_envs, report_poll_error};

#[derive(Debug, Default)]
pub struct GenericCmdDataSource<T: Connection> {
    pub(super) connect: T,
    pub(super) context: ProviderContext,
}

impl<T: Connection> GenericCmdDataSource<T> {
    pub fn new(connect: T, context: ProviderContext) -> Self {
        Self { connect, context }
    }
}

#[async_trait]
impl<T> DataSource for GenericCmdDataSource<T>
where
    T: Connection,
    T: Debug,
    T: Clone,
{
    type State<'a> = DataSourceState<'a, T>;
    type ProviderMetaState<'a> = ValueEmpty;

    fn schema(&self, _diags: &mut Diagnostics) -> Option<Schema> {
        Some(DataSourceState::<T>::schema())
    }

    async fn validate<'a>(&self, diags: &mut Diagnostics, config: Self::State<'a>) -> Option<()> {
        self.validate(diags, &config, AttributePath::default())
            .await;

        if diags.errors.is_empty() {
            Some(())
        } else {
            None
        }
    }

    async fn read<'a>(
        &self,
        diags: &mut Diagnostics,
        config: Self::State<'a>,
        _provider_meta_state: Self::ProviderMetaState<'a>,
    ) -> Option<Self::State<'a>> {
        let state_env = prepare_envs(&[(&config.inputs, "INPUT_")]);

        let mut state = config.clone();
        state.normalize(diags);

        let Value::Value(read_status) = &config.read_status else {
            diags.error_short(
                "`read_status` block is required",
                AttributePath::new("read_status"),
            );
            return None;
        };
        let connection_default = Default::default();
        let connection = config.connect.as_ref().unwrap_or(&connection_default);
        let source = CmdStatus {
            connect: &self.connect,
            config: connection,
            status: read_status,
            env: &state_env,
        };
        let defaults = *self.context.defaults.read();
        let cancel = self.context.stop.child_token();
        let name = format!("{}_status", T::NAME);

        let converged = match status::converge(&source, &config.wait, &defaults, &cancel).await {
            Ok(converged) => converged,
            Err(err) => {
                let attr_path = if config.wait.is_null() {
                    AttributePath::new("read_status")
                } else {
                    AttributePath::new("wait")
                };
                report_poll_error(diags, "read", &name, &err, attr_path);
                return None;
            }
        };
        debug!(status = converged.status.as_str(), "status read");

        // A missing resource is only expected when waiting for it
        let Some(snapshot) = converged.snapshot else {
            if config.wait.is_null() {
                diags.error_short(
                    "Resource not found",
                    AttributePath::new("read_status"),
                );
                return None;
            }
            state.status = Value::Value(Cow::Owned(converged.status));
            state.snapshot = Value::Null;
            return Some(state);
        };

        state.status = Value::Value(Cow::Owned(converged.status));
        state.snapshot = Value::Value(Cow::Owned(snapshot));
        Some(state)
    }
}
