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
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use anyhow::anyhow;
use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tracing::{debug, info, warn};

use tf_provider::value::{Value, ValueEmpty, ValueMap, ValueNumber, ValueString};
use tf_provider::{schema::Schema, AttributePath, Diagnostics, Resource};

use crate::connection::Connection;
use crate::converge_provider::ProviderContext;
use crate::locks::NamedGuard;
use crate::poll::{Converged, PollError};
use crate::utils::{WithNormalize, WithSchema};

use super::state::{ResourceState, StateWait};
use super::status::{self, CmdStatus};
use super::{prepare_envs, report_poll_error, run_step};

#[derive(Debug, Default)]
pub struct GenericCmdResource<T: Connection> {
    pub(super) connect: T,
    pub(super) context: ProviderContext,
}

impl<T: Connection> GenericCmdResource<T> {
    pub fn new(connect: T, context: ProviderContext) -> Self {
        Self { connect, context }
    }

    async fn lock<'a>(&self, state: &ResourceState<'a, T>) -> NamedGuard<'_> {
        let names = state
            .lock
            .iter()
            .flatten()
            .filter_map(|name| name.as_deref_option())
            .collect::<Vec<_>>();
        let guard = self
            .context
            .locks
            .lock_many(&format!("{}_cmd", T::NAME), names)
            .await;
        debug!(locks = ?guard.names().collect::<Vec<_>>(), "locks held");
        guard
    }

    /// Fetch the status once, or until convergence when `wait` is set.
    ///
    /// Poll failures are reported in `diags` before being returned.
    #[allow(clippy::too_many_arguments)]
    async fn observe<'a>(
        &self,
        diags: &mut Diagnostics,
        state: &ResourceState<'a, T>,
        step: &str,
        wait_name: &str,
        wait: &Value<StateWait<'a>>,
        env: &[(Cow<'_, str>, Cow<'_, str>)],
        id: &str,
    ) -> Result<Converged<String>, PollError> {
        let attr_path = if wait.is_null() {
            AttributePath::new("read_status")
        } else {
            AttributePath::new(wait_name.to_owned())
        };

        let Value::Value(read_status) = &state.read_status else {
            let err = PollError::FetchFailed {
                attempts: 0,
                source: anyhow!("`read_status` block is missing"),
            };
            report_poll_error(diags, step, id, &err, attr_path);
            return Err(err);
        };

        let connection_default = Default::default();
        let connection = state.connect.as_ref().unwrap_or(&connection_default);
        let source = CmdStatus {
            connect: &self.connect,
            config: connection,
            status: read_status,
            env,
        };
        let defaults = *self.context.defaults.read();
        let cancel = self.context.stop.child_token();

        match status::converge(&source, wait, &defaults, &cancel).await {
            Ok(converged) => {
                info!(
                    step,
                    id,
                    status = converged.status.as_str(),
                    attempts = converged.attempts,
                    "resource observed"
                );
                Ok(converged)
            }
            Err(err) => {
                report_poll_error(diags, step, id, &err, attr_path);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl<T> Resource for GenericCmdResource<T>
where
    T: Connection,
    T: Debug,
    T: Clone,
{
    type State<'a> = ResourceState<'a, T>;
    type PrivateState<'a> = ValueNumber;
    type ProviderMetaState<'a> = ValueEmpty;

    fn schema(&self, _diags: &mut Diagnostics) -> Option<Schema> {
        Some(ResourceState::<T>::schema())
    }

    async fn validate<'a>(&self, diags: &mut Diagnostics, config: Self::State<'a>) -> Option<()> {
        self.validate(diags, &config, Default::default()).await;

        if diags.errors.is_empty() {
            Some(())
        } else {
            None
        }
    }

    async fn read<'a>(
        &self,
        diags: &mut Diagnostics,
        state: Self::State<'a>,
        private_state: Self::PrivateState<'a>,
        _provider_meta_state: Self::ProviderMetaState<'a>,
    ) -> Option<(Self::State<'a>, Self::PrivateState<'a>)> {
        let version = match private_state {
            Value::Value(version) => version.to_string(),
            Value::Null => String::new(),
            // Resource has been imported, but not yet updated
            Value::Unknown => return Some((state, private_state)),
        };

        let id = state.id.as_str();
        let mut state_env = prepare_envs(&[(&state.inputs, "INPUT_")]);
        state_env.push((Cow::from("ID"), Cow::from(id)));
        state_env.push((Cow::from("VERSION"), Cow::from(version)));

        let converged = self
            .observe(diags, &state, "read", "read_status", &Value::Null, &state_env, id)
            .await
            .ok()?;

        if converged.snapshot.is_none() {
            warn!(id, "resource not found, removing it from the state");
            diags.root_warning(
                "Resource not found",
                format!("Resource `{id}` could not be found anymore and has been removed from the state."),
            );
            return None;
        }

        let mut new_state = state.clone();
        new_state.record(converged);
        Some((new_state, private_state))
    }

    async fn plan_create<'a>(
        &self,
        diags: &mut Diagnostics,
        proposed_state: Self::State<'a>,
        _config_state: Self::State<'a>,
        _provider_meta_state: Self::ProviderMetaState<'a>,
    ) -> Option<(Self::State<'a>, Self::PrivateState<'a>)> {
        let mut state = proposed_state.clone();
        state.normalize(diags);

        Some((state, Default::default()))
    }

    async fn plan_update<'a>(
        &self,
        diags: &mut Diagnostics,
        prior_state: Self::State<'a>,
        proposed_state: Self::State<'a>,
        _config_state: Self::State<'a>,
        prior_private_state: Self::PrivateState<'a>,
        provider_meta_state: Self::ProviderMetaState<'a>,
    ) -> Option<(
        Self::State<'a>,
        Self::PrivateState<'a>,
        Vec<tf_provider::AttributePath>,
    )> {
        // Resource has been imported, but not yet updated.
        // Its status is read with the configured commands, before planning the update.
        let prior_state = if prior_private_state.is_unknown() {
            let imported = ResourceState {
                id: prior_state.id.clone(),
                inputs: prior_state.inputs.clone(),
                ..proposed_state.clone()
            };
            match self
                .read(diags, imported, Value::Value(0), provider_meta_state)
                .await
            {
                Some((state, _)) => state,
                None => {
                    if diags.errors.is_empty() {
                        diags.error_short(
                            "Imported resource does not exist",
                            AttributePath::new("read_status"),
                        );
                    }
                    return None;
                }
            }
        } else {
            prior_state
        };

        let mut state = proposed_state.clone();
        state.normalize(diags);

        let modified = find_modified(&prior_state.inputs, &proposed_state.inputs);
        let mut trigger_replace = Vec::new();

        if modified.is_empty() {
            state.status = prior_state.status.clone();
            state.snapshot = prior_state.snapshot.clone();
        } else {
            state.status = Value::Unknown;
            state.snapshot = Value::Unknown;
            if proposed_state.update.is_null() {
                trigger_replace = modified
                    .into_iter()
                    .map(|name| AttributePath::new("inputs").key(name.into_owned()))
                    .collect();
            }
        }

        Some((state, prior_private_state, trigger_replace))
    }

    async fn plan_destroy<'a>(
        &self,
        diags: &mut Diagnostics,
        _prior_state: Self::State<'a>,
        prior_private_state: Self::PrivateState<'a>,
        _provider_meta_state: Self::ProviderMetaState<'a>,
    ) -> Option<Self::PrivateState<'a>> {
        if prior_private_state.is_unknown() {
            diags.root_warning(
                "Destroy ignored on newly imported resource",
                "The resource has just been imported and need to be applied once in order to know how it should be destroyed.\nAs it has not been applied since import, it will be removed from state without calling the destroy command."
            );
        }
        Some(prior_private_state)
    }

    async fn create<'a>(
        &self,
        diags: &mut Diagnostics,
        planned_state: Self::State<'a>,
        _config_state: Self::State<'a>,
        mut private_state: Self::PrivateState<'a>,
        _provider_meta_state: Self::ProviderMetaState<'a>,
    ) -> Option<(Self::State<'a>, Self::PrivateState<'a>)> {
        let mut state = planned_state.clone();

        let version = private_state.unwrap_or_default() + 1;
        private_state = Value::from(version);

        let id = state.extract_id();

        let connection_default = Default::default();
        let connection = planned_state
            .connect
            .as_ref()
            .unwrap_or(&connection_default);

        let mut state_env = prepare_envs(&[(&planned_state.inputs, "INPUT_")]);
        state_env.push((Cow::from("ID"), Cow::from(id.as_ref())));
        state_env.push((Cow::from("VERSION"), Cow::from(version.to_string())));

        let _guard = self.lock(&planned_state).await;

        if planned_state.require_import == Value::Value(true) {
            let existing = self
                .observe(
                    diags,
                    &planned_state,
                    "create",
                    "read_status",
                    &Value::Null,
                    &state_env,
                    &id,
                )
                .await
                .ok()?;
            if existing.snapshot.is_some() {
                diags.error(
                    "Resource already exists",
                    format!(
                        "`read_status` found the resource with status `{}`. It needs to be imported into the state to be managed by Terraform.",
                        existing.status
                    ),
                    AttributePath::new("require_import"),
                );
                return None;
            }
        }

        run_step(
            diags,
            &self.connect,
            connection,
            "create",
            &planned_state.create,
            &state_env,
        )
        .await?;

        // The resource exists from now on, even if it did not converge
        match self
            .observe(
                diags,
                &planned_state,
                "create",
                "create_wait",
                &planned_state.create_wait,
                &state_env,
                &id,
            )
            .await
        {
            Ok(converged) => state.record(converged),
            Err(err) => state.record_failure(&err),
        }

        state.id = Value::Value(id);

        Some((state, private_state))
    }

    async fn update<'a>(
        &self,
        diags: &mut Diagnostics,
        prior_state: Self::State<'a>,
        planned_state: Self::State<'a>,
        _config_state: Self::State<'a>,
        mut private_state: Self::PrivateState<'a>,
        _provider_meta_state: Self::ProviderMetaState<'a>,
    ) -> Option<(Self::State<'a>, Self::PrivateState<'a>)> {
        let mut state = planned_state.clone();
        let id = state.extract_id();

        if find_modified(&prior_state.inputs, &planned_state.inputs).is_empty() {
            state.id = Value::Value(id);
            return Some((state, private_state));
        }

        let connection_default = Default::default();
        let connection = planned_state
            .connect
            .as_ref()
            .unwrap_or(&connection_default);

        let version = private_state.unwrap_or_default() + 1;
        private_state = Value::from(version);

        let mut state_env = prepare_envs(&[
            (&planned_state.inputs, "INPUT_"),
            (&prior_state.inputs, "PREVIOUS_"),
        ]);
        state_env.push((Cow::from("ID"), Cow::from(id.as_ref())));
        state_env.push((Cow::from("VERSION"), Cow::from(version.to_string())));

        let _guard = self.lock(&planned_state).await;

        run_step(
            diags,
            &self.connect,
            connection,
            "update",
            &planned_state.update,
            &state_env,
        )
        .await?;

        match self
            .observe(
                diags,
                &planned_state,
                "update",
                "update_wait",
                &planned_state.update_wait,
                &state_env,
                &id,
            )
            .await
        {
            Ok(converged) => state.record(converged),
            Err(err) => state.record_failure(&err),
        }

        state.id = Value::Value(id);

        Some((state, private_state))
    }

    async fn destroy<'a>(
        &self,
        diags: &mut Diagnostics,
        state: Self::State<'a>,
        planned_private_state: Self::PrivateState<'a>,
        _provider_meta_state: Self::ProviderMetaState<'a>,
    ) -> Option<()> {
        if planned_private_state.is_unknown() {
            return Some(());
        }

        let connection_default = Default::default();
        let connection = state.connect.as_ref().unwrap_or(&connection_default);

        let id = state.id.as_str();
        let mut state_env = prepare_envs(&[(&state.inputs, "INPUT_")]);
        state_env.push((Cow::from("ID"), Cow::from(id)));
        state_env.push((
            Cow::from("VERSION"),
            Cow::from(planned_private_state.unwrap_or(0).to_string()),
        ));

        let _guard = self.lock(&state).await;

        run_step(
            diags,
            &self.connect,
            connection,
            "destroy",
            &state.destroy,
            &state_env,
        )
        .await?;

        if !state.destroy_wait.is_null() {
            self.observe(
                diags,
                &state,
                "destroy",
                "destroy_wait",
                &state.destroy_wait,
                &state_env,
                id,
            )
            .await
            .ok()?;
        }

        Some(())
    }

    async fn import<'a>(
        &self,
        _diags: &mut Diagnostics,
        id: String,
    ) -> Option<(Self::State<'a>, Self::PrivateState<'a>)> {
        let mut inputs = BTreeMap::new();
        for var in id.split(',') {
            if var.is_empty() {
                continue;
            }

            let (key, value) = var.split_once('=').unwrap_or((var, ""));
            inputs.insert(
                Cow::Owned(key.to_owned()),
                Value::Value(Cow::Owned(value.to_owned())),
            );
        }

        let mut state = Self::State {
            inputs: Value::Value(inputs),
            ..Default::default()
        };
        state.id = Value::Value(state.extract_id());
        Some((state, Value::Unknown))
    }
}

fn find_modified<'a>(
    state: &'a ValueMap<'a, ValueString<'a>>,
    plan: &'a ValueMap<'a, ValueString<'a>>,
) -> BTreeSet<Cow<'a, str>> {
    match (state, plan) {
        (Value::Value(state), Value::Value(plan)) => {
            let mut modified = BTreeSet::new();

            for (k, x) in state {
                if plan.get(k) != Some(x) {
                    modified.insert(Cow::from(k.as_ref()));
                }
            }
            for k in plan.keys() {
                if !state.contains_key(k) {
                    modified.insert(Cow::from(k.as_ref()));
                }
            }

            modified
        }
        (_, Value::Value(plan)) => plan.keys().map(|k| Cow::from(k.as_ref())).collect(),
        (Value::Value(state), _) => state.keys().map(|k| Cow::from(k.as_ref())).collect(),
        _ => Default::default(),
    }
}

impl<'a, T: Connection> ResourceState<'a, T> {
    fn extract_id(&mut self) -> Cow<'a, str> {
        if let Value::Value(id) = std::mem::take(&mut self.id) {
            id
        } else {
            thread_rng()
                .sample_iter(&Alphanumeric)
                .take(30)
                .map(char::from)
                .collect()
        }
    }

    fn record(&mut self, converged: Converged<String>) {
        self.status = Value::Value(Cow::Owned(converged.status));
        self.snapshot = match converged.snapshot {
            Some(snapshot) => Value::Value(Cow::Owned(snapshot)),
            None => Value::Null,
        };
    }

    fn record_failure(&mut self, err: &PollError) {
        self.status = match err.last_status() {
            Some(status) => Value::Value(Cow::Owned(status.to_owned())),
            None => Value::Null,
        };
        self.snapshot = Value::Null;
    }
}

#[cfg(test)]
mod tests {
    use crate::cmd::state::{StateCmd, StateStatus};
    use crate::connection::local::ConnectionLocal;

    use super::*;

    fn string(value: &'static str) -> ValueString<'static> {
        Value::Value(Cow::from(value))
    }

    fn labels(labels: &[&'static str]) -> Value<Vec<ValueString<'static>>> {
        Value::Value(labels.iter().map(|label| string(label)).collect())
    }

    fn inputs(pairs: &[(&'static str, &'static str)]) -> ValueMap<'static, ValueString<'static>> {
        Value::Value(
            pairs
                .iter()
                .map(|(k, v)| (Cow::from(*k), string(v)))
                .collect(),
        )
    }

    fn resource() -> GenericCmdResource<ConnectionLocal> {
        GenericCmdResource::new(ConnectionLocal::default(), Default::default())
    }

    fn status_cmd(cmd: &'static str) -> Value<StateStatus<'static>> {
        Value::Value(StateStatus {
            cmd: string(cmd),
            status_path: string("/properties/state"),
            not_found_exit_codes: Value::Value(vec![Value::Value(4)]),
            ..Default::default()
        })
    }

    fn planned(status: &'static str) -> ResourceState<'static, ConnectionLocal> {
        ResourceState {
            id: Value::Unknown,
            inputs: inputs(&[("name", "rule")]),
            status: Value::Unknown,
            snapshot: Value::Unknown,
            create: Value::Value(StateCmd {
                cmd: string("test \"$INPUT_name\" = rule"),
                ..Default::default()
            }),
            read_status: status_cmd(status),
            create_wait: Value::Value(StateWait {
                pending: labels(&["InProgress"]),
                target: labels(&["Succeeded"]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_records_the_converged_status() {
        let mut diags = Diagnostics::default();
        let (state, private_state) = resource()
            .create(
                &mut diags,
                planned(r#"printf '{"properties":{"state":"Succeeded"}}'"#),
                Default::default(),
                Default::default(),
                Default::default(),
            )
            .await
            .unwrap();

        assert!(diags.errors.is_empty());
        assert_eq!(state.status, string("Succeeded"));
        assert_eq!(
            state.snapshot,
            string(r#"{"properties":{"state":"Succeeded"}}"#)
        );
        assert_eq!(state.id.as_str().len(), 30);
        assert_eq!(private_state, Value::Value(1));
    }

    #[tokio::test]
    async fn create_reports_a_failed_provisioning() {
        let mut diags = Diagnostics::default();
        let (state, _) = resource()
            .create(
                &mut diags,
                planned(r#"printf '{"properties":{"state":"Failed"}}'"#),
                Default::default(),
                Default::default(),
                Default::default(),
            )
            .await
            .unwrap();

        assert_eq!(diags.errors.len(), 1);
        assert_eq!(state.status, string("Failed"));
        assert!(state.snapshot.is_null());
        assert!(matches!(state.id, Value::Value(_)));
    }

    #[tokio::test]
    async fn create_stops_when_the_command_fails() {
        let mut diags = Diagnostics::default();
        let mut state = planned(r#"printf '{"properties":{"state":"Succeeded"}}'"#);
        state.inputs = inputs(&[("name", "other")]);

        let res = resource()
            .create(
                &mut diags,
                state,
                Default::default(),
                Default::default(),
                Default::default(),
            )
            .await;

        assert!(res.is_none());
        assert_eq!(diags.errors.len(), 1);
    }

    fn scratch_path(name: &str) -> std::path::PathBuf {
        let suffix: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        std::env::temp_dir().join(format!("converge-{name}-{suffix}"))
    }

    /// Resource whose status exists once `marker` exists, and whose creation writes `created`
    fn marker_resource(
        marker: &std::path::Path,
        created: &std::path::Path,
    ) -> ResourceState<'static, ConnectionLocal> {
        let marker = marker.display();
        let created = created.display();
        ResourceState {
            require_import: Value::Value(true),
            create: Value::Value(StateCmd {
                cmd: Value::Value(Cow::Owned(format!("touch '{marker}' '{created}'"))),
                ..Default::default()
            }),
            read_status: Value::Value(StateStatus {
                cmd: Value::Value(Cow::Owned(format!(
                    "test -e '{marker}' || exit 4; echo Succeeded"
                ))),
                not_found_exit_codes: Value::Value(vec![Value::Value(4)]),
                ..Default::default()
            }),
            ..planned("true")
        }
    }

    #[tokio::test]
    async fn create_refuses_existing_resources() {
        let marker = scratch_path("marker");
        let created = scratch_path("created");
        std::fs::write(&marker, "").unwrap();

        let mut diags = Diagnostics::default();
        let res = resource()
            .create(
                &mut diags,
                marker_resource(&marker, &created),
                Default::default(),
                Default::default(),
                Default::default(),
            )
            .await;
        let was_created = created.exists();
        std::fs::remove_file(&marker).unwrap();

        assert!(res.is_none());
        assert_eq!(diags.errors.len(), 1);
        assert!(!was_created);
    }

    #[tokio::test]
    async fn create_checks_absence_before_running() {
        let marker = scratch_path("marker");
        let created = scratch_path("created");

        let mut diags = Diagnostics::default();
        let res = resource()
            .create(
                &mut diags,
                marker_resource(&marker, &created),
                Default::default(),
                Default::default(),
                Default::default(),
            )
            .await;
        let was_created = created.exists();
        let _ = std::fs::remove_file(&marker);
        let _ = std::fs::remove_file(&created);

        let (state, _) = res.unwrap();
        assert!(diags.errors.is_empty());
        assert!(was_created);
        assert_eq!(state.status, string("Succeeded"));
    }

    #[tokio::test]
    async fn read_removes_missing_resources() {
        let mut diags = Diagnostics::default();
        let state = ResourceState {
            id: string("abc"),
            ..planned("exit 4")
        };

        let res = resource()
            .read(&mut diags, state, Value::Value(1), Default::default())
            .await;

        assert!(res.is_none());
        assert!(diags.errors.is_empty());
    }

    #[tokio::test]
    async fn read_skips_pending_imports() {
        let mut diags = Diagnostics::default();
        let state = ResourceState {
            id: string("abc"),
            ..planned("exit 1")
        };

        let (state, private_state) = resource()
            .read(&mut diags, state, Value::Unknown, Default::default())
            .await
            .unwrap();

        assert!(diags.errors.is_empty());
        assert!(private_state.is_unknown());
        assert!(state.status.is_unknown());
    }

    #[tokio::test]
    async fn import_parses_inputs() {
        let mut diags = Diagnostics::default();
        let (state, private_state) = resource()
            .import(&mut diags, "name=rule,zone=,".to_owned())
            .await
            .unwrap();

        assert_eq!(state.inputs, inputs(&[("name", "rule"), ("zone", "")]));
        assert!(matches!(state.id, Value::Value(_)));
        assert!(private_state.is_unknown());
    }

    #[tokio::test]
    async fn modified_inputs_trigger_replace_without_update() {
        let mut diags = Diagnostics::default();
        let prior = ResourceState {
            id: string("abc"),
            status: string("Succeeded"),
            snapshot: string("{}"),
            ..planned("true")
        };
        let proposed = ResourceState {
            inputs: inputs(&[("name", "renamed")]),
            ..prior.clone()
        };

        let (state, _, replace) = resource()
            .plan_update(
                &mut diags,
                prior.clone(),
                proposed.clone(),
                proposed.clone(),
                Value::Value(1),
                Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(replace.len(), 1);
        assert!(state.status.is_unknown());

        let proposed = ResourceState {
            update: Value::Value(StateCmd {
                cmd: string("true"),
                ..Default::default()
            }),
            ..proposed
        };
        let (_, _, replace) = resource()
            .plan_update(
                &mut diags,
                prior,
                proposed.clone(),
                proposed,
                Value::Value(1),
                Default::default(),
            )
            .await
            .unwrap();
        assert!(replace.is_empty());
    }

    #[test]
    fn modified_inputs() {
        let prior = inputs(&[("a", "1"), ("b", "2")]);
        let plan = inputs(&[("a", "1"), ("b", "3"), ("c", "4")]);

        assert_eq!(
            find_modified(&prior, &plan),
            BTreeSet::from([Cow::from("b"), Cow::from("c")])
        );
        assert!(find_modified(&prior, &prior).is_empty());
        assert_eq!(find_modified(&Value::Null, &prior).len(), 2);
    }
}
