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

use tf_provider::value::{Value, ValueMap, ValueString};
use tf_provider::{AttributePath, Diagnostics};
use tracing::{info, warn};

use crate::connection::Connection;
use crate::poll::PollError;
use crate::utils::{WithCmd, WithEnv};

mod data_source;
mod normalize;
mod resource;
mod state;
mod status;
mod validate;

pub use data_source::GenericCmdDataSource;
pub use resource::GenericCmdResource;

use state::StateCmd;

fn prepare_envs<'a>(
    envs: &[(&'a ValueMap<'a, ValueString<'a>>, &'a str)],
) -> Vec<(Cow<'a, str>, Cow<'a, str>)> {
    envs.iter()
        .flat_map(|(env, prefix)| {
            env.iter().flatten().filter_map(|(k, v)| {
                Some((
                    Cow::Owned(format!("{}{}", *prefix, k)),
                    Cow::Borrowed(v.as_deref_option()?),
                ))
            })
        })
        .collect()
}

fn with_env<'a>(
    base_env: &'a [(Cow<'a, str>, Cow<'a, str>)],
    extra_env: &'a ValueMap<'a, ValueString<'a>>,
) -> impl Iterator<Item = (&'a Cow<'a, str>, &'a Cow<'a, str>)> {
    base_env.iter().map(|(k, v)| (k, v)).chain(
        extra_env
            .iter()
            .flatten()
            .filter_map(|(k, v)| Some((k, v.as_ref_option()?))),
    )
}

/// Run the mutating command of `step`, reporting its outcome in `diags`.
///
/// Returns `None` if the command could not be run or failed.
async fn run_step<'a, T: Connection>(
    diags: &mut Diagnostics,
    connect: &T,
    config: &T::Config<'a>,
    step: &str,
    block: &Value<StateCmd<'a>>,
    env: &[(Cow<'_, str>, Cow<'_, str>)],
) -> Option<()> {
    let cmd = block.cmd();
    if cmd.is_empty() {
        return Some(());
    }

    let attr_path = AttributePath::new(step.to_owned()).index(0).attribute("cmd");
    info!(step, "running command");
    match connect
        .execute(config, cmd, block.dir(), with_env(env, block.env()))
        .await
    {
        Ok(res) => {
            if !res.stdout.is_empty() {
                diags.warning(
                    format!("`{step}` stdout was not empty"),
                    res.stdout,
                    attr_path.clone(),
                );
            }
            if res.status == 0 {
                if !res.stderr.is_empty() {
                    diags.warning(
                        format!("`{step}` succeeded but stderr was not empty"),
                        res.stderr,
                        attr_path,
                    );
                }
                Some(())
            } else {
                warn!(step, status = res.status, "command failed");
                diags.error(
                    format!("`{step}` failed with status code: {}", res.status),
                    res.stderr,
                    attr_path,
                );
                None
            }
        }
        Err(err) => {
            diags.error(
                format!("Failed to {step} resource"),
                err.to_string(),
                attr_path,
            );
            None
        }
    }
}

/// Translate a poll failure into a diagnostic naming the resource
fn report_poll_error(
    diags: &mut Diagnostics,
    step: &str,
    id: &str,
    err: &PollError,
    attr_path: AttributePath,
) {
    warn!(
        step,
        id,
        attempts = err.attempts(),
        error = %err,
        "resource did not converge"
    );
    let summary = if err.is_failure() {
        format!("Provisioning of resource `{id}` failed during `{step}`")
    } else {
        format!("Resource `{id}` is still provisioning after `{step}`")
    };
    diags.error(summary, err.to_string(), attr_path);
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn envs_are_prefixed_and_skip_nulls() {
        let inputs: ValueMap<ValueString> = Value::Value(BTreeMap::from([
            (Cow::from("name"), Value::Value(Cow::from("rule"))),
            (Cow::from("server"), Value::Null),
        ]));
        let previous: ValueMap<ValueString> = Value::Value(BTreeMap::from([(
            Cow::from("name"),
            Value::Value(Cow::from("old")),
        )]));

        let env = prepare_envs(&[(&inputs, "INPUT_"), (&previous, "PREVIOUS_")]);

        assert_eq!(
            env,
            vec![
                (Cow::from("INPUT_name"), Cow::from("rule")),
                (Cow::from("PREVIOUS_name"), Cow::from("old")),
            ]
        );
    }

    #[test]
    fn block_env_is_appended() {
        let base = vec![(Cow::from("ID"), Cow::from("abc"))];
        let extra: ValueMap<ValueString> = Value::Value(BTreeMap::from([(
            Cow::from("REGION"),
            Value::Value(Cow::from("westeurope")),
        )]));

        let env = with_env(&base, &extra)
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>();

        assert_eq!(env, vec!["ID=abc", "REGION=westeurope"]);
    }
}
