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

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_process::Command;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tf_provider::value::{ValueList, ValueString};
use tf_provider::{
    map, Attribute, AttributeConstraint, AttributePath, AttributeType, Description, Diagnostics,
};
use tracing::debug;

use super::{Connection, ExecutionResult};

const DEFAULT_INTERPRETER: [&str; 2] = ["sh", "-c"];

#[derive(Debug, Default, Clone)]
pub struct ConnectionLocal {}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionLocalConfig<'a> {
    pub interpreter: ValueList<ValueString<'a>>,
}

impl<'a> ConnectionLocalConfig<'a> {
    fn interpreter(&self) -> Vec<&str> {
        let interpreter = self
            .interpreter
            .iter()
            .flatten()
            .filter_map(|arg| arg.as_deref_option())
            .collect::<Vec<_>>();
        if interpreter.is_empty() {
            DEFAULT_INTERPRETER.to_vec()
        } else {
            interpreter
        }
    }
}

#[async_trait]
impl Connection for ConnectionLocal {
    const NAME: &'static str = "local";
    type Config<'a> = ConnectionLocalConfig<'a>;

    async fn execute<'a, 'b, I, K, V>(
        &self,
        config: &Self::Config<'a>,
        cmd: &str,
        dir: &str,
        env: I,
    ) -> Result<ExecutionResult>
    where
        'a: 'b,
        I: IntoIterator<Item = (&'b K, &'b V)> + Send + Sync + 'b,
        I::IntoIter: Send + Sync + 'b,
        K: AsRef<str> + Send + Sync + 'b,
        V: AsRef<str> + Send + Sync + 'b,
    {
        let interpreter = config.interpreter();
        let (program, args) = interpreter
            .split_first()
            .context("local interpreter is empty")?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(cmd)
            .envs(env.into_iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !dir.is_empty() {
            command.current_dir(dir);
        }

        debug!(program, dir, "executing local command");
        let output = command
            .output()
            .await
            .with_context(|| format!("could not spawn `{program}`"))?;

        Ok(ExecutionResult {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn validate<'a>(
        &self,
        diags: &mut Diagnostics,
        attr_path: AttributePath,
        config: &Self::Config<'a>,
    ) -> Option<()> {
        if let Some(interpreter) = config.interpreter.as_ref_option() {
            match interpreter.first() {
                None => diags.error_short(
                    "`interpreter` must not be empty",
                    attr_path.attribute("interpreter"),
                ),
                Some(program) if program.as_deref_option() == Some("") => diags.error_short(
                    "`interpreter` program must not be empty",
                    attr_path.attribute("interpreter").index(0),
                ),
                Some(_) => (),
            }
        }
        if diags.errors.is_empty() {
            Some(())
        } else {
            None
        }
    }

    fn schema() -> HashMap<String, Attribute> {
        map! {
            "interpreter" => Attribute {
                attr_type: AttributeType::List(AttributeType::String.into()),
                description: Description::plain("Program and arguments used to run commands (default: `[\"sh\", \"-c\"]`)"),
                constraint: AttributeConstraint::Optional,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use tf_provider::value::Value;

    use super::*;

    fn no_env() -> Vec<(Cow<'static, str>, Cow<'static, str>)> {
        Vec::new()
    }

    #[tokio::test]
    async fn captures_output_and_status() {
        let env = no_env();
        let res = ConnectionLocal::default()
            .execute(
                &Default::default(),
                "echo out; echo err >&2; exit 3",
                "",
                env.iter().map(|(k, v)| (k, v)),
            )
            .await
            .unwrap();

        assert_eq!(
            res,
            ExecutionResult {
                status: 3,
                stdout: "out\n".to_owned(),
                stderr: "err\n".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn forwards_env_and_dir() {
        let env = vec![(Cow::from("INPUT_name"), Cow::from("rule"))];
        let res = ConnectionLocal::default()
            .execute(
                &Default::default(),
                "printf '%s %s' \"$INPUT_name\" \"$(pwd)\"",
                "/",
                env.iter().map(|(k, v)| (k, v)),
            )
            .await
            .unwrap();

        assert_eq!(res.status, 0);
        assert_eq!(res.stdout, "rule /");
    }

    #[tokio::test]
    async fn custom_interpreter() {
        let config = ConnectionLocalConfig {
            interpreter: Value::Value(vec![
                Value::Value(Cow::from("sh")),
                Value::Value(Cow::from("-c")),
            ]),
        };
        let env = no_env();
        let res = ConnectionLocal::default()
            .execute(&config, "echo ok", "", env.iter().map(|(k, v)| (k, v)))
            .await
            .unwrap();

        assert_eq!(res.stdout, "ok\n");
    }

    #[tokio::test]
    async fn rejects_empty_interpreter() {
        let config = ConnectionLocalConfig {
            interpreter: Value::Value(vec![]),
        };
        let mut diags = Diagnostics::default();

        let res = ConnectionLocal::default()
            .validate(&mut diags, AttributePath::new("connect"), &config)
            .await;

        assert!(res.is_none());
        assert_eq!(diags.errors.len(), 1);
    }
}
