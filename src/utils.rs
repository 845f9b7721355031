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

use async_trait::async_trait;

use tf_provider::{AttributePath, Diagnostics, Schema, Value};

pub(crate) trait WithSchema {
    fn schema() -> Schema;
}

#[async_trait]
pub(crate) trait WithValidate {
    async fn validate(&self, diags: &mut Diagnostics, attr_path: AttributePath);
}

pub(crate) trait WithNormalize {
    fn normalize(&mut self, diags: &mut Diagnostics);
}

pub(crate) trait WithCmd {
    fn cmd(&self) -> &str;
    fn dir(&self) -> &str;
}

impl<T: WithCmd> WithCmd for Value<T> {
    fn cmd(&self) -> &str {
        self.as_ref().map_or("", WithCmd::cmd)
    }
    fn dir(&self) -> &str {
        self.as_ref().map_or("", WithCmd::dir)
    }
}

pub(crate) trait WithEnv {
    type Env;
    fn env(&self) -> &Self::Env;
}

impl<T, E> WithEnv for Value<T>
where
    T: WithEnv<Env = Value<E>>,
{
    type Env = T::Env;
    fn env(&self) -> &Self::Env {
        self.as_ref().map_or(&Value::Null, WithEnv::env)
    }
}
