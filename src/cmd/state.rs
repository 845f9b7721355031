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

use serde::{Deserialize, Serialize};
use tf_provider::map;
use tf_provider::schema::{
    Attribute, AttributeConstraint, AttributeType, Block, Description, NestedBlock, Schema,
};
use tf_provider::value::{self, Value, ValueList, ValueMap, ValueNumber, ValueString};

use crate::connection::Connection;
use crate::utils::{WithCmd, WithEnv, WithSchema};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ResourceState<'a, T>
where
    T: Connection,
{
    #[serde(borrow = "'a")]
    pub id: ValueString<'a>,
    pub inputs: ValueMap<'a, ValueString<'a>>,
    pub lock: ValueList<ValueString<'a>>,
    pub status: ValueString<'a>,
    pub snapshot: ValueString<'a>,
    pub require_import: Value<bool>,
    #[serde(with = "value::serde_as_vec")]
    pub create: Value<StateCmd<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub update: Value<StateCmd<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub destroy: Value<StateCmd<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub read_status: Value<StateStatus<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub create_wait: Value<StateWait<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub update_wait: Value<StateWait<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub destroy_wait: Value<StateWait<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub connect: Value<T::Config<'a>>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DataSourceState<'a, T>
where
    T: Connection,
{
    #[serde(borrow = "'a")]
    pub inputs: ValueMap<'a, ValueString<'a>>,
    pub status: ValueString<'a>,
    pub snapshot: ValueString<'a>,
    #[serde(with = "value::serde_as_vec")]
    pub read_status: Value<StateStatus<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub wait: Value<StateWait<'a>>,
    #[serde(with = "value::serde_as_vec")]
    pub connect: Value<T::Config<'a>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCmd<'a> {
    #[serde(borrow = "'a")]
    pub cmd: ValueString<'a>,
    pub dir: ValueString<'a>,
    pub env: ValueMap<'a, ValueString<'a>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStatus<'a> {
    #[serde(borrow = "'a")]
    pub cmd: ValueString<'a>,
    pub dir: ValueString<'a>,
    pub env: ValueMap<'a, ValueString<'a>>,
    pub status_path: ValueString<'a>,
    pub missing_status: ValueString<'a>,
    pub not_found_exit_codes: ValueList<ValueNumber>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateWait<'a> {
    #[serde(borrow = "'a")]
    pub pending: ValueList<ValueString<'a>>,
    pub target: ValueList<ValueString<'a>>,
    pub interval: ValueNumber,
    pub min_wait: ValueNumber,
    pub delay: ValueNumber,
    pub timeout: ValueNumber,
    pub continuous_target_occurrence: ValueNumber,
    pub not_found_status: ValueString<'a>,
    pub not_found_checks: ValueNumber,
}

impl<'a> WithCmd for StateCmd<'a> {
    fn cmd(&self) -> &str {
        self.cmd.as_str()
    }
    fn dir(&self) -> &str {
        self.dir.as_str()
    }
}

impl<'a> WithEnv for StateCmd<'a> {
    type Env = ValueMap<'a, ValueString<'a>>;

    fn env(&self) -> &Self::Env {
        &self.env
    }
}

impl<'a> WithCmd for StateStatus<'a> {
    fn cmd(&self) -> &str {
        self.cmd.as_str()
    }
    fn dir(&self) -> &str {
        self.dir.as_str()
    }
}

impl<'a> WithEnv for StateStatus<'a> {
    type Env = ValueMap<'a, ValueString<'a>>;

    fn env(&self) -> &Self::Env {
        &self.env
    }
}

fn env_attribute() -> Attribute {
    Attribute {
        attr_type: AttributeType::Map(AttributeType::String.into()),
        description: Description::plain("Environment variables added to the command"),
        constraint: AttributeConstraint::Optional,
        ..Default::default()
    }
}

fn cmd_attributes(action: &str) -> HashMap<String, Attribute> {
    map! {
        "cmd" => Attribute {
            attr_type: AttributeType::String,
            description: Description::plain(format!("Command to execute when {action}")),
            constraint: AttributeConstraint::Required,
            ..Default::default()
        },
        "dir" => Attribute {
            attr_type: AttributeType::String,
            description: Description::plain(format!("Working directory of the command executed when {action}")),
            constraint: AttributeConstraint::Optional,
            ..Default::default()
        },
        "env" => env_attribute(),
    }
}

fn cmd_block(action: &str) -> NestedBlock {
    NestedBlock::Optional(Block {
        attributes: cmd_attributes(action),
        description: Description::plain(format!("Command executed when {action}")),
        ..Default::default()
    })
}

fn status_block() -> NestedBlock {
    let mut attributes = cmd_attributes("fetching the status of the resource");
    attributes.insert(
        "status_path".to_owned(),
        Attribute {
            attr_type: AttributeType::String,
            description: Description::plain("JSON pointer to the status label in the command output. If null, the whole trimmed output is the label"),
            constraint: AttributeConstraint::Optional,
            ..Default::default()
        },
    );
    attributes.insert(
        "missing_status".to_owned(),
        Attribute {
            attr_type: AttributeType::String,
            description: Description::plain("Label used when the output holds no status (default: `Unknown`)"),
            constraint: AttributeConstraint::Optional,
            ..Default::default()
        },
    );
    attributes.insert(
        "not_found_exit_codes".to_owned(),
        Attribute {
            attr_type: AttributeType::List(AttributeType::Number.into()),
            description: Description::plain("Exit codes meaning the resource does not exist (yet)"),
            constraint: AttributeConstraint::Optional,
            ..Default::default()
        },
    );
    NestedBlock::Optional(Block {
        attributes,
        description: Description::plain("Command fetching the current status of the resource"),
        ..Default::default()
    })
}

fn seconds(description: &str) -> Attribute {
    Attribute {
        attr_type: AttributeType::Number,
        description: Description::plain(description),
        constraint: AttributeConstraint::Optional,
        ..Default::default()
    }
}

fn wait_block(action: &str) -> NestedBlock {
    NestedBlock::Optional(Block {
        attributes: map! {
            "pending" => Attribute {
                attr_type: AttributeType::List(AttributeType::String.into()),
                description: Description::plain("Status labels meaning the resource is still converging"),
                constraint: AttributeConstraint::Optional,
                ..Default::default()
            },
            "target" => Attribute {
                attr_type: AttributeType::List(AttributeType::String.into()),
                description: Description::plain("Status labels meaning the resource has converged"),
                constraint: AttributeConstraint::Required,
                ..Default::default()
            },
            "interval" => seconds("Seconds between two status fetches (default: provider `default_interval`)"),
            "min_wait" => seconds("Minimum seconds between two status fetches (default: provider `default_min_wait`)"),
            "delay" => seconds("Seconds to wait before the first status fetch (default: 0)"),
            "timeout" => seconds("Maximum seconds to wait for convergence (default: provider `default_timeout`)"),
            "continuous_target_occurrence" => Attribute {
                attr_type: AttributeType::Number,
                description: Description::plain("Number of consecutive target observations required (default: 1)"),
                constraint: AttributeConstraint::Optional,
                ..Default::default()
            },
            "not_found_status" => Attribute {
                attr_type: AttributeType::String,
                description: Description::plain("Label given to a resource that was not found (default: `ResponseNotFound`)"),
                constraint: AttributeConstraint::Optional,
                ..Default::default()
            },
            "not_found_checks" => Attribute {
                attr_type: AttributeType::Number,
                description: Description::plain("Maximum number of consecutive not-found observations while pending (default: 20)"),
                constraint: AttributeConstraint::Optional,
                ..Default::default()
            },
        },
        description: Description::plain(format!("Wait for the resource to converge after {action}")),
        ..Default::default()
    })
}

fn computed_string(description: &str) -> Attribute {
    Attribute {
        attr_type: AttributeType::String,
        description: Description::plain(description),
        constraint: AttributeConstraint::Computed,
        ..Default::default()
    }
}

fn inputs_attribute() -> Attribute {
    Attribute {
        attr_type: AttributeType::Map(AttributeType::String.into()),
        description: Description::plain("Inputs of the resource, exported as `INPUT_<name>` to every command"),
        constraint: AttributeConstraint::Optional,
        ..Default::default()
    }
}

fn connect_block<T: Connection>() -> NestedBlock {
    NestedBlock::Optional(Block {
        attributes: T::schema(),
        description: Description::plain(format!("Options for the {} connection", T::NAME)),
        ..Default::default()
    })
}

impl<'a, T> WithSchema for ResourceState<'a, T>
where
    T: Connection,
{
    fn schema() -> Schema {
        Schema {
            version: 1,
            block: Block {
                version: 1,
                attributes: map! {
                    "id" => Attribute {
                        attr_type: AttributeType::String,
                        description: Description::plain("Identifier of the resource, exported as `ID` to every command"),
                        constraint: AttributeConstraint::OptionalComputed,
                        ..Default::default()
                    },
                    "inputs" => inputs_attribute(),
                    "lock" => Attribute {
                        attr_type: AttributeType::List(AttributeType::String.into()),
                        description: Description::plain("Names locked while the resource is created, updated or destroyed"),
                        constraint: AttributeConstraint::Optional,
                        ..Default::default()
                    },
                    "status" => computed_string("Status label the resource converged to"),
                    "snapshot" => computed_string("Output of the last status command"),
                    "require_import" => Attribute {
                        attr_type: AttributeType::Bool,
                        description: Description::plain("Fail the creation if `read_status` already finds the resource, which must then be imported (default: false)"),
                        constraint: AttributeConstraint::Optional,
                        ..Default::default()
                    },
                },
                blocks: map! {
                    "create" => cmd_block("creating the resource"),
                    "update" => cmd_block("inputs are updated"),
                    "destroy" => cmd_block("destroying the resource"),
                    "read_status" => status_block(),
                    "create_wait" => wait_block("creation"),
                    "update_wait" => wait_block("update"),
                    "destroy_wait" => wait_block("destruction"),
                    "connect" => connect_block::<T>(),
                },
                description: Description::plain(format!(
                    "Asynchronously provisioned resource driven by {} commands",
                    T::NAME
                )),
                ..Default::default()
            },
        }
    }
}

impl<'a, T> WithSchema for DataSourceState<'a, T>
where
    T: Connection,
{
    fn schema() -> Schema {
        Schema {
            version: 1,
            block: Block {
                version: 1,
                attributes: map! {
                    "inputs" => inputs_attribute(),
                    "status" => computed_string("Status label of the resource"),
                    "snapshot" => computed_string("Output of the last status command"),
                },
                blocks: map! {
                    "read_status" => status_block(),
                    "wait" => wait_block("reading"),
                    "connect" => connect_block::<T>(),
                },
                description: Description::plain(format!(
                    "Status of a remote resource fetched with {} commands",
                    T::NAME
                )),
                ..Default::default()
            },
        }
    }
}
