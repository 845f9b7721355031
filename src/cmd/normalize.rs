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

use tf_provider::{value::Value, Diagnostics};

use crate::{connection::Connection, utils::WithNormalize};

use super::state::{DataSourceState, ResourceState};

impl<'a, T: Connection> WithNormalize for ResourceState<'a, T> {
    fn normalize(&mut self, _diags: &mut Diagnostics) {
        if self.id.is_null() {
            self.id = Value::Unknown;
        }
        if self.status.is_null() {
            self.status = Value::Unknown;
        }
        if self.snapshot.is_null() {
            self.snapshot = Value::Unknown;
        }
    }
}

impl<'a, T: Connection> WithNormalize for DataSourceState<'a, T> {
    fn normalize(&mut self, _diags: &mut Diagnostics) {
        // Always fetched again
        self.status = Value::Unknown;
        self.snapshot = Value::Unknown;
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use crate::connection::local::ConnectionLocal;

    use super::*;

    #[test]
    fn computed_fields_become_unknown() {
        let mut state = ResourceState::<ConnectionLocal> {
            status: Value::Value(Cow::from("Ready")),
            ..Default::default()
        };

        state.normalize(&mut Diagnostics::default());

        assert!(state.id.is_unknown());
        assert!(state.snapshot.is_unknown());
        assert_eq!(state.status, Value::Value(Cow::from("Ready")));
        assert!(state.inputs.is_null());
    }
}
