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

use anyhow::Result;
use tf_provider::serve;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use converge_provider::ConvergeProvider;

mod cmd;
mod connection;
mod converge_provider;
mod locks;
mod poll;
mod utils;

const LOG_ENV: &str = "CONVERGE_LOG";

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the plugin handshake
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

/// Cancel in-flight polls on Ctrl+C
fn cancel_on_interrupt(stop: CancellationToken) {
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, cancelling pending operations");
                stop.cancel();
            }
            Err(err) => warn!(error = %err, "failed to listen for interrupts"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let stop = CancellationToken::new();
    cancel_on_interrupt(stop.clone());

    serve("converge", ConvergeProvider::new(stop)).await
}
