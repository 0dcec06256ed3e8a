// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
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

//! Publish one traffic event.
//!
//! Usage: `traffic-broadcast [request.json]`. The request body is read from
//! the given file, or from stdin when no file is given, and handled exactly as
//! the HTTP trigger would hand it over.

use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use vehicle_telemetry_mqtt::{load_trust_anchors, BroadcastConfig, BroadcastEndpoint, RumqttcConnector};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let body = match std::env::args_os().nth(1) {
        Some(path) => std::fs::read(&path)
            .with_context(|| format!("Reading request body from {}", path.to_string_lossy()))?,
        None => {
            let mut body = Vec::new();
            std::io::stdin()
                .read_to_end(&mut body)
                .context("Reading request body from stdin")?;
            body
        }
    };

    let config = BroadcastConfig::from_env().context("Configuration error")?;
    let roots = load_trust_anchors(config.ca_file.as_deref()).context("Loading broker trust anchors")?;
    let endpoint = BroadcastEndpoint::new(config, Arc::new(roots), RumqttcConnector);

    let response = endpoint.handle(&body).await;
    println!("{} {}", response.status, response.body);

    Ok(if response.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
