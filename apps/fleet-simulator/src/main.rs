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

//! Simulated vehicle fleet: every configured device connects with its own
//! certificate and replays `{FLEET_PAYLOAD_DIR}/{device}.json` to the broker.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use vehicle_telemetry_mqtt::{load_trust_anchors, shutdown, FleetConfig, FleetRunner, RumqttcConnector};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = FleetConfig::from_env().context("Configuration error")?;
    let roots = load_trust_anchors(config.ca_file.as_deref()).context("Loading broker trust anchors")?;

    let (trigger, signal) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received, stopping publishers");
            trigger.trigger();
        }
    });

    let runner = FleetRunner::new(config, Arc::new(roots), RumqttcConnector);
    let report = runner.run(signal).await;

    info!(
        "Sent {} messages from {} devices",
        report.total_sent(),
        report.outcomes().len()
    );
    Ok(if report.all_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
