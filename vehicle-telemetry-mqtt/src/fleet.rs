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

//! Fleet runner: many simulated devices, each replaying its payload batch.
//!
//! Every device runs its whole lifecycle in its own task:
//! credentials -> connect -> load payloads -> publish (paced) -> disconnect.
//! A device's failure is captured as its [`RunOutcome`] and never affects its
//! siblings. A shared [`Shutdown`] stops further publishes everywhere; devices
//! then disconnect and report how many messages they got out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use rustls::RootCertStore;

use crate::config::FleetConfig;
use crate::connection::{Connector, DeviceConnection, MqttLink};
use crate::credentials::CredentialLoader;
use crate::payload;
use crate::shutdown::Shutdown;

/// Pipeline stage a device failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Credential,
    Connect,
    Load,
    Publish,
    /// The device task itself panicked or was aborted.
    Task,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Credential => "credential",
            FailureStage::Connect => "connect",
            FailureStage::Load => "load",
            FailureStage::Publish => "publish",
            FailureStage::Task => "task",
        };
        f.write_str(name)
    }
}

/// Terminal result of one device's pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        messages_sent: usize,
        /// Stopped early by cancellation or the run deadline.
        cancelled: bool,
    },
    Failed {
        stage: FailureStage,
        detail: String,
        messages_sent: usize,
    },
}

impl RunOutcome {
    fn failed(stage: FailureStage, detail: impl fmt::Display, messages_sent: usize) -> Self {
        RunOutcome::Failed {
            stage,
            detail: detail.to_string(),
            messages_sent,
        }
    }

    fn cancelled(messages_sent: usize) -> Self {
        RunOutcome::Completed {
            messages_sent,
            cancelled: true,
        }
    }

    pub fn messages_sent(&self) -> usize {
        match self {
            RunOutcome::Completed { messages_sent, .. } | RunOutcome::Failed { messages_sent, .. } => {
                *messages_sent
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }
}

/// Outcomes of a run, keyed and ordered by device id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    outcomes: BTreeMap<String, RunOutcome>,
}

impl FleetReport {
    pub fn outcomes(&self) -> &BTreeMap<String, RunOutcome> {
        &self.outcomes
    }

    pub fn get(&self, device_id: &str) -> Option<&RunOutcome> {
        self.outcomes.get(device_id)
    }

    pub fn all_completed(&self) -> bool {
        self.outcomes.values().all(RunOutcome::is_completed)
    }

    pub fn total_sent(&self) -> usize {
        self.outcomes.values().map(RunOutcome::messages_sent).sum()
    }
}

/// Runs every configured device concurrently.
pub struct FleetRunner<C: Connector> {
    config: Arc<FleetConfig>,
    loader: CredentialLoader,
    connector: Arc<C>,
}

impl<C: Connector> FleetRunner<C> {
    /// `roots` are the broker trust anchors shared by every device.
    pub fn new(config: FleetConfig, roots: Arc<RootCertStore>, connector: C) -> Self {
        let loader = CredentialLoader::new(&config.cert_dir, &config.key_dir, roots);
        Self {
            config: Arc::new(config),
            loader,
            connector: Arc::new(connector),
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Run all devices to a terminal state and collect their outcomes.
    pub async fn run(&self, shutdown: Shutdown) -> FleetReport {
        let shutdown = match self.config.deadline {
            Some(deadline) => shutdown.with_deadline(deadline),
            None => shutdown,
        };
        info!(
            "Starting fleet of {} devices against {}:{} (interval={:?}, qos={:?})",
            self.config.device_ids.len(),
            self.config.endpoint.host,
            self.config.endpoint.port,
            self.config.inter_message_delay,
            self.config.publish_qos
        );

        let tasks: Vec<_> = self
            .config
            .device_ids
            .iter()
            .map(|device_id| {
                let sent = Arc::new(AtomicUsize::new(0));
                let pipeline = DevicePipeline {
                    device_id: device_id.clone(),
                    config: self.config.clone(),
                    loader: self.loader.clone(),
                    connector: self.connector.clone(),
                    shutdown: shutdown.clone(),
                    sent: sent.clone(),
                };
                (device_id.clone(), sent, tokio::spawn(pipeline.run()))
            })
            .collect();

        let mut outcomes = BTreeMap::new();
        for (device_id, sent, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("[{device_id}] Device task ended abnormally: {e}");
                    RunOutcome::failed(FailureStage::Task, e, sent.load(Ordering::Acquire))
                }
            };
            log_outcome(&device_id, &outcome);
            outcomes.insert(device_id, outcome);
        }

        let report = FleetReport { outcomes };
        info!(
            "Fleet finished: devices={} completed={} sent={}",
            report.outcomes.len(),
            report.outcomes.values().filter(|o| o.is_completed()).count(),
            report.total_sent()
        );
        report
    }
}

struct DevicePipeline<C: Connector> {
    device_id: String,
    config: Arc<FleetConfig>,
    loader: CredentialLoader,
    connector: Arc<C>,
    shutdown: Shutdown,
    /// Acknowledged publishes, readable even if this task panics.
    sent: Arc<AtomicUsize>,
}

impl<C: Connector> DevicePipeline<C> {
    async fn run(mut self) -> RunOutcome {
        let loader = self.loader.clone();
        let device_id = self.device_id.clone();
        let identity = match tokio::task::spawn_blocking(move || loader.load(&device_id)).await {
            Ok(Ok(identity)) => identity,
            Ok(Err(e)) => return RunOutcome::failed(FailureStage::Credential, e, 0),
            Err(e) => return RunOutcome::failed(FailureStage::Task, e, 0),
        };

        let link = self.connector.link(&self.device_id);
        let mut connection =
            DeviceConnection::new(identity, &self.config.endpoint, &self.config.naming, link);

        let outcome = self.replay(&mut connection).await;
        connection.disconnect().await;
        outcome
    }

    async fn replay<L: MqttLink>(&mut self, connection: &mut DeviceConnection<L>) -> RunOutcome {
        let device_id = self.device_id.as_str();
        let config = &self.config;
        let shutdown = &mut self.shutdown;

        if shutdown.is_cancelled() {
            return RunOutcome::cancelled(0);
        }
        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return RunOutcome::cancelled(0),
            result = connection.connect() => result,
        };
        if let Err(e) = connected {
            return RunOutcome::failed(FailureStage::Connect, e, 0);
        }

        let path = config.payload_dir.join(format!("{device_id}.json"));
        let topic = config.naming.topic(device_id);
        let qos = config.publish_qos;
        let loaded = tokio::task::spawn_blocking(move || payload::load(&path, &topic, qos)).await;
        let messages = match loaded {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) => return RunOutcome::failed(FailureStage::Load, e, 0),
            Err(e) => return RunOutcome::failed(FailureStage::Task, e, 0),
        };
        info!("[{device_id}] Replaying {} messages", messages.len());

        let mut sent = 0;
        for (index, message) in messages.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {}
                    _ = connection.idle(config.inter_message_delay) => {}
                }
            }
            if shutdown.is_cancelled() {
                warn!("[{device_id}] Cancelled after {sent}/{} messages", messages.len());
                return RunOutcome::cancelled(sent);
            }
            match connection.publish(message).await {
                Ok(_) => {
                    sent += 1;
                    self.sent.store(sent, Ordering::Release);
                }
                Err(e) => return RunOutcome::failed(FailureStage::Publish, e, sent),
            }
        }
        RunOutcome::Completed {
            messages_sent: sent,
            cancelled: false,
        }
    }
}

fn log_outcome(device_id: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed {
            messages_sent,
            cancelled,
        } => info!("device={device_id} outcome=completed sent={messages_sent} cancelled={cancelled}"),
        RunOutcome::Failed {
            stage,
            detail,
            messages_sent,
        } => error!(
            "device={device_id} outcome=failed stage={stage} sent={messages_sent} detail=\"{detail}\""
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::config::{BrokerEndpoint, FleetConfigBuilder};
    use crate::shutdown;
    use crate::testing::{
        empty_roots, numbered_records, write_credentials, write_payloads, LinkCall, MockBehaviour,
        MockConnector,
    };

    /// Credentials and `count` payload records for each device, all in `dir`.
    fn provision(dir: &Path, devices: &[(&str, usize)]) -> FleetConfigBuilder {
        for (device_id, count) in devices {
            write_credentials(dir, device_id);
            write_payloads(dir, device_id, &numbered_records(*count));
        }
        let mut endpoint = BrokerEndpoint::new("broker.test");
        endpoint.connect_timeout = Duration::from_secs(5);
        FleetConfig::builder(endpoint, dir)
            .payload_dir(dir)
            .inter_message_delay(Duration::from_millis(500))
            .devices(devices.iter().map(|(id, _)| *id))
    }

    fn seq_bodies(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|seq| format!("{{\"seq\":{seq}}}")).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_broken_credential_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("deviceA", 3), ("deviceB", 4)])
            .build()
            .unwrap();
        std::fs::write(dir.path().join("deviceB.cert.pem"), "garbage").unwrap();

        let connector = MockConnector::default();
        let runner = FleetRunner::new(config, empty_roots(), connector.clone());
        let report = runner.run(Shutdown::never()).await;

        assert_eq!(
            report.get("deviceA"),
            Some(&RunOutcome::Completed {
                messages_sent: 3,
                cancelled: false
            })
        );
        assert!(matches!(
            report.get("deviceB"),
            Some(RunOutcome::Failed {
                stage: FailureStage::Credential,
                messages_sent: 0,
                ..
            })
        ));
        assert!(connector.calls_for("deviceB").is_empty());
        assert!(!report.all_completed());
        assert_eq!(report.total_sent(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_in_order_waiting_for_acks() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 3), ("device02", 3)])
            .build()
            .unwrap();

        let connector = MockConnector::default();
        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(Shutdown::never())
            .await;
        assert!(report.all_completed());

        for device in ["device01", "device02"] {
            let mut expected = vec![LinkCall::Open {
                device: device.into(),
                client_id: format!("{device}-client"),
                username: format!("{device}.mqtt.contoso.com"),
            }];
            for body in seq_bodies(0..3) {
                expected.push(LinkCall::Send(device.into(), body.clone()));
                expected.push(LinkCall::Ack(device.into(), body));
            }
            expected.push(LinkCall::Close(device.into()));
            assert_eq!(connector.calls_for(device), expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_between_messages() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 4)])
            .inter_message_delay(Duration::from_secs(2))
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let report = FleetRunner::new(config, empty_roots(), MockConnector::default())
            .run(Shutdown::never())
            .await;

        assert_eq!(report.get("device01").map(RunOutcome::messages_sent), Some(4));
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 5)]).build().unwrap();

        let (trigger, signal) = shutdown::channel();
        let connector = MockConnector::default();
        connector.set_behaviour(
            "device01",
            MockBehaviour {
                cancel_after_sends: Some((2, trigger)),
                ..Default::default()
            },
        );

        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(signal)
            .await;

        assert_eq!(
            report.get("device01"),
            Some(&RunOutcome::Completed {
                messages_sent: 2,
                cancelled: true
            })
        );
        assert_eq!(connector.count(|c| matches!(c, LinkCall::Send(..))), 2);
        assert_eq!(connector.count(|c| matches!(c, LinkCall::Close(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_every_device() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 5), ("device02", 5)])
            .inter_message_delay(Duration::from_secs(10))
            .deadline(Duration::from_secs(15))
            .build()
            .unwrap();

        let connector = MockConnector::default();
        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(Shutdown::never())
            .await;

        for device in ["device01", "device02"] {
            assert_eq!(
                report.get(device),
                Some(&RunOutcome::Completed {
                    messages_sent: 2,
                    cancelled: true
                })
            );
        }
        assert_eq!(connector.count(|c| matches!(c, LinkCall::Close(_))), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 2)]).build().unwrap();
        let (trigger, signal) = shutdown::channel();
        trigger.trigger();

        let connector = MockConnector::default();
        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(signal)
            .await;

        assert_eq!(
            report.get("device01"),
            Some(&RunOutcome::Completed {
                messages_sent: 0,
                cancelled: true
            })
        );
        assert!(connector.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refused_still_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 2), ("device02", 2)])
            .build()
            .unwrap();
        let connector = MockConnector::default();
        connector.set_behaviour(
            "device01",
            MockBehaviour {
                refuse_connect: Some(5),
                ..Default::default()
            },
        );

        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(Shutdown::never())
            .await;

        assert!(matches!(
            report.get("device01"),
            Some(RunOutcome::Failed {
                stage: FailureStage::Connect,
                ..
            })
        ));
        assert_eq!(report.get("device02").map(RunOutcome::messages_sent), Some(2));
        assert_eq!(
            connector.calls_for("device01").last(),
            Some(&LinkCall::Close("device01".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 2)]).build().unwrap();
        let connector = MockConnector::default();
        connector.set_behaviour(
            "device01",
            MockBehaviour {
                hang_on_connect: true,
                ..Default::default()
            },
        );

        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(Shutdown::never())
            .await;
        match report.get("device01") {
            Some(RunOutcome::Failed { stage, detail, .. }) => {
                assert_eq!(*stage, FailureStage::Connect);
                assert!(detail.contains("timed out"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(connector.count(|c| matches!(c, LinkCall::Close(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_rejection_reports_partial_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 5)]).build().unwrap();
        let connector = MockConnector::default();
        connector.set_behaviour(
            "device01",
            MockBehaviour {
                reject_publish_at: Some(3),
                ..Default::default()
            },
        );

        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(Shutdown::never())
            .await;

        assert!(matches!(
            report.get("device01"),
            Some(RunOutcome::Failed {
                stage: FailureStage::Publish,
                messages_sent: 3,
                ..
            })
        ));
        assert_eq!(connector.count(|c| matches!(c, LinkCall::Close(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_payload_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("device01", 1)]).build().unwrap();
        std::fs::remove_file(dir.path().join("device01.json")).unwrap();

        let connector = MockConnector::default();
        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(Shutdown::never())
            .await;

        assert!(matches!(
            report.get("device01"),
            Some(RunOutcome::Failed {
                stage: FailureStage::Load,
                ..
            })
        ));
        assert_eq!(connector.count(|c| matches!(c, LinkCall::Close(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_device_keeps_partial_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = provision(dir.path(), &[("deviceA", 5), ("deviceB", 2)])
            .build()
            .unwrap();
        let connector = MockConnector::default();
        connector.set_behaviour(
            "deviceA",
            MockBehaviour {
                panic_at_send: Some(2),
                ..Default::default()
            },
        );

        let report = FleetRunner::new(config, empty_roots(), connector.clone())
            .run(Shutdown::never())
            .await;

        assert!(matches!(
            report.get("deviceA"),
            Some(RunOutcome::Failed {
                stage: FailureStage::Task,
                messages_sent: 2,
                ..
            })
        ));
        assert_eq!(
            report.get("deviceB"),
            Some(&RunOutcome::Completed {
                messages_sent: 2,
                cancelled: false
            })
        );
    }
}
