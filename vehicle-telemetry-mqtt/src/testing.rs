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

//! Test fixtures: throwaway device credentials and a recording mock broker link.

use std::collections::HashMap;
use std::fs;
use std::future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::RootCertStore;
use serde_json::Value;
use tempfile::TempDir;

use crate::config::{BrokerEndpoint, DeliveryGuarantee};
use crate::connection::{ClientLogin, Connector, MqttLink, PublishAck};
use crate::credentials::{CredentialLoader, DeviceIdentity};
use crate::error::{ConnectError, PublishError};
use crate::payload::TelemetryMessage;
use crate::shutdown::ShutdownTrigger;

pub(crate) fn empty_roots() -> Arc<RootCertStore> {
    Arc::new(RootCertStore::empty())
}

/// Write `{device}.cert.pem` and `{device}.key.pem` into `dir`.
pub(crate) fn write_credentials(dir: &Path, device_id: &str) {
    let CertifiedKey { cert, signing_key } =
        generate_simple_self_signed(vec![format!("{device_id}.mqtt.contoso.com")]).unwrap();
    fs::write(dir.join(format!("{device_id}.cert.pem")), cert.pem()).unwrap();
    fs::write(dir.join(format!("{device_id}.key.pem")), signing_key.serialize_pem()).unwrap();
}

/// Write a certificate together with a key from a different pair.
pub(crate) fn write_mismatched_credentials(dir: &Path, device_id: &str) {
    let CertifiedKey { cert, .. } = generate_simple_self_signed(vec![device_id.to_string()]).unwrap();
    let CertifiedKey { signing_key, .. } =
        generate_simple_self_signed(vec![device_id.to_string()]).unwrap();
    fs::write(dir.join(format!("{device_id}.cert.pem")), cert.pem()).unwrap();
    fs::write(dir.join(format!("{device_id}.key.pem")), signing_key.serialize_pem()).unwrap();
}

pub(crate) fn write_payloads(dir: &Path, device_id: &str, records: &[Value]) {
    fs::write(
        dir.join(format!("{device_id}.json")),
        serde_json::to_vec(records).unwrap(),
    )
    .unwrap();
}

/// `count` distinct records, `{"seq": 0}`, `{"seq": 1}`, ...
pub(crate) fn numbered_records(count: usize) -> Vec<Value> {
    (0..count).map(|seq| serde_json::json!({ "seq": seq })).collect()
}

pub(crate) fn identity_for(device_id: &str) -> (TempDir, DeviceIdentity) {
    let dir = tempfile::tempdir().unwrap();
    write_credentials(dir.path(), device_id);
    let identity = CredentialLoader::new(dir.path(), dir.path(), empty_roots())
        .load(device_id)
        .unwrap();
    (dir, identity)
}

/// What a [`MockLink`] observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkCall {
    Open {
        device: String,
        client_id: String,
        username: String,
    },
    Send(String, String),
    Ack(String, String),
    Close(String),
}

/// Scripted broker behaviour for one device.
#[derive(Clone, Default)]
pub(crate) struct MockBehaviour {
    pub refuse_connect: Option<u8>,
    pub hang_on_connect: bool,
    /// Zero-based index of the send the broker rejects.
    pub reject_publish_at: Option<usize>,
    /// Zero-based index of the send that panics the calling task.
    pub panic_at_send: Option<usize>,
    /// Fire the trigger once this many sends have been acknowledged.
    pub cancel_after_sends: Option<(usize, ShutdownTrigger)>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<LinkCall>,
    behaviour: HashMap<String, MockBehaviour>,
    links_created: usize,
}

#[derive(Clone, Default)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub(crate) fn set_behaviour(&self, device_id: &str, behaviour: MockBehaviour) {
        self.state
            .lock()
            .unwrap()
            .behaviour
            .insert(device_id.to_string(), behaviour);
    }

    pub(crate) fn calls(&self) -> Vec<LinkCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn calls_for(&self, device_id: &str) -> Vec<LinkCall> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                LinkCall::Open { device, .. } => device == device_id,
                LinkCall::Send(d, _) | LinkCall::Ack(d, _) | LinkCall::Close(d) => d == device_id,
            })
            .collect()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&LinkCall) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    pub(crate) fn links_created(&self) -> usize {
        self.state.lock().unwrap().links_created
    }
}

impl Connector for MockConnector {
    type Link = MockLink;

    fn link(&self, device_id: &str) -> MockLink {
        self.state.lock().unwrap().links_created += 1;
        MockLink {
            device_id: device_id.to_string(),
            state: self.state.clone(),
            sends: 0,
            acked: 0,
        }
    }
}

pub(crate) struct MockLink {
    device_id: String,
    state: Arc<Mutex<MockState>>,
    sends: usize,
    acked: usize,
}

impl MockLink {
    fn behaviour(&self) -> MockBehaviour {
        self.state
            .lock()
            .unwrap()
            .behaviour
            .get(&self.device_id)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, call: LinkCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl MqttLink for MockLink {
    async fn open(
        &mut self,
        identity: &DeviceIdentity,
        _endpoint: &BrokerEndpoint,
        login: &ClientLogin,
    ) -> Result<u8, ConnectError> {
        self.record(LinkCall::Open {
            device: identity.device_id().to_string(),
            client_id: login.client_id.clone(),
            username: login.username.clone(),
        });
        let behaviour = self.behaviour();
        if behaviour.hang_on_connect {
            future::pending::<()>().await;
        }
        match behaviour.refuse_connect {
            Some(code) => Err(ConnectError::Rejected(code)),
            None => Ok(0),
        }
    }

    async fn send(&mut self, message: &TelemetryMessage) -> Result<PublishAck, PublishError> {
        let body = String::from_utf8_lossy(&message.payload).into_owned();
        self.record(LinkCall::Send(self.device_id.clone(), body.clone()));
        let index = self.sends;
        self.sends += 1;

        let behaviour = self.behaviour();
        if behaviour.reject_publish_at == Some(index) {
            return Err(PublishError::Rejected(0x87));
        }
        if behaviour.panic_at_send == Some(index) {
            panic!("link for {} crashed on send {index}", self.device_id);
        }

        // Let sibling tasks run between the write and the acknowledgment.
        tokio::task::yield_now().await;
        self.record(LinkCall::Ack(self.device_id.clone(), body));
        self.acked += 1;

        if let Some((after, trigger)) = &behaviour.cancel_after_sends {
            if self.acked == *after {
                trigger.trigger();
            }
        }
        let packet_id = match message.qos {
            DeliveryGuarantee::AtMostOnce => None,
            _ => Some(self.sends as u16),
        };
        Ok(PublishAck { packet_id })
    }

    async fn close(&mut self) {
        self.record(LinkCall::Close(self.device_id.clone()));
    }
}
