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

//! Single-shot broadcast: validate a traffic event and publish it once.
//!
//! [`BroadcastEndpoint::handle`] takes a raw request body and returns an
//! HTTP-shaped [`BroadcastResponse`]. Validation happens before any file or
//! network access; downstream failures are reported by kind only.

use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use rustls::RootCertStore;
use serde::{Deserialize, Serialize};

use crate::config::BroadcastConfig;
use crate::connection::{Connector, DeviceConnection};
use crate::credentials::CredentialLoader;
use crate::payload::TelemetryMessage;

const INVALID_EVENT: &str = "Please pass a valid JSON with 'type' and 'description'.";
const PUBLISHED: &str = "Message published via MQTT.";

/// Inbound traffic event. Both fields must be present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BroadcastEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

impl BroadcastEvent {
    /// Decode and validate a request body.
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let event: BroadcastEvent = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        if event.kind.is_empty() {
            return Err("'type' is empty".to_string());
        }
        if event.description.is_empty() {
            return Err("'description' is empty".to_string());
        }
        Ok(event)
    }
}

/// Which downstream step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFailure {
    Credential,
    Connect,
    Publish,
}

impl fmt::Display for BroadcastFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BroadcastFailure::Credential => "credential",
            BroadcastFailure::Connect => "connect",
            BroadcastFailure::Publish => "publish",
        })
    }
}

/// HTTP-shaped result of [`BroadcastEndpoint::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastResponse {
    pub status: u16,
    pub body: String,
}

impl BroadcastResponse {
    fn ok() -> Self {
        Self {
            status: 200,
            body: PUBLISHED.to_string(),
        }
    }

    fn bad_request() -> Self {
        Self {
            status: 400,
            body: INVALID_EVENT.to_string(),
        }
    }

    /// 500 for our own credential problems, 502 when the broker let us down.
    fn failed(kind: BroadcastFailure) -> Self {
        let status = match kind {
            BroadcastFailure::Credential => 500,
            BroadcastFailure::Connect | BroadcastFailure::Publish => 502,
        };
        Self {
            status,
            body: format!("Broadcast failed: {kind}"),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Publishes validated events under one fixed device identity.
pub struct BroadcastEndpoint<C: Connector> {
    config: BroadcastConfig,
    loader: CredentialLoader,
    connector: C,
}

impl<C: Connector> BroadcastEndpoint<C> {
    pub fn new(config: BroadcastConfig, roots: Arc<RootCertStore>, connector: C) -> Self {
        let loader = CredentialLoader::new(&config.cert_dir, &config.key_dir, roots);
        Self {
            config,
            loader,
            connector,
        }
    }

    /// Validate `body`, then connect, publish once and disconnect.
    pub async fn handle(&self, body: &[u8]) -> BroadcastResponse {
        let event = match BroadcastEvent::parse(body) {
            Ok(event) => event,
            Err(reason) => {
                warn!("[broadcast] Rejected request: {reason}");
                return BroadcastResponse::bad_request();
            }
        };

        match self.publish(&event).await {
            Ok(()) => {
                info!("[broadcast] Published '{}' event", event.kind);
                BroadcastResponse::ok()
            }
            Err(kind) => BroadcastResponse::failed(kind),
        }
    }

    async fn publish(&self, event: &BroadcastEvent) -> Result<(), BroadcastFailure> {
        let device_id = self.config.device_id.as_str();
        let identity = self.loader.load(device_id).map_err(|e| {
            warn!("[{device_id}] Credential load failed: {e}");
            BroadcastFailure::Credential
        })?;
        let payload = serde_json::to_vec(event).map_err(|e| {
            warn!("[{device_id}] Failed to encode event: {e}");
            BroadcastFailure::Publish
        })?;
        let message = TelemetryMessage::new(self.config.topic(), payload, self.config.qos);

        let link = self.connector.link(device_id);
        let mut connection =
            DeviceConnection::new(identity, &self.config.endpoint, &self.config.naming, link);

        let result = match connection.connect().await {
            Err(_) => Err(BroadcastFailure::Connect),
            Ok(()) => connection.publish(&message).await.map(|_| ()).map_err(|e| {
                warn!("[{device_id}] Publish failed: {e}");
                BroadcastFailure::Publish
            }),
        };
        connection.disconnect().await;
        result
    }
}
