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

//! One device's MQTT session and the link abstraction underneath it.
//!
//! [`DeviceConnection`] owns the session state machine
//! (`Disconnected -> Connecting -> Connected | Failed`) and enforces the
//! rules around it: timeouts, no publishing unless connected, and a single
//! teardown however many times `disconnect` is called. The wire work is
//! delegated to an [`MqttLink`], produced per device by a [`Connector`].

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::config::{BrokerEndpoint, DeviceNaming};
use crate::credentials::DeviceIdentity;
use crate::error::{ConnectError, PublishError};
use crate::payload::TelemetryMessage;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Observable state of a device's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub device_id: String,
    pub state: ConnectionState,
    /// Last CONNACK return code (or broker reason code) seen.
    pub last_result_code: Option<u8>,
}

/// Client id and username presented in CONNECT. The password is always empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLogin {
    pub client_id: String,
    pub username: String,
}

/// Broker acknowledgment of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    /// `None` for at-most-once publishes, which carry no packet id.
    pub packet_id: Option<u16>,
}

/// Wire-level MQTT operations for one device.
#[async_trait]
pub trait MqttLink: Send {
    /// Open transport, handshake and wait for CONNACK. Returns the CONNACK code.
    async fn open(
        &mut self,
        identity: &DeviceIdentity,
        endpoint: &BrokerEndpoint,
        login: &ClientLogin,
    ) -> Result<u8, ConnectError>;

    /// Publish and wait until the message is acknowledged for its QoS.
    async fn send(&mut self, message: &TelemetryMessage) -> Result<PublishAck, PublishError>;

    /// Tear the connection down. Must tolerate a link that never opened.
    async fn close(&mut self);

    /// Wait for `period` while keeping the connection serviced.
    async fn idle(&mut self, period: Duration) {
        tokio::time::sleep(period).await;
    }
}

/// Creates a fresh [`MqttLink`] per device.
pub trait Connector: Send + Sync + 'static {
    type Link: MqttLink + 'static;

    fn link(&self, device_id: &str) -> Self::Link;
}

/// A device identity bound to one MQTT session.
pub struct DeviceConnection<L: MqttLink> {
    identity: DeviceIdentity,
    endpoint: BrokerEndpoint,
    login: ClientLogin,
    link: L,
    session: Session,
    /// An `open` was attempted and `close` has not been issued since.
    needs_teardown: bool,
}

impl<L: MqttLink> DeviceConnection<L> {
    pub fn new(
        identity: DeviceIdentity,
        endpoint: &BrokerEndpoint,
        naming: &DeviceNaming,
        link: L,
    ) -> Self {
        let device_id = identity.device_id().to_string();
        let login = ClientLogin {
            client_id: naming.client_id(&device_id),
            username: naming.principal(&device_id),
        };
        Self {
            identity,
            endpoint: endpoint.clone(),
            login,
            link,
            session: Session {
                device_id,
                state: ConnectionState::Disconnected,
                last_result_code: None,
            },
            needs_teardown: false,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn device_id(&self) -> &str {
        &self.session.device_id
    }

    pub fn is_connected(&self) -> bool {
        self.session.state == ConnectionState::Connected
    }

    /// Connect to the broker, bounded by the endpoint's connect timeout.
    ///
    /// A previous failed attempt is torn down first. Connecting an already
    /// connected session is a no-op.
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.needs_teardown {
            self.disconnect().await;
        }

        let device_id = self.session.device_id.clone();
        info!(
            "[{device_id}] Connecting to {}:{} as '{}'",
            self.endpoint.host, self.endpoint.port, self.login.username
        );
        self.session.state = ConnectionState::Connecting;
        self.needs_teardown = true;

        let attempt = tokio::time::timeout(
            self.endpoint.connect_timeout,
            self.link.open(&self.identity, &self.endpoint, &self.login),
        )
        .await;

        match attempt {
            Ok(Ok(code)) => {
                self.session.state = ConnectionState::Connected;
                self.session.last_result_code = Some(code);
                info!("[{device_id}] Connected (CONNACK={code})");
                Ok(())
            }
            Ok(Err(e)) => {
                self.session.state = ConnectionState::Failed;
                if let ConnectError::Rejected(code) = e {
                    self.session.last_result_code = Some(code);
                }
                warn!("[{device_id}] Connect failed: {e}");
                Err(e)
            }
            Err(_) => {
                self.session.state = ConnectionState::Failed;
                warn!(
                    "[{device_id}] Connect timed out after {:?}",
                    self.endpoint.connect_timeout
                );
                Err(ConnectError::Timeout)
            }
        }
    }

    /// Publish one message and wait for its acknowledgment.
    pub async fn publish(&mut self, message: &TelemetryMessage) -> Result<PublishAck, PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        debug!(
            "[{}] Publishing {} bytes to '{}'",
            self.session.device_id,
            message.payload.len(),
            message.topic
        );

        // On timeout the link's in-flight `EventLoop::poll()` is dropped, which
        // rumqttc 0.24 tolerates between packets. Recheck on upgrade.
        let result = match tokio::time::timeout(self.endpoint.ack_timeout, self.link.send(message))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout),
        };

        match &result {
            Ok(_) => {}
            Err(PublishError::ConnectionLost(reason)) => {
                warn!("[{}] Connection lost: {reason}", self.session.device_id);
                self.session.state = ConnectionState::Disconnected;
            }
            Err(PublishError::Rejected(code)) => {
                self.session.last_result_code = Some(*code);
            }
            Err(_) => {}
        }
        result
    }

    /// Wait `period` without starving the connection's keep-alive.
    pub async fn idle(&mut self, period: Duration) {
        if self.is_connected() {
            self.link.idle(period).await;
        } else {
            tokio::time::sleep(period).await;
        }
    }

    /// Close the session. Safe to call repeatedly and on failed sessions;
    /// the link is torn down at most once per connect attempt.
    pub async fn disconnect(&mut self) {
        if self.needs_teardown {
            self.needs_teardown = false;
            self.link.close().await;
            debug!("[{}] Disconnected", self.session.device_id);
        }
        self.session.state = ConnectionState::Disconnected;
    }
}
