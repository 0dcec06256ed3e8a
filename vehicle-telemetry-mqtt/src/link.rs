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

//! [`MqttLink`] backed by rumqttc.
//!
//! The link drives its own [`EventLoop`] instead of spawning a background
//! poller, so each operation can wait for exactly the packet that completes
//! it: CONNACK for `open`, PUBACK/PUBCOMP (or the outgoing write for QoS 0)
//! for `send`, and the outgoing DISCONNECT for `close`.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, TlsConfiguration, Transport,
};

use crate::config::BrokerEndpoint;
use crate::connection::{ClientLogin, Connector, MqttLink, PublishAck};
use crate::credentials::DeviceIdentity;
use crate::error::{ConnectError, PublishError};
use crate::payload::TelemetryMessage;

/// Request channel capacity per client. Only one request is in flight at a time.
const REQUEST_CAPACITY: usize = 10;

/// Upper bound on flushing DISCONNECT during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces [`RumqttcLink`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RumqttcConnector;

impl Connector for RumqttcConnector {
    type Link = RumqttcLink;

    fn link(&self, device_id: &str) -> RumqttcLink {
        RumqttcLink::new(device_id)
    }
}

struct Active {
    client: AsyncClient,
    eventloop: EventLoop,
}

/// One rumqttc client plus its event loop.
pub struct RumqttcLink {
    device_id: String,
    active: Option<Active>,
    /// Why the connection dropped, if it dropped outside `send`.
    lost: Option<String>,
}

impl RumqttcLink {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            active: None,
            lost: None,
        }
    }

    fn options(identity: &DeviceIdentity, endpoint: &BrokerEndpoint, login: &ClientLogin) -> MqttOptions {
        let mut options = MqttOptions::new(&login.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(endpoint.keep_alive);
        options.set_clean_session(true);
        // The certificate carries the identity; the password stays empty.
        options.set_credentials(&login.username, "");
        if endpoint.require_tls {
            options.set_transport(Transport::Tls(TlsConfiguration::Rustls(
                identity.tls_config(),
            )));
        }
        options
    }
}

#[async_trait]
impl MqttLink for RumqttcLink {
    async fn open(
        &mut self,
        identity: &DeviceIdentity,
        endpoint: &BrokerEndpoint,
        login: &ClientLogin,
    ) -> Result<u8, ConnectError> {
        let options = Self::options(identity, endpoint, login);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ConnectError::Rejected(ack.code as u8));
                    }
                    self.active = Some(Active { client, eventloop });
                    self.lost = None;
                    return Ok(ack.code as u8);
                }
                Ok(event) => debug!("[{}] {event:?}", self.device_id),
                Err(e) => return Err(connect_error(e)),
            }
        }
    }

    async fn send(&mut self, message: &TelemetryMessage) -> Result<PublishAck, PublishError> {
        let Some(active) = self.active.as_mut() else {
            let reason = self.lost.clone().unwrap_or_else(|| "not open".to_string());
            return Err(PublishError::ConnectionLost(reason));
        };
        let qos = QoS::from(message.qos);

        if let Err(e) = active
            .client
            .publish(message.topic.as_str(), qos, false, message.payload.clone())
            .await
        {
            self.active = None;
            return Err(PublishError::ConnectionLost(e.to_string()));
        }

        let mut packet_id = None;
        loop {
            match active.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    if qos == QoS::AtMostOnce {
                        return Ok(PublishAck { packet_id: None });
                    }
                    packet_id = Some(pkid);
                }
                Ok(Event::Incoming(Incoming::PubAck(ack)))
                    if qos == QoS::AtLeastOnce && packet_id == Some(ack.pkid) =>
                {
                    return Ok(PublishAck { packet_id });
                }
                Ok(Event::Incoming(Incoming::PubComp(comp)))
                    if qos == QoS::ExactlyOnce && packet_id == Some(comp.pkid) =>
                {
                    return Ok(PublishAck { packet_id });
                }
                Ok(event) => debug!("[{}] {event:?}", self.device_id),
                Err(e) => {
                    self.active = None;
                    return Err(PublishError::ConnectionLost(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        if let Err(e) = active.client.disconnect().await {
            warn!("[{}] Failed to queue DISCONNECT: {e}", self.device_id);
            return;
        }
        let flush = async {
            loop {
                match active.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, flush).await.is_err() {
            warn!("[{}] Timed out flushing DISCONNECT", self.device_id);
        }
    }

    async fn idle(&mut self, period: Duration) {
        let Some(active) = self.active.as_mut() else {
            tokio::time::sleep(period).await;
            return;
        };

        let deadline = tokio::time::sleep(period);
        tokio::pin!(deadline);
        // Dropping `poll()` when the deadline wins is safe in rumqttc 0.24: reads
        // go through `read_buf` and state is only touched after a full packet.
        // Recheck on upgrade.
        let lost = loop {
            tokio::select! {
                _ = &mut deadline => break None,
                event = active.eventloop.poll() => match event {
                    Ok(event) => debug!("[{}] {event:?}", self.device_id),
                    Err(e) => break Some(e.to_string()),
                }
            }
        };

        if let Some(reason) = lost {
            warn!("[{}] Connection lost while idle: {reason}", self.device_id);
            self.active = None;
            self.lost = Some(reason);
            deadline.await;
        }
    }
}

fn connect_error(err: ConnectionError) -> ConnectError {
    match err {
        ConnectionError::ConnectionRefused(code) => ConnectError::Rejected(code as u8),
        ConnectionError::NetworkTimeout => ConnectError::Timeout,
        ConnectionError::Tls(e) => ConnectError::TlsFailure(e.to_string()),
        // rustls reports handshake alerts as InvalidData.
        ConnectionError::Io(e) if e.kind() == ErrorKind::InvalidData => {
            ConnectError::TlsFailure(e.to_string())
        }
        other => ConnectError::Network(other.to_string()),
    }
}
