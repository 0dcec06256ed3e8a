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

//! Configuration types for the fleet runner and the broadcast endpoint.
//!
//! Both configurations can be assembled with a builder or read from the
//! process environment. Environment parsing goes through a lookup function so
//! it can be exercised without touching real environment variables.

use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rumqttc::QoS;

use crate::error::ConfigError;

/// Default MQTT-over-TLS port.
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// MQTT delivery guarantee for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryGuarantee {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl DeliveryGuarantee {
    /// Map an MQTT QoS level (0, 1, 2).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

impl From<DeliveryGuarantee> for QoS {
    fn from(value: DeliveryGuarantee) -> Self {
        match value {
            DeliveryGuarantee::AtMostOnce => QoS::AtMostOnce,
            DeliveryGuarantee::AtLeastOnce => QoS::AtLeastOnce,
            DeliveryGuarantee::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Where and how to reach the broker. Read-only once built.
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub require_tls: bool,
    /// Upper bound on TCP + TLS + CONNACK.
    pub connect_timeout: Duration,
    /// Upper bound on waiting for PUBACK/PUBCOMP (or the write, for QoS 0).
    pub ack_timeout: Duration,
    pub keep_alive: Duration,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_TLS_PORT,
            require_tls: true,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            keep_alive: Duration::from_secs(30),
        }
    }

    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("MQTT_BROKER_HOST")
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::Missing("MQTT_BROKER_HOST"))?;
        let mut endpoint = BrokerEndpoint::new(host);
        if let Some(port) = parse_var::<u16, _>(lookup, "MQTT_PORT")? {
            endpoint.port = port;
        }
        if let Some(tls) = parse_var::<bool, _>(lookup, "MQTT_REQUIRE_TLS")? {
            endpoint.require_tls = tls;
        }
        if let Some(secs) = parse_var::<u64, _>(lookup, "MQTT_CONNECT_TIMEOUT_SECS")? {
            endpoint.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(lookup, "MQTT_ACK_TIMEOUT_SECS")? {
            endpoint.ack_timeout = Duration::from_secs(secs);
        }
        Ok(endpoint)
    }
}

/// Per-device naming: client id, authentication principal and topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNaming {
    /// Authority the principal lives under, e.g. `contoso.com`.
    pub authority: String,
    /// Last topic segment, e.g. `vehiclestatus`.
    pub topic_suffix: String,
}

impl DeviceNaming {
    pub fn new(authority: impl Into<String>, topic_suffix: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            topic_suffix: topic_suffix.into(),
        }
    }

    /// `{device}.mqtt.{authority}`, sent as the MQTT username.
    pub fn principal(&self, device_id: &str) -> String {
        format!("{device_id}.mqtt.{}", self.authority)
    }

    pub fn client_id(&self, device_id: &str) -> String {
        format!("{device_id}-client")
    }

    /// `{principal}/{topic_suffix}`.
    pub fn topic(&self, device_id: &str) -> String {
        format!("{}/{}", self.principal(device_id), self.topic_suffix)
    }
}

/// Reject ids that cannot safely become file names or topic levels.
pub fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    if device_id.is_empty() {
        return Err(ConfigError::invalid("device id", "empty"));
    }
    if let Some(c) = device_id
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '+' | '#') || c.is_whitespace() || c.is_control())
    {
        return Err(ConfigError::invalid(
            "device id",
            format!("'{device_id}' contains forbidden character {c:?}"),
        ));
    }
    if device_id == "." || device_id == ".." {
        return Err(ConfigError::invalid("device id", format!("'{device_id}'")));
    }
    Ok(())
}

/// Configuration for a fleet simulation run.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub endpoint: BrokerEndpoint,
    pub cert_dir: PathBuf,
    /// Defaults to `cert_dir`.
    pub key_dir: PathBuf,
    /// Trust anchors for the broker; the platform store is used when unset.
    pub ca_file: Option<PathBuf>,
    /// De-duplicated, sorted.
    pub device_ids: BTreeSet<String>,
    /// Directory holding `{device}.json` payload batches.
    pub payload_dir: PathBuf,
    pub inter_message_delay: Duration,
    pub publish_qos: DeliveryGuarantee,
    pub naming: DeviceNaming,
    /// Overall run deadline; when it elapses every device stops publishing.
    pub deadline: Option<Duration>,
}

impl FleetConfig {
    /// Start building a config with the required fields.
    pub fn builder(endpoint: BrokerEndpoint, cert_dir: impl Into<PathBuf>) -> FleetConfigBuilder {
        FleetConfigBuilder {
            endpoint,
            cert_dir: cert_dir.into(),
            key_dir: None,
            ca_file: None,
            device_ids: Vec::new(),
            payload_dir: PathBuf::from("SamplePayloads"),
            inter_message_delay: Duration::from_secs(1),
            publish_qos: DeliveryGuarantee::AtLeastOnce,
            naming: DeviceNaming::new("contoso.com", "vehiclestatus"),
            deadline: None,
        }
    }

    /// Read the config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = BrokerEndpoint::from_lookup(&lookup)?;
        let cert_dir = lookup("MQTT_CERT_DIR").ok_or(ConfigError::Missing("MQTT_CERT_DIR"))?;
        let devices = lookup("FLEET_DEVICE_IDS").ok_or(ConfigError::Missing("FLEET_DEVICE_IDS"))?;

        let mut builder = FleetConfig::builder(endpoint, cert_dir)
            .devices(devices.split(',').map(str::trim).filter(|d| !d.is_empty()));

        if let Some(key_dir) = lookup("MQTT_KEY_DIR") {
            builder = builder.key_dir(key_dir);
        }
        if let Some(ca) = lookup("MQTT_CA_FILE") {
            builder = builder.ca_file(ca);
        }
        if let Some(dir) = lookup("FLEET_PAYLOAD_DIR") {
            builder = builder.payload_dir(dir);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "FLEET_PUBLISH_INTERVAL_MS")? {
            builder = builder.inter_message_delay(Duration::from_millis(ms));
        }
        if let Some(qos) = parse_qos(&lookup)? {
            builder = builder.publish_qos(qos);
        }
        let authority = lookup("MQTT_AUTH_AUTHORITY");
        let suffix = lookup("MQTT_TOPIC_SUFFIX");
        if authority.is_some() || suffix.is_some() {
            builder = builder.naming(DeviceNaming::new(
                authority.unwrap_or_else(|| "contoso.com".to_string()),
                suffix.unwrap_or_else(|| "vehiclestatus".to_string()),
            ));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "FLEET_DEADLINE_SECS")? {
            builder = builder.deadline(Duration::from_secs(secs));
        }
        builder.build()
    }
}

/// Builder for [`FleetConfig`].
pub struct FleetConfigBuilder {
    endpoint: BrokerEndpoint,
    cert_dir: PathBuf,
    key_dir: Option<PathBuf>,
    ca_file: Option<PathBuf>,
    device_ids: Vec<String>,
    payload_dir: PathBuf,
    inter_message_delay: Duration,
    publish_qos: DeliveryGuarantee,
    naming: DeviceNaming,
    deadline: Option<Duration>,
}

impl FleetConfigBuilder {
    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_ids.push(device_id.into());
        self
    }

    pub fn devices<I, S>(mut self, device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device_ids.extend(device_ids.into_iter().map(Into::into));
        self
    }

    pub fn key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = Some(dir.into());
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn payload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.payload_dir = dir.into();
        self
    }

    pub fn inter_message_delay(mut self, delay: Duration) -> Self {
        self.inter_message_delay = delay;
        self
    }

    pub fn publish_qos(mut self, qos: DeliveryGuarantee) -> Self {
        self.publish_qos = qos;
        self
    }

    pub fn naming(mut self, naming: DeviceNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Validate device ids and build the config.
    pub fn build(self) -> Result<FleetConfig, ConfigError> {
        for id in &self.device_ids {
            validate_device_id(id)?;
        }
        let device_ids: BTreeSet<String> = self.device_ids.into_iter().collect();
        if device_ids.is_empty() {
            return Err(ConfigError::invalid("device ids", "no devices configured"));
        }
        let key_dir = self.key_dir.unwrap_or_else(|| self.cert_dir.clone());
        Ok(FleetConfig {
            endpoint: self.endpoint,
            cert_dir: self.cert_dir,
            key_dir,
            ca_file: self.ca_file,
            device_ids,
            payload_dir: self.payload_dir,
            inter_message_delay: self.inter_message_delay,
            publish_qos: self.publish_qos,
            naming: self.naming,
            deadline: self.deadline,
        })
    }
}

/// Configuration for the single-shot broadcast endpoint.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub endpoint: BrokerEndpoint,
    /// Identity every broadcast is published under.
    pub device_id: String,
    pub cert_dir: PathBuf,
    pub key_dir: PathBuf,
    pub ca_file: Option<PathBuf>,
    pub naming: DeviceNaming,
    pub qos: DeliveryGuarantee,
}

impl BroadcastConfig {
    pub fn builder(endpoint: BrokerEndpoint, cert_dir: impl Into<PathBuf>) -> BroadcastConfigBuilder {
        BroadcastConfigBuilder {
            endpoint,
            device_id: "vehiclebroadcastservice".to_string(),
            cert_dir: cert_dir.into(),
            key_dir: None,
            ca_file: None,
            naming: DeviceNaming::new("contoso.com", "trafficevents"),
            qos: DeliveryGuarantee::AtLeastOnce,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = BrokerEndpoint::from_lookup(&lookup)?;
        let cert_dir = lookup("MQTT_CERT_DIR").ok_or(ConfigError::Missing("MQTT_CERT_DIR"))?;
        let mut builder = BroadcastConfig::builder(endpoint, cert_dir);
        if let Some(id) = lookup("BROADCAST_DEVICE_ID") {
            builder = builder.device_id(id);
        }
        if let Some(key_dir) = lookup("MQTT_KEY_DIR") {
            builder = builder.key_dir(key_dir);
        }
        if let Some(ca) = lookup("MQTT_CA_FILE") {
            builder = builder.ca_file(ca);
        }
        if let Some(qos) = parse_qos(&lookup)? {
            builder = builder.qos(qos);
        }
        let authority = lookup("MQTT_AUTH_AUTHORITY");
        let suffix = lookup("BROADCAST_TOPIC_SUFFIX");
        if authority.is_some() || suffix.is_some() {
            builder = builder.naming(DeviceNaming::new(
                authority.unwrap_or_else(|| "contoso.com".to_string()),
                suffix.unwrap_or_else(|| "trafficevents".to_string()),
            ));
        }
        builder.build()
    }

    /// Topic broadcasts are published on.
    pub fn topic(&self) -> String {
        self.naming.topic(&self.device_id)
    }
}

/// Builder for [`BroadcastConfig`].
pub struct BroadcastConfigBuilder {
    endpoint: BrokerEndpoint,
    device_id: String,
    cert_dir: PathBuf,
    key_dir: Option<PathBuf>,
    ca_file: Option<PathBuf>,
    naming: DeviceNaming,
    qos: DeliveryGuarantee,
}

impl BroadcastConfigBuilder {
    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn key_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.key_dir = Some(dir.into());
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn naming(mut self, naming: DeviceNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn qos(mut self, qos: DeliveryGuarantee) -> Self {
        self.qos = qos;
        self
    }

    pub fn build(self) -> Result<BroadcastConfig, ConfigError> {
        validate_device_id(&self.device_id)?;
        let key_dir = self.key_dir.unwrap_or_else(|| self.cert_dir.clone());
        Ok(BroadcastConfig {
            endpoint: self.endpoint,
            device_id: self.device_id,
            cert_dir: self.cert_dir,
            key_dir,
            ca_file: self.ca_file,
            naming: self.naming,
            qos: self.qos,
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}"))),
    }
}

fn parse_qos<F>(lookup: &F) -> Result<Option<DeliveryGuarantee>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_var::<u8, _>(lookup, "MQTT_PUBLISH_QOS")? {
        None => Ok(None),
        Some(level) => DeliveryGuarantee::from_level(level)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid("MQTT_PUBLISH_QOS", format!("{level} is not 0, 1 or 2"))),
    }
}
