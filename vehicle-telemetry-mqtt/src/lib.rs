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

//! Certificate-authenticated MQTT telemetry publishing for simulated vehicles.
//!
//! Each device authenticates with its own X.509 certificate, connects over
//! TLS, and replays an ordered batch of JSON telemetry records. The
//! [`FleetRunner`] drives many devices concurrently; the
//! [`BroadcastEndpoint`] publishes a single validated traffic event.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vehicle_telemetry_mqtt::{
//!     load_trust_anchors, shutdown, BrokerEndpoint, FleetConfig, FleetRunner, RumqttcConnector,
//! };
//!
//! let config = FleetConfig::builder(BrokerEndpoint::new("broker.example.net"), "certs")
//!     .devices(["device01", "device02"])
//!     .payload_dir("SamplePayloads")
//!     .build()?;
//!
//! let roots = Arc::new(load_trust_anchors(config.ca_file.as_deref())?);
//! let runner = FleetRunner::new(config, roots, RumqttcConnector);
//! let (_trigger, signal) = shutdown::channel();
//! let report = runner.run(signal).await;
//! ```

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod fleet;
pub mod link;
pub mod payload;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testing;

pub use broadcast::{BroadcastEndpoint, BroadcastEvent, BroadcastFailure, BroadcastResponse};
pub use config::{
    BroadcastConfig, BroadcastConfigBuilder, BrokerEndpoint, DeliveryGuarantee, DeviceNaming,
    FleetConfig, FleetConfigBuilder,
};
pub use connection::{
    ClientLogin, ConnectionState, Connector, DeviceConnection, MqttLink, PublishAck, Session,
};
pub use credentials::{load_trust_anchors, CredentialLoader, DeviceIdentity};
pub use error::{ConfigError, ConnectError, CredentialError, LoadError, PublishError};
pub use fleet::{FailureStage, FleetReport, FleetRunner, RunOutcome};
pub use link::{RumqttcConnector, RumqttcLink};
pub use payload::TelemetryMessage;
pub use shutdown::{Shutdown, ShutdownTrigger};
