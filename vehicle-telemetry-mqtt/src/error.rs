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

//! Error taxonomy for credential loading, connections, publishing and payloads.

use thiserror::Error;

/// Failure to turn a device's PEM files into a TLS client identity.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file not found: {0}")]
    NotFound(String),
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("private key does not match certificate: {0}")]
    KeyMismatch(String),
}

/// Failure to establish an MQTT session.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("timed out waiting for CONNACK")]
    Timeout,
    #[error("broker rejected connection (return code {0})")]
    Rejected(u8),
    #[error("TLS handshake failed: {0}")]
    TlsFailure(String),
    #[error("network error: {0}")]
    Network(String),
}

/// Failure to publish one message.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Publishing on a session that is not connected. A caller bug, not a network failure.
    #[error("session is not connected")]
    NotConnected,
    #[error("broker rejected publish (reason code {0})")]
    Rejected(u8),
    #[error("timed out waiting for publish acknowledgment")]
    Timeout,
    #[error("connection lost while publishing: {0}")]
    ConnectionLost(String),
}

/// Failure to load a payload batch.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("payload file not found: {0}")]
    NotFound(String),
    #[error("invalid payload batch: {0}")]
    ParseError(String),
}

/// Invalid or incomplete configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    Missing(&'static str),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
