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

//! Payload batches: ordered telemetry records replayed by a simulated device.
//!
//! A batch file is a JSON array of objects. Each object becomes one message
//! body, in array order. Anything else (a bare object, scalars inside the
//! array, trailing garbage) is rejected rather than skipped.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde_json::{Map, Value};

use crate::config::DeliveryGuarantee;
use crate::error::LoadError;

/// One telemetry record.
pub type Record = Map<String, Value>;

/// A message ready to publish. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub topic: String,
    /// UTF-8 JSON.
    pub payload: Vec<u8>,
    pub qos: DeliveryGuarantee,
}

impl TelemetryMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, qos: DeliveryGuarantee) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
        }
    }

    /// Serialize `record` as the message body.
    pub fn from_record(
        topic: impl Into<String>,
        record: &Record,
        qos: DeliveryGuarantee,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(record)?, qos))
    }
}

/// Read the batch at `path` into messages for `topic`, preserving order.
///
/// The whole batch is materialized; loading the same file twice yields the
/// same sequence.
pub fn load(
    path: &Path,
    topic: &str,
    qos: DeliveryGuarantee,
) -> Result<Vec<TelemetryMessage>, LoadError> {
    let raw = fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => LoadError::NotFound(path.display().to_string()),
        _ => LoadError::NotFound(format!("{}: {e}", path.display())),
    })?;
    parse(&raw, topic, qos).map_err(|e| match e {
        LoadError::ParseError(reason) => {
            LoadError::ParseError(format!("{}: {reason}", path.display()))
        }
        other => other,
    })
}

/// Decode a JSON array of objects into messages for `topic`.
pub fn parse(
    raw: &[u8],
    topic: &str,
    qos: DeliveryGuarantee,
) -> Result<Vec<TelemetryMessage>, LoadError> {
    let records: Vec<Record> =
        serde_json::from_slice(raw).map_err(|e| LoadError::ParseError(e.to_string()))?;
    records
        .iter()
        .map(|record| {
            TelemetryMessage::from_record(topic, record, qos)
                .map_err(|e| LoadError::ParseError(e.to_string()))
        })
        .collect()
}
