//! Envelope construction for outgoing telemetry
//!
//! Producers hand the channel a typed payload plus context tags. The channel
//! wraps both into an [`Envelope`], serializes it to a single JSON line, and
//! that line is what gets batched, staged and shipped.
//!
//! ## Wire shape
//!
//! ```text
//! {"ver":1,"name":"Event","time":"2024-05-01T12:00:00Z","iKey":"...",
//!  "tags":{"device.id":"..."},"data":{"baseType":"EventData","baseData":{...}}}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Envelope schema version
pub const ENVELOPE_VERSION: u32 = 1;

/// Context tags (device, app, user, session) attached to an envelope.
///
/// Ordered so serialized envelopes are deterministic.
pub type ContextTags = BTreeMap<String, String>;

/// A typed telemetry record that can be wrapped in an envelope.
pub trait TelemetryData: Serialize {
    /// Envelope name (e.g. `"Event"`, `"Metric"`)
    fn envelope_name(&self) -> &str;

    /// Payload type stored as `data.baseType`
    fn base_type(&self) -> &str;
}

/// Read-only source of per-envelope metadata.
///
/// Implemented by the host; the pipeline merges these tags with the tags
/// passed at the call site (call-site tags win on conflicts).
pub trait ContextProvider: Send + Sync {
    fn tags(&self) -> ContextTags;
}

/// Serialized telemetry envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub ver: u32,

    /// Envelope name from [`TelemetryData::envelope_name`]
    pub name: String,

    /// When the envelope was built
    pub time: DateTime<Utc>,

    /// Instrumentation key identifying the host application
    #[serde(rename = "iKey", default, skip_serializing_if = "Option::is_none")]
    pub instrumentation_key: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: ContextTags,

    pub data: EnvelopeData,
}

/// Type-tagged payload inside an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeData {
    #[serde(rename = "baseType")]
    pub base_type: String,

    #[serde(rename = "baseData")]
    pub base_data: serde_json::Value,
}

impl Envelope {
    /// Wrap a payload with its context tags, stamped with the current time
    pub fn wrap<T>(payload: &T, tags: ContextTags, instrumentation_key: Option<&str>) -> Result<Self>
    where
        T: TelemetryData + ?Sized,
    {
        Ok(Envelope {
            ver: ENVELOPE_VERSION,
            name: payload.envelope_name().to_string(),
            time: Utc::now(),
            instrumentation_key: instrumentation_key.map(str::to_string),
            tags,
            data: EnvelopeData {
                base_type: payload.base_type().to_string(),
                base_data: serde_json::to_value(payload)?,
            },
        })
    }

    /// Serialize to one line of the `application/x-json-stream` body.
    ///
    /// Compact JSON escapes embedded newlines, so the result never spans lines.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Named custom event with string properties and numeric measurements
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomEvent {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub measurements: BTreeMap<String, f64>,
}

impl CustomEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_measurement(mut self, key: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(key.into(), value);
        self
    }
}

impl TelemetryData for CustomEvent {
    fn envelope_name(&self) -> &str {
        "Event"
    }

    fn base_type(&self) -> &str {
        "EventData"
    }
}
