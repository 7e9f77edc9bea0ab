use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use saksflyt_core::{CaseId, CorrelationId};

use crate::error::FieldError;
use crate::event_name::EventName;
use crate::fields::{FieldKey, Fields};
use crate::identity::{ProvenanceEntry, ServiceIdentity};

/// Envelope for one saga step's input/output.
///
/// This is the unit published to (and consumed from) the event stream.
///
/// Notes:
/// - `case_id` is the partition key: all envelopes of one case are ordered.
/// - `correlation_id` is copied unchanged across the whole saga.
/// - `hop_count` grows by one per [`EventEnvelope::follow_on`]; envelopes built through
///   `originate`/`follow_on` keep `provenance.len() == hop_count + 1`.
/// - `fields` are denormalized snapshots, never the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_id: Uuid,
    event_name: EventName,
    case_id: CaseId,
    correlation_id: CorrelationId,
    hop_count: u32,
    provenance: Vec<ProvenanceEntry>,
    #[serde(default)]
    fields: Fields,
    created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Start a new saga (or inject an external trigger) at hop 0.
    pub fn originate(
        event_name: EventName,
        case_id: CaseId,
        correlation_id: CorrelationId,
        origin: &ServiceIdentity,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_name,
            case_id,
            correlation_id,
            hop_count: 0,
            provenance: vec![origin.stamp()],
            fields: Fields::new(),
            created_at: Utc::now(),
        }
    }

    /// Build the envelope for the next step.
    ///
    /// Fields and correlation id are carried over, the hop counter is incremented
    /// and `identity` is appended to the provenance trail.
    pub fn follow_on(&self, event_name: EventName, identity: &ServiceIdentity) -> Self {
        let mut provenance = self.provenance.clone();
        provenance.push(identity.stamp());

        Self {
            event_id: Uuid::now_v7(),
            event_name,
            case_id: self.case_id,
            correlation_id: self.correlation_id,
            hop_count: self.hop_count.saturating_add(1),
            provenance,
            fields: self.fields.clone(),
            created_at: Utc::now(),
        }
    }

    /// Add (or overwrite) a field.
    pub fn with_field<T: Serialize + ?Sized>(
        mut self,
        key: FieldKey,
        value: &T,
    ) -> Result<Self, FieldError> {
        let value = serde_json::to_value(value).map_err(|e| FieldError::Malformed {
            key,
            reason: e.to_string(),
        })?;
        self.fields.insert(key.as_str().to_string(), value);
        Ok(self)
    }

    pub fn with_value(mut self, key: FieldKey, value: JsonValue) -> Self {
        self.fields.insert(key.as_str().to_string(), value);
        self
    }

    /// Replace name and fields, keeping identity, correlation, hops and provenance.
    pub(crate) fn reshaped(mut self, event_name: EventName, fields: Fields) -> Self {
        self.event_name = event_name;
        self.fields = fields;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_name(&self) -> &EventName {
        &self.event_name
    }

    pub fn case_id(&self) -> CaseId {
        self.case_id
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn hop_count(&self) -> u32 {
        self.hop_count
    }

    pub fn provenance(&self) -> &[ProvenanceEntry] {
        &self.provenance
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field(&self, key: FieldKey) -> Option<&JsonValue> {
        self.fields.get(key.as_str())
    }

    pub fn contains(&self, key: FieldKey) -> bool {
        self.fields.contains_key(key.as_str())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
