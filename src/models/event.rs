// Event models - inbound and system-generated occurrences

//! # Event Models
//!
//! Events drive schema instances forward. Apart from `handled` and
//! `handled_at` an event is never modified once stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    UserMessage,
    TerminateWorkflow,
    TriggerChildWorkflow,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    /// Read `{ "latitude": .., "longitude": .. }` (or `lat`/`lng`) from JSON
    pub fn from_json(value: &Value) -> Option<Self> {
        let latitude = value
            .get("latitude")
            .or_else(|| value.get("lat"))
            .and_then(Value::as_f64)?;
        let longitude = value
            .get("longitude")
            .or_else(|| value.get("lng"))
            .and_then(Value::as_f64)?;
        Some(Self { latitude, longitude })
    }

    pub fn to_json(&self) -> Value {
        json!({ "latitude": self.latitude, "longitude": self.longitude })
    }
}

/// Answer to a question previously sent to the user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuestionResponse {
    #[serde(default)]
    pub question_text: Option<String>,

    #[serde(default)]
    pub options: Vec<String>,

    #[serde(default)]
    pub chosen_option: Option<String>,

    #[serde(default)]
    pub chosen_option_sequence: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub text: Option<String>,

    #[serde(default)]
    pub media_url: Option<String>,

    #[serde(default)]
    pub location: Option<GeoLocation>,

    #[serde(default)]
    pub question_response: Option<QuestionResponse>,

    /// Id of the message this one replies to
    #[serde(default)]
    pub previous_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub tenant_id: String,
    pub event_type: EventType,

    #[serde(default)]
    pub reference_id: Option<String>,

    /// Explicit routing
    #[serde(default)]
    pub schema_id: Option<Uuid>,

    #[serde(default)]
    pub schema_instance_id: Option<Uuid>,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub user_message: Option<UserMessage>,

    #[serde(default)]
    pub payload: Option<Value>,

    #[serde(default)]
    pub handled: bool,

    #[serde(default)]
    pub handled_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new<T: Into<String>>(tenant_id: T, event_type: EventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            event_type,
            reference_id: None,
            schema_id: None,
            schema_instance_id: None,
            timestamp: Utc::now(),
            user_message: None,
            payload: None,
            handled: false,
            handled_at: None,
        }
    }

    pub fn user_message<T: Into<String>>(tenant_id: T, message: UserMessage) -> Self {
        let mut event = Self::new(tenant_id, EventType::UserMessage);
        event.user_message = Some(message);
        event
    }

    pub fn for_schema(mut self, schema_id: Uuid) -> Self {
        self.schema_id = Some(schema_id);
        self
    }

    pub fn for_instance(mut self, schema_instance_id: Uuid) -> Self {
        self.schema_instance_id = Some(schema_instance_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn phone(&self) -> Option<&str> {
        self.user_message.as_ref()?.phone.as_deref()
    }

    pub fn text(&self) -> Option<&str> {
        self.user_message.as_ref()?.text.as_deref()
    }

    pub fn location(&self) -> Option<GeoLocation> {
        self.user_message.as_ref()?.location
    }

    /// The user's answer: chosen option text, else its sequence, else the raw text
    pub fn answer(&self) -> Option<Value> {
        let message = self.user_message.as_ref()?;
        if let Some(response) = &message.question_response {
            if let Some(option) = &response.chosen_option {
                return Some(Value::String(option.clone()));
            }
            if let Some(sequence) = response.chosen_option_sequence {
                return Some(Value::from(sequence));
            }
        }
        message
            .text
            .as_ref()
            .filter(|text| !text.trim().is_empty())
            .map(|text| Value::String(text.trim().to_string()))
    }

    /// Resolve a named value from the event for `ValueSource::Event` lookups.
    ///
    /// Well-known message fields are matched case-insensitively; anything else
    /// is a dot-separated path into the payload, e.g. `order.total`.
    pub fn context_value(&self, key: &str) -> Option<Value> {
        let message = self.user_message.as_ref();
        let known = match key.to_ascii_lowercase().as_str() {
            "text" | "message" => message.and_then(|m| m.text.clone()).map(Value::String),
            "phone" | "phonenumber" => message.and_then(|m| m.phone.clone()).map(Value::String),
            "mediaurl" => message.and_then(|m| m.media_url.clone()).map(Value::String),
            "location" => message.and_then(|m| m.location).map(|l| l.to_json()),
            "chosenoption" => message
                .and_then(|m| m.question_response.as_ref())
                .and_then(|r| r.chosen_option.clone())
                .map(Value::String),
            "chosenoptionsequence" => message
                .and_then(|m| m.question_response.as_ref())
                .and_then(|r| r.chosen_option_sequence)
                .map(Value::from),
            "timestamp" => Some(Value::String(self.timestamp.to_rfc3339())),
            _ => None,
        };
        if known.is_some() {
            return known;
        }

        let mut current = self.payload.as_ref()?;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current.clone())
    }

    pub fn mark_handled(&mut self) {
        self.handled = true;
        self.handled_at = Some(Utc::now());
    }
}

/// Record of a queued task that failed or overran its deadline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub queue: String,
    pub payload: Value,
    pub error: String,

    #[serde(default)]
    pub schema_instance_id: Option<Uuid>,

    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new<Q: Into<String>>(queue: Q, payload: Value, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            payload,
            error,
            schema_instance_id: None,
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_answer_prefers_chosen_option() {
        let mut message = UserMessage {
            text: Some(" maybe ".to_string()),
            ..Default::default()
        };
        let event = Event::user_message("t", message.clone());
        assert_eq!(event.answer(), Some(json!("maybe")));

        message.question_response = Some(QuestionResponse {
            chosen_option_sequence: Some(2),
            ..Default::default()
        });
        let event = Event::user_message("t", message.clone());
        assert_eq!(event.answer(), Some(json!(2)));

        message.question_response = Some(QuestionResponse {
            chosen_option: Some("Yes".to_string()),
            chosen_option_sequence: Some(1),
            ..Default::default()
        });
        let event = Event::user_message("t", message);
        assert_eq!(event.answer(), Some(json!("Yes")));
    }

    #[test]
    fn test_context_value_lookup() {
        let event = Event::user_message(
            "t",
            UserMessage {
                phone: Some("+15550100".to_string()),
                ..Default::default()
            },
        )
        .with_payload(json!({"order": {"total": 12.5}}));

        assert_eq!(event.context_value("Phone"), Some(json!("+15550100")));
        assert_eq!(event.context_value("order.total"), Some(json!(12.5)));
        assert_eq!(event.context_value("order.missing"), None);
    }

    #[test]
    fn test_geo_location_from_json() {
        let location = GeoLocation::from_json(&json!({"lat": 1.5, "lng": -2.0})).unwrap();
        assert_eq!(location, GeoLocation { latitude: 1.5, longitude: -2.0 });
        assert!(GeoLocation::from_json(&json!({"lat": 1.5})).is_none());
    }
}
