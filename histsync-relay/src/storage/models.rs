//! Relay storage model types and their JSON wire format.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

/// A registered device. `(user_id, device_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub user_id: String,
    pub device_id: String,
    pub registration_ip: String,
    pub registration_date: DateTime<Utc>,
    /// Test devices are aggressively cleaned by the deep clean.
    pub is_integration_test_device: bool,
    pub uninstall_date: Option<DateTime<Utc>>,
}

/// One encrypted history entry addressed to one destination device.
///
/// `enc_data` and `nonce` are opaque; the relay never decrypts them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncHistoryEntry {
    #[serde(rename = "enc_data", with = "base64_bytes")]
    pub encrypted_data: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Destination device of this row.
    pub device_id: String,
    pub user_id: String,
    #[serde(rename = "time")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub encrypted_id: String,
    #[serde(default)]
    pub read_count: u32,
    #[serde(default)]
    pub is_from_same_device: bool,
}

/// A device asking its peers for a full history upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRequest {
    pub user_id: String,
    pub requesting_device_id: String,
    pub request_time: DateTime<Utc>,
    #[serde(default)]
    pub read_count: u32,
}

/// Identifies entries to delete: by end time, by entry id, or either.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageIdentifier {
    #[serde(default)]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub entry_id: String,
}

impl MessageIdentifier {
    /// The end time, treating the zero timestamp sent by older clients as unset.
    pub fn effective_end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time.filter(|t| t.year() > 1)
    }

    pub fn effective_entry_id(&self) -> Option<&str> {
        Some(self.entry_id.as_str()).filter(|id| !id.is_empty())
    }

    /// Whether this message can match any entry at all.
    pub fn is_matchable(&self) -> bool {
        self.effective_end_time().is_some() || self.effective_entry_id().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageIdentifiers {
    #[serde(rename = "message_ids", default)]
    pub ids: Vec<MessageIdentifier>,
}

/// A tombstone addressed to one destination device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub user_id: String,
    #[serde(default)]
    pub destination_device_id: String,
    pub send_time: DateTime<Utc>,
    #[serde(default)]
    pub read_count: u32,
    #[serde(default)]
    pub messages: MessageIdentifiers,
}

/// Free-text feedback a client sends when it is uninstalled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub user_id: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub feedback: String,
}

/// Per-(user, device) activity counters. Observational only.
#[cfg(test)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageData {
    pub user_id: String,
    pub device_id: String,
    pub last_used: DateTime<Utc>,
    pub last_ip: String,
    pub num_entries_handled: i64,
    pub last_queried: Option<DateTime<Utc>>,
    pub num_queries: i64,
    pub version: String,
}

/// Response to a submit. Both fields are omitted for clients that only
/// understand a bare acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dump_requests: Option<Vec<DumpRequest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_requests: Option<Vec<DeletionRequest>>,
}

/// Custom base64 serialization for `Vec<u8>`.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_wire_format() {
        let json = r#"{
            "enc_data": "AQID",
            "nonce": "BAU=",
            "device_id": "dev",
            "user_id": "user",
            "time": "2024-01-02T03:04:05.123456789Z",
            "encrypted_id": "abc"
        }"#;
        let entry: EncHistoryEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.encrypted_data, vec![1, 2, 3]);
        assert_eq!(entry.nonce, vec![4, 5]);
        assert_eq!(entry.read_count, 0);
        assert!(!entry.is_from_same_device);
        assert_eq!(entry.date.timestamp_subsec_nanos(), 123_456_789);

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["enc_data"], "AQID");
        assert!(value.get("encrypted_data").is_none());
    }

    #[test]
    fn rejects_invalid_base64() {
        let json = r#"{"enc_data": "!!", "nonce": "", "device_id": "d", "user_id": "u",
                       "time": "2024-01-02T03:04:05Z"}"#;
        assert!(serde_json::from_str::<EncHistoryEntry>(json).is_err());
    }

    #[test]
    fn zero_end_time_is_unset() {
        let json = r#"{"device_id": "d", "end_time": "0001-01-01T00:00:00Z"}"#;
        let msg: MessageIdentifier = serde_json::from_str(json).unwrap();
        assert!(msg.end_time.is_some());
        assert!(msg.effective_end_time().is_none());
        assert!(!msg.is_matchable());

        let msg = MessageIdentifier {
            device_id: "d".into(),
            end_time: None,
            entry_id: "id".into(),
        };
        assert!(msg.is_matchable());
    }

    #[test]
    fn bare_submit_response_is_empty_object() {
        let json = serde_json::to_string(&SubmitResponse::default()).unwrap();
        assert_eq!(json, "{}");

        let structured = SubmitResponse {
            dump_requests: Some(vec![]),
            deletion_requests: Some(vec![]),
        };
        let json = serde_json::to_string(&structured).unwrap();
        assert_eq!(json, r#"{"dump_requests":[],"deletion_requests":[]}"#);
    }
}
