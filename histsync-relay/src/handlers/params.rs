//! Query-string and header helpers shared by the handlers.

use crate::engine::{ClientInfo, UNKNOWN_IP};
use crate::error::RelayError;
use axum::http::HeaderMap;
use serde::Deserialize;

pub const VERSION_HEADER: &str = "x-histsync-version";
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// `user_id` + `device_id`, used by most read endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct DeviceParams {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegisterParams {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub is_integration_test_device: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    pub source_device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    #[serde(rename = "queryReason")]
    pub query_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitDumpParams {
    pub user_id: Option<String>,
    pub source_device_id: Option<String>,
    pub requesting_device_id: Option<String>,
    pub is_chunk: Option<String>,
}

/// A parameter every client sends.
pub fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, RelayError> {
    match value.as_deref() {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RelayError::BadRequest(format!(
            "Missing required query parameter {}",
            name
        ))),
    }
}

/// A parameter older clients may omit. The test environment requires it so
/// client regressions are caught.
pub fn optional<'a>(value: &'a Option<String>, name: &str, strict: bool) -> Result<Option<&'a str>, RelayError> {
    if strict {
        return required(value, name).map(Some);
    }
    Ok(value.as_deref().filter(|v| !v.is_empty()))
}

pub fn is_true(value: Option<&str>) -> bool {
    value == Some("true")
}

/// Client version and address as reported by the client and the proxy in
/// front of the relay.
pub fn client_info(headers: &HeaderMap) -> ClientInfo {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    ClientInfo {
        version: header(VERSION_HEADER).unwrap_or_default().to_string(),
        ip: header(REAL_IP_HEADER).unwrap_or(UNKNOWN_IP).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn required_rejects_missing_and_empty() {
        assert_eq!(required(&Some("u1".into()), "user_id").unwrap(), "u1");
        assert!(matches!(
            required(&None, "user_id"),
            Err(RelayError::BadRequest(_))
        ));
        assert!(required(&Some(String::new()), "user_id").is_err());
    }

    #[test]
    fn optional_is_strict_only_when_asked() {
        assert_eq!(optional(&None, "source_device_id", false).unwrap(), None);
        assert!(optional(&None, "source_device_id", true).is_err());
        assert_eq!(
            optional(&Some("d1".into()), "source_device_id", true).unwrap(),
            Some("d1")
        );
    }

    #[test]
    fn client_info_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_info(&headers).ip, UNKNOWN_IP);
        assert_eq!(client_info(&headers).version, "");

        headers.insert(VERSION_HEADER, HeaderValue::from_static("v0.300"));
        headers.insert(REAL_IP_HEADER, HeaderValue::from_static("10.1.2.3"));
        let info = client_info(&headers);
        assert_eq!(info.version, "v0.300");
        assert_eq!(info.ip, "10.1.2.3");
        assert!(info.capabilities().structured_submit_response);
    }
}
