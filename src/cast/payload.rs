//! JSON payload shapes for the post-auth session sub-protocols
//! (connection, heartbeat, receiver).

use serde::{Deserialize, Serialize};

pub const NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";

pub const DEFAULT_APP_ID: &str = "CC1AD845";
const DEFAULT_APP_NAME: &str = "Default Media Receiver";
const SESSION_ID: &str = "7E2FF513-CDF6-9A91-2B28-3E3DE7BAC174";
const TRANSPORT_ID: &str = "web-5";
const STATUS_TEXT: &str = "Ready To Cast";

/// The `{"type": ...}` discriminator every Cast JSON payload carries.
#[derive(Debug, Deserialize)]
pub struct TypeTag {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(rename = "requestId")]
    pub request_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct Pong {
    #[serde(rename = "type")]
    pub type_: &'static str,
}

impl Pong {
    pub fn new() -> Self {
        Self { type_: "PONG" }
    }
}

#[derive(Debug, Serialize)]
pub struct Close {
    #[serde(rename = "type")]
    pub type_: &'static str,
}

impl Close {
    pub fn new() -> Self {
        Self { type_: "CLOSE" }
    }
}

#[derive(Debug, Deserialize)]
pub struct GetAppAvailability {
    #[serde(rename = "requestId")]
    pub request_id: Option<i64>,
    #[serde(rename = "appId")]
    pub app_id: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AppAvailabilityResponse {
    #[serde(rename = "type")]
    pub type_: &'static str,
    #[serde(rename = "requestId")]
    pub request_id: Option<i64>,
    pub availability: std::collections::HashMap<String, &'static str>,
}

impl AppAvailabilityResponse {
    pub fn for_apps(request_id: Option<i64>, app_ids: &[String]) -> Self {
        let availability = app_ids
            .iter()
            .map(|id| (id.clone(), "APP_AVAILABLE"))
            .collect();
        Self { type_: "GET_APP_AVAILABILITY", request_id, availability }
    }
}

#[derive(Debug, Deserialize)]
pub struct GetStatus {
    #[serde(rename = "requestId")]
    pub request_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct Launch {
    #[serde(rename = "requestId")]
    pub request_id: Option<i64>,
    #[serde(rename = "appId")]
    pub app_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Volume {
    pub level: f64,
    pub muted: bool,
}

impl Default for Volume {
    fn default() -> Self {
        Self { level: 1.0, muted: false }
    }
}

#[derive(Debug, Serialize)]
pub struct Namespace {
    pub name: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Application {
    #[serde(rename = "appId")]
    pub app_id: String,
    #[serde(rename = "displayName")]
    pub display_name: &'static str,
    pub namespaces: Vec<Namespace>,
    #[serde(rename = "sessionId")]
    pub session_id: &'static str,
    #[serde(rename = "transportId")]
    pub transport_id: &'static str,
    #[serde(rename = "statusText")]
    pub status_text: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReceiverStatus {
    #[serde(rename = "type")]
    pub type_: &'static str,
    #[serde(rename = "requestId")]
    pub request_id: Option<i64>,
    pub status: StatusBody,
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub applications: Vec<Application>,
    pub volume: Volume,
}

impl ReceiverStatus {
    /// The canned `RECEIVER_STATUS` reply: one application session for
    /// `app_id` (falling back to [`DEFAULT_APP_ID`] if none was requested).
    pub fn canned(request_id: Option<i64>, app_id: Option<&str>) -> Self {
        let app_id = app_id.unwrap_or(DEFAULT_APP_ID).to_string();
        Self {
            type_: "RECEIVER_STATUS",
            request_id,
            status: StatusBody {
                applications: vec![Application {
                    app_id,
                    display_name: DEFAULT_APP_NAME,
                    namespaces: vec![
                        Namespace { name: "urn:x-cast:com.google.cast.player.message" },
                        Namespace { name: "urn:x-cast:com.google.cast.media" },
                    ],
                    session_id: SESSION_ID,
                    transport_id: TRANSPORT_ID,
                    status_text: STATUS_TEXT,
                }],
                volume: Volume::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_serializes_without_request_id() {
        let json = serde_json::to_string(&Pong::new()).unwrap();
        assert_eq!(json, r#"{"type":"PONG"}"#);
    }

    #[test]
    fn canned_status_echoes_request_id_and_app() {
        let status = ReceiverStatus::canned(Some(42), Some("ABCD1234"));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["requestId"], 42);
        assert_eq!(json["status"]["applications"][0]["appId"], "ABCD1234");
        assert_eq!(json["status"]["volume"]["level"], 1.0);
    }

    #[test]
    fn canned_status_defaults_app_id() {
        let status = ReceiverStatus::canned(None, None);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"]["applications"][0]["appId"], DEFAULT_APP_ID);
    }

    #[test]
    fn availability_marks_every_requested_app() {
        let ids = vec!["A".to_string(), "B".to_string()];
        let resp = AppAvailabilityResponse::for_apps(Some(1), &ids);
        assert_eq!(resp.availability.get("A"), Some(&"APP_AVAILABLE"));
        assert_eq!(resp.availability.get("B"), Some(&"APP_AVAILABLE"));
    }
}
