//! Wire types for the flag service API.
//!
//! Both endpoints are plain JSON-over-POST, relative to the configured base URL. Timestamps use
//! the fixed encoding from [`crate::timestamp`].
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::EvaluationContext;

/// Path of the apply endpoint, relative to the base URL.
pub const APPLY_ENDPOINT: &str = "flags:apply";

/// Path of the resolve endpoint, relative to the base URL.
pub const RESOLVE_ENDPOINT: &str = "flags:resolve";

/// SDK identification attached to every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sdk {
    /// SDK identifier.
    pub id: &'static str,
    /// Version of the SDK.
    pub version: &'static str,
}

impl Default for Sdk {
    fn default() -> Sdk {
        Sdk {
            id: "beacon-rust-core",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// A single applied flag inside an apply request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedFlag {
    /// Name of the flag that was used.
    pub flag: String,
    /// When the flag value was first used by the host application.
    #[serde(with = "crate::timestamp")]
    pub apply_time: DateTime<Utc>,
}

/// Request body for [`APPLY_ENDPOINT`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFlagsRequest {
    pub flags: Vec<AppliedFlag>,
    #[serde(with = "crate::timestamp")]
    pub send_time: DateTime<Utc>,
    pub client_secret: String,
    pub resolve_token: String,
    pub sdk: Sdk,
}

/// Response body for [`APPLY_ENDPOINT`]. Empty on success.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplyFlagsResponse {}

/// Request body for [`RESOLVE_ENDPOINT`].
///
/// Resolution itself happens server-side; this crate only ships the request so that the
/// surrounding resolver can reuse the transport.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveFlagsRequest {
    pub evaluation_context: EvaluationContext,
    pub client_secret: String,
    /// Whether the server should consider the resolved flags applied right away, skipping
    /// client-side apply reporting.
    pub apply: bool,
    pub sdk: Sdk,
}

/// Response body for [`RESOLVE_ENDPOINT`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveFlagsResponse {
    pub resolved_flags: Vec<ResolvedFlag>,
    /// Opaque token correlating later apply reports to this resolution.
    pub resolve_token: String,
}

/// One resolved flag within a [`ResolveFlagsResponse`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedFlag {
    pub flag: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// Structured error body returned by the service on non-200 responses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn apply_request_serializes_to_the_wire_shape() {
        let request = ApplyFlagsRequest {
            flags: vec![AppliedFlag {
                flag: "checkout-redesign".to_owned(),
                apply_time: Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 0).unwrap(),
            }],
            send_time: Utc.with_ymd_and_hms(2024, 5, 17, 12, 0, 1).unwrap(),
            client_secret: "secret".to_owned(),
            resolve_token: "token-1".to_owned(),
            sdk: Sdk {
                id: "beacon-rust-core",
                version: "1.2.3",
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "flags": [{"flag": "checkout-redesign", "applyTime": "2024-05-17T12:00:00.000Z"}],
                "sendTime": "2024-05-17T12:00:01.000Z",
                "clientSecret": "secret",
                "resolveToken": "token-1",
                "sdk": {"id": "beacon-rust-core", "version": "1.2.3"},
            })
        );
    }

    #[test]
    fn error_body_decodes_with_missing_details() {
        let error: ApiError =
            serde_json::from_str(r#"{"code": 7, "message": "invalid client secret"}"#).unwrap();
        assert_eq!(
            error,
            ApiError {
                code: 7,
                message: "invalid client secret".to_owned(),
                details: vec![],
            }
        );
    }

    #[test]
    fn resolve_response_decodes() {
        let response: ResolveFlagsResponse = serde_json::from_str(
            r#"{
                "resolvedFlags": [
                    {"flag": "checkout-redesign", "variant": "treatment", "value": {"color": "blue"}},
                    {"flag": "kill-switch"}
                ],
                "resolveToken": "token-1"
            }"#,
        )
        .unwrap();

        assert_eq!(response.resolve_token, "token-1");
        assert_eq!(response.resolved_flags.len(), 2);
        assert_eq!(response.resolved_flags[1].variant, None);
        assert_eq!(response.resolved_flags[1].value, serde_json::Value::Null);
    }
}
