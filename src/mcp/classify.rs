//! Failure classification for backend error payloads.
//!
//! Backend wording is matched against [`PERMISSION_MARKERS`], a versioned
//! table kept apart from the matching logic. Bump [`MARKER_TABLE_VERSION`]
//! whenever an entry is added, removed or reworded.

use super::error::SearchError;
use serde_json::Value;

pub const MARKER_TABLE_VERSION: u32 = 1;

/// A substring that identifies a permission denial, with the explanation
/// surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionMarker {
    pub marker: &'static str,
    pub explanation: &'static str,
}

/// Matched case-insensitively, first entry wins.
pub const PERMISSION_MARKERS: &[PermissionMarker] = &[
    PermissionMarker {
        marker: "permission_denied",
        explanation: "the search backend denied permission for this tool",
    },
    PermissionMarker {
        marker: "permission denied",
        explanation: "the search backend denied permission for this tool",
    },
    PermissionMarker {
        marker: "insufficient_scope",
        explanation: "the stored credential lacks the scope required for search",
    },
    PermissionMarker {
        marker: "invalid api key",
        explanation: "the search backend rejected the stored API key",
    },
    PermissionMarker {
        marker: "invalid_api_key",
        explanation: "the search backend rejected the stored API key",
    },
    PermissionMarker {
        marker: "not authorized",
        explanation: "the account is not authorized to use this search tool",
    },
    PermissionMarker {
        marker: "unauthorized",
        explanation: "the search backend rejected the credentials",
    },
    PermissionMarker {
        marker: "forbidden",
        explanation: "the search backend refused access to this tool",
    },
    PermissionMarker {
        marker: "access denied",
        explanation: "the search backend refused access to this tool",
    },
];

/// HTTP statuses that mean the credential, not the transport, is the problem.
pub const PERMISSION_STATUSES: &[(u16, PermissionMarker)] = &[
    (
        401,
        PermissionMarker {
            marker: "http 401",
            explanation: "the search backend rejected the credentials",
        },
    ),
    (
        403,
        PermissionMarker {
            marker: "http 403",
            explanation: "the search backend refused access to this tool",
        },
    ),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Permission(PermissionMarker),
    Protocol { code: i64, message: String },
    Generic,
}

impl Classification {
    /// Converts the classification into the error handed to callers.
    pub fn into_error(self, detail: &str) -> SearchError {
        match self {
            Classification::Permission(marker) => SearchError::Permission {
                marker: marker.marker,
                explanation: marker.explanation,
                detail: detail.trim().to_string(),
            },
            Classification::Protocol { code, message } => SearchError::Protocol {
                code: Some(code),
                message,
            },
            Classification::Generic => SearchError::Failed(detail.trim().to_string()),
        }
    }
}

pub fn find_permission_marker(text: &str) -> Option<PermissionMarker> {
    let lowered = text.to_ascii_lowercase();
    PERMISSION_MARKERS
        .iter()
        .find(|entry| lowered.contains(entry.marker))
        .copied()
}

/// Classifies free-form error text, such as the text of a failed tool call.
pub fn classify_text(text: &str) -> Classification {
    if let Some(marker) = find_permission_marker(text) {
        return Classification::Permission(marker);
    }
    if let Some((code, message)) = embedded_rpc_error(text) {
        return Classification::Protocol { code, message };
    }
    Classification::Generic
}

/// Classifies a JSON-RPC error object received for a request.
pub fn classify_rpc_error(code: i64, message: &str, data: Option<&Value>) -> SearchError {
    let detail = match data.and_then(data_details) {
        Some(details) => format!("{message}: {details}"),
        None => message.to_string(),
    };
    if let Some(marker) = find_permission_marker(&detail) {
        return Classification::Permission(marker).into_error(&detail);
    }
    Classification::Protocol {
        code,
        message: detail,
    }
    .into_error(message)
}

/// Classifies a non-success HTTP status from the transport.
pub fn classify_http_status(status: u16, body: &str) -> SearchError {
    if let Some((_, marker)) = PERMISSION_STATUSES.iter().find(|(code, _)| *code == status) {
        return Classification::Permission(*marker).into_error(body);
    }
    if let Some(marker) = find_permission_marker(body) {
        return Classification::Permission(marker).into_error(body);
    }
    let body = body.trim();
    if body.is_empty() {
        SearchError::connection(format!("HTTP error: {status}"))
    } else {
        SearchError::connection(format!("HTTP error: {status}: {body}"))
    }
}

fn data_details(data: &Value) -> Option<String> {
    data.get("details")
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
        .or_else(|| data.as_str().map(|value| value.to_string()))
        .or_else(|| serde_json::to_string(data).ok())
        .filter(|details| !details.is_empty())
}

/// Finds a `{"code": <int>, "message": <str>}` object, or the
/// `MCP error <code>: <message>` rendering of one, inside `text`.
fn embedded_rpc_error(text: &str) -> Option<(i64, String)> {
    if let Some(start) = text.find('{') {
        if let Ok(value) = serde_json::from_str::<Value>(&text[start..]) {
            let object = value.get("error").unwrap_or(&value);
            let code = object.get("code").and_then(Value::as_i64);
            let message = object.get("message").and_then(Value::as_str);
            if let (Some(code), Some(message)) = (code, message) {
                return Some((code, message.to_string()));
            }
        }
    }

    let rest = text.trim().strip_prefix("MCP error ")?;
    let (code, message) = rest.split_once(':')?;
    let code = code.trim().parse::<i64>().ok()?;
    Some((code, message.trim().to_string()))
}
