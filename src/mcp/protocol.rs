use super::classify::{classify_rpc_error, classify_text};
use super::error::SearchError;
use crate::core::config::ClientConfig;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, ClientCapabilities, Implementation, InitializeRequestParams, RequestId,
};
use serde::Serialize;
use serde_json::{Map, Value};

/// Caller-supplied knobs for one search.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchOptions {
    pub max_results: Option<u32>,
    /// Additional tool arguments passed through unchanged.
    pub extra: Map<String, Value>,
}

impl SearchOptions {
    pub fn with_max_results(max_results: u32) -> Self {
        Self {
            max_results: Some(max_results),
            ..Self::default()
        }
    }

    pub(crate) fn tool_arguments(&self, query: &str) -> Map<String, Value> {
        let mut arguments = self.extra.clone();
        arguments.insert("query".to_string(), Value::String(query.to_string()));
        if let Some(max_results) = self.max_results {
            arguments.insert("max_results".to_string(), Value::from(max_results));
        }
        arguments
    }
}

/// Id carried by an inbound response, split by who issued the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireId {
    /// Handshake and heartbeat traffic uses integer ids.
    Control(i64),
    Search(String),
}

impl From<RequestId> for WireId {
    fn from(id: RequestId) -> Self {
        match id {
            RequestId::Integer(id) => WireId::Control(id),
            RequestId::String(id) => WireId::Search(id),
        }
    }
}

/// A decoded `data` payload from the event stream.
#[derive(Debug)]
pub(crate) enum Inbound {
    Response {
        id: Option<WireId>,
        outcome: Result<String, SearchError>,
    },
    /// Server-initiated requests and notifications; never settle a search.
    ServerTraffic(String),
}

pub(crate) fn client_details(config: &ClientConfig) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "mcp-search".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("MCP Search Client".to_string()),
            description: Some(format!("Search client for {}", config.server_name)),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: config.protocol_version.clone(),
    }
}

pub(crate) fn search_request(
    tool_name: &str,
    query: &str,
    options: &SearchOptions,
) -> RequestFromClient {
    let params = CallToolRequestParams::new(tool_name).with_arguments(options.tool_arguments(query));
    RequestFromClient::CallToolRequest(params)
}

pub(crate) fn encode_request(
    request: RequestFromClient,
    id: RequestId,
) -> Result<String, SearchError> {
    let message =
        ClientMessage::from_message(MessageFromClient::RequestFromClient(request), Some(id))
            .map_err(|err| SearchError::protocol(err.to_string()))?;
    serde_json::to_string(&message).map_err(|err| SearchError::protocol(err.to_string()))
}

pub(crate) fn encode_notification(
    notification: NotificationFromClient,
) -> Result<String, SearchError> {
    let message = ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(notification),
        None,
    )
    .map_err(|err| SearchError::protocol(err.to_string()))?;
    serde_json::to_string(&message).map_err(|err| SearchError::protocol(err.to_string()))
}

/// Decodes one frame's `data` value.
pub(crate) fn decode_inbound(data: &str) -> Result<Inbound, SearchError> {
    let message = serde_json::from_str::<ServerMessage>(data)
        .map_err(|err| SearchError::protocol(format!("Malformed MCP message: {err}")))?;

    match message {
        ServerMessage::Response(response) => {
            let outcome = serde_json::to_value(&response.result)
                .map_err(|err| SearchError::protocol(err.to_string()))
                .and_then(|value| tool_outcome(&value));
            Ok(Inbound::Response {
                id: Some(response.id.into()),
                outcome,
            })
        }
        ServerMessage::Error(error) => Ok(Inbound::Response {
            id: error.id.map(WireId::from),
            outcome: Err(classify_rpc_error(
                error.error.code,
                &error.error.message,
                error.error.data.as_ref(),
            )),
        }),
        ServerMessage::Request(request) => {
            Ok(Inbound::ServerTraffic(request.method().to_string()))
        }
        ServerMessage::Notification(_) => Ok(Inbound::ServerTraffic("notification".to_string())),
    }
}

/// Turns a `tools/call` result into the caller's text or a classified error.
pub(crate) fn tool_outcome(result: &Value) -> Result<String, SearchError> {
    let text = content_text(result);
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if is_error {
        let detail = text.unwrap_or_else(|| result.to_string());
        return Err(classify_text(&detail).into_error(&detail));
    }

    match text {
        Some(text) => Ok(text),
        None => match result.get("structuredContent") {
            Some(structured) => serde_json::to_string_pretty(structured)
                .map_err(|err| SearchError::protocol(err.to_string())),
            None => Ok(result.to_string()),
        },
    }
}

fn content_text(result: &Value) -> Option<String> {
    let blocks = result.get("content")?.as_array()?;
    let texts: Vec<&str> = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_arguments_merge_extra_fields() {
        let mut options = SearchOptions::with_max_results(5);
        options
            .extra
            .insert("region".to_string(), Value::String("eu".to_string()));

        let arguments = options.tool_arguments("rust async");
        assert_eq!(arguments.get("query"), Some(&json!("rust async")));
        assert_eq!(arguments.get("max_results"), Some(&json!(5)));
        assert_eq!(arguments.get("region"), Some(&json!("eu")));
    }

    #[test]
    fn search_request_encodes_tools_call_with_string_id() {
        let payload = encode_request(
            search_request("search", "foo", &SearchOptions::default()),
            RequestId::String("search-1".to_string()),
        )
        .expect("request should encode");
        let value: Value = serde_json::from_str(&payload).expect("json");

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], "search-1");
        assert_eq!(value["method"], "tools/call");
        assert_eq!(value["params"]["name"], "search");
        assert_eq!(value["params"]["arguments"]["query"], "foo");
    }

    #[test]
    fn decodes_text_results() {
        let data = json!({
            "jsonrpc": "2.0",
            "id": "search-7",
            "result": {
                "content": [
                    {"type": "text", "text": "first"},
                    {"type": "text", "text": "second"}
                ],
                "isError": false
            }
        })
        .to_string();

        match decode_inbound(&data).expect("decode") {
            Inbound::Response { id, outcome } => {
                assert_eq!(id, Some(WireId::Search("search-7".to_string())));
                assert_eq!(outcome.expect("ok"), "first\n\nsecond");
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[test]
    fn tool_errors_are_classified() {
        let result = json!({
            "content": [{"type": "text", "text": "Permission denied for tool search"}],
            "isError": true
        });
        assert!(tool_outcome(&result).expect_err("error").is_permission());

        let result = json!({
            "content": [{"type": "text", "text": "upstream exploded"}],
            "isError": true
        });
        assert_eq!(
            tool_outcome(&result).expect_err("error"),
            SearchError::Failed("upstream exploded".to_string())
        );
    }

    #[test]
    fn rpc_errors_and_control_ids_decode() {
        let data = json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32601, "message": "Method not found"}
        })
        .to_string();

        match decode_inbound(&data).expect("decode") {
            Inbound::Response { id, outcome } => {
                assert_eq!(id, Some(WireId::Control(3)));
                assert_eq!(
                    outcome.expect_err("error"),
                    SearchError::Protocol {
                        code: Some(-32601),
                        message: "Method not found".to_string()
                    }
                );
            }
            other => panic!("unexpected inbound: {other:?}"),
        }
    }

    #[test]
    fn malformed_payloads_are_protocol_errors() {
        let err = decode_inbound("not json").expect_err("should fail");
        assert!(matches!(err, SearchError::Protocol { code: None, .. }));
    }
}
