use super::error::SearchError;
use super::protocol::{client_details, encode_notification, encode_request};
use super::session::Session;
use super::transport::EventTransport;
use crate::core::config::ClientConfig;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient};
use rust_mcp_schema::RequestId;
use std::time::Duration;
use tracing::debug;

/// One fixed call of the initialization sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeStep {
    pub method: &'static str,
    pub payload: String,
}

/// Builds the ordered handshake: `initialize`, `notifications/initialized`,
/// then `tools/list`.
///
/// Requests draw integer ids from `next_id`; their responses are never awaited.
pub fn handshake_steps(
    config: &ClientConfig,
    mut next_id: impl FnMut() -> i64,
) -> Result<Vec<HandshakeStep>, SearchError> {
    let initialize = encode_request(
        RequestFromClient::InitializeRequest(client_details(config)),
        RequestId::Integer(next_id()),
    )?;
    let initialized =
        encode_notification(NotificationFromClient::InitializedNotification(None))?;
    let list_tools = encode_request(
        RequestFromClient::ListToolsRequest(None),
        RequestId::Integer(next_id()),
    )?;

    Ok(vec![
        HandshakeStep {
            method: "initialize",
            payload: initialize,
        },
        HandshakeStep {
            method: "notifications/initialized",
            payload: initialized,
        },
        HandshakeStep {
            method: "tools/list",
            payload: list_tools,
        },
    ])
}

/// Posts each step in order with `delay` between sends.
///
/// The first failed send aborts the sequence. `session.initialized` is only
/// set once every step has been accepted.
pub async fn run_handshake(
    transport: &dyn EventTransport,
    session: &mut Session,
    steps: Vec<HandshakeStep>,
    delay: Duration,
) -> Result<(), SearchError> {
    for (index, step) in steps.into_iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!(
            session_id = %session.session_id,
            method = step.method,
            "Sending MCP handshake step"
        );
        transport
            .post(&session.message_endpoint, step.payload)
            .await
            .map_err(|err| handshake_failure(step.method, err))?;
    }

    session.initialized = true;
    Ok(())
}

fn handshake_failure(method: &str, err: SearchError) -> SearchError {
    match err {
        SearchError::Permission { .. } => err,
        other => SearchError::connection(format!("handshake {method} failed: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::EventStream;
    use async_trait::async_trait;
    use reqwest::Url;
    use serde_json::Value;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct RecordingTransport {
        posts: Mutex<Vec<(Instant, String)>>,
        fail_on: Option<usize>,
    }

    impl RecordingTransport {
        fn new(fail_on: Option<usize>) -> Self {
            Self {
                posts: Mutex::new(Vec::new()),
                fail_on,
            }
        }
    }

    #[async_trait]
    impl EventTransport for RecordingTransport {
        fn origin(&self) -> Url {
            Url::parse("http://search.test/").unwrap()
        }

        async fn open(&self) -> Result<EventStream, SearchError> {
            Err(SearchError::connection("not used"))
        }

        async fn post(&self, _endpoint: &Url, payload: String) -> Result<(), SearchError> {
            let mut posts = self.posts.lock().unwrap();
            if self.fail_on == Some(posts.len()) {
                return Err(SearchError::connection("reset by peer"));
            }
            posts.push((Instant::now(), payload));
            Ok(())
        }
    }

    fn session() -> Session {
        Session::from_endpoint(
            &Url::parse("http://search.test/").unwrap(),
            "/messages?sessionId=abc",
        )
        .unwrap()
    }

    fn config() -> ClientConfig {
        ClientConfig::new(Url::parse("http://search.test/sse").unwrap())
    }

    #[test]
    fn steps_are_ordered_with_integer_ids() {
        let mut ids = 0;
        let steps = handshake_steps(&config(), || {
            ids += 1;
            ids
        })
        .unwrap();

        let methods: Vec<&str> = steps.iter().map(|step| step.method).collect();
        assert_eq!(
            methods,
            vec!["initialize", "notifications/initialized", "tools/list"]
        );

        let initialize: Value = serde_json::from_str(&steps[0].payload).unwrap();
        assert_eq!(initialize["method"], "initialize");
        assert_eq!(initialize["id"], 1);
        assert_eq!(initialize["params"]["clientInfo"]["name"], "mcp-search");

        let initialized: Value = serde_json::from_str(&steps[1].payload).unwrap();
        assert_eq!(initialized["method"], "notifications/initialized");
        assert!(initialized.get("id").is_none());

        let list_tools: Value = serde_json::from_str(&steps[2].payload).unwrap();
        assert_eq!(list_tools["method"], "tools/list");
        assert_eq!(list_tools["id"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn steps_are_spaced_by_the_handshake_delay() {
        let transport = RecordingTransport::new(None);
        let mut session = session();
        let steps = handshake_steps(&config(), || 1).unwrap();

        run_handshake(&transport, &mut session, steps, Duration::from_millis(50))
            .await
            .unwrap();

        assert!(session.initialized);
        let posts = transport.posts.lock().unwrap();
        assert_eq!(posts.len(), 3);
        assert!(posts[1].0 - posts[0].0 >= Duration::from_millis(50));
        assert!(posts[2].0 - posts[1].0 >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_step_aborts_the_sequence() {
        let transport = RecordingTransport::new(Some(1));
        let mut session = session();
        let steps = handshake_steps(&config(), || 1).unwrap();

        let err = run_handshake(&transport, &mut session, steps, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(!session.initialized);
        assert_eq!(transport.posts.lock().unwrap().len(), 1);
        assert!(err
            .to_string()
            .contains("handshake notifications/initialized failed"));
    }
}
