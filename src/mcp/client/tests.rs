use super::*;
use crate::core::token_store::MemoryTokenStore;
use crate::mcp::classify::find_permission_marker;
use crate::mcp::transport::EventStream;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::{stream, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::mpsc;

type Chunk = Result<Vec<u8>, String>;
type Responder = Box<dyn Fn(&Value) -> Option<String> + Send + Sync>;

const ENDPOINT_FRAME: &str = "event: endpoint\ndata: /messages?sessionId=abc\n\n";

/// In-memory MCP server: every `open` yields a fresh stream that starts with
/// an endpoint frame, and every POST is recorded and optionally answered on
/// the newest stream.
struct FakeServer {
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
    failing_pings: AtomicUsize,
    posts: std::sync::Mutex<Vec<Value>>,
    streams: std::sync::Mutex<Vec<mpsc::UnboundedSender<Chunk>>>,
    responder: Responder,
}

impl FakeServer {
    fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicUsize::new(0),
            failing_opens: AtomicUsize::new(0),
            failing_pings: AtomicUsize::new(0),
            posts: std::sync::Mutex::new(Vec::new()),
            streams: std::sync::Mutex::new(Vec::new()),
            responder,
        })
    }

    /// Answers every search with `result for <query>` under the request id.
    fn echo() -> Arc<Self> {
        Self::new(Box::new(|message| {
            if message["method"] != "tools/call" {
                return None;
            }
            let query = message["params"]["arguments"]["query"]
                .as_str()
                .unwrap_or_default();
            Some(tool_result(&message["id"], &format!("result for {query}"), false))
        }))
    }

    /// Never answers; tests push frames by hand.
    fn manual() -> Arc<Self> {
        Self::new(Box::new(|_| None))
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn posts(&self) -> Vec<Value> {
        self.posts.lock().unwrap().clone()
    }

    fn methods(&self) -> Vec<String> {
        self.posts()
            .iter()
            .filter_map(|post| post["method"].as_str().map(str::to_string))
            .collect()
    }

    fn dispatched_queries(&self) -> Vec<String> {
        self.posts()
            .iter()
            .filter(|post| post["method"] == "tools/call")
            .filter_map(|post| {
                post["params"]["arguments"]["query"]
                    .as_str()
                    .map(str::to_string)
            })
            .collect()
    }

    fn push_data(&self, data: &str) {
        let streams = self.streams.lock().unwrap();
        let tx = streams.last().expect("a stream should be open");
        let _ = tx.send(Ok(format!("event: message\ndata: {data}\n\n").into_bytes()));
    }

    fn push_raw(&self, bytes: &[u8]) {
        let streams = self.streams.lock().unwrap();
        let tx = streams.last().expect("a stream should be open");
        let _ = tx.send(Ok(bytes.to_vec()));
    }

    fn close_stream(&self) {
        self.streams.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventTransport for FakeServer {
    fn origin(&self) -> Url {
        Url::parse("http://search.test/").unwrap()
    }

    async fn open(&self) -> Result<EventStream, SearchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.failing_opens.load(Ordering::SeqCst) > 0 {
            self.failing_opens.fetch_sub(1, Ordering::SeqCst);
            return Err(SearchError::connection("connection refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel::<Chunk>();
        let _ = tx.send(Ok(ENDPOINT_FRAME.as_bytes().to_vec()));
        self.streams.lock().unwrap().push(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed())
    }

    async fn post(&self, endpoint: &Url, payload: String) -> Result<(), SearchError> {
        assert_eq!(endpoint.as_str(), "http://search.test/messages?sessionId=abc");
        let message: Value = serde_json::from_str(&payload).expect("payload should be JSON");
        if message["method"] == "ping" && self.failing_pings.load(Ordering::SeqCst) > 0 {
            self.failing_pings.fetch_sub(1, Ordering::SeqCst);
            return Err(SearchError::connection("ping refused"));
        }

        self.posts.lock().unwrap().push(message.clone());
        if let Some(data) = (self.responder)(&message) {
            self.push_data(&data);
        }
        Ok(())
    }
}

fn tool_result(id: &Value, text: &str, is_error: bool) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "content": [{"type": "text", "text": text}],
            "isError": is_error
        }
    })
    .to_string()
}

fn test_config() -> ClientConfig {
    ClientConfig::new(Url::parse("http://search.test/sse").unwrap())
}

fn client_with(server: &Arc<FakeServer>, config: ClientConfig) -> SearchClient {
    SearchClient::new(
        config,
        Arc::clone(server) as Arc<dyn EventTransport>,
        Arc::new(MemoryTokenStore::with_token("mcp-search", "secret")),
    )
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached");
}

#[tokio::test(start_paused = true)]
async fn concurrent_searches_share_one_handshake_and_keep_fifo_order() {
    let server = FakeServer::echo();
    let client = client_with(&server, test_config());
    let queries: Vec<String> = (0..5).map(|index| format!("q{index}")).collect();

    let results = join_all(
        queries
            .iter()
            .map(|query| client.search(query, SearchOptions::default())),
    )
    .await;

    for (query, result) in queries.iter().zip(results) {
        assert_eq!(result.unwrap(), format!("result for {query}"));
    }
    assert_eq!(server.opens(), 1);
    let methods = server.methods();
    assert_eq!(
        &methods[..3],
        ["initialize", "notifications/initialized", "tools/list"]
    );
    assert_eq!(
        methods.iter().filter(|method| *method == "initialize").count(),
        1
    );
    assert_eq!(server.dispatched_queries(), queries);
    assert_eq!(client.get_connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn second_search_waits_for_the_first_to_settle() {
    let server = FakeServer::manual();
    let client = Arc::new(client_with(&server, test_config()));

    let foo = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("foo", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 1).await;
    let bar = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("bar", SearchOptions::default()).await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(server.dispatched_queries(), vec!["foo"]);

    server.push_data(&tool_result(&json!("search-1"), "foo hits", false));
    assert_eq!(foo.await.unwrap().unwrap(), "foo hits");

    wait_until(|| server.dispatched_queries().len() == 2).await;
    server.push_data(&tool_result(&json!("search-2"), "bar hits", false));
    assert_eq!(bar.await.unwrap().unwrap(), "bar hits");

    assert_eq!(server.dispatched_queries(), vec!["foo", "bar"]);
    assert_eq!(server.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn permission_errors_fail_only_the_request() {
    let server = FakeServer::new(Box::new(|message| {
        (message["method"] == "tools/call").then(|| {
            tool_result(
                &message["id"],
                "permission_denied: search is disabled for this key",
                true,
            )
        })
    }));
    let client = client_with(&server, test_config());

    let err = client
        .search("foo", SearchOptions::default())
        .await
        .unwrap_err();

    let marker = find_permission_marker("permission_denied").unwrap();
    assert!(err.is_permission());
    assert!(err.to_string().contains(marker.explanation));
    assert_eq!(client.get_connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn rpc_errors_surface_as_protocol_errors() {
    let server = FakeServer::new(Box::new(|message| {
        (message["method"] == "tools/call").then(|| {
            json!({
                "jsonrpc": "2.0",
                "id": message["id"],
                "error": {"code": -32602, "message": "Unknown tool: search"}
            })
            .to_string()
        })
    }));
    let client = client_with(&server, test_config());

    let err = client
        .search("foo", SearchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SearchError::Protocol {
            code: Some(-32602),
            message: "Unknown tool: search".to_string()
        }
    );
    assert_eq!(client.get_connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_fail_the_current_request() {
    let server = FakeServer::manual();
    let client = Arc::new(client_with(&server, test_config()));

    let search = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("foo", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 1).await;
    server.push_data("{not json");

    let err = search.await.unwrap().unwrap_err();
    assert!(matches!(err, SearchError::Protocol { code: None, .. }));
    assert_eq!(client.get_connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn invalid_utf8_fails_the_current_request() {
    let server = FakeServer::manual();
    let client = Arc::new(client_with(&server, test_config()));

    let search = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("foo", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 1).await;
    server.push_raw(b"event: message\ndata: {\"text\": \"caf\xe9\"}\n\n");

    let err = search.await.unwrap().unwrap_err();
    assert!(matches!(err, SearchError::Protocol { code: None, .. }));
    assert_eq!(client.get_connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn responses_for_failed_requests_do_not_settle_the_next_one() {
    let server = FakeServer::manual();
    let client = Arc::new(client_with(&server, test_config()));

    let foo = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("foo", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 1).await;
    server.push_data("{not json");
    assert!(foo.await.unwrap().is_err());

    let bar = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("bar", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 2).await;

    server.push_data(&tool_result(&json!("search-1"), "foo hits", false));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!bar.is_finished());

    server.push_data(&tool_result(&json!("search-2"), "bar hits", false));
    assert_eq!(bar.await.unwrap().unwrap(), "bar hits");
}

#[tokio::test(start_paused = true)]
async fn late_responses_stay_ignored_after_many_timeouts() {
    let server = FakeServer::manual();
    let mut config = test_config();
    config.request_timeout = Duration::from_secs(5);
    let client = Arc::new(client_with(&server, config));

    let queries: Vec<String> = (0..65).map(|index| format!("slow{index}")).collect();
    let results = join_all(
        queries
            .iter()
            .map(|query| client.search(query, SearchOptions::default())),
    )
    .await;
    assert!(results.iter().all(|result| result
        .as_ref()
        .is_err_and(|err| err.is_timeout())));

    let live = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("live", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().iter().any(|query| query == "live")).await;

    server.push_data(&tool_result(&json!("search-1"), "stale slow0", false));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!live.is_finished());

    server.push_data(&tool_result(&json!("search-66"), "live hits", false));
    assert_eq!(live.await.unwrap().unwrap(), "live hits");
}

#[tokio::test(start_paused = true)]
async fn late_responses_for_timed_out_requests_are_ignored() {
    let server = FakeServer::manual();
    let mut config = test_config();
    config.request_timeout = Duration::from_secs(5);
    let client = Arc::new(client_with(&server, config));

    let err = client
        .search("slow", SearchOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    let fast = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("fast", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 2).await;

    server.push_data(&tool_result(&json!("search-1"), "stale", false));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!fast.is_finished());

    server.push_data(&tool_result(&json!("search-2"), "fresh", false));
    assert_eq!(fast.await.unwrap().unwrap(), "fresh");
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_reject_everything_with_a_terminal_error() {
    let server = FakeServer::echo();
    server.failing_opens.store(usize::MAX, Ordering::SeqCst);
    let client = client_with(&server, test_config());
    let started = Instant::now();

    let results = join_all(
        ["a", "b", "c", "d", "e"]
            .iter()
            .map(|query| client.search(query, SearchOptions::default())),
    )
    .await;

    for result in &results[..3] {
        assert_eq!(
            result.as_ref().unwrap_err(),
            &SearchError::connection("connection refused")
        );
    }
    for result in &results[3..] {
        assert!(result.as_ref().unwrap_err().is_terminal());
    }
    // Initial attempt plus three reconnects spaced 1s, 2s and 4s apart.
    assert_eq!(server.opens(), 4);
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(client.get_connection_state(), ConnectionState::Error);

    let err = client
        .search("f", SearchOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_terminal());
    assert_eq!(server.opens(), 4);

    client.disconnect().await;
    assert_eq!(client.get_connection_state(), ConnectionState::Error);
    let err = client
        .search("f", SearchOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_terminal());
    assert_eq!(server.opens(), 4);

    server.failing_opens.store(0, Ordering::SeqCst);
    client.connect().await.unwrap();
    assert_eq!(client.get_connection_state(), ConnectionState::Connected);
    assert_eq!(
        client.search("g", SearchOptions::default()).await.unwrap(),
        "result for g"
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_succeeds_after_a_transient_failure() {
    let server = FakeServer::echo();
    server.failing_opens.store(1, Ordering::SeqCst);
    let client = client_with(&server, test_config());

    let first = client.search("a", SearchOptions::default()).await;
    assert_eq!(first.unwrap_err(), SearchError::connection("connection refused"));

    let second = client.search("b", SearchOptions::default()).await;
    assert_eq!(second.unwrap(), "result for b");
    assert_eq!(server.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn disconnect_rejects_outstanding_requests_and_is_idempotent() {
    let server = FakeServer::manual();
    let client = Arc::new(client_with(&server, test_config()));

    let searches: Vec<_> = ["foo", "bar"]
        .into_iter()
        .map(|query| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.search(query, SearchOptions::default()).await })
        })
        .collect();
    wait_until(|| server.dispatched_queries().len() == 1).await;

    client.disconnect().await;
    for search in searches {
        assert_eq!(
            search.await.unwrap().unwrap_err(),
            SearchError::connection_closed()
        );
    }
    assert_eq!(client.get_connection_state(), ConnectionState::Disconnected);

    client.disconnect().await;
    assert_eq!(client.get_connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_failure_schedules_a_reconnect() {
    let server = FakeServer::echo();
    server.failing_pings.store(1, Ordering::SeqCst);
    let client = client_with(&server, test_config());
    client.connect().await.unwrap();
    let mut states = client.watch_state();

    tokio::time::sleep(Duration::from_secs(30)).await;
    states
        .wait_for(|state| *state == ConnectionState::Error)
        .await
        .unwrap();
    states
        .wait_for(|state| *state == ConnectionState::Connected)
        .await
        .unwrap();

    assert_eq!(server.opens(), 2);
    assert_eq!(
        client.search("after", SearchOptions::default()).await.unwrap(),
        "result for after"
    );
}

#[tokio::test(start_paused = true)]
async fn heartbeat_failure_resends_the_in_flight_search() {
    let server = FakeServer::manual();
    server.failing_pings.store(1, Ordering::SeqCst);
    let client = Arc::new(client_with(&server, test_config()));
    let started = Instant::now();

    let search = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("foo", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 1).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    wait_until(|| server.dispatched_queries().len() == 2).await;
    assert_eq!(server.opens(), 2);
    assert_eq!(server.dispatched_queries(), vec!["foo", "foo"]);
    assert!(!search.is_finished());

    server.push_data(&tool_result(&json!("search-1"), "foo hits", false));
    assert_eq!(search.await.unwrap().unwrap(), "foo hits");
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(client.get_connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_while_connected() {
    let server = FakeServer::echo();
    let client = client_with(&server, test_config());
    client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;

    let pings = server
        .methods()
        .iter()
        .filter(|method| *method == "ping")
        .count();
    assert_eq!(pings, 2);
    assert_eq!(client.get_connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn lost_stream_fails_the_current_request_and_reconnects_lazily() {
    let server = FakeServer::manual();
    let client = Arc::new(client_with(&server, test_config()));

    let search = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("foo", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 1).await;
    server.close_stream();

    assert_eq!(
        search.await.unwrap().unwrap_err(),
        SearchError::connection("connection lost")
    );
    assert_eq!(client.get_connection_state(), ConnectionState::Disconnected);

    let retry = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("foo", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 2).await;
    assert_eq!(server.opens(), 2);
    server.push_data(&tool_result(&json!("search-2"), "foo hits", false));
    assert_eq!(retry.await.unwrap().unwrap(), "foo hits");
}

#[tokio::test(start_paused = true)]
async fn control_responses_never_settle_searches() {
    let server = FakeServer::manual();
    let client = Arc::new(client_with(&server, test_config()));

    let search = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.search("foo", SearchOptions::default()).await }
    });
    wait_until(|| server.dispatched_queries().len() == 1).await;

    server.push_data(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#);
    server.push_data(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","data":"hi"}}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!search.is_finished());

    // Responses without a usable id go to the in-flight request.
    server.push_data(&tool_result(&json!("unexpected"), "foo hits", false));
    assert_eq!(search.await.unwrap().unwrap(), "foo hits");
}

#[tokio::test(start_paused = true)]
async fn search_arguments_include_options() {
    let server = FakeServer::echo();
    let client = client_with(&server, test_config());

    client
        .search("rust", SearchOptions::with_max_results(3))
        .await
        .unwrap();

    let call = server
        .posts()
        .into_iter()
        .find(|post| post["method"] == "tools/call")
        .unwrap();
    assert_eq!(call["id"], "search-1");
    assert_eq!(call["params"]["name"], "search");
    assert_eq!(
        call["params"]["arguments"],
        json!({"query": "rust", "max_results": 3})
    );
}

#[test]
fn status_reports_credentials_and_state() {
    let server = FakeServer::manual();
    let client = client_with(&server, test_config());

    let status = client.get_status();
    assert_eq!(status.name, "mcp-search");
    assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
    assert!(status.enabled);
    assert_eq!(status.connection_state, ConnectionState::Disconnected);
    assert_eq!(
        serde_json::to_value(&status).unwrap()["connection_state"],
        "disconnected"
    );

    let anonymous = SearchClient::new(
        test_config(),
        server as Arc<dyn EventTransport>,
        Arc::new(MemoryTokenStore::default()),
    );
    assert!(!anonymous.is_enabled());
}

#[test]
fn connection_state_display_is_lowercase() {
    assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    assert_eq!(ConnectionState::Connected.to_string(), "connected");
    assert_eq!(ConnectionState::Error.to_string(), "error");
}
