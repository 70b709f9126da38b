use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Failures surfaced to search callers.
///
/// Request-scoped variants (`Timeout`, `Protocol`, `Permission`, `Failed`)
/// leave the connection usable. `Connection` and `Terminal` describe the
/// shared transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// Transport or handshake failure, including an orderly disconnect.
    Connection(String),
    /// A connect or request deadline elapsed.
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    /// Malformed frame or a JSON-RPC error object.
    Protocol { code: Option<i64>, message: String },
    /// The backend denied the capability.
    Permission {
        marker: &'static str,
        explanation: &'static str,
        detail: String,
    },
    /// Reconnect attempts are exhausted.
    Terminal { attempts: u32, last_error: String },
    /// Backend reported a failure that matched no classification.
    Failed(String),
}

impl SearchError {
    pub fn connection(message: impl Into<String>) -> Self {
        SearchError::Connection(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        SearchError::Protocol {
            code: None,
            message: message.into(),
        }
    }

    pub fn connection_closed() -> Self {
        SearchError::Connection("connection closed".to_string())
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, SearchError::Permission { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SearchError::Timeout { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchError::Terminal { .. })
    }

    /// True when the failure only concerns one request.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            SearchError::Timeout { .. }
                | SearchError::Protocol { .. }
                | SearchError::Permission { .. }
                | SearchError::Failed(_)
        )
    }
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::Connection(message) => write!(f, "MCP connection error: {message}"),
            SearchError::Timeout { operation, after } => {
                write!(f, "MCP {operation} timed out after {}ms", after.as_millis())
            }
            SearchError::Protocol {
                code: Some(code),
                message,
            } => write!(f, "MCP protocol error {code}: {message}"),
            SearchError::Protocol { code: None, message } => {
                write!(f, "MCP protocol error: {message}")
            }
            SearchError::Permission {
                explanation, detail, ..
            } => {
                if detail.is_empty() {
                    write!(f, "MCP permission error: {explanation}")
                } else {
                    write!(f, "MCP permission error: {explanation} ({detail})")
                }
            }
            SearchError::Terminal {
                attempts,
                last_error,
            } => write!(
                f,
                "MCP connection gave up after {attempts} reconnect attempts: {last_error}"
            ),
            SearchError::Failed(message) => write!(f, "MCP search failed: {message}"),
        }
    }
}

impl StdError for SearchError {}
