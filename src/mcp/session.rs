use super::error::SearchError;
use reqwest::Url;

const SESSION_ID_PARAM: &str = "sessionId=";

/// Server-assigned session discovered from the `endpoint` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub message_endpoint: Url,
    pub initialized: bool,
}

impl Session {
    /// Builds a session from the `data` of an `endpoint` frame.
    ///
    /// The data is a path joined onto the stream's origin; the session id is
    /// read from its `sessionId=` query parameter.
    pub fn from_endpoint(origin: &Url, data: &str) -> Result<Self, SearchError> {
        let path = data.trim();
        if path.is_empty() {
            return Err(SearchError::protocol("endpoint frame carried no data"));
        }

        let session_id = extract_session_id(path).ok_or_else(|| {
            SearchError::protocol(format!("endpoint frame is missing sessionId: {path}"))
        })?;
        let message_endpoint = origin
            .join(path)
            .map_err(|err| SearchError::protocol(format!("invalid endpoint {path}: {err}")))?;

        Ok(Self {
            session_id,
            message_endpoint,
            initialized: false,
        })
    }
}

/// Reduces a URL to its scheme, host and port.
pub fn origin_of(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

fn extract_session_id(path: &str) -> Option<String> {
    let start = path.find(SESSION_ID_PARAM)? + SESSION_ID_PARAM.len();
    let rest = &path[start..];
    let end = rest.find(['&', '#']).unwrap_or(rest.len());
    let session_id = &rest[..end];
    if session_id.is_empty() {
        None
    } else {
        Some(session_id.to_string())
    }
}
