//! HTTP transport for decision backends.
//!
//! The production transport shells out to `curl`, the same way the rest of
//! the crate drives external tools. Request bodies go through stdin because
//! base64 screenshots are far larger than a single argv entry may be.

use serde_json::Value;
use std::collections::VecDeque;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

use super::{BackendError, BackendResult};

/// Marker separating the response body from the status code in curl output
const STATUS_MARKER: &str = "\n__droid_pilot_status__:";

/// Blocking JSON-over-HTTP POST.
pub trait HttpTransport: Send + Sync {
    fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> BackendResult<Value>;
}

/// Transport that runs one `curl` process per request.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
}

impl CurlTransport {
    pub fn new(connect_timeout: u64) -> Self {
        Self { connect_timeout }
    }
}

impl HttpTransport for CurlTransport {
    fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> BackendResult<Value> {
        let payload = serde_json::to_vec(body)?;
        debug!(url, bytes = payload.len(), "POST");

        let connect_timeout = self.connect_timeout.to_string();
        let mut cmd = Command::new("curl");
        cmd.args([
            "-s",
            "-X",
            "POST",
            url,
            "-H",
            "Content-Type: application/json",
            "--data-binary",
            "@-",
            "--connect-timeout",
            connect_timeout.as_str(),
            "-w",
        ]);
        cmd.arg(format!("{}%{{http_code}}", STATUS_MARKER));
        for (name, value) in headers {
            cmd.arg("-H").arg(format!("{}: {}", name, value));
        }

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::Transport(format!("failed to start curl: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Transport("failed to open curl stdin".to_string()))?;
        let writer = thread::spawn(move || stdin.write_all(&payload));

        let output = child.wait_with_output()?;
        writer
            .join()
            .map_err(|_| BackendError::Transport("request writer panicked".to_string()))??;

        if !output.status.success() {
            return Err(BackendError::Transport(format!(
                "curl exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let (status, body) = split_status(&String::from_utf8_lossy(&output.stdout))?;
        if !(200..300).contains(&status) {
            return Err(BackendError::Http { status, body });
        }
        serde_json::from_str(&body).map_err(|e| BackendError::InvalidResponse(format!("response is not JSON: {}", e)))
    }
}

/// Split curl stdout into status code and body.
fn split_status(stdout: &str) -> BackendResult<(u16, String)> {
    let (body, status) = stdout
        .rsplit_once(STATUS_MARKER)
        .ok_or_else(|| BackendError::Transport("curl output carried no status code".to_string()))?;
    let status = status
        .trim()
        .parse::<u16>()
        .map_err(|_| BackendError::Transport(format!("unparseable status code '{}'", status.trim())))?;
    if status == 0 {
        return Err(BackendError::Transport("connection failed".to_string()));
    }
    Ok((status, body.to_string()))
}

/// A captured request, as seen by [`ReplayTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Transport that answers from a queue of canned responses.
///
/// Used for offline replays and tests. Clones share the same queue and
/// request log, so a clone kept outside the backend can inspect traffic.
#[derive(Debug, Clone, Default)]
pub struct ReplayTransport {
    responses: Arc<Mutex<VecDeque<BackendResult<Value>>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response body.
    pub fn push(&self, response: Value) -> &Self {
        self.push_result(Ok(response))
    }

    /// Queue a transport failure.
    pub fn push_error(&self, error: BackendError) -> &Self {
        self.push_result(Err(error))
    }

    fn push_result(&self, result: BackendResult<Value>) -> &Self {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(result);
        }
        self
    }

    /// Requests sent so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl HttpTransport for ReplayTransport {
    fn post_json(&self, url: &str, headers: &[(String, String)], body: &Value) -> BackendResult<Value> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                url: url.to_string(),
                headers: headers.to_vec(),
                body: body.clone(),
            });
        }
        self.responses
            .lock()
            .map_err(|_| BackendError::Transport("replay queue poisoned".to_string()))?
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Transport("replay queue exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_status() {
        let stdout = format!("{{\"ok\":true}}{}200", STATUS_MARKER);
        let (status, body) = split_status(&stdout).unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "{\"ok\":true}");
    }

    #[test]
    fn test_split_status_connection_failure() {
        let stdout = format!("{}000", STATUS_MARKER);
        assert!(matches!(split_status(&stdout), Err(BackendError::Transport(_))));
        assert!(split_status("no marker").is_err());
    }

    #[test]
    fn test_replay_transport_order_and_log() {
        let transport = ReplayTransport::new();
        transport.push(json!({"n": 1})).push(json!({"n": 2}));
        let observer = transport.clone();

        assert_eq!(transport.post_json("u", &[], &json!({"q": 1})).unwrap(), json!({"n": 1}));
        assert_eq!(transport.post_json("u", &[], &json!({"q": 2})).unwrap(), json!({"n": 2}));
        assert!(transport.post_json("u", &[], &json!({})).is_err());

        let requests = observer.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].body, json!({"q": 2}));
        assert_eq!(observer.remaining(), 0);
    }
}
