//! Per-endpoint serialized HTTP sessions.
//!
//! Sessions are cached by `(endpoint, legacy_tls)` and every request holds
//! that endpoint's mutex for its full duration: two callers targeting the
//! same endpoint are serialized, callers targeting different endpoints run
//! in parallel. The serialization is what keeps fragile management
//! controllers from being overwhelmed; there is deliberately no rate
//! limiter or circuit breaker on top, and overall backpressure comes from
//! the dispatcher's bounded worker pool.

pub mod legacy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use legacy::build_client;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    endpoint: String,
    legacy_tls: bool,
}

struct Session {
    client: reqwest::Client,
    serial: Mutex<()>,
}

/// Request body variants the remote endpoints need.
#[derive(Debug, Clone)]
pub enum RequestBody {
    None,
    Json(Value),
    /// Multipart file upload (firmware packages).
    Multipart {
        field: String,
        file_name: String,
        bytes: Vec<u8>,
    },
}

/// A request routed through the session cache.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub method: Method,
    pub url: String,
    /// Cache/serialization key, typically the remote IP.
    pub endpoint: String,
    pub legacy_tls: bool,
    pub basic_auth: Option<(String, String)>,
    pub bearer: Option<String>,
    /// Extra headers (protocol-specific auth and the like).
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// Overrides the default read timeout for long-running remote work.
    pub timeout: Option<Duration>,
}

impl RemoteRequest {
    pub fn new(method: Method, endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            endpoint: endpoint.into(),
            legacy_tls: false,
            basic_auth: None,
            bearer: None,
            headers: Vec::new(),
            body: RequestBody::None,
            timeout: None,
        }
    }

    pub fn get(endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint, url)
    }

    pub fn post(endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint, url)
    }

    pub fn patch(endpoint: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, endpoint, url)
    }

    pub fn legacy_tls(mut self, enabled: bool) -> Self {
        self.legacy_tls = enabled;
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((username.into(), password.into()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, field: &str, file_name: &str, bytes: Vec<u8>) -> Self {
        self.body = RequestBody::Multipart {
            field: field.to_string(),
            file_name: file_name.to_string(),
            bytes,
        };
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Response captured for the caller and the audit log.
#[derive(Debug, Clone)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: String,
    pub elapsed_ms: u64,
    /// `Location` header, when the remote queued asynchronous work.
    pub location: Option<String>,
}

impl RemoteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).context("remote response was not the expected JSON")
    }
}

/// Cache of per-endpoint HTTP sessions with per-endpoint serialization.
pub struct SessionManager {
    verify_tls: bool,
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(verify_tls: bool) -> Self {
        Self {
            verify_tls,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the session for an endpoint. The map lock is held
    /// only for the lookup/insert, never across a request.
    async fn session(&self, endpoint: &str, legacy_tls: bool) -> Result<Arc<Session>> {
        let key = SessionKey {
            endpoint: endpoint.to_string(),
            legacy_tls,
        };
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(session.clone());
        }
        let session = Arc::new(Session {
            client: build_client(legacy_tls, self.verify_tls)?,
            serial: Mutex::new(()),
        });
        sessions.insert(key, session.clone());
        Ok(session)
    }

    /// Issue a request, holding the endpoint's mutex for the duration.
    pub async fn request(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        let session = self.session(&request.endpoint, request.legacy_tls).await?;
        let _serial = session.serial.lock().await;

        let mut builder = session.client.request(request.method, &request.url);
        builder = builder.header("Accept", "application/json");
        if let Some((username, password)) = &request.basic_auth {
            builder = builder.basic_auth(username, Some(password));
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        match request.body {
            RequestBody::None => {}
            RequestBody::Json(body) => builder = builder.json(&body),
            RequestBody::Multipart {
                field,
                file_name,
                bytes,
            } => {
                let part = reqwest::multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str("application/octet-stream")
                    .context("invalid multipart mime")?;
                builder = builder.multipart(reqwest::multipart::Form::new().part(field, part));
            }
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let started = Instant::now();
        let response = builder.send().await.context("remote request failed")?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.text().await.unwrap_or_default();

        Ok(RemoteResponse {
            status,
            body,
            elapsed_ms: started.elapsed().as_millis() as u64,
            location,
        })
    }

    /// Drop cached sessions for an endpoint (both TLS variants).
    pub async fn close(&self, endpoint: &str) {
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|key, _| key.endpoint != endpoint);
    }

    /// Drop every cached session.
    pub async fn close_all(&self) {
        self.sessions.lock().await.clear();
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP server: answers every request with 200 after `delay`.
    async fn slow_server(delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut seen = Vec::new();
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) => return,
                            Ok(n) => {
                                seen.extend_from_slice(&buf[..n]);
                                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    tokio::time::sleep(delay).await;
                    let body = b"{\"ok\":true}";
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_same_endpoint_requests_serialize() {
        let delay = Duration::from_millis(150);
        let addr = slow_server(delay).await;
        let manager = Arc::new(SessionManager::new(false));

        let url = format!("http://{addr}/status");
        let started = Instant::now();
        let (a, b) = tokio::join!(
            manager.request(RemoteRequest::get("device-a", &url)),
            manager.request(RemoteRequest::get("device-a", &url)),
        );
        let elapsed = started.elapsed();

        assert_eq!(a.unwrap().status, 200);
        assert_eq!(b.unwrap().status, 200);
        // Two requests behind one endpoint mutex cannot overlap.
        assert!(
            elapsed >= delay * 2,
            "same-endpoint requests overlapped: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_different_endpoints_run_in_parallel() {
        let delay = Duration::from_millis(150);
        let addr = slow_server(delay).await;
        let manager = Arc::new(SessionManager::new(false));

        let url = format!("http://{addr}/status");
        let started = Instant::now();
        let (a, b) = tokio::join!(
            manager.request(RemoteRequest::get("device-a", &url)),
            manager.request(RemoteRequest::get("device-b", &url)),
        );
        let elapsed = started.elapsed();

        assert!(a.unwrap().is_success());
        assert!(b.unwrap().is_success());
        assert!(
            elapsed < delay * 2,
            "different-endpoint requests serialized: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_sessions_cached_per_endpoint_and_variant() {
        let addr = slow_server(Duration::ZERO).await;
        let manager = SessionManager::new(false);
        let url = format!("http://{addr}/");

        manager.request(RemoteRequest::get("a", &url)).await.unwrap();
        manager.request(RemoteRequest::get("a", &url)).await.unwrap();
        assert_eq!(manager.session_count().await, 1);

        manager.request(RemoteRequest::get("b", &url)).await.unwrap();
        assert_eq!(manager.session_count().await, 2);

        manager.close("a").await;
        assert_eq!(manager.session_count().await, 1);
        manager.close_all().await;
        assert_eq!(manager.session_count().await, 0);
    }
}
