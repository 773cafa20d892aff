//! JSON-RPC over HTTP server-sent events.
//!
//! The client opens a long-lived `GET` stream. The server's first `endpoint`
//! event names the URL requests are POSTed to; responses come back as
//! `message` events on the stream.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use reqwest::Url;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::SseConnection;
use super::errors::McpError;
use super::transport::{
    next_request_id, reply_to_server_request, IncomingMessage, PendingRequests, Transport,
};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Event Parsing ───────────────────────────────────────────────────────────

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the server sent no `event:` field.
    pub event: String,
    pub data: String,
}

/// Parse one event block (the text between blank lines).
///
/// Multiple `data:` lines are joined with `\n`. Returns `None` for
/// keep-alives and comment-only blocks.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

/// Splits a byte stream into events, bounding each read.
pub struct SseEventReader<S> {
    server_name: String,
    stream: S,
    buffer: Vec<u8>,
    read_timeout: Duration,
}

impl<S, B, E> SseEventReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    pub fn new(server_name: &str, stream: S, read_timeout: Duration) -> Self {
        Self {
            server_name: server_name.to_string(),
            stream,
            buffer: Vec::new(),
            read_timeout,
        }
    }

    /// Next complete event, or `Ok(None)` once the stream ends.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>, McpError> {
        loop {
            if let Some(end) = find_boundary(&self.buffer) {
                let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
                let text = String::from_utf8_lossy(&block[..end]);
                match parse_event(&text) {
                    Some(event) => return Ok(Some(event)),
                    None => continue, // keep-alive
                }
            }

            let next = tokio::time::timeout(self.read_timeout, self.stream.next())
                .await
                .map_err(|_| McpError::Transport {
                    server: self.server_name.clone(),
                    reason: format!(
                        "no data on event stream for {}ms",
                        self.read_timeout.as_millis()
                    ),
                })?;

            match next {
                Some(Ok(chunk)) => {
                    // CRLF framing is normalised to LF.
                    self.buffer
                        .extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));
                }
                Some(Err(e)) => {
                    return Err(McpError::Transport {
                        server: self.server_name.clone(),
                        reason: format!("stream read error: {e}"),
                    });
                }
                None => {
                    let rest = std::mem::take(&mut self.buffer);
                    let text = String::from_utf8_lossy(&rest);
                    return Ok(parse_event(text.trim_end_matches('\n')));
                }
            }
        }
    }
}

fn find_boundary(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

/// Resolve the `endpoint` event payload against the stream URL.
///
/// The POST target must share the stream's origin.
pub fn resolve_endpoint(base: &Url, data: &str) -> Result<Url, String> {
    let endpoint = base
        .join(data.trim())
        .map_err(|e| format!("invalid endpoint '{}': {e}", data.trim()))?;
    if endpoint.origin() != base.origin() {
        return Err(format!(
            "endpoint origin does not match connection origin: {endpoint}"
        ));
    }
    Ok(endpoint)
}

fn build_headers(server: &str, headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::Config {
            reason: format!("server '{server}': invalid header name '{name}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| McpError::Config {
            reason: format!("server '{server}': invalid value for header '{name}': {e}"),
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

// ─── Poster ──────────────────────────────────────────────────────────────────

/// POSTs JSON-RPC messages to the session endpoint.
#[derive(Clone)]
struct Poster {
    server_name: String,
    http: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
    timeout: Duration,
}

impl Poster {
    async fn post<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let send = self
            .http
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(message)
            .send();

        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| McpError::Timeout {
                operation: format!("POST to server '{}'", self.server_name),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
            .map_err(|e| self.error(format!("POST failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.error(format!("POST returned HTTP {status}")));
        }
        Ok(())
    }

    fn error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason,
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// JSON-RPC transport over an SSE stream plus per-request POSTs.
pub struct SseTransport {
    poster: Poster,
    pending: PendingRequests,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Open the event stream and wait for the session endpoint.
    ///
    /// Both the initial response and the `endpoint` event must arrive within
    /// the descriptor's HTTP timeout.
    pub async fn connect(
        name: &str,
        config: &SseConnection,
        cancel: &CancellationToken,
    ) -> Result<Self, McpError> {
        let base = Url::parse(&config.url).map_err(|e| McpError::Config {
            reason: format!("server '{name}': invalid url '{}': {e}", config.url),
        })?;
        let headers = build_headers(name, &config.headers)?;
        let http_timeout = config.http_timeout();

        let http = reqwest::Client::builder()
            .connect_timeout(http_timeout)
            .build()
            .map_err(|e| McpError::ConnectionFailed {
                server: name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let open = async {
            let response = http
                .get(base.clone())
                .headers(headers.clone())
                .header(ACCEPT, "text/event-stream")
                .send()
                .await
                .map_err(|e| McpError::ConnectionFailed {
                    server: name.to_string(),
                    reason: format!("GET {base} failed: {e}"),
                })?;
            let status = response.status();
            if !status.is_success() {
                return Err(McpError::ConnectionFailed {
                    server: name.to_string(),
                    reason: format!("GET {base} returned HTTP {status}"),
                });
            }

            let mut events =
                SseEventReader::new(name, response.bytes_stream().boxed(), config.read_timeout());
            let endpoint = wait_for_endpoint(name, &base, &mut events).await?;
            Ok::<_, McpError>((events, endpoint))
        };

        // Dropping `open` on timeout or cancellation closes the socket.
        let (events, endpoint) = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(McpError::Cancelled { server: name.to_string() });
            }
            opened = tokio::time::timeout(http_timeout, open) => {
                opened.map_err(|_| McpError::ConnectionTimeout {
                    server: name.to_string(),
                    timeout_ms: http_timeout.as_millis() as u64,
                })??
            }
        };

        tracing::debug!(server = name, endpoint = %endpoint, "sse session established");

        let poster = Poster {
            server_name: name.to_string(),
            http,
            endpoint,
            headers,
            timeout: http_timeout,
        };
        let pending = PendingRequests::new(name);
        let reader = tokio::spawn(read_loop(events, pending.clone(), poster.clone()));

        Ok(Self {
            poster,
            pending,
            reader: Mutex::new(Some(reader)),
        })
    }
}

async fn wait_for_endpoint<S, B, E>(
    name: &str,
    base: &Url,
    events: &mut SseEventReader<S>,
) -> Result<Url, McpError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    loop {
        match events.next_event().await? {
            Some(event) if event.event == "endpoint" => {
                return resolve_endpoint(base, &event.data).map_err(|reason| {
                    McpError::ConnectionFailed {
                        server: name.to_string(),
                        reason,
                    }
                });
            }
            Some(event) => {
                tracing::debug!(server = name, event = %event.event, "ignoring event before endpoint");
            }
            None => {
                return Err(McpError::ConnectionFailed {
                    server: name.to_string(),
                    reason: "event stream ended before endpoint was announced".into(),
                });
            }
        }
    }
}

async fn read_loop<S, B, E>(mut events: SseEventReader<S>, pending: PendingRequests, poster: Poster)
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let server = poster.server_name.clone();
    loop {
        let event = match events.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::debug!(server = %server, "event stream ended");
                pending.close("event stream ended");
                return;
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "event stream failed");
                pending.close(&e.to_string());
                return;
            }
        };

        if event.event != "message" {
            tracing::debug!(server = %server, event = %event.event, "ignoring event");
            continue;
        }

        match IncomingMessage::parse(&event.data) {
            Some(IncomingMessage::Response(resp)) => {
                if !pending.complete(resp) {
                    tracing::debug!(server = %server, "dropping response with no waiter");
                }
            }
            Some(IncomingMessage::Notification { method }) => {
                tracing::debug!(server = %server, method = %method, "server notification");
            }
            Some(IncomingMessage::Request { id, method }) => {
                let reply = reply_to_server_request(id, &method);
                let poster = poster.clone();
                tokio::spawn(async move {
                    if let Err(e) = poster.post(&reply).await {
                        tracing::warn!(server = %poster.server_name, method = %method, error = %e, "failed to answer server request");
                    }
                });
            }
            None => {
                tracing::debug!(server = %server, data = %event.data, "ignoring malformed message event");
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let guard = self.pending.register(id)?;
        self.poster.post(&JsonRpcRequest::new(id, method, params)).await?;
        guard.wait().await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.poster.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.pending.close("connection closed");
        let reader = match self.reader.lock() {
            Ok(mut reader) => reader.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(reader) = reader {
            reader.abort();
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], String>> + Unpin {
        futures::stream::iter(parts.iter().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    #[test]
    fn test_parse_event_fields() {
        let ev = parse_event("event: endpoint\ndata: /messages?session=1").unwrap();
        assert_eq!(ev.event, "endpoint");
        assert_eq!(ev.data, "/messages?session=1");

        let ev = parse_event("data: {\"a\":\ndata: 1}").unwrap();
        assert_eq!(ev.event, "message");
        assert_eq!(ev.data, "{\"a\":\n1}");

        assert!(parse_event(": keep-alive").is_none());
    }

    #[tokio::test]
    async fn test_reader_handles_split_chunks_and_crlf() {
        let stream = chunks(&[
            "event: endpoint\r\nda",
            "ta: /msg\r\n\r\n: ping\n\n",
            "data: {\"x\":1}\n\n",
            "data: tail",
        ]);
        let mut reader = SseEventReader::new("s", stream, Duration::from_secs(1));

        let first = reader.next_event().await.unwrap().unwrap();
        assert_eq!((first.event.as_str(), first.data.as_str()), ("endpoint", "/msg"));
        let second = reader.next_event().await.unwrap().unwrap();
        assert_eq!(second.data, "{\"x\":1}");
        let tail = reader.next_event().await.unwrap().unwrap();
        assert_eq!(tail.data, "tail");
        assert!(reader.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_times_out_on_silence() {
        let stream = futures::stream::pending::<Result<&'static [u8], String>>();
        let mut reader = SseEventReader::new("quiet", stream, Duration::from_millis(20));
        let err = reader.next_event().await.unwrap_err();
        assert!(err.to_string().contains("no data on event stream"));
    }

    #[test]
    fn test_resolve_endpoint() {
        let base = Url::parse("http://localhost:8080/sse").unwrap();
        let url = resolve_endpoint(&base, "/messages?session_id=abc").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/messages?session_id=abc");

        assert!(resolve_endpoint(&base, "http://evil.example/messages").is_err());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let headers = HashMap::from([("bad header".to_string(), "v".to_string())]);
        assert!(matches!(
            build_headers("s", &headers),
            Err(McpError::Config { .. })
        ));
    }

    // ── Minimal in-process SSE server ──

    async fn read_http_request(sock: &mut TcpStream) -> (String, String) {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            if sock.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            buf.push(byte[0]);
        }
        let head = String::from_utf8_lossy(&buf).to_string();
        let length = head
            .lines()
            .find_map(|l| {
                let (k, v) = l.split_once(':')?;
                k.eq_ignore_ascii_case("content-length")
                    .then(|| v.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        sock.read_exact(&mut body).await.unwrap();
        (head, String::from_utf8_lossy(&body).to_string())
    }

    /// Serves one SSE session that echoes each request's params as its result.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream_sock, _) = listener.accept().await.unwrap();
            read_http_request(&mut stream_sock).await;
            stream_sock
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
                      event: endpoint\ndata: /messages?session=1\n\n",
                )
                .await
                .unwrap();

            loop {
                let Ok((mut post_sock, _)) = listener.accept().await else {
                    return;
                };
                let (_, body) = read_http_request(&mut post_sock).await;
                let _ = post_sock
                    .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;

                let msg: serde_json::Value = serde_json::from_str(&body).unwrap();
                if let Some(id) = msg.get("id") {
                    let reply = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": msg.get("params").cloned().unwrap_or_default(),
                    });
                    let event = format!("event: message\ndata: {reply}\n\n");
                    if stream_sock.write_all(event.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });

        format!("http://{addr}/sse")
    }

    #[tokio::test]
    async fn test_request_round_trip_over_sse() {
        let url = spawn_echo_server().await;
        let transport = SseTransport::connect("echo", &SseConnection::new(url), &CancellationToken::new())
            .await
            .unwrap();

        transport.notify("notifications/initialized", None).await.unwrap();
        let resp = transport
            .request("tools/call", Some(serde_json::json!({"name": "t"})))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["name"], "t");

        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_fails() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = SseConnection::new(format!("http://{addr}/sse"));
        let err = SseTransport::connect("down", &config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            McpError::ConnectionFailed { .. } | McpError::ConnectionTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            read_http_request(&mut sock).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut config = SseConnection::new(format!("http://{addr}/sse"));
        config.timeout_ms = Some(100);
        let err = SseTransport::connect("slow", &config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::ConnectionTimeout { timeout_ms: 100, .. }));
    }
}
