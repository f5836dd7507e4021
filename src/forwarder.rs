use std::{fmt, time::Duration, time::Instant};

use bytes::Bytes;
use futures_util::{StreamExt, stream::BoxStream};
use reqwest::{
    Client, Method, StatusCode, Url,
    header::{
        AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, HeaderName,
        HeaderValue,
    },
};
use serde_json::{Value, json};

use crate::{
    error::PoolError,
    preview_key,
    upstream_url,
    selector::{KeySelector, SelectedKey},
    usage::{StreamTally, TokenUsage, UsageEvent, UsageRecorder},
};

const EVENT_STREAM: &str = "text/event-stream";

const BLOCKED_HEADERS: &[&str] = &[
    "forwarded",
    "via",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-forwarded-server",
    "x-original-forwarded-for",
    "x-real-ip",
    "true-client-ip",
    "cf-connecting-ip",
    "cf-ipcountry",
    "cf-ray",
    "cf-visitor",
    "x-cluster-client-ip",
    "proxy-authorization",
    "proxy-connection",
    "cdn-loop",
];

// authorization is always replaced by the pooled key; accept-encoding is dropped so
// buffered bodies stay parseable.
const ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "cache-control",
    "content-type",
    "pragma",
    "user-agent",
    "origin",
    "referer",
];

#[derive(Debug, Clone)]
struct SanitizedHeaders {
    headers: HeaderMap,
    dropped: Vec<String>,
}

/// 透传请求描述。
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<String>,
}

pub enum ProxyBody {
    Buffered(Bytes),
    Streaming(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl fmt::Debug for ProxyBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// 透传响应。
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ProxyBody,
}

impl ProxyResponse {
    /// `{error:{message}}` envelope with the given status.
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        let body = json!({ "error": { "message": message.into() } });
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Self {
            status,
            headers,
            body: ProxyBody::Buffered(Bytes::from(body.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accounting {
    Recorded,
    Skipped,
}

/// 选 key、改写请求并转发到上游；按响应类型走缓冲或流式分支。
#[derive(Debug, Clone)]
pub struct ProxyForwarder {
    client: Client,
    upstream: Url,
    upstream_origin: String,
    selector: KeySelector,
    recorder: UsageRecorder,
    models_timeout: Duration,
}

impl ProxyForwarder {
    pub fn new(
        client: Client,
        upstream: Url,
        selector: KeySelector,
        recorder: UsageRecorder,
        models_timeout: Duration,
    ) -> Self {
        let upstream_origin = origin_from_url(&upstream);
        Self {
            client,
            upstream,
            upstream_origin,
            selector,
            recorder,
            models_timeout,
        }
    }

    /// Forwards an inference call and records its usage.
    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, PoolError> {
        self.dispatch(request, Accounting::Recorded, None).await
    }

    /// Model listing: bounded by the models timeout, never written to the usage log.
    pub async fn forward_models(&self, request: ProxyRequest) -> Result<ProxyResponse, PoolError> {
        self.dispatch(request, Accounting::Skipped, Some(self.models_timeout))
            .await
    }

    async fn dispatch(
        &self,
        request: ProxyRequest,
        accounting: Accounting,
        timeout: Option<Duration>,
    ) -> Result<ProxyResponse, PoolError> {
        let started = Instant::now();
        let key = self.selector.select(None).await?;
        let payload: Option<Value> = if request.body.is_empty() {
            None
        } else {
            serde_json::from_slice(&request.body).ok()
        };
        let model = payload
            .as_ref()
            .and_then(|p| p.get("model"))
            .and_then(Value::as_str)
            .map(str::to_owned);

        let url = upstream_url(&self.upstream, &request.path, request.query.as_deref());

        let sanitized = self.sanitize_headers(&request.headers);
        if !sanitized.dropped.is_empty() {
            tracing::debug!(dropped = ?sanitized.dropped, "dropped inbound headers");
        }
        let mut builder = self.client.request(request.method.clone(), url);
        for (name, value) in sanitized.headers.iter() {
            // Host/Content-Length 由 reqwest 重算。
            if name == HOST || name == CONTENT_LENGTH {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder.bearer_auth(&key.secret);
        if !request.body.is_empty() && !sanitized.headers.contains_key(CONTENT_TYPE) {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let event = UsageEvent {
            key_secret: key.secret.clone(),
            model,
            request_ip: request.client_ip.clone(),
            request_path: Some(compose_path(&request.path, request.query.as_deref())),
            ..Default::default()
        };

        let response = match builder.body(request.body.clone()).send().await {
            Ok(response) => response,
            Err(err) => {
                log_error(&key, &request.method, &request.path, &err);
                if accounting == Accounting::Recorded {
                    self.recorder
                        .record_quietly(&UsageEvent {
                            status_code: Some(StatusCode::INTERNAL_SERVER_ERROR.as_u16()),
                            response_time_ms: elapsed_ms(started),
                            ..event
                        })
                        .await;
                }
                return Ok(ProxyResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("upstream request failed: {err}"),
                ));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        tracing::info!(
            key = %preview_key(&key.secret),
            method = %request.method,
            path = %request.path,
            status = status.as_u16(),
            "upstream responded"
        );

        let event = UsageEvent {
            status_code: Some(status.as_u16()),
            ..event
        };

        if is_event_stream(&headers) {
            let tally = payload
                .as_ref()
                .map(StreamTally::for_request)
                .unwrap_or_default();
            let recorder = (accounting == Accounting::Recorded).then(|| self.recorder.clone());
            let guard = StreamAccounting {
                recorder,
                event: Some(event),
                tally,
                started,
            };
            return Ok(ProxyResponse {
                status,
                headers: stream_headers(headers),
                body: ProxyBody::Streaming(relay_stream(response, guard)),
            });
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                log_error(&key, &request.method, &request.path, &err);
                if accounting == Accounting::Recorded {
                    self.recorder
                        .record_quietly(&UsageEvent {
                            status_code: Some(StatusCode::INTERNAL_SERVER_ERROR.as_u16()),
                            response_time_ms: elapsed_ms(started),
                            ..event
                        })
                        .await;
                }
                return Ok(ProxyResponse::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("failed to read upstream response: {err}"),
                ));
            }
        };

        if accounting == Accounting::Recorded {
            let usage = if status.is_success() {
                serde_json::from_slice::<Value>(&body)
                    .ok()
                    .and_then(|value| TokenUsage::from_response_body(&value))
                    .unwrap_or_default()
            } else {
                TokenUsage::default()
            };
            self.recorder
                .record_quietly(&UsageEvent {
                    usage,
                    response_time_ms: elapsed_ms(started),
                    ..event
                })
                .await;
        }

        Ok(ProxyResponse {
            status,
            headers,
            body: ProxyBody::Buffered(body),
        })
    }

    fn sanitize_headers(&self, headers: &HeaderMap) -> SanitizedHeaders {
        sanitize_headers_inner(headers, &self.upstream, &self.upstream_origin)
    }
}

/// Records the streamed call exactly once, when the relay finishes or the caller
/// goes away.
struct StreamAccounting {
    recorder: Option<UsageRecorder>,
    event: Option<UsageEvent>,
    tally: StreamTally,
    started: Instant,
}

impl Drop for StreamAccounting {
    fn drop(&mut self) {
        let (Some(recorder), Some(event)) = (self.recorder.take(), self.event.take()) else {
            return;
        };
        recorder.record_detached(UsageEvent {
            usage: self.tally.usage(),
            response_time_ms: elapsed_ms(self.started),
            ..event
        });
    }
}

fn relay_stream(
    response: reqwest::Response,
    mut guard: StreamAccounting,
) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
    let upstream = response.bytes_stream();
    let relay = async_stream::stream! {
        tokio::pin!(upstream);
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(chunk) => {
                    guard.tally.observe_chunk(&chunk);
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "upstream stream interrupted");
                    yield Ok(error_frame(&format!("stream interrupted: {err}")));
                    break;
                }
            }
        }
        drop(guard);
    };
    relay.boxed()
}

/// Terminal SSE event written when the upstream stream fails.
pub fn error_frame(message: &str) -> Bytes {
    let payload = json!({ "error": { "message": message } });
    Bytes::from(format!("data: {payload}\n\n"))
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|raw| raw.to_ascii_lowercase().contains(EVENT_STREAM))
        .unwrap_or(false)
}

fn stream_headers(mut headers: HeaderMap) -> HeaderMap {
    headers.remove(CONTENT_LENGTH);
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn compose_path(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_owned(),
    }
}

fn log_error(key: &SelectedKey, method: &Method, path: &str, err: &reqwest::Error) {
    tracing::error!(
        key = %preview_key(&key.secret),
        pooled = key.is_pooled(),
        %method,
        path,
        error = %err,
        "upstream request failed"
    );
}

fn sanitize_headers_inner(
    headers: &HeaderMap,
    upstream: &Url,
    upstream_origin: &str,
) -> SanitizedHeaders {
    let mut sanitized = HeaderMap::new();
    let mut dropped = Vec::new();
    for (name, value) in headers.iter() {
        if !should_forward_header(name) {
            dropped.push(name.as_str().to_owned());
            continue;
        }
        match transform_header_value(name, value, upstream, upstream_origin) {
            Some(transformed) => {
                sanitized.append(name.clone(), transformed);
            }
            None => dropped.push(name.as_str().to_owned()),
        }
    }
    SanitizedHeaders {
        headers: sanitized,
        dropped,
    }
}

fn should_forward_header(name: &HeaderName) -> bool {
    // HeaderName is always lowercase.
    let lower = name.as_str();
    if name == AUTHORIZATION || BLOCKED_HEADERS.contains(&lower) {
        return false;
    }
    if ALLOWED_HEADERS.contains(&lower) {
        return true;
    }
    lower.starts_with("x-") && !lower.starts_with("x-forwarded-")
}

fn transform_header_value(
    name: &HeaderName,
    value: &HeaderValue,
    upstream: &Url,
    upstream_origin: &str,
) -> Option<HeaderValue> {
    match name.as_str() {
        "origin" => HeaderValue::from_str(upstream_origin).ok(),
        "referer" => {
            let rewritten = value
                .to_str()
                .ok()
                .and_then(|raw| Url::parse(raw).ok())
                .and_then(|mut url| {
                    url.set_scheme(upstream.scheme()).ok()?;
                    url.set_host(upstream.host_str()).ok()?;
                    url.set_port(upstream.port()).ok()?;
                    Some(url)
                });
            match rewritten {
                Some(url) => HeaderValue::from_str(url.as_str()).ok(),
                None => HeaderValue::from_str(upstream_origin).ok(),
            }
        }
        _ => Some(value.clone()),
    }
}

fn origin_from_url(url: &Url) -> String {
    let mut origin = match url.host_str() {
        Some(host) => format!("{}://{}", url.scheme(), host),
        None => url.as_str().to_owned(),
    };
    // Url::port() is None when the port is the scheme default.
    if let Some(port) = url.port() {
        origin.push(':');
        origin.push_str(&port.to_string());
    }
    origin
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyStore, tests::temp_store};
    use axum::{
        Json, Router,
        body::Body,
        http::HeaderMap as AxumHeaders,
        response::{IntoResponse, Response},
        routing::{get, post},
    };
    use std::{net::SocketAddr, sync::Arc};

    fn bearer(headers: &AxumHeaders) -> String {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned()
    }

    async fn chat(headers: AxumHeaders, Json(body): Json<Value>) -> Response {
        let auth = bearer(&headers);
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let model = body.get("model").and_then(Value::as_str).unwrap_or_default();

        if model == "broken-stream" {
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n\n")),
                Err(std::io::Error::other("upstream died")),
            ];
            return Response::builder()
                .header("content-type", EVENT_STREAM)
                .body(Body::from_stream(futures_util::stream::iter(chunks)))
                .unwrap();
        }

        if model == "stalled-stream" {
            let first: Result<Bytes, std::io::Error> = Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"partial answer\"}}]}\n\n",
            ));
            let stalled = futures_util::stream::iter(vec![first])
                .chain(futures_util::stream::pending::<Result<Bytes, std::io::Error>>());
            return Response::builder()
                .header("content-type", EVENT_STREAM)
                .body(Body::from_stream(stalled))
                .unwrap();
        }

        if stream {
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n")),
                Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n")),
                Ok(Bytes::from_static(b"data: [DONE]\n\n")),
            ];
            return Response::builder()
                .header("content-type", EVENT_STREAM)
                .body(Body::from_stream(futures_util::stream::iter(chunks)))
                .unwrap();
        }

        Json(json!({
            "id": "cmpl-1",
            "seen_authorization": auth,
            "choices": [{"message": {"role": "assistant", "content": "hi"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}
        }))
        .into_response()
    }

    async fn models(headers: AxumHeaders) -> Json<Value> {
        Json(json!({"object": "list", "data": [{"id": "m"}], "seen_authorization": bearer(&headers)}))
    }

    async fn spawn_inference_upstream() -> Url {
        let app = Router::new()
            .route("/v1/chat/completions", post(chat))
            .route("/v1/models", get(models));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}")).unwrap()
    }

    async fn forwarder_with_key(upstream: Url) -> (tempfile::TempDir, Arc<KeyStore>, ProxyForwarder) {
        let (dir, store) = temp_store().await;
        let store = Arc::new(store);
        store.insert_key("sk-pool-1", 10.0, &[], 1).await.unwrap();
        let forwarder = ProxyForwarder::new(
            Client::new(),
            upstream,
            KeySelector::new(store.clone(), None),
            UsageRecorder::new(store.clone()),
            Duration::from_secs(5),
        );
        (dir, store, forwarder)
    }

    fn chat_request(body: Value) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer caller-own-key"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        ProxyRequest {
            method: Method::POST,
            path: "/v1/chat/completions".to_owned(),
            query: None,
            headers,
            body: Bytes::from(body.to_string()),
            client_ip: Some("10.0.0.9".to_owned()),
        }
    }

    async fn collect(body: ProxyBody) -> String {
        match body {
            ProxyBody::Buffered(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
            ProxyBody::Streaming(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk.unwrap());
                }
                String::from_utf8(out).unwrap()
            }
        }
    }

    async fn wait_for_logs(store: &KeyStore, expected: i64) {
        for _ in 0..50 {
            if store.count_logs().await.unwrap() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("usage log never written");
    }

    #[tokio::test]
    async fn buffered_call_uses_pooled_key_and_records_usage() {
        let upstream = spawn_inference_upstream().await;
        let (_dir, store, forwarder) = forwarder_with_key(upstream).await;

        let response = forwarder
            .forward(chat_request(json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]})))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let body: Value = serde_json::from_str(&collect(response.body).await).unwrap();
        assert_eq!(body["seen_authorization"], "Bearer sk-pool-1");

        let logs = store.fetch_logs_page(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].input_tokens, 12);
        assert_eq!(logs[0].output_tokens, 30);
        assert_eq!(logs[0].total_tokens, 42);
        assert_eq!(logs[0].model.as_deref(), Some("m"));
        assert_eq!(logs[0].request_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(logs[0].used_key.as_deref(), Some("sk-pool-1"));
    }

    #[tokio::test]
    async fn streaming_call_relays_and_records_estimate_once() {
        let upstream = spawn_inference_upstream().await;
        let (_dir, store, forwarder) = forwarder_with_key(upstream).await;

        let response = forwarder
            .forward(chat_request(json!({
                "model": "m",
                "stream": true,
                "messages": [{"role": "user", "content": "abcdefgh"}]
            })))
            .await
            .unwrap();
        assert!(matches!(response.body, ProxyBody::Streaming(_)));
        let text = collect(response.body).await;
        assert!(text.contains("Hello"));
        assert!(text.ends_with("data: [DONE]\n\n"));

        wait_for_logs(&store, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let logs = store.fetch_logs_page(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].input_tokens, 2);
        assert!(logs[0].output_tokens > 0);
        assert_eq!(logs[0].status_code, Some(200));

        let keys = store.fetch_all_keys().await.unwrap();
        assert_eq!(keys[0].usage_count, 1);
    }

    #[tokio::test]
    async fn caller_disconnect_mid_stream_records_partial_usage_once() {
        let upstream = spawn_inference_upstream().await;
        let (_dir, store, forwarder) = forwarder_with_key(upstream).await;

        let response = forwarder
            .forward(chat_request(json!({
                "model": "stalled-stream",
                "stream": true,
                "messages": [{"role": "user", "content": "abcd"}]
            })))
            .await
            .unwrap();
        let ProxyBody::Streaming(mut stream) = response.body else {
            panic!("expected a streaming body");
        };
        let first = stream.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&first).contains("partial answer"));
        assert_eq!(store.count_logs().await.unwrap(), 0);
        drop(stream);

        wait_for_logs(&store, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let logs = store.fetch_logs_page(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].input_tokens, 1);
        assert!(logs[0].output_tokens > 0);
        assert_eq!(store.fetch_all_keys().await.unwrap()[0].usage_count, 1);
    }

    #[tokio::test]
    async fn upstream_base_path_prefix_is_kept() {
        let app = Router::new().route("/prefix/v1/chat/completions", post(chat));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let upstream = Url::parse(&format!("http://{addr}/prefix")).unwrap();
        let (_dir, store, forwarder) = forwarder_with_key(upstream).await;

        let response = forwarder
            .forward(chat_request(json!({"model": "m", "messages": []})))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let body: Value = serde_json::from_str(&collect(response.body).await).unwrap();
        assert_eq!(body["seen_authorization"], "Bearer sk-pool-1");
        assert_eq!(store.count_logs().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn broken_stream_ends_with_error_frame() {
        let upstream = spawn_inference_upstream().await;
        let (_dir, store, forwarder) = forwarder_with_key(upstream).await;

        let response = forwarder
            .forward(chat_request(json!({"model": "broken-stream", "stream": true, "messages": []})))
            .await
            .unwrap();
        let text = collect(response.body).await;
        let last = text.trim_end().rsplit("\n\n").next().unwrap();
        let frame: Value = serde_json::from_str(last.trim_start_matches("data: ")).unwrap();
        assert!(frame["error"]["message"].is_string());

        wait_for_logs(&store, 1).await;
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_error_envelope_and_zero_log() {
        let upstream = Url::parse("http://127.0.0.1:1").unwrap();
        let (_dir, store, forwarder) = forwarder_with_key(upstream).await;

        let response = forwarder
            .forward(chat_request(json!({"model": "m", "messages": []})))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&collect(response.body).await).unwrap();
        assert!(body["error"]["message"].is_string());

        let logs = store.fetch_logs_page(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, Some(500));
        assert_eq!(logs[0].total_tokens, 0);
    }

    #[tokio::test]
    async fn models_listing_is_not_logged() {
        let upstream = spawn_inference_upstream().await;
        let (_dir, store, forwarder) = forwarder_with_key(upstream).await;

        let response = forwarder
            .forward_models(ProxyRequest {
                method: Method::GET,
                path: "/v1/models".to_owned(),
                query: None,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                client_ip: None,
            })
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let body: Value = serde_json::from_str(&collect(response.body).await).unwrap();
        assert_eq!(body["seen_authorization"], "Bearer sk-pool-1");
        assert_eq!(store.count_logs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_pool_without_default_is_an_error() {
        let upstream = spawn_inference_upstream().await;
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let forwarder = ProxyForwarder::new(
            Client::new(),
            upstream,
            KeySelector::new(store.clone(), None),
            UsageRecorder::new(store),
            Duration::from_secs(5),
        );

        let result = forwarder.forward(chat_request(json!({"model": "m"}))).await;
        assert!(matches!(result, Err(PoolError::NoAvailableKey)));
    }

    #[test]
    fn sanitize_headers_drops_forwarding_and_caller_auth() {
        let upstream = Url::parse("https://api.siliconflow.cn").unwrap();
        let origin = origin_from_url(&upstream);

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer mine"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let sanitized = sanitize_headers_inner(&headers, &upstream, &origin);
        assert!(!sanitized.headers.contains_key("x-forwarded-for"));
        assert!(!sanitized.headers.contains_key(AUTHORIZATION));
        assert_eq!(sanitized.headers.get("accept").unwrap(), "application/json");
        assert!(sanitized.headers.contains_key("x-request-id"));
        assert!(sanitized.dropped.contains(&"authorization".to_owned()));
    }

    #[test]
    fn sanitize_headers_rewrites_origin_and_referer() {
        let upstream = Url::parse("https://api.siliconflow.cn:8443").unwrap();
        let origin = origin_from_url(&upstream);
        assert_eq!(origin, "https://api.siliconflow.cn:8443");

        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("https://pool.local"));
        headers.insert("referer", HeaderValue::from_static("https://pool.local/admin"));

        let sanitized = sanitize_headers_inner(&headers, &upstream, &origin);
        assert_eq!(sanitized.headers.get("origin").unwrap(), origin.as_str());
        assert_eq!(
            sanitized.headers.get("referer").unwrap(),
            "https://api.siliconflow.cn:8443/admin"
        );
    }
}
