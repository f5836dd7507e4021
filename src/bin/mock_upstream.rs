use std::{net::SocketAddr, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

/// Keys starting with this prefix are accepted; anything else gets 401.
const GOOD_PREFIX: &str = "sk-";

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"code": 20012, "message": "Invalid token"})),
    )
        .into_response()
}

async fn user_info(headers: HeaderMap) -> Response {
    let Some(key) = bearer(&headers).filter(|k| k.starts_with(GOOD_PREFIX)) else {
        return unauthorized();
    };
    // "sk-empty..." keys report a drained account.
    let balance = if key.starts_with("sk-empty") { "0" } else { "14.23456" };
    Json(json!({
        "code": 20000,
        "status": true,
        "data": {
            "totalBalance": balance,
            "modelAccess": ["Qwen/Qwen2.5-7B-Instruct", "deepseek-ai/DeepSeek-V3"],
            "userInfo": {"name": "mock"}
        }
    }))
    .into_response()
}

async fn models(headers: HeaderMap) -> Response {
    if bearer(&headers).is_none_or(|k| !k.starts_with(GOOD_PREFIX)) {
        return unauthorized();
    }
    Json(json!({
        "object": "list",
        "data": [
            {"id": "Qwen/Qwen2.5-7B-Instruct", "object": "model"},
            {"id": "deepseek-ai/DeepSeek-V3", "object": "model"}
        ]
    }))
    .into_response()
}

async fn chat(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if bearer(&headers).is_none_or(|k| !k.starts_with(GOOD_PREFIX)) {
        return unauthorized();
    }
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("mock-model")
        .to_owned();

    if body.get("stream").and_then(Value::as_bool).unwrap_or(false) {
        let words = ["Hello", " from", " the", " mock", " upstream."];
        let stream = async_stream::stream! {
            for word in words {
                let frame = json!({
                    "model": model,
                    "choices": [{"index": 0, "delta": {"content": word}}]
                });
                yield Ok::<Bytes, std::io::Error>(Bytes::from(format!("data: {frame}\n\n")));
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
        };
        return Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello from the mock upstream."},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 11, "completion_tokens": 7, "total_tokens": 18}
    }))
    .into_response()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let app = Router::new()
        .route("/v1/user/info", get(user_info))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat));
    let bind_addr =
        std::env::var("MOCK_UPSTREAM_ADDR").unwrap_or_else(|_| "127.0.0.1:58088".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    println!("Mock upstream on http://{addr}");

    let generator = spawn_generator();

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;

    if let Some(h) = generator {
        let _ = h.await;
    }
    Ok(())
}

/// Optional traffic through the proxy, alternating buffered and streaming calls.
fn spawn_generator() -> Option<JoinHandle<()>> {
    let proxy_base = std::env::var("PROXY_BASE").ok()?;
    let token = std::env::var("POOL_ACCESS_TOKEN").ok();
    let interval_ms: u64 = std::env::var("GEN_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(5000);

    Some(tokio::spawn(async move {
        let client = Client::new();
        let url = format!("{proxy_base}/v1/chat/completions");
        let mut i = 0u64;
        loop {
            let stream = i % 2 == 1;
            let mut request = client.post(&url).json(&json!({
                "model": "Qwen/Qwen2.5-7B-Instruct",
                "stream": stream,
                "messages": [{"role": "user", "content": format!("ping #{i}")}]
            }));
            if let Some(token) = token.as_deref() {
                request = request.bearer_auth(token);
            }
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    println!("[mock-gen] stream={stream} -> {status} ({} bytes)", body.len());
                    if !status.is_success() {
                        eprintln!("[mock-gen] response body: {body}");
                    }
                }
                Err(err) => eprintln!("[mock-gen] request error: {err}"),
            }

            i = i.wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }))
}
