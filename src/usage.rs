use std::sync::Arc;

use serde_json::Value;

use crate::{
    error::PoolError,
    now_millis, preview_key,
    store::{KeyStore, NewLogEntry},
};

/// Characters per estimated token in the streaming heuristic.
const CHARS_PER_TOKEN: f64 = 4.0;

/// 一次调用的 token 用量。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
    pub total: i64,
}

impl TokenUsage {
    /// Reads the upstream `usage` object of a buffered response body.
    pub fn from_response_body(body: &Value) -> Option<Self> {
        let usage = body.get("usage")?;
        if !usage.is_object() {
            return None;
        }
        let field = |name: &str| usage.get(name).and_then(Value::as_i64).unwrap_or(0).max(0);
        let input = field("prompt_tokens");
        let output = field("completion_tokens");
        let total = usage
            .get("total_tokens")
            .and_then(Value::as_i64)
            .map(|t| t.max(0))
            .unwrap_or(input + output);
        Some(Self {
            input,
            output,
            total,
        })
    }
}

/// Streaming token estimate: message characters / 4 for input, and characters of
/// every relayed chunk mentioning `content` / 4 for output. This is a deliberate
/// approximation; streamed responses carry no reliable usage object.
#[derive(Debug, Clone, Default)]
pub struct StreamTally {
    input: f64,
    output: f64,
}

impl StreamTally {
    pub fn for_request(body: &Value) -> Self {
        let input = body
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .map(|message| message_chars(message.get("content")) as f64 / CHARS_PER_TOKEN)
                    .sum()
            })
            .unwrap_or(0.0);
        Self { input, output: 0.0 }
    }

    pub fn observe_chunk(&mut self, chunk: &[u8]) {
        let text = String::from_utf8_lossy(chunk);
        if text.contains("content") {
            self.output += text.chars().count() as f64 / CHARS_PER_TOKEN;
        }
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input: self.input.round() as i64,
            output: self.output.round() as i64,
            total: (self.input + self.output).round() as i64,
        }
    }
}

fn message_chars(content: Option<&Value>) -> usize {
    match content {
        Some(Value::String(text)) => text.chars().count(),
        // multi-part content: count the text parts only
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .map(|text| text.chars().count())
            .sum(),
        _ => 0,
    }
}

/// 一次已完成（或已中断）的上游调用，待写入日志。
#[derive(Debug, Clone, Default)]
pub struct UsageEvent {
    pub key_secret: String,
    pub model: Option<String>,
    pub request_ip: Option<String>,
    pub request_path: Option<String>,
    pub status_code: Option<u16>,
    pub response_time_ms: i64,
    pub usage: TokenUsage,
}

/// Writes exactly one log row per event and bumps the serving key's counter.
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    store: Arc<KeyStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, event: &UsageEvent) -> Result<String, PoolError> {
        let now = now_millis();
        let log_id = self
            .store
            .insert_log(&NewLogEntry {
                timestamp: now,
                request_ip: event.request_ip.as_deref(),
                request_path: event.request_path.as_deref(),
                key_secret: Some(event.key_secret.as_str()),
                status_code: event.status_code.map(i64::from),
                response_time_ms: Some(event.response_time_ms),
                model: event.model.as_deref(),
                input_tokens: event.usage.input,
                output_tokens: event.usage.output,
                total_tokens: event.usage.total,
            })
            .await?;

        // Zero rows means the default key or a key deleted mid-flight.
        self.store.increment_usage(&event.key_secret, now).await?;
        Ok(log_id)
    }

    /// Records and swallows any failure after logging it.
    pub async fn record_quietly(&self, event: &UsageEvent) {
        if let Err(err) = self.record(event).await {
            tracing::warn!(
                key = %preview_key(&event.key_secret),
                error = %err,
                "failed to record usage"
            );
        }
    }

    /// Fire-and-forget recording on the current runtime.
    pub fn record_detached(&self, event: UsageEvent) {
        let recorder = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { recorder.record_quietly(&event).await });
            }
            Err(_) => tracing::warn!(
                key = %preview_key(&event.key_secret),
                "no runtime available; usage event dropped"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;
    use serde_json::json;

    #[test]
    fn buffered_usage_is_read_from_body() {
        let body = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 30, "total_tokens": 42}});
        assert_eq!(
            TokenUsage::from_response_body(&body),
            Some(TokenUsage {
                input: 12,
                output: 30,
                total: 42
            })
        );
        assert_eq!(TokenUsage::from_response_body(&json!({"choices": []})), None);
    }

    #[test]
    fn missing_total_is_derived() {
        let body = json!({"usage": {"prompt_tokens": 3, "completion_tokens": 4}});
        assert_eq!(TokenUsage::from_response_body(&body).unwrap().total, 7);
    }

    #[test]
    fn stream_tally_estimates_and_rounds() {
        let request = json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "abcdef"},
                {"role": "user", "content": [{"type": "text", "text": "abcd"}]}
            ]
        });
        let mut tally = StreamTally::for_request(&request);
        // 10 chars / 4 = 2.5
        tally.observe_chunk(br#"data: {"delta":{"content":"hi"}}"#);
        tally.observe_chunk(b"data: [DONE]\n\n");

        let usage = tally.usage();
        assert_eq!(usage.input, 3);
        assert_eq!(usage.output, 8); // 32 chars / 4
        assert_eq!(usage.total, 11);
    }

    #[test]
    fn tally_without_messages_is_zero() {
        assert_eq!(StreamTally::for_request(&json!({})).usage(), TokenUsage::default());
    }

    #[tokio::test]
    async fn record_writes_log_and_counts_usage() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let id = store.insert_key("sk-used", 1.0, &[], 1).await.unwrap().unwrap();
        let recorder = UsageRecorder::new(store.clone());

        recorder
            .record(&UsageEvent {
                key_secret: "sk-used".to_owned(),
                model: Some("m".to_owned()),
                status_code: Some(200),
                response_time_ms: 15,
                usage: TokenUsage {
                    input: 1,
                    output: 2,
                    total: 3,
                },
                ..Default::default()
            })
            .await
            .unwrap();

        let logs = store.fetch_logs_page(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].api_key_id.as_deref(), Some(id.as_str()));
        assert_eq!(logs[0].total_tokens, 3);
        assert_eq!(logs[0].status_code, Some(200));

        let key = store.fetch_key(&id).await.unwrap().unwrap();
        assert_eq!(key.usage_count, 1);
        assert!(key.last_used_at.is_some());
    }

    #[tokio::test]
    async fn unknown_secret_logs_with_null_key() {
        let (_dir, store) = temp_store().await;
        let store = Arc::new(store);
        let recorder = UsageRecorder::new(store.clone());

        recorder
            .record(&UsageEvent {
                key_secret: "sk-deleted".to_owned(),
                ..Default::default()
            })
            .await
            .unwrap();

        let logs = store.fetch_logs_page(10, 0).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].api_key_id, None);
    }
}
