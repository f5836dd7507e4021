use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;

use crate::{preview_key, round_balance, upstream_url};

const USER_INFO_PATH: &str = "/v1/user/info";

/// 单个 key 的校验结果。
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub valid: bool,
    pub balance: f64,
    pub model_access: Vec<String>,
    pub message: Option<String>,
}

impl Validation {
    pub fn valid(balance: f64, model_access: Vec<String>) -> Self {
        Self {
            valid: true,
            balance,
            model_access,
            message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            balance: 0.0,
            model_access: Vec::new(),
            message: Some(message.into()),
        }
    }
}

/// Checks one secret against the upstream account endpoint. Never fails: every
/// problem is folded into an invalid [`Validation`].
#[async_trait]
pub trait KeyValidator: Send + Sync {
    async fn validate(&self, secret: &str) -> Validation;
}

#[derive(Debug, Clone)]
pub struct UpstreamValidator {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl UpstreamValidator {
    pub fn new(client: Client, upstream: &Url, timeout: Duration) -> Self {
        let endpoint = upstream_url(upstream, USER_INFO_PATH, None);
        Self {
            client,
            endpoint,
            timeout,
        }
    }
}

#[async_trait]
impl KeyValidator for UpstreamValidator {
    async fn validate(&self, secret: &str) -> Validation {
        let response = self
            .client
            .get(self.endpoint.clone())
            .bearer_auth(secret)
            .timeout(self.timeout)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(key = %preview_key(secret), error = %err, "key validation request failed");
                return Validation::invalid(format!("Validation error: {err}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                key = %preview_key(secret),
                status = status.as_u16(),
                body = %body,
                "key validation rejected"
            );
            return Validation::invalid(format!("Invalid API key (Status: {})", status.as_u16()));
        }

        match response.json::<Value>().await {
            Ok(payload) => parse_user_info(&payload),
            Err(err) => {
                tracing::warn!(key = %preview_key(secret), error = %err, "user info body not json");
                Validation::invalid(format!("Validation error: {err}"))
            }
        }
    }
}

/// Normalises a `{data: {totalBalance, modelAccess}}` payload.
pub fn parse_user_info(payload: &Value) -> Validation {
    let data = payload.get("data");
    let balance = data
        .and_then(|d| d.get("totalBalance"))
        .map(parse_balance)
        .unwrap_or(0.0);
    let model_access = data
        .and_then(|d| d.get("modelAccess"))
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default();

    Validation::valid(balance, model_access)
}

fn parse_balance(raw: &Value) -> f64 {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(value) if value.is_finite() => round_balance(value),
        _ => 0.0,
    }
}
