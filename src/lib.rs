pub mod error;
pub mod forwarder;
pub mod refresher;
pub mod selector;
pub mod settings;
pub mod store;
pub mod usage;
pub mod validator;

use std::sync::Arc;

use chrono::Utc;
use nanoid::nanoid;
use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;

pub use error::PoolError;
pub use forwarder::{ProxyBody, ProxyForwarder, ProxyRequest, ProxyResponse};
pub use refresher::{BatchRefresher, ImportStats, KeyRefreshOutcome, RefreshQueue, RefreshReport};
pub use selector::{KeySelector, SelectedKey};
pub use settings::{AdminCredentials, DEFAULT_UPSTREAM, PoolSettings};
pub use store::{ApiKeyRecord, KeyStore, LogRecord, PoolStats};
pub use usage::{StreamTally, TokenUsage, UsageEvent, UsageRecorder};
pub use validator::{KeyValidator, UpstreamValidator, Validation};

pub const DEFAULT_LOG_PAGE_SIZE: i64 = 20;
pub const MAX_LOG_PAGE_SIZE: i64 = 500;

/// 导入结果，附带导入后的池统计。
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub stats: ImportStats,
    pub pool: PoolStats,
}

/// 后台刷新的受理结果；空池时不入队，`run_id` 为 `None`。
#[derive(Debug, Clone, Serialize)]
pub struct BackgroundRefresh {
    pub total: usize,
    pub run_id: Option<String>,
}

/// 最近一次后台刷新报告。
#[derive(Debug, Clone, Serialize)]
pub struct LatestRefresh {
    pub id: String,
    pub created_at: i64,
    pub report: Value,
}

#[derive(Debug, Clone)]
pub struct LogsPage {
    pub logs: Vec<LogRecord>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

/// 对外的 key 池句柄：管理操作、会话与代理转发都从这里进入。
#[derive(Clone)]
pub struct KeyPool {
    store: Arc<KeyStore>,
    refresher: Arc<BatchRefresher>,
    queue: RefreshQueue,
    selector: KeySelector,
    forwarder: ProxyForwarder,
    admin: Option<AdminCredentials>,
    session_ttl_ms: i64,
}

impl KeyPool {
    pub async fn new(settings: PoolSettings) -> Result<Self, PoolError> {
        let upstream = parse_upstream(&settings.upstream)?;
        let client = Client::new();
        let validator = UpstreamValidator::new(client.clone(), &upstream, settings.validate_timeout);
        Self::with_validator(settings, client, upstream, Arc::new(validator)).await
    }

    /// Builds the pool around a caller-supplied validator.
    pub async fn with_validator(
        settings: PoolSettings,
        client: Client,
        upstream: Url,
        validator: Arc<dyn KeyValidator>,
    ) -> Result<Self, PoolError> {
        let store = Arc::new(KeyStore::open(&settings.database_path).await?);
        let refresher = Arc::new(BatchRefresher::new(
            store.clone(),
            validator,
            settings.refresh_batch_size,
            settings.import_batch_size,
            settings.refresh_delay,
        ));
        let queue = RefreshQueue::spawn(refresher.clone(), store.clone());
        let selector = KeySelector::new(store.clone(), settings.default_key.clone());
        let forwarder = ProxyForwarder::new(
            client,
            upstream,
            selector.clone(),
            UsageRecorder::new(store.clone()),
            settings.models_timeout,
        );

        Ok(Self {
            store,
            refresher,
            queue,
            selector,
            forwarder,
            admin: settings.admin,
            session_ttl_ms: settings.session_ttl_secs.saturating_mul(1_000),
        })
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin.is_some()
    }

    // ----- proxy -----

    pub async fn forward(&self, request: ProxyRequest) -> Result<ProxyResponse, PoolError> {
        self.forwarder.forward(request).await
    }

    pub async fn forward_models(&self, request: ProxyRequest) -> Result<ProxyResponse, PoolError> {
        self.forwarder.forward_models(request).await
    }

    /// 直接取一个可用 key（不经转发）。
    pub async fn select_key(&self, exclude_key: Option<&str>) -> Result<SelectedKey, PoolError> {
        self.selector.select(exclude_key).await
    }

    // ----- keys -----

    pub async fn import_keys(&self, keys: &[String]) -> Result<ImportSummary, PoolError> {
        if keys.iter().all(|k| k.trim().is_empty()) {
            return Err(PoolError::invalid_input("no keys provided"));
        }
        let stats = self.refresher.import(keys).await?;
        let pool = self.store.fetch_stats().await?;
        Ok(ImportSummary { stats, pool })
    }

    /// 全量 key 明细，按余额降序。
    pub async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>, PoolError> {
        self.store.fetch_all_keys().await
    }

    /// Full dump for backup; same rows as [`Self::list_keys`].
    pub async fn export_keys(&self) -> Result<Vec<ApiKeyRecord>, PoolError> {
        self.store.fetch_all_keys().await
    }

    pub async fn refresh_all(&self) -> Result<RefreshReport, PoolError> {
        self.refresher.refresh_all().await
    }

    /// Queues a full refresh and returns without waiting for it.
    pub async fn start_background_refresh(&self) -> Result<BackgroundRefresh, PoolError> {
        let keys = self.store.fetch_all_keys().await?;
        let total = keys.len();
        if total == 0 {
            return Ok(BackgroundRefresh {
                total,
                run_id: None,
            });
        }
        let run_id = self.queue.enqueue(keys);
        tracing::info!(total, run_id = ?run_id, "background refresh queued");
        Ok(BackgroundRefresh { total, run_id })
    }

    pub async fn latest_refresh(&self) -> Result<Option<LatestRefresh>, PoolError> {
        let Some(run) = self.store.latest_refresh_run().await? else {
            return Ok(None);
        };
        Ok(Some(LatestRefresh {
            report: serde_json::from_str(&run.payload)?,
            id: run.id,
            created_at: run.created_at,
        }))
    }

    pub async fn refresh_keys(&self, ids: &[String]) -> Result<RefreshReport, PoolError> {
        if ids.is_empty() {
            return Err(PoolError::invalid_input("key_ids must not be empty"));
        }
        let keys = self.store.fetch_keys_by_ids(ids).await?;
        if keys.is_empty() {
            return Err(PoolError::KeyNotFound(ids.join(",")));
        }
        Ok(self.refresher.refresh_keys(keys).await)
    }

    pub async fn refresh_key(&self, id: &str) -> Result<KeyRefreshOutcome, PoolError> {
        let key = self
            .store
            .fetch_key(id)
            .await?
            .ok_or_else(|| PoolError::KeyNotFound(id.to_owned()))?;
        let report = self.refresher.refresh_keys(vec![key]).await;
        report
            .results
            .into_iter()
            .next()
            .ok_or_else(|| PoolError::KeyNotFound(id.to_owned()))
    }

    pub async fn set_key_active(&self, id: &str, is_active: bool) -> Result<(), PoolError> {
        match self.store.set_active(id, is_active).await? {
            0 => Err(PoolError::KeyNotFound(id.to_owned())),
            _ => Ok(()),
        }
    }

    pub async fn set_keys_active(&self, ids: &[String], is_active: bool) -> Result<u64, PoolError> {
        if ids.is_empty() {
            return Err(PoolError::invalid_input("key_ids must not be empty"));
        }
        self.store.set_active_many(ids, is_active).await
    }

    /// Deletes one key; its log rows stay with a null key reference.
    pub async fn delete_key(&self, id: &str) -> Result<(), PoolError> {
        match self.store.delete_key(id).await? {
            0 => Err(PoolError::KeyNotFound(id.to_owned())),
            _ => Ok(()),
        }
    }

    /// Deletes every key with balance <= 0 together with its logs.
    pub async fn prune_zero_balance(&self) -> Result<u64, PoolError> {
        let ids = self.store.zero_balance_ids().await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let deleted = self.store.delete_keys_with_logs(&ids).await?;
        tracing::info!(deleted, "pruned zero-balance keys");
        Ok(deleted)
    }

    // ----- stats & logs -----

    pub async fn stats(&self) -> Result<PoolStats, PoolError> {
        self.store.fetch_stats().await
    }

    pub async fn logs_page(&self, page: i64, limit: i64) -> Result<LogsPage, PoolError> {
        let page = page.max(1);
        let page_size = limit.clamp(1, MAX_LOG_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(page_size);
        let logs = self.store.fetch_logs_page(page_size, offset).await?;
        let total = self.store.count_logs().await?;
        Ok(LogsPage {
            logs,
            total,
            page,
            page_size,
        })
    }

    pub async fn clear_logs(&self) -> Result<u64, PoolError> {
        self.store.clear_logs().await
    }

    // ----- admin sessions -----

    /// Returns a new session id when the credentials match.
    pub async fn login(&self, username: &str, password: &str) -> Result<Option<String>, PoolError> {
        let Some(admin) = self.admin.as_ref() else {
            tracing::warn!("admin login attempted but no admin password is configured");
            return Ok(None);
        };
        let user_ok = secrets_match(&admin.username, username);
        let password_ok = secrets_match(&admin.password, password);
        if !(user_ok && password_ok) {
            tracing::warn!(username, "admin login rejected");
            return Ok(None);
        }

        let now = now_millis();
        self.store.purge_expired_sessions(now).await?;
        let session_id = nanoid!(32);
        let data = json!({ "username": username }).to_string();
        self.store
            .insert_session(
                &session_id,
                username,
                now,
                now.saturating_add(self.session_ttl_ms),
                &data,
            )
            .await?;
        tracing::info!(username, "admin session created");
        Ok(Some(session_id))
    }

    pub async fn validate_session(&self, session_id: &str) -> Result<bool, PoolError> {
        let now = now_millis();
        self.store.purge_expired_sessions(now).await?;
        self.store.session_is_live(session_id, now).await
    }

    pub async fn logout(&self, session_id: &str) -> Result<(), PoolError> {
        self.store.delete_session(session_id).await
    }
}

fn parse_upstream(raw: &str) -> Result<Url, PoolError> {
    Url::parse(raw).map_err(|source| PoolError::InvalidEndpoint {
        endpoint: raw.to_owned(),
        source,
    })
}

/// Puts `path` under the base URL's own path so a gateway prefix survives.
pub(crate) fn upstream_url(base: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query.filter(|q| !q.is_empty()));
    url
}

fn secrets_match(expected: &str, given: &str) -> bool {
    expected.as_bytes().ct_eq(given.as_bytes()).into()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 余额统一保留 4 位小数。
pub fn round_balance(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Always exactly four fractional digits, e.g. `0.0000`.
pub fn format_balance(value: f64) -> String {
    format!("{:.4}", round_balance(value))
}

pub fn preview_key(key: &str) -> String {
    let shown: String = key.chars().take(6).collect();
    format!("{shown}…")
}
