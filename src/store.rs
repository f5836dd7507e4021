use std::collections::HashSet;

use nanoid::nanoid;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::PoolError;

/// Prune and scoped lookups bind at most this many ids per statement.
const ID_CHUNK: usize = 100;

/// 一条池内 API key 记录。
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub key: String,
    pub created_at: i64,
    pub add_time: i64,
    pub last_used_at: Option<i64>,
    pub last_check_time: Option<i64>,
    pub balance: f64,
    pub is_active: bool,
    pub usage_count: i64,
    pub model_access: Vec<String>,
}

/// 待写入的调用日志。
#[derive(Debug, Clone, Default)]
pub struct NewLogEntry<'a> {
    pub timestamp: i64,
    pub request_ip: Option<&'a str>,
    pub request_path: Option<&'a str>,
    /// Resolved to the key id inside the insert; unknown secrets store NULL.
    pub key_secret: Option<&'a str>,
    pub status_code: Option<i64>,
    pub response_time_ms: Option<i64>,
    pub model: Option<&'a str>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// 日志查询结果，附带（若仍存在的）key 原文。
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: String,
    pub timestamp: i64,
    pub request_ip: Option<String>,
    pub request_path: Option<String>,
    pub api_key_id: Option<String>,
    pub used_key: Option<String>,
    pub status_code: Option<i64>,
    pub response_time_ms: Option<i64>,
    pub model: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// 池整体统计。
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub total_keys: i64,
    pub active_keys: i64,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub total_balance: f64,
}

/// 后台刷新结果的暂存记录。
#[derive(Debug, Clone)]
pub struct RefreshRun {
    pub id: String,
    pub created_at: i64,
    pub payload: String,
}

#[derive(Debug)]
pub struct KeyStore {
    pool: SqlitePool,
}

impl KeyStore {
    pub async fn open(database_path: &str) -> Result<Self, PoolError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), PoolError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                add_time INTEGER NOT NULL,
                last_used_at INTEGER,
                last_check_time INTEGER,
                balance REAL NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                usage_count INTEGER NOT NULL DEFAULT 0,
                model_access TEXT NOT NULL DEFAULT '[]'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Logs outlive their key: the reference is nulled, never cascaded.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS logs (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                request_ip TEXT,
                request_path TEXT,
                api_key_id TEXT REFERENCES api_keys(id) ON DELETE SET NULL,
                status_code INTEGER,
                response_time INTEGER,
                model TEXT,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_api_key_id ON logs(api_key_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                data TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refresh_runs (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ----- keys -----

    /// Inserts a validated key. Returns `None` when the secret is already stored.
    pub async fn insert_key(
        &self,
        secret: &str,
        balance: f64,
        model_access: &[String],
        now: i64,
    ) -> Result<Option<String>, PoolError> {
        let id = nanoid!();
        let model_access = serde_json::to_string(model_access)?;
        let result = sqlx::query(
            r#"
            INSERT INTO api_keys (
                id, key, created_at, add_time, last_check_time, balance, is_active, model_access
            ) VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(secret)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(balance)
        .bind(model_access)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() > 0).then_some(id))
    }

    /// Returns which of the given secrets are already in the pool.
    pub async fn existing_secrets(&self, secrets: &[String]) -> Result<HashSet<String>, PoolError> {
        let mut found = HashSet::new();
        for chunk in secrets.chunks(ID_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new("SELECT key FROM api_keys WHERE key IN (");
            push_bind_list(&mut builder, chunk);
            let rows: Vec<String> = builder
                .build_query_scalar()
                .fetch_all(&self.pool)
                .await?;
            found.extend(rows);
        }
        Ok(found)
    }

    /// 全量 key，按余额降序。
    pub async fn fetch_all_keys(&self) -> Result<Vec<ApiKeyRecord>, PoolError> {
        let rows = sqlx::query(
            r#"
            SELECT id, key, created_at, add_time, last_used_at, last_check_time,
                   balance, is_active, usage_count, model_access
            FROM api_keys
            ORDER BY balance DESC, add_time ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(key_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(PoolError::from)
    }

    pub async fn fetch_key(&self, id: &str) -> Result<Option<ApiKeyRecord>, PoolError> {
        let row = sqlx::query(
            r#"
            SELECT id, key, created_at, add_time, last_used_at, last_check_time,
                   balance, is_active, usage_count, model_access
            FROM api_keys
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(key_from_row)
            .transpose()
            .map_err(PoolError::from)
    }

    pub async fn fetch_keys_by_ids(&self, ids: &[String]) -> Result<Vec<ApiKeyRecord>, PoolError> {
        let mut keys = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                r#"
                SELECT id, key, created_at, add_time, last_used_at, last_check_time,
                       balance, is_active, usage_count, model_access
                FROM api_keys
                WHERE id IN ("#,
            );
            push_bind_list(&mut builder, chunk);
            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in &rows {
                keys.push(key_from_row(row)?);
            }
        }
        Ok(keys)
    }

    /// Active `(id, key)` pairs eligible for selection.
    pub async fn active_key_candidates(
        &self,
        exclude_key: Option<&str>,
    ) -> Result<Vec<(String, String)>, PoolError> {
        let candidates = match exclude_key {
            Some(excluded) => {
                sqlx::query_as::<_, (String, String)>(
                    "SELECT id, key FROM api_keys WHERE is_active = 1 AND key <> ?",
                )
                .bind(excluded)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, (String, String)>(
                    "SELECT id, key FROM api_keys WHERE is_active = 1",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(candidates)
    }

    pub async fn touch_key(&self, id: &str, timestamp: i64) -> Result<(), PoolError> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Single-row atomic counter bump owned by the usage recorder.
    pub async fn increment_usage(&self, secret: &str, timestamp: i64) -> Result<u64, PoolError> {
        let result = sqlx::query(
            r#"
            UPDATE api_keys
            SET usage_count = usage_count + 1, last_used_at = ?
            WHERE key = ?
            "#,
        )
        .bind(timestamp)
        .bind(secret)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Writes one validation result back. `model_access` is left untouched when `None`.
    pub async fn apply_validation(
        &self,
        id: &str,
        is_active: bool,
        balance: f64,
        model_access: Option<&[String]>,
        checked_at: i64,
    ) -> Result<(), PoolError> {
        match model_access {
            Some(models) => {
                sqlx::query(
                    r#"
                    UPDATE api_keys
                    SET is_active = ?, balance = ?, last_check_time = ?, model_access = ?
                    WHERE id = ?
                    "#,
                )
                .bind(is_active)
                .bind(balance)
                .bind(checked_at)
                .bind(serde_json::to_string(models)?)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE api_keys
                    SET is_active = ?, balance = ?, last_check_time = ?
                    WHERE id = ?
                    "#,
                )
                .bind(is_active)
                .bind(balance)
                .bind(checked_at)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn set_active(&self, id: &str, is_active: bool) -> Result<u64, PoolError> {
        let result = sqlx::query("UPDATE api_keys SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn set_active_many(&self, ids: &[String], is_active: bool) -> Result<u64, PoolError> {
        let mut updated = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new("UPDATE api_keys SET is_active = ");
            builder.push_bind(is_active);
            builder.push(" WHERE id IN (");
            push_bind_list(&mut builder, chunk);
            updated += builder.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(updated)
    }

    pub async fn delete_key(&self, id: &str) -> Result<u64, PoolError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn zero_balance_ids(&self) -> Result<Vec<String>, PoolError> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM api_keys WHERE balance <= 0")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Deletes keys in chunks, removing their log rows first. A failed log delete
    /// is logged and the key delete still proceeds.
    pub async fn delete_keys_with_logs(&self, ids: &[String]) -> Result<u64, PoolError> {
        let mut deleted = 0;
        for chunk in ids.chunks(ID_CHUNK) {
            let mut logs = QueryBuilder::<Sqlite>::new("DELETE FROM logs WHERE api_key_id IN (");
            push_bind_list(&mut logs, chunk);
            if let Err(err) = logs.build().execute(&self.pool).await {
                tracing::warn!(error = %err, keys = chunk.len(), "failed to delete logs for pruned keys");
            }

            let mut keys = QueryBuilder::<Sqlite>::new("DELETE FROM api_keys WHERE id IN (");
            push_bind_list(&mut keys, chunk);
            deleted += keys.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(deleted)
    }

    // ----- logs -----

    pub async fn insert_log(&self, entry: &NewLogEntry<'_>) -> Result<String, PoolError> {
        let id = nanoid!();
        sqlx::query(
            r#"
            INSERT INTO logs (
                id,
                timestamp,
                request_ip,
                request_path,
                api_key_id,
                status_code,
                response_time,
                model,
                input_tokens,
                output_tokens,
                total_tokens
            ) VALUES (
                ?, ?, ?, ?,
                (SELECT id FROM api_keys WHERE key = ?),
                ?, ?, ?, ?, ?, ?
            )
            "#,
        )
        .bind(&id)
        .bind(entry.timestamp)
        .bind(entry.request_ip)
        .bind(entry.request_path)
        .bind(entry.key_secret)
        .bind(entry.status_code)
        .bind(entry.response_time_ms)
        .bind(entry.model)
        .bind(entry.input_tokens)
        .bind(entry.output_tokens)
        .bind(entry.total_tokens)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn count_logs(&self) -> Result<i64, PoolError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn fetch_logs_page(&self, limit: i64, offset: i64) -> Result<Vec<LogRecord>, PoolError> {
        let rows = sqlx::query(
            r#"
            SELECT
                l.id,
                l.timestamp,
                l.request_ip,
                l.request_path,
                l.api_key_id,
                a.key AS used_key,
                l.status_code,
                l.response_time,
                l.model,
                l.input_tokens,
                l.output_tokens,
                l.total_tokens
            FROM logs l
            LEFT JOIN api_keys a ON l.api_key_id = a.id
            ORDER BY l.timestamp DESC, l.id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .into_iter()
            .map(|row| -> Result<LogRecord, sqlx::Error> {
                Ok(LogRecord {
                    id: row.try_get("id")?,
                    timestamp: row.try_get("timestamp")?,
                    request_ip: row.try_get("request_ip")?,
                    request_path: row.try_get("request_path")?,
                    api_key_id: row.try_get("api_key_id")?,
                    used_key: row.try_get("used_key")?,
                    status_code: row.try_get("status_code")?,
                    response_time_ms: row.try_get("response_time")?,
                    model: row.try_get("model")?,
                    input_tokens: row.try_get("input_tokens")?,
                    output_tokens: row.try_get("output_tokens")?,
                    total_tokens: row.try_get("total_tokens")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    pub async fn clear_logs(&self) -> Result<u64, PoolError> {
        let result = sqlx::query("DELETE FROM logs").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    pub async fn fetch_stats(&self) -> Result<PoolStats, PoolError> {
        let key_row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_keys,
                COALESCE(SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END), 0) AS active_keys,
                ROUND(COALESCE(SUM(CASE WHEN is_active = 1 THEN balance ELSE 0 END), 0), 4) AS total_balance
            FROM api_keys
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let log_row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_requests,
                COALESCE(SUM(total_tokens), 0) AS total_tokens
            FROM logs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(PoolStats {
            total_keys: key_row.try_get("total_keys")?,
            active_keys: key_row.try_get("active_keys")?,
            total_balance: key_row.try_get("total_balance")?,
            total_requests: log_row.try_get("total_requests")?,
            total_tokens: log_row.try_get("total_tokens")?,
        })
    }

    // ----- sessions -----

    pub async fn purge_expired_sessions(&self, now: i64) -> Result<u64, PoolError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_session(
        &self,
        id: &str,
        user_id: &str,
        created_at: i64,
        expires_at: i64,
        data: &str,
    ) -> Result<(), PoolError> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, created_at, expires_at, data) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(user_id)
        .bind(created_at)
        .bind(expires_at)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn session_is_live(&self, id: &str, now: i64) -> Result<bool, PoolError> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM sessions WHERE id = ? AND expires_at > ? LIMIT 1",
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), PoolError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ----- refresh runs (scratch blob store) -----

    pub async fn save_refresh_run(
        &self,
        id: &str,
        created_at: i64,
        payload: &str,
    ) -> Result<(), PoolError> {
        sqlx::query(
            r#"
            INSERT INTO refresh_runs (id, created_at, payload) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET created_at = excluded.created_at, payload = excluded.payload
            "#,
        )
        .bind(id)
        .bind(created_at)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_refresh_run(&self) -> Result<Option<RefreshRun>, PoolError> {
        let run = sqlx::query_as::<_, (String, i64, String)>(
            "SELECT id, created_at, payload FROM refresh_runs ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .map(|(id, created_at, payload)| RefreshRun {
            id,
            created_at,
            payload,
        });
        Ok(run)
    }
}

fn push_bind_list<'a>(builder: &mut QueryBuilder<'a, Sqlite>, values: &'a [String]) {
    {
        let mut separated = builder.separated(", ");
        for value in values {
            separated.push_bind(value.as_str());
        }
    }
    builder.push(")");
}

fn key_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ApiKeyRecord, sqlx::Error> {
    let model_access: Option<String> = row.try_get("model_access")?;
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        key: row.try_get("key")?,
        created_at: row.try_get("created_at")?,
        add_time: row.try_get("add_time")?,
        last_used_at: row.try_get("last_used_at")?,
        last_check_time: row.try_get("last_check_time")?,
        balance: row.try_get("balance")?,
        is_active: row.try_get("is_active")?,
        usage_count: row.try_get("usage_count")?,
        model_access: parse_model_access(model_access),
    })
}

fn parse_model_access(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}
