use std::time::Duration;

/// 默认上游 API 根地址。
pub const DEFAULT_UPSTREAM: &str = "https://api.siliconflow.cn";

pub const DEFAULT_REFRESH_BATCH_SIZE: usize = 5;
pub const DEFAULT_REFRESH_DELAY_MS: u64 = 1_000;
pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 20;
pub const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// 运行期可调参数，由 CLI/环境变量组装后交给 [`crate::KeyPool`]。
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub upstream: String,
    pub database_path: String,
    /// 池中没有可用 key 时的兜底 key，不参与统计。
    pub default_key: Option<String>,
    pub refresh_batch_size: usize,
    pub refresh_delay: Duration,
    pub import_batch_size: usize,
    pub validate_timeout: Duration,
    pub models_timeout: Duration,
    pub session_ttl_secs: i64,
    /// 未配置时管理登录一律拒绝。
    pub admin: Option<AdminCredentials>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl PoolSettings {
    pub fn new(upstream: impl Into<String>, database_path: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            database_path: database_path.into(),
            default_key: None,
            refresh_batch_size: DEFAULT_REFRESH_BATCH_SIZE,
            refresh_delay: Duration::from_millis(DEFAULT_REFRESH_DELAY_MS),
            import_batch_size: DEFAULT_IMPORT_BATCH_SIZE,
            validate_timeout: Duration::from_secs(10),
            models_timeout: Duration::from_secs(30),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            admin: None,
        }
    }

    pub fn with_default_key(mut self, key: Option<String>) -> Self {
        self.default_key = key
            .map(|k| k.trim().to_owned())
            .filter(|k| !k.is_empty());
        self
    }

    pub fn with_admin(mut self, username: String, password: Option<String>) -> Self {
        self.admin = password
            .filter(|p| !p.is_empty())
            .map(|password| AdminCredentials { username, password });
        self
    }
}
