use std::{net::SocketAddr, sync::Arc};

use axum::http::header::{AUTHORIZATION, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::response::IntoResponse;
use axum::{
    Router,
    body::{self, Body},
    extract::{ConnectInfo, FromRequestParts, Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, Request, Response, StatusCode, request::Parts},
    response::Json,
    routing::{any, delete, get, post},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use flowpool::{
    ApiKeyRecord, KeyPool, LogRecord, PoolError, PoolStats, ProxyBody, ProxyRequest,
    ProxyResponse, RefreshReport, format_balance,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;

const SESSION_COOKIE: &str = "session";
const BODY_LIMIT: usize = 16 * 1024 * 1024; // 16 MiB 默认限制

#[derive(Clone)]
pub struct AppState {
    pool: KeyPool,
    /// 代理入口要求的 Bearer token；未配置则不校验。
    access_token: Option<String>,
    /// Only behind a trusted reverse proxy may cf-connecting-ip / x-forwarded-for
    /// stand in for the peer address.
    trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(pool: KeyPool, access_token: Option<String>) -> Self {
        Self {
            pool,
            access_token: access_token.filter(|t| !t.trim().is_empty()),
            trust_proxy_headers: false,
        }
    }

    pub fn with_trusted_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    fn proxy_authorized(&self, headers: &HeaderMap) -> bool {
        match self.access_token.as_deref() {
            None => true,
            Some(expected) => bearer_token(headers)
                .is_some_and(|token| token.as_bytes().ct_eq(expected.as_bytes()).into()),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/login", post(login))
        .route("/logout", get(logout).post(logout))
        .route("/api/key", get(pick_key))
        .route("/api/stats", get(get_stats))
        .route("/api/logs", get(list_logs))
        .route("/api/logs/clear", post(clear_logs))
        .route("/api/keys", get(list_keys).post(import_keys))
        .route("/api/keys/export", get(export_keys))
        .route("/api/keys/refresh", post(refresh_all))
        .route("/api/keys/refresh/background", post(refresh_background))
        .route("/api/keys/refresh/latest", get(latest_refresh))
        .route("/api/keys/refresh/batch", post(refresh_batch))
        .route("/api/keys/status", post(update_keys_status))
        .route("/api/keys/prune", post(prune_keys))
        .route("/api/keys/:id", delete(delete_key))
        .route("/api/keys/:id/refresh", post(refresh_key))
        .route("/api/keys/:id/status", post(update_key_status))
        .route("/v1/models", get(models_handler))
        .route("/v1/*path", any(proxy_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), Box<dyn std::error::Error>> {
    if !state.pool.admin_enabled() {
        tracing::warn!("ADMIN_PASSWORD not set; admin API is locked");
    }
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    tracing::info!("key pool proxy listening on http://{bound_addr}");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn health_check() -> &'static str {
    "ok"
}

// ----- errors -----

/// 管理接口错误：`{success:false, message}`。
struct AdminError {
    status: StatusCode,
    message: String,
}

impl AdminError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }
}

impl From<PoolError> for AdminError {
    fn from(err: PoolError) -> Self {
        let status = match &err {
            PoolError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PoolError::KeyNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "admin request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for AdminError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, rejection.body_text())
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(json!({ "success": false, "message": self.message })),
        )
            .into_response()
    }
}

fn proxy_error(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    (status, Json(json!({ "error": { "message": message.into() } }))).into_response()
}

// ----- sessions -----

/// 已登录的管理会话（cookie 中的 session id）。
struct AdminSession;

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminSession {
    type Rejection = AdminError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let Some(session_id) = jar.get(SESSION_COOKIE).map(|c| c.value().to_owned()) else {
            return Err(AdminError::unauthorized());
        };
        if state.pool.validate_session(&session_id).await? {
            Ok(AdminSession)
        } else {
            Err(AdminError::unauthorized())
        }
    }
}

fn session_cookie(value: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Strict)
        .build()
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(CookieJar, Json<Value>), AdminError> {
    let Json(payload) = payload?;
    match state
        .pool
        .login(payload.username.trim(), &payload.password)
        .await?
    {
        Some(session_id) => Ok((
            jar.add(session_cookie(session_id)),
            Json(json!({ "success": true, "message": "logged in" })),
        )),
        None => Err(AdminError::new(
            StatusCode::UNAUTHORIZED,
            "invalid username or password",
        )),
    }
}

async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> (CookieJar, Json<Value>) {
    if let Some(cookie) = jar.get(SESSION_COOKIE)
        && let Err(err) = state.pool.logout(cookie.value()).await
    {
        tracing::warn!(error = %err, "failed to delete session");
    }
    (
        jar.remove(session_cookie(String::new())),
        Json(json!({ "success": true })),
    )
}

// ----- admin: stats & logs -----

async fn get_stats(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsView>, AdminError> {
    Ok(Json(state.pool.stats().await?.into()))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    page: Option<i64>,
    limit: Option<i64>,
}

async fn list_logs(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsQuery>,
) -> Result<Json<LogsView>, AdminError> {
    let page = state
        .pool
        .logs_page(
            params.page.unwrap_or(1),
            params.limit.unwrap_or(flowpool::DEFAULT_LOG_PAGE_SIZE),
        )
        .await?;
    Ok(Json(LogsView {
        logs: page.logs.into_iter().map(LogView::from).collect(),
        total: page.total,
        page: page.page,
        page_size: page.page_size,
    }))
}

async fn clear_logs(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AdminError> {
    let deleted = state.pool.clear_logs().await?;
    tracing::info!(deleted, "logs cleared");
    Ok(Json(
        json!({ "success": true, "message": "logs cleared", "deleted_count": deleted }),
    ))
}

// ----- admin: keys -----

async fn list_keys(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Json<KeysView>, AdminError> {
    let keys = state.pool.list_keys().await?;
    Ok(Json(KeysView::from(keys)))
}

async fn export_keys(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Json<KeysView>, AdminError> {
    let keys = state.pool.export_keys().await?;
    Ok(Json(KeysView::from(keys)))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    keys: Vec<String>,
}

async fn import_keys(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ImportRequest>, JsonRejection>,
) -> Result<Json<ImportView>, AdminError> {
    let Json(payload) = payload?;
    let summary = state.pool.import_keys(&payload.keys).await?;
    Ok(Json(ImportView {
        success: true,
        total: summary.stats.total,
        imported: summary.stats.imported,
        duplicates: summary.stats.duplicates,
        invalid: summary.stats.invalid,
        total_keys: summary.pool.total_keys,
        active_keys: summary.pool.active_keys,
        total_balance: format_balance(summary.pool.total_balance),
    }))
}

async fn refresh_all(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshView>, AdminError> {
    let report = state.pool.refresh_all().await?;
    refresh_view(&state, report).await
}

async fn refresh_background(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AdminError> {
    let queued = state.pool.start_background_refresh().await?;
    Ok(Json(json!({
        "success": true,
        "total": queued.total,
        "run_id": queued.run_id,
    })))
}

async fn latest_refresh(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AdminError> {
    match state.pool.latest_refresh().await? {
        Some(latest) => Ok(Json(json!({ "success": true, "latest": latest }))),
        None => Err(AdminError::new(
            StatusCode::NOT_FOUND,
            "no background refresh has completed yet",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct KeyIdsRequest {
    #[serde(default)]
    key_ids: Vec<String>,
}

async fn refresh_batch(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<KeyIdsRequest>, JsonRejection>,
) -> Result<Json<RefreshView>, AdminError> {
    let Json(payload) = payload?;
    let report = state.pool.refresh_keys(&payload.key_ids).await?;
    refresh_view(&state, report).await
}

async fn refresh_key(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AdminError> {
    let outcome = state.pool.refresh_key(&id).await?;
    Ok(Json(json!({ "success": true, "result": outcome })))
}

#[derive(Debug, Deserialize)]
struct KeyStatusRequest {
    is_active: bool,
}

async fn update_key_status(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    payload: Result<Json<KeyStatusRequest>, JsonRejection>,
) -> Result<Json<Value>, AdminError> {
    let Json(payload) = payload?;
    state.pool.set_key_active(&id, payload.is_active).await?;
    Ok(Json(
        json!({ "success": true, "id": id, "is_active": payload.is_active }),
    ))
}

#[derive(Debug, Deserialize)]
struct KeysStatusRequest {
    #[serde(default)]
    key_ids: Vec<String>,
    is_active: bool,
}

async fn update_keys_status(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<KeysStatusRequest>, JsonRejection>,
) -> Result<Json<Value>, AdminError> {
    let Json(payload) = payload?;
    let updated = state
        .pool
        .set_keys_active(&payload.key_ids, payload.is_active)
        .await?;
    Ok(Json(json!({ "success": true, "updated_count": updated })))
}

async fn delete_key(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AdminError> {
    state.pool.delete_key(&id).await?;
    Ok(Json(json!({ "success": true, "id": id })))
}

async fn prune_keys(
    _session: AdminSession,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, AdminError> {
    let deleted = state.pool.prune_zero_balance().await?;
    Ok(Json(json!({ "success": true, "deleted_count": deleted })))
}

async fn refresh_view(
    state: &AppState,
    report: RefreshReport,
) -> Result<Json<RefreshView>, AdminError> {
    let stats = state.pool.stats().await?;
    Ok(Json(RefreshView {
        success: true,
        report,
        stats: stats.into(),
    }))
}

// ----- proxy -----

#[derive(Debug, Deserialize)]
struct PickKeyQuery {
    exclude: Option<String>,
}

/// 直接下发一个池内 key，供自行直连上游的客户端使用。
async fn pick_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<PickKeyQuery>,
) -> Response<Body> {
    if !state.proxy_authorized(&headers) {
        return proxy_error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    match state.pool.select_key(params.exclude.as_deref()).await {
        Ok(selected) => Json(json!({ "key": selected.secret })).into_response(),
        Err(err) => proxy_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn models_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response<Body> {
    forward_inbound(&state, connect_info, req, true).await
}

async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response<Body> {
    forward_inbound(&state, connect_info, req, false).await
}

async fn forward_inbound(
    state: &AppState,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
    models: bool,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    if !state.proxy_authorized(&parts.headers) {
        return proxy_error(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    let client_ip = client_ip(
        &parts.headers,
        connect_info.map(|ConnectInfo(addr)| addr),
        state.trust_proxy_headers,
    );
    let body_bytes = match body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => return proxy_error(StatusCode::BAD_REQUEST, format!("invalid body: {err}")),
    };

    let request = ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_owned(),
        query: parts.uri.query().map(str::to_owned),
        headers: parts.headers,
        body: body_bytes,
        client_ip,
    };

    let result = if models {
        state.pool.forward_models(request).await
    } else {
        state.pool.forward(request).await
    };
    match result {
        Ok(resp) => build_response(resp),
        Err(err) => {
            tracing::error!(error = %err, "proxy error");
            proxy_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_headers: bool) -> Option<String> {
    let peer_ip = peer.map(|addr| addr.ip().to_string());
    if !trust_headers {
        return peer_ip;
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };
    header("cf-connecting-ip")
        .or_else(|| header("x-forwarded-for"))
        .or(peer_ip)
}

fn build_response(resp: ProxyResponse) -> Response<Body> {
    let mut builder = Response::builder().status(resp.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in resp.headers.iter() {
            if name == TRANSFER_ENCODING || name == CONNECTION || name == CONTENT_LENGTH {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let ProxyBody::Buffered(bytes) = &resp.body {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
        }
    }
    let body = match resp.body {
        ProxyBody::Buffered(bytes) => Body::from(bytes),
        ProxyBody::Streaming(stream) => Body::from_stream(stream),
    };
    builder.body(body).unwrap_or_else(|err| {
        tracing::error!(error = %err, "failed to build proxy response");
        proxy_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response")
    })
}

// ----- views -----

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsView {
    total_keys: i64,
    active_keys: i64,
    total_requests: i64,
    total_tokens: i64,
    total_balance: String,
}

impl From<PoolStats> for StatsView {
    fn from(stats: PoolStats) -> Self {
        Self {
            total_keys: stats.total_keys,
            active_keys: stats.active_keys,
            total_requests: stats.total_requests,
            total_tokens: stats.total_tokens,
            total_balance: format_balance(stats.total_balance),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImportView {
    success: bool,
    total: usize,
    imported: usize,
    duplicates: usize,
    invalid: usize,
    total_keys: i64,
    active_keys: i64,
    total_balance: String,
}

#[derive(Debug, Serialize)]
struct RefreshView {
    success: bool,
    #[serde(flatten)]
    report: RefreshReport,
    stats: StatsView,
}

#[derive(Debug, Serialize)]
struct KeyView {
    id: String,
    key: String,
    created_at: i64,
    add_time: i64,
    last_used_at: Option<i64>,
    last_check_time: Option<i64>,
    balance: f64,
    is_active: bool,
    usage_count: i64,
    model_access: Vec<String>,
}

impl From<ApiKeyRecord> for KeyView {
    fn from(record: ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            key: record.key,
            created_at: record.created_at,
            add_time: record.add_time,
            last_used_at: record.last_used_at,
            last_check_time: record.last_check_time,
            balance: record.balance,
            is_active: record.is_active,
            usage_count: record.usage_count,
            model_access: record.model_access,
        }
    }
}

#[derive(Debug, Serialize)]
struct KeysView {
    keys: Vec<KeyView>,
}

impl From<Vec<ApiKeyRecord>> for KeysView {
    fn from(keys: Vec<ApiKeyRecord>) -> Self {
        Self {
            keys: keys.into_iter().map(KeyView::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct LogView {
    id: String,
    used_key: String,
    api_key_id: Option<String>,
    model: String,
    call_time: i64,
    request_ip: Option<String>,
    request_path: Option<String>,
    status_code: Option<i64>,
    response_time: Option<i64>,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
}

impl From<LogRecord> for LogView {
    fn from(record: LogRecord) -> Self {
        Self {
            id: record.id,
            used_key: record.used_key.unwrap_or_default(),
            api_key_id: record.api_key_id,
            model: record.model.unwrap_or_default(),
            call_time: record.timestamp.div_euclid(1_000),
            request_ip: record.request_ip,
            request_path: record.request_path,
            status_code: record.status_code,
            response_time: record.response_time_ms,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            total_tokens: record.total_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
struct LogsView {
    logs: Vec<LogView>,
    total: i64,
    page: i64,
    page_size: i64,
}
