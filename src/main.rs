mod server;

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use flowpool::{
    DEFAULT_UPSTREAM, KeyPool, PoolError, PoolSettings,
    settings::{
        DEFAULT_IMPORT_BATCH_SIZE, DEFAULT_REFRESH_BATCH_SIZE, DEFAULT_REFRESH_DELAY_MS,
        DEFAULT_SESSION_TTL_SECS,
    },
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(author, version, about = "Key-pool proxy for an OpenAI-compatible inference API")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP proxy and admin API.
    Serve(ServeArgs),
    /// Revalidate every stored key once and print the report.
    Refresh(PoolArgs),
}

#[derive(Debug, Args)]
struct PoolArgs {
    /// Upstream API base URL.
    #[arg(long, env = "UPSTREAM_BASE_URL", default_value = DEFAULT_UPSTREAM)]
    upstream: String,

    /// SQLite database path used to persist keys, logs and sessions.
    #[arg(long, env = "POOL_DB_PATH", default_value = "flowpool.db")]
    db_path: String,

    /// Fallback key used when the pool has no active key.
    #[arg(long, env = "POOL_DEFAULT_KEY", hide_env_values = true, hide = true)]
    default_key: Option<String>,

    /// Keys validated concurrently per refresh batch.
    #[arg(long, env = "REFRESH_BATCH_SIZE", default_value_t = DEFAULT_REFRESH_BATCH_SIZE)]
    refresh_batch_size: usize,

    /// Pause between refresh batches, in milliseconds.
    #[arg(long, env = "REFRESH_DELAY_MS", default_value_t = DEFAULT_REFRESH_DELAY_MS)]
    refresh_delay_ms: u64,

    /// Keys validated concurrently per import batch.
    #[arg(long, env = "IMPORT_BATCH_SIZE", default_value_t = DEFAULT_IMPORT_BATCH_SIZE)]
    import_batch_size: usize,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[command(flatten)]
    pool: PoolArgs,

    /// Address to bind the proxy to.
    #[arg(long, env = "POOL_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the proxy to.
    #[arg(long, env = "POOL_PORT", default_value_t = 8787)]
    port: u16,

    /// Bearer token callers must present on /v1/*; open when unset.
    #[arg(long, env = "POOL_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// Take the client address from cf-connecting-ip / x-forwarded-for.
    #[arg(long, env = "TRUST_PROXY_HEADERS", default_value_t = false)]
    trust_proxy_headers: bool,

    /// Admin login name.
    #[arg(long, env = "ADMIN_USERNAME", default_value = "admin")]
    admin_username: String,

    /// Admin login password; the admin API stays locked without it.
    #[arg(long, env = "ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: Option<String>,

    /// Admin session lifetime in seconds.
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = DEFAULT_SESSION_TTL_SECS)]
    session_ttl_secs: i64,
}

impl PoolArgs {
    fn settings(&self) -> PoolSettings {
        let mut settings = PoolSettings::new(&self.upstream, &self.db_path)
            .with_default_key(self.default_key.clone());
        settings.refresh_batch_size = self.refresh_batch_size;
        settings.refresh_delay = Duration::from_millis(self.refresh_delay_ms);
        settings.import_batch_size = self.import_batch_size;
        settings
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => run_server(args).await?,
        Command::Refresh(args) => {
            if let Err(err) = run_refresh(args).await {
                report_error(&err);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "flowpool=info,tower_http=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = args
        .pool
        .settings()
        .with_admin(args.admin_username.trim().to_owned(), args.admin_password);
    settings.session_ttl_secs = args.session_ttl_secs;

    let pool = KeyPool::new(settings).await?;
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let state = server::AppState::new(pool, args.access_token)
        .with_trusted_proxy_headers(args.trust_proxy_headers);
    server::serve(addr, state).await
}

async fn run_refresh(args: PoolArgs) -> Result<(), PoolError> {
    let pool = KeyPool::new(args.settings()).await?;
    let report = pool.refresh_all().await?;
    let stats = pool.stats().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    println!(
        "keys: {} total, {} active, balance {}",
        stats.total_keys,
        stats.active_keys,
        flowpool::format_balance(stats.total_balance)
    );
    Ok(())
}

fn report_error(err: &PoolError) {
    eprintln!("error: {err}");
    match err {
        PoolError::Database(db_err) => {
            eprintln!("  database: {db_err}");
        }
        PoolError::InvalidEndpoint { endpoint, .. } => {
            eprintln!("  endpoint: {endpoint}");
        }
        _ => {}
    }
}
