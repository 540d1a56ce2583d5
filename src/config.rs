use serde::Deserialize;
use std::path::PathBuf;
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_WORKSPACE_BASE: &str = "/tmp/rag-eval-sessions";
const DEFAULT_SESSION_TTL_HOURS: i64 = 24;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_MAX_CONCURRENT_JUDGE: usize = 5;
const DEFAULT_MAX_CONCURRENT_SEARCH: usize = 3;
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_JUDGE_TIMEOUT: u64 = 60;
const DEFAULT_SEARCH_TIMEOUT: u64 = 30;
const DEFAULT_MAX_ROWS_PER_REQUEST: usize = 10_000;
const DEFAULT_JUDGE_MODEL: &str = "gpt-4";

/// Credentials for the retrieval-search API. Presence of the whole struct is
/// the "is configured" signal; no placeholder-string sentinels.
#[derive(Clone, Debug, Deserialize)]
pub struct SearchCredentials {
    pub domain: String,
    pub app_id: String,
    pub auth_token: String,
}

#[derive(Clone, Debug)]
pub struct JudgeCredentials {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

/// Which source a credential set was taken from, in consultation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Request,
    Environment,
}

impl std::fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialSource::Request => write!(f, "request"),
            CredentialSource::Environment => write!(f, "environment"),
        }
    }
}

/// Consult credential sources in priority order: the request's own config
/// first, then the shared environment-derived config. Falling back to the
/// shared config is legitimate but never silent, since the rest of the
/// system leans on per-session isolation.
pub fn resolve_search_credentials<'a>(
    request: Option<&'a SearchCredentials>,
    shared: Option<&'a SearchCredentials>,
) -> Option<(&'a SearchCredentials, CredentialSource)> {
    if let Some(creds) = request {
        info!(source = %CredentialSource::Request, "using session-supplied search credentials");
        return Some((creds, CredentialSource::Request));
    }
    if let Some(creds) = shared {
        warn!("request carried no search credentials, falling back to shared configuration");
        return Some((creds, CredentialSource::Environment));
    }
    None
}

/// Built once in `main` and passed by `Arc` into every component; never
/// reconstructed from ambient state mid-run.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub auth_token: Option<String>,
    pub workspace_base: PathBuf,
    pub session_ttl_hours: i64,
    pub reap_interval_secs: u64,
    pub max_concurrent_judge: usize,
    pub max_concurrent_search: usize,
    pub batch_size: usize,
    pub judge_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub max_rows_per_request: usize,
    pub search: Option<SearchCredentials>,
    pub judge: Option<JudgeCredentials>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            auth_token: std::env::var("AUTH_TOKEN").ok(),
            workspace_base: PathBuf::from(
                std::env::var("WORKSPACE_BASE").unwrap_or_else(|_| DEFAULT_WORKSPACE_BASE.into()),
            ),
            session_ttl_hours: env_parse("SESSION_TTL_HOURS", DEFAULT_SESSION_TTL_HOURS),
            reap_interval_secs: env_parse("REAP_INTERVAL_SECS", DEFAULT_REAP_INTERVAL_SECS),
            max_concurrent_judge: env_parse("MAX_CONCURRENT_JUDGE", DEFAULT_MAX_CONCURRENT_JUDGE)
                .max(1),
            max_concurrent_search: env_parse(
                "MAX_CONCURRENT_SEARCH",
                DEFAULT_MAX_CONCURRENT_SEARCH,
            )
            .max(1),
            batch_size: env_parse("BATCH_SIZE", DEFAULT_BATCH_SIZE).max(1),
            judge_timeout_secs: env_parse("JUDGE_TIMEOUT_SECS", DEFAULT_JUDGE_TIMEOUT),
            search_timeout_secs: env_parse("SEARCH_TIMEOUT_SECS", DEFAULT_SEARCH_TIMEOUT),
            max_rows_per_request: env_parse("MAX_ROWS_PER_REQUEST", DEFAULT_MAX_ROWS_PER_REQUEST),
            search: search_from_env(),
            judge: judge_from_env(),
        }
    }

    pub fn print_banner(&self) {
        tracing::info!("╔══════════════════════════════════════════════════╗");
        tracing::info!("║           rag-eval-server v{}                ║", env!("CARGO_PKG_VERSION"));
        tracing::info!("╠══════════════════════════════════════════════════╣");
        tracing::info!("║  Port:              {:<28}║", self.port);
        tracing::info!("║  Auth:              {:<28}║", if self.auth_token.is_some() { "enabled" } else { "disabled" });
        tracing::info!("║  Workspace:         {:<28}║", self.workspace_base.display());
        tracing::info!("║  Session TTL:       {:<25}h ║", self.session_ttl_hours);
        tracing::info!("║  Judge bound:       {:<28}║", self.max_concurrent_judge);
        tracing::info!("║  Search bound:      {:<28}║", self.max_concurrent_search);
        tracing::info!("║  Batch size:        {:<28}║", self.batch_size);
        tracing::info!("║  Judge timeout:     {:<25}s ║", self.judge_timeout_secs);
        tracing::info!("║  Search timeout:    {:<25}s ║", self.search_timeout_secs);
        tracing::info!("║  Search API:        {:<28}║", if self.search.is_some() { "configured" } else { "absent" });
        tracing::info!("║  Judge API:         {:<28}║", if self.judge.is_some() { "configured" } else { "absent" });
        tracing::info!("╚══════════════════════════════════════════════════╝");
    }
}

fn search_from_env() -> Option<SearchCredentials> {
    let domain = std::env::var("SEARCH_DOMAIN").ok();
    let app_id = std::env::var("SEARCH_APP_ID").ok();
    let auth_token = std::env::var("SEARCH_AUTH_TOKEN").ok();

    let present = [&domain, &app_id, &auth_token]
        .iter()
        .filter(|v| v.is_some())
        .count();
    match (domain, app_id, auth_token) {
        (Some(domain), Some(app_id), Some(auth_token)) => Some(SearchCredentials {
            domain,
            app_id,
            auth_token,
        }),
        _ => {
            if present > 0 {
                warn!("incomplete search credentials in environment, search backfill disabled");
            }
            None
        }
    }
}

fn judge_from_env() -> Option<JudgeCredentials> {
    let endpoint = std::env::var("JUDGE_ENDPOINT").ok()?;
    let api_key = std::env::var("JUDGE_API_KEY").ok()?;
    Some(JudgeCredentials {
        endpoint,
        api_key,
        model: std::env::var("JUDGE_MODEL").unwrap_or_else(|_| DEFAULT_JUDGE_MODEL.into()),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
