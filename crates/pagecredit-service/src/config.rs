//! Service configuration.

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

use pagecredit_core::PricingConfig;

/// Which storage backend the binary opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process maps; state is lost on restart.
    Memory,
    /// PostgreSQL via `DATABASE_URL`.
    Postgres,
    /// Embedded `RocksDB` under `DATA_DIR` (feature `rocksdb-backend`).
    RocksDb,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// Where rate limit counters live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitBackend {
    /// Per-instance counters.
    Local,
    /// Counters in the shared store, consistent across instances.
    Store,
}

impl FromStr for RateLimitBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "memory" => Ok(Self::Local),
            "store" | "shared" => Ok(Self::Store),
            other => Err(format!("unknown rate limit backend: {other}")),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Storage backend (default: memory).
    pub store_backend: StoreBackend,

    /// PostgreSQL connection string, required for the postgres backend.
    pub database_url: Option<String>,

    /// PostgreSQL pool size.
    pub database_max_connections: u32,

    /// Path to `RocksDB` data directory (default: "/data/pagecredit").
    pub data_dir: String,

    /// HS256 secret used to validate user JWTs. Without it user routes reject everyone.
    pub auth_jwt_secret: Option<String>,

    /// Expected JWT audience (default: "pagecredit").
    pub auth_audience: String,

    /// Service API key for service-to-service auth.
    pub service_api_key: Option<String>,

    /// Shared secret for Stripe webhook signatures.
    pub stripe_webhook_secret: Option<String>,

    /// Shared secret for PayPal webhook signatures.
    pub paypal_webhook_secret: Option<String>,

    /// Document engine endpoint. Without it a no-op processor is used.
    pub processor_url: Option<String>,

    /// Timeout for one processor call, in seconds.
    pub processor_timeout_seconds: u64,

    /// Requests allowed per identity per window.
    pub rate_limit_max_requests: u32,

    /// Rate limit window length in seconds.
    pub rate_limit_window_seconds: u64,

    /// Where rate limit counters live.
    pub rate_limit_backend: RateLimitBackend,

    /// Files processed concurrently per job.
    pub job_max_parallel_files: usize,

    /// Attempts per file before it is marked failed.
    pub job_max_file_attempts: u32,

    /// First retry delay in milliseconds (doubles per attempt).
    pub job_retry_base_ms: u64,

    /// Retry delay cap in milliseconds.
    pub job_retry_max_ms: u64,

    /// Maximum number of files in one job.
    pub job_max_files: usize,

    /// Identifies this process as the owner of the jobs it drives.
    pub instance_id: String,

    /// How long a job lease lasts without renewal, in seconds.
    pub job_lease_seconds: u64,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Plan table and per-operation costs.
    pub pricing: PricingConfig,
}

/// Webhook secrets file structure.
#[derive(Debug, Default, Deserialize)]
struct WebhookSecrets {
    #[serde(default)]
    stripe_webhook_secret: Option<String>,
    #[serde(default)]
    paypal_webhook_secret: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let (stripe_webhook_secret, paypal_webhook_secret) = load_webhook_secrets();

        let mut pricing = PricingConfig::default();
        if let Ok(extra) = std::env::var("PLAN_CREDITS") {
            merge_plans(&mut pricing, &extra);
        }

        Self {
            listen_addr: env_or("LISTEN_ADDR", defaults.listen_addr),
            store_backend: env_parse("STORE_BACKEND", defaults.store_backend),
            database_url: std::env::var("DATABASE_URL").ok(),
            database_max_connections: env_parse(
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            data_dir: env_or("DATA_DIR", defaults.data_dir),
            auth_jwt_secret: std::env::var("AUTH_JWT_SECRET").ok(),
            auth_audience: env_or("AUTH_AUDIENCE", defaults.auth_audience),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            stripe_webhook_secret,
            paypal_webhook_secret,
            processor_url: std::env::var("PROCESSOR_URL").ok(),
            processor_timeout_seconds: env_parse(
                "PROCESSOR_TIMEOUT_SECONDS",
                defaults.processor_timeout_seconds,
            ),
            rate_limit_max_requests: env_parse(
                "RATE_LIMIT_MAX_REQUESTS",
                defaults.rate_limit_max_requests,
            ),
            rate_limit_window_seconds: env_parse(
                "RATE_LIMIT_WINDOW_SECONDS",
                defaults.rate_limit_window_seconds,
            ),
            rate_limit_backend: env_parse("RATE_LIMIT_BACKEND", defaults.rate_limit_backend),
            job_max_parallel_files: env_parse(
                "JOB_MAX_PARALLEL_FILES",
                defaults.job_max_parallel_files,
            ),
            job_max_file_attempts: env_parse(
                "JOB_MAX_FILE_ATTEMPTS",
                defaults.job_max_file_attempts,
            ),
            job_retry_base_ms: env_parse("JOB_RETRY_BASE_MS", defaults.job_retry_base_ms),
            job_retry_max_ms: env_parse("JOB_RETRY_MAX_MS", defaults.job_retry_max_ms),
            job_max_files: env_parse("JOB_MAX_FILES", defaults.job_max_files),
            instance_id: env_or("INSTANCE_ID", defaults.instance_id),
            job_lease_seconds: env_parse("JOB_LEASE_SECONDS", defaults.job_lease_seconds),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_parse("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_parse(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
            pricing,
        }
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

/// Parse an environment variable, falling back to `default` when unset or invalid.
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = %name, value = %raw, "Ignoring invalid configuration value");
            default
        }),
        Err(_) => default,
    }
}

/// Merge `plan=credits,plan=credits` pairs into the plan table.
fn merge_plans(pricing: &mut PricingConfig, raw: &str) {
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        match pair.split_once('=') {
            Some((plan, credits)) => match credits.trim().parse::<i64>() {
                Ok(credits) if credits > 0 => {
                    pricing.plans.insert(plan.trim().to_string(), credits);
                }
                _ => tracing::warn!(entry = %pair, "Ignoring plan with invalid credits"),
            },
            None => tracing::warn!(entry = %pair, "Ignoring malformed plan entry"),
        }
    }
}

/// Load webhook secrets from file or environment.
fn load_webhook_secrets() -> (Option<String>, Option<String>) {
    let secret_paths = [
        ".secrets/webhooks.json",
        "pagecredit/.secrets/webhooks.json",
        "../.secrets/webhooks.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<WebhookSecrets>(path) {
            tracing::info!(path = %path, "Loaded webhook secrets from file");
            return (
                secrets
                    .stripe_webhook_secret
                    .or_else(|| std::env::var("STRIPE_WEBHOOK_SECRET").ok()),
                secrets
                    .paypal_webhook_secret
                    .or_else(|| std::env::var("PAYPAL_WEBHOOK_SECRET").ok()),
            );
        }
    }

    tracing::debug!("Webhook secrets file not found, using environment variables");
    (
        std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
        std::env::var("PAYPAL_WEBHOOK_SECRET").ok(),
    )
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            store_backend: StoreBackend::Memory,
            database_url: None,
            database_max_connections: 10,
            data_dir: "/data/pagecredit".into(),
            auth_jwt_secret: None,
            auth_audience: "pagecredit".into(),
            service_api_key: None,
            stripe_webhook_secret: None,
            paypal_webhook_secret: None,
            processor_url: None,
            processor_timeout_seconds: 120,
            rate_limit_max_requests: 10,
            rate_limit_window_seconds: 60,
            rate_limit_backend: RateLimitBackend::Local,
            job_max_parallel_files: 4,
            job_max_file_attempts: 3,
            job_retry_base_ms: 200,
            job_retry_max_ms: 5000,
            job_max_files: 100,
            instance_id: uuid::Uuid::new_v4().to_string(),
            job_lease_seconds: 30,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            pricing: PricingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backends() {
        assert_eq!("Postgres".parse::<StoreBackend>(), Ok(StoreBackend::Postgres));
        assert_eq!("rocksdb".parse::<StoreBackend>(), Ok(StoreBackend::RocksDb));
        assert!("mysql".parse::<StoreBackend>().is_err());
        assert_eq!("store".parse::<RateLimitBackend>(), Ok(RateLimitBackend::Store));
    }

    #[test]
    fn merge_plans_adds_and_overrides() {
        let mut pricing = PricingConfig::default();
        merge_plans(&mut pricing, "team_pack=2000, credits_100=120,broken,free=0");

        assert_eq!(pricing.plan_credits("team_pack"), Some(2000));
        assert_eq!(pricing.plan_credits("credits_100"), Some(120));
        assert_eq!(pricing.plan_credits("free"), None);
        assert_eq!(pricing.plan_credits("broken"), None);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.rate_limit_max_requests, 10);
        assert_eq!(config.rate_limit_window_seconds, 60);
        assert_eq!(config.job_max_parallel_files, 4);
        assert_eq!(config.job_max_file_attempts, 3);
        assert_eq!(config.job_max_files, 100);
        assert_eq!(config.job_lease_seconds, 30);
        assert_ne!(config.instance_id, ServiceConfig::default().instance_id);
    }
}
