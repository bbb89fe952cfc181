use std::time::Duration;

const DEFAULT_API_BASE: &str = "http://localhost:8000";

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the generation service, without trailing slash.
    pub api_base: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub max_upload_bytes: usize,
    /// Sessions untouched for this long are closed by the sweeper.
    pub session_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let api_base = lookup("INTERIOR_API_BASE")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();
        let port: u16 = lookup("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080);
        let timeout_secs: u64 = lookup("REQUEST_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(60);
        let max_upload_mb: usize = lookup("MAX_UPLOAD_MB").and_then(|v| v.parse().ok()).unwrap_or(20);
        let session_ttl_secs: u64 = lookup("SESSION_TTL_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(30 * 60);

        Self {
            api_base,
            port,
            request_timeout: Duration::from_secs(timeout_secs),
            max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
            session_ttl: Duration::from_secs(session_ttl_secs),
        }
    }
}
