use serde::Deserialize;

pub const DEFAULT_API_CACHE_PREFIXES: &[&str] = &["/api/storage/buckets", "/api/storage/backend"];

pub const DEFAULT_PRECACHE: &[&str] = &["/", "/index.html", "/favicon.svg", "/favicon.ico"];

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub port: u16,
    pub upstream_url: String,
    pub cache_dir: String,
    pub cache_version: String,
    pub api_cache_prefixes: Vec<String>,
    pub precache: Vec<String>,
    pub skip_waiting: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Config {
            port: std::env::var("SHELFD_PORT")
                .unwrap_or_else(|_| "8090".to_string())
                .parse()?,
            upstream_url: std::env::var("SHELFD_UPSTREAM_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            cache_dir: std::env::var("SHELFD_CACHE_DIR")
                .unwrap_or_else(|_| "./data/cache".to_string()),
            cache_version: std::env::var("SHELFD_CACHE_VERSION")
                .unwrap_or_else(|_| "v1.0.0".to_string()),
            api_cache_prefixes: std::env::var("SHELFD_API_CACHE_PREFIXES")
                .map(|v| split_list(&v))
                .unwrap_or_else(|_| to_owned(DEFAULT_API_CACHE_PREFIXES)),
            precache: std::env::var("SHELFD_PRECACHE")
                .map(|v| split_list(&v))
                .unwrap_or_else(|_| to_owned(DEFAULT_PRECACHE)),
            skip_waiting: parse_bool(
                &std::env::var("SHELFD_SKIP_WAITING").unwrap_or_else(|_| "true".to_string()),
            )?,
        })
    }
}

/// Comma-separated list, blanks dropped
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn to_owned(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid boolean: {}", other),
    }
}
