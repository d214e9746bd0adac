use crate::listing::DEFAULT_PAGE_SIZE;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_SEARCH_LIMIT: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_url: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_search_limit")]
    pub search_limit: u32,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_search_limit() -> u32 {
    DEFAULT_SEARCH_LIMIT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            page_size: DEFAULT_PAGE_SIZE,
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl Config {
    pub fn config_path() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "shelf", "shelf")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        let config_dir = proj_dirs.config_dir();
        std::fs::create_dir_all(config_dir)?;

        Ok(config_dir.join("config.toml"))
    }

    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Self::parse(&content)
        } else {
            Ok(Config::default())
        }
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn require_server(&self) -> anyhow::Result<&str> {
        match &self.server_url {
            Some(url) => Ok(url),
            None => anyhow::bail!("No server configured. Run: shelf connect <url>"),
        }
    }
}

/// Add a scheme when the user typed a bare host
pub fn normalize_server_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::parse(r#"server_url = "http://localhost:8080""#).unwrap();
        assert_eq!(config.server_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.search_limit, DEFAULT_SEARCH_LIMIT);
    }

    #[test]
    fn test_require_server() {
        assert!(Config::default().require_server().is_err());
    }

    #[test]
    fn test_normalize_server_url() {
        assert_eq!(normalize_server_url("localhost:8080/"), "http://localhost:8080");
        assert_eq!(normalize_server_url("https://s3.example.com"), "https://s3.example.com");
    }
}
