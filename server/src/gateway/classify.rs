/// How an intercepted request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    NetworkFirst,
    CacheFirst,
    PassThrough,
}

pub const STATIC_EXTENSIONS: &[&str] = &[
    ".html", ".css", ".js", ".svg", ".ico", ".png", ".jpg", ".jpeg",
];

pub struct Classifier {
    api_prefixes: Vec<String>,
}

impl Classifier {
    pub fn new(api_prefixes: Vec<String>) -> Self {
        Self { api_prefixes }
    }

    /// First match wins: API allowlist, then static assets
    pub fn classify(&self, path: &str) -> Policy {
        if self.api_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            Policy::NetworkFirst
        } else if path == "/" || STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            Policy::CacheFirst
        } else {
            Policy::PassThrough
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_API_CACHE_PREFIXES;

    fn classifier() -> Classifier {
        Classifier::new(DEFAULT_API_CACHE_PREFIXES.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_api_allowlist() {
        let c = classifier();
        assert_eq!(c.classify("/api/storage/buckets"), Policy::NetworkFirst);
        assert_eq!(c.classify("/api/storage/backend"), Policy::NetworkFirst);
        assert_eq!(c.classify("/api/storage/files/list"), Policy::PassThrough);
        assert_eq!(c.classify("/api/storage/download"), Policy::PassThrough);
    }

    #[test]
    fn test_static_assets() {
        let c = classifier();
        assert_eq!(c.classify("/"), Policy::CacheFirst);
        assert_eq!(c.classify("/index.html"), Policy::CacheFirst);
        assert_eq!(c.classify("/js/app.js"), Policy::CacheFirst);
        assert_eq!(c.classify("/favicon.ico"), Policy::CacheFirst);
        assert_eq!(c.classify("/photo.jpeg"), Policy::CacheFirst);
        assert_eq!(c.classify("/data.json"), Policy::PassThrough);
        assert_eq!(c.classify("/docs"), Policy::PassThrough);
    }

    #[test]
    fn test_allowlist_wins_over_extension() {
        let c = classifier();
        assert_eq!(c.classify("/api/storage/buckets/logo.png"), Policy::NetworkFirst);
    }
}
