use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address to bind (default: 0.0.0.0)
    pub server_host: String,

    /// Port to bind (default: 8080)
    pub server_port: u16,

    /// Static assets and the page templates (default: ./resources)
    pub doc_root: PathBuf,

    /// Where uploads are stored and served from (default: <doc_root>/uploads)
    pub upload_dir: PathBuf,

    /// Worker threads running the request state machine (default: CPU count)
    pub worker_threads: usize,

    /// Ready-queue depth; submissions beyond it are refused (default: 10000)
    pub max_requests: usize,

    /// Connection table capacity (default: 10000)
    pub max_connections: usize,

    /// Initial per-connection read buffer in bytes (default: 2048)
    pub read_buffer_size: usize,

    /// Largest accepted request body in bytes (default: 10MB)
    pub max_upload_size: usize,

    /// Close connections idle in the read state this long; 0 disables (default: 60)
    pub idle_timeout_secs: u64,

    /// Upper bound on one readiness wait in milliseconds (default: 500)
    pub poll_interval_ms: u64,

    /// Pin worker threads to CPU cores (default: false)
    pub pin_workers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let doc_root = PathBuf::from(
            lookup("DOC_ROOT").unwrap_or_else(|| "./resources".to_string()),
        );
        let upload_dir = lookup("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| doc_root.join("uploads"));

        Config {
            server_host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            server_port: parse_or(&lookup, "SERVER_PORT", 8080),
            doc_root,
            upload_dir,
            worker_threads: parse_or(&lookup, "WORKER_THREADS", num_cpus::get()),
            max_requests: parse_or(&lookup, "MAX_REQUESTS", 10_000),
            max_connections: parse_or(&lookup, "MAX_CONNECTIONS", 10_000),
            read_buffer_size: parse_or(&lookup, "READ_BUFFER_SIZE", 2048),
            max_upload_size: parse_or(&lookup, "MAX_UPLOAD_SIZE", 10_485_760), // 10MB
            idle_timeout_secs: parse_or(&lookup, "IDLE_TIMEOUT_SECS", 60),
            poll_interval_ms: parse_or(&lookup, "POLL_INTERVAL_MS", 500),
            pin_workers: lookup("PIN_WORKERS").is_some_and(|v| {
                matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes")
            }),
        }
    }

    /// Get the full server address.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

fn parse_or<T: FromStr + Copy + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, %default, "invalid value, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config.server_addr(), "0.0.0.0:8080");
        assert_eq!(config.doc_root, PathBuf::from("./resources"));
        assert_eq!(config.upload_dir, PathBuf::from("./resources/uploads"));
        assert_eq!(config.max_requests, 10_000);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.read_buffer_size, 2048);
        assert_eq!(config.max_upload_size, 10_485_760);
        assert_eq!(config.idle_timeout_secs, 60);
        assert!(config.worker_threads >= 1);
        assert!(!config.pin_workers);
    }

    #[test]
    fn upload_dir_follows_doc_root_unless_set() {
        let config = from_pairs(&[("DOC_ROOT", "/srv/www")]);
        assert_eq!(config.upload_dir, PathBuf::from("/srv/www/uploads"));

        let config = from_pairs(&[("DOC_ROOT", "/srv/www"), ("UPLOAD_DIR", "/var/uploads")]);
        assert_eq!(config.upload_dir, PathBuf::from("/var/uploads"));
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let config = from_pairs(&[
            ("SERVER_PORT", "99999"),
            ("WORKER_THREADS", "many"),
            ("IDLE_TIMEOUT_SECS", " 5 "),
            ("PIN_WORKERS", "Yes"),
        ]);
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.worker_threads, num_cpus::get());
        assert_eq!(config.idle_timeout_secs, 5);
        assert!(config.pin_workers);
    }
}
