//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The session file location may be overridden with SESSION_FILE so the
//! same TOML can be shared between hosts with different state directories.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use session_auth::constants::{DEFAULT_ACCESS_TTL_SECS, LEGACY_SESSION_KEYS};
use session_pipeline::{DEFAULT_MAX_RESPONSE_BYTES, PipelineConfig};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub session: SessionConfig,
    pub gateway: GatewayConfig,
}

/// Compliance API endpoints
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    /// Login/refresh origin; defaults to `base_url`
    #[serde(default)]
    pub auth_base_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Cap on buffered upstream response bodies
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

/// Where and how the session is persisted
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    pub file: PathBuf,
    /// Keys older clients stored the session under, tried in order
    #[serde(default = "default_legacy_keys")]
    pub legacy_keys: Vec<String>,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,
}

/// Local HTTP listener
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_response_bytes() -> usize {
    DEFAULT_MAX_RESPONSE_BYTES
}

fn default_legacy_keys() -> Vec<String> {
    LEGACY_SESSION_KEYS.iter().map(|k| k.to_string()).collect()
}

fn default_access_ttl() -> u64 {
    DEFAULT_ACCESS_TTL_SECS
}

fn default_max_connections() -> usize {
    256
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        common::require_http_url("api.base_url", &config.api.base_url)?;
        if let Some(ref auth) = config.api.auth_base_url {
            common::require_http_url("api.auth_base_url", auth)?;
        }

        if config.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "api.timeout_secs must be greater than 0".into(),
            ));
        }

        if config.api.max_response_bytes == 0 {
            return Err(common::Error::Config(
                "api.max_response_bytes must be greater than 0".into(),
            ));
        }

        if config.session.access_ttl_secs == 0 {
            return Err(common::Error::Config(
                "session.access_ttl_secs must be greater than 0".into(),
            ));
        }

        if config.gateway.max_connections == 0 {
            return Err(common::Error::Config(
                "gateway.max_connections must be greater than 0".into(),
            ));
        }

        if let Ok(file) = std::env::var("SESSION_FILE")
            && !file.trim().is_empty()
        {
            config.session.file = PathBuf::from(file);
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("compliance-session-gateway.toml")
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let auth_base_url = self
            .api
            .auth_base_url
            .clone()
            .unwrap_or_else(|| self.api.base_url.clone());
        PipelineConfig::new(self.api.base_url.clone())
            .with_auth_base_url(auth_base_url)
            .with_timeout(Duration::from_secs(self.api.timeout_secs))
            .with_access_ttl(Duration::from_secs(self.session.access_ttl_secs))
            .with_max_response_bytes(self.api.max_response_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn valid_toml() -> &'static str {
        r#"
[api]
base_url = "https://grc.example.com/api"

[session]
file = "/var/lib/compliance/session.json"

[gateway]
listen_addr = "127.0.0.1:8080"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_valid_config_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("SESSION_FILE") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.api.base_url, "https://grc.example.com/api");
        assert!(config.api.auth_base_url.is_none());
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.session.file, PathBuf::from("/var/lib/compliance/session.json"));
        assert_eq!(config.session.legacy_keys, vec!["auth", "userSession", "currentUser"]);
        assert_eq!(config.session.access_ttl_secs, 900);
        assert_eq!(config.gateway.max_connections, 256);
    }

    #[test]
    fn test_pipeline_config_falls_back_to_api_origin_for_auth() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("SESSION_FILE") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let pipeline = Config::load(&path).unwrap().pipeline_config();
        assert_eq!(pipeline.auth_base_url, "https://grc.example.com/api");
        assert_eq!(pipeline.timeout, Duration::from_secs(30));
        assert_eq!(pipeline.access_ttl, Duration::from_secs(900));
        assert_eq!(pipeline.max_response_bytes, DEFAULT_MAX_RESPONSE_BYTES);
    }

    #[test]
    fn test_explicit_auth_origin_and_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("SESSION_FILE") };
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[api]
base_url = "https://grc.example.com/api"
auth_base_url = "https://sso.example.com"
timeout_secs = 10

[session]
file = "/tmp/session.json"
legacy_keys = ["oldSession"]
access_ttl_secs = 300

[gateway]
listen_addr = "0.0.0.0:9000"
max_connections = 32
"#,
        );

        let config = Config::load(&path).unwrap();
        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.auth_base_url, "https://sso.example.com");
        assert_eq!(pipeline.timeout, Duration::from_secs(10));
        assert_eq!(pipeline.access_ttl, Duration::from_secs(300));
        assert_eq!(config.session.legacy_keys, vec!["oldSession"]);
        assert_eq!(config.gateway.max_connections, 32);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_session_file_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env("SESSION_FILE", "/run/compliance/session.json") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("SESSION_FILE") };

        assert_eq!(config.session.file, PathBuf::from("/run/compliance/session.json"));
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[api]
base_url = "grc.example.com"

[session]
file = "/tmp/session.json"

[gateway]
listen_addr = "127.0.0.1:8080"
"#,
        );

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(
            err.contains("api.base_url must start with http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn test_invalid_auth_base_url_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[api]
base_url = "https://grc.example.com"
auth_base_url = "ftp://sso.example.com"

[session]
file = "/tmp/session.json"

[gateway]
listen_addr = "127.0.0.1:8080"
"#,
        );

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("api.auth_base_url"), "got: {err}");
    }

    #[test]
    fn test_zero_values_rejected() {
        let cases = [
            ("timeout_secs = 0", "", "", "api.timeout_secs"),
            ("max_response_bytes = 0", "", "", "api.max_response_bytes"),
            ("", "access_ttl_secs = 0", "", "session.access_ttl_secs"),
            ("", "", "max_connections = 0", "gateway.max_connections"),
        ];
        for (api, session, gateway, field) in cases {
            let dir = tempfile::tempdir().unwrap();
            let path = write_config(
                &dir,
                &format!(
                    r#"
[api]
base_url = "https://grc.example.com"
{api}

[session]
file = "/tmp/session.json"
{session}

[gateway]
listen_addr = "127.0.0.1:8080"
{gateway}
"#
                ),
            );
            let err = Config::load(&path).unwrap_err().to_string();
            assert!(err.contains(field), "expected {field} in: {err}");
        }
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("compliance-session-gateway.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
