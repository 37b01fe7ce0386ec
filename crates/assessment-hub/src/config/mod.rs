use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub storage: StorageConfig,
    pub assessments: AssessmentConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let upload_dir = env::var("APP_UPLOAD_DIR").unwrap_or_else(|_| "uploads".to_string());
        let max_upload_bytes = match env::var("APP_MAX_UPLOAD_BYTES") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|bytes| *bytes > 0)
                .ok_or(ConfigError::InvalidUploadLimit)?,
            Err(_) => DEFAULT_MAX_UPLOAD_BYTES,
        };
        let users_file = env::var("APP_USERS_FILE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);

        let name_prefix =
            env::var("APP_ASSESSMENT_NAME_PREFIX").unwrap_or_else(|_| "FY".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            storage: StorageConfig {
                upload_dir: PathBuf::from(upload_dir),
                max_upload_bytes,
                users_file,
            },
            assessments: AssessmentConfig { name_prefix },
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Where submission images and the seeded user directory live.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub users_file: Option<PathBuf>,
}

/// Naming rules for generated assessments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssessmentConfig {
    pub name_prefix: String,
}

impl Default for AssessmentConfig {
    fn default() -> Self {
        Self {
            name_prefix: "FY".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidUploadLimit,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidUploadLimit => {
                write!(f, "APP_MAX_UPLOAD_BYTES must be a positive integer")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidUploadLimit => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        env::remove_var("APP_ENV");
        env::remove_var("APP_HOST");
        env::remove_var("APP_PORT");
        env::remove_var("APP_LOG_LEVEL");
        env::remove_var("APP_UPLOAD_DIR");
        env::remove_var("APP_MAX_UPLOAD_BYTES");
        env::remove_var("APP_USERS_FILE");
        env::remove_var("APP_ASSESSMENT_NAME_PREFIX");
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.storage.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.storage.max_upload_bytes, 16 * 1024 * 1024);
        assert!(config.storage.users_file.is_none());
        assert_eq!(config.assessments.name_prefix, "FY");
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn rejects_zero_upload_limit() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_MAX_UPLOAD_BYTES", "0");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidUploadLimit)
        ));
        reset_env();
    }

    #[test]
    fn reads_storage_and_naming_overrides() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_UPLOAD_DIR", "/var/lib/assessments");
        env::set_var("APP_USERS_FILE", "users.json");
        env::set_var("APP_ASSESSMENT_NAME_PREFIX", "Budget");
        let config = AppConfig::load().expect("config loads");
        assert_eq!(
            config.storage.upload_dir,
            PathBuf::from("/var/lib/assessments")
        );
        assert_eq!(config.storage.users_file, Some(PathBuf::from("users.json")));
        assert_eq!(config.assessments.name_prefix, "Budget");
        reset_env();
    }
}
