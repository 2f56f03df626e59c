//! Harness configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{E2eError, E2eResult};
use crate::playwright::PlaywrightConfig;

/// Environment variable naming a YAML config file for [`HarnessConfig::from_env`]
pub const CONFIG_ENV_VAR: &str = "E2E_CONFIG";

/// Full configuration of a per-test environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub backend: BackendConfig,
    pub frontend: FrontendConfig,
    pub users: UserConfig,
    pub login: LoginConfig,
    pub browser: PlaywrightConfig,

    /// Directory receiving one `<test name>.log` file per test
    pub log_dir: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            frontend: FrontendConfig::default(),
            users: UserConfig::default(),
            login: LoginConfig::default(),
            browser: PlaywrightConfig::default(),
            log_dir: PathBuf::from("test-results/logs"),
        }
    }
}

impl HarnessConfig {
    /// Parse a config from YAML
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> E2eResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_yaml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from the file named by `E2E_CONFIG`, or defaults
    pub fn from_env() -> E2eResult<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> E2eResult<()> {
        if self.backend.build_command.is_empty() {
            return Err(E2eError::Config("backend.build_command is empty".into()));
        }
        if self.frontend.command.is_empty() {
            return Err(E2eError::Config("frontend.command is empty".into()));
        }
        if self.users.retry_attempts == 0 {
            return Err(E2eError::Config("users.retry_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Backend (spawn_test_server) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend crate root; build commands run here
    pub root: PathBuf,

    /// Binary path, relative to `root` unless absolute
    pub binary: PathBuf,

    /// Extra arguments passed to the binary
    pub args: Vec<String>,

    /// Command used to build the binary when it is missing
    pub build_command: Vec<String>,

    /// Set `TEST_LOG` so the backend traces to stdout
    pub verbose: bool,

    #[serde(with = "duration_ms")]
    pub announce_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub announce_interval: Duration,

    pub health_path: String,

    #[serde(with = "duration_ms")]
    pub health_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub health_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".."),
            binary: PathBuf::from("target/release/spawn_test_server"),
            args: Vec::new(),
            build_command: [
                "cargo",
                "build",
                "--bin",
                "spawn_test_server",
                "--features",
                "e2e-tests",
                "--release",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            verbose: false,
            announce_timeout: Duration::from_secs(30),
            announce_interval: Duration::from_millis(100),
            health_path: "/health_check".to_string(),
            health_timeout: Duration::from_secs(30),
            health_interval: Duration::from_millis(500),
        }
    }
}

/// Frontend dev-server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontendConfig {
    /// Working directory of the dev server
    pub dir: PathBuf,

    /// Program and arguments
    pub command: Vec<String>,

    /// Token that appears in the output once the server is up
    pub ready_marker: String,

    #[serde(with = "duration_ms")]
    pub ready_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub port_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,

    /// Fixed pause after the probe so client-side hydration can finish
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            command: vec!["npm".to_string(), "run".to_string(), "dev".to_string()],
            ready_marker: "ready".to_string(),
            ready_timeout: Duration::from_secs(10),
            port_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_secs(12),
            probe_interval: Duration::from_millis(250),
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// User provisioning settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub create_path: String,
    pub exists_path: String,

    pub retry_attempts: u32,

    #[serde(with = "duration_ms")]
    pub retry_base_delay: Duration,

    pub visibility_attempts: usize,

    #[serde(with = "duration_ms")]
    pub visibility_interval: Duration,

    /// Pause after creation so the session store settles
    #[serde(with = "duration_ms")]
    pub settle_delay: Duration,

    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            create_path: "/api/initial_password".to_string(),
            exists_path: "/api/users/exists".to_string(),
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(100),
            visibility_attempts: 10,
            visibility_interval: Duration::from_millis(100),
            settle_delay: Duration::from_millis(200),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Browser login settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub login_route: String,
    pub dashboard_route: String,

    /// URL fragment identifying the login POST
    pub login_request: String,

    /// URL fragment identifying the follow-up identity check
    pub auth_check_request: String,

    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    pub error_banner_selector: String,

    pub session_cookie: String,

    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub auth_check_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub navigation_timeout: Duration,

    pub screenshot_dir: PathBuf,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            login_route: "/login".to_string(),
            dashboard_route: "/admin/dashboard".to_string(),
            login_request: "/login".to_string(),
            auth_check_request: "/api/auth/me".to_string(),
            username_selector: "input[name=\"username\"]".to_string(),
            password_selector: "input[name=\"password\"]".to_string(),
            submit_selector: "button[type=\"submit\"]".to_string(),
            error_banner_selector: "[role=\"alert\"]".to_string(),
            session_cookie: "id".to_string(),
            response_timeout: Duration::from_secs(10),
            auth_check_timeout: Duration::from_secs(5),
            navigation_timeout: Duration::from_secs(10),
            screenshot_dir: PathBuf::from("test-results/screenshots"),
        }
    }
}

/// Serialize `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
backend:
  root: /srv/app
  health_timeout: 5000
frontend:
  dir: /srv/app/frontend
log_dir: /tmp/e2e-logs
"#;
        let config = HarnessConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.backend.root, PathBuf::from("/srv/app"));
        assert_eq!(config.backend.health_timeout, Duration::from_secs(5));
        assert_eq!(config.backend.announce_interval, Duration::from_millis(100));
        assert_eq!(config.users.retry_attempts, 3);
        assert_eq!(config.login.auth_check_request, "/api/auth/me");
    }

    #[test]
    fn test_rejects_empty_frontend_command() {
        let yaml = "frontend:\n  command: []\n";
        let err = HarnessConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("frontend.command"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.users.create_path, "/api/initial_password");
    }
}
