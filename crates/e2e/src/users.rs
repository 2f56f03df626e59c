//! Test user provisioning through the backend's HTTP API

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::UserConfig;
use crate::error::{describe_error_body, E2eError, E2eResult};
use crate::log_sink::LogSink;
use crate::retry::RetryPolicy;

const ERROR_BODY_LIMIT: usize = 500;

/// Username and password for a test user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Fresh random credentials, unique per call
    pub fn generate() -> Self {
        Self {
            username: format!("e2e-{}", uuid::Uuid::new_v4().simple()),
            password: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// A user that the backend accepted
#[derive(Debug, Clone, Serialize)]
pub struct CreatedUser {
    pub credentials: Credentials,
    pub user_id: Option<String>,
    /// Whether the users-exist check confirmed the write
    pub confirmed: bool,
}

#[derive(Serialize)]
struct CreateUserRequest<'a> {
    username: &'a str,
    password: &'a str,
    password_confirmation: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct CreateUserResponse {
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsersExistResponse {
    users_exist: bool,
}

/// Creates users with retry and read-after-write confirmation
pub struct UserProvisioner {
    client: reqwest::Client,
    config: UserConfig,
    sink: LogSink,
}

impl UserProvisioner {
    pub fn new(config: UserConfig, sink: LogSink) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            config,
            sink,
        })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.retry_attempts, self.config.retry_base_delay)
    }

    /// Create a user.
    ///
    /// Network errors and 5xx responses are retried with backoff; a 4xx is
    /// returned at once as [`E2eError::ValidationFailure`]. A successful write
    /// that the users-exist check cannot confirm is only logged.
    pub async fn make_user(
        &self,
        backend_address: &str,
        username: &str,
        password: &str,
    ) -> E2eResult<CreatedUser> {
        let url = endpoint(backend_address, &self.config.create_path);
        let request = CreateUserRequest {
            username,
            password,
            password_confirmation: password,
        };
        let policy = self.retry_policy();

        info!("Creating test user {}", username);
        let created = policy
            .run(|attempt| {
                self.sink.test(format!(
                    "Creating user {} (attempt {}/{})",
                    username, attempt, policy.max_attempts
                ));
                self.create_once(&url, &request)
            })
            .await
            .map_err(|e| {
                self.sink.test(format!("User creation failed: {}", e));
                e
            })?;

        let confirmed = match self.confirm_visible(backend_address).await {
            Ok(()) => true,
            Err(e) => {
                warn!("User {} created but not yet visible: {}", username, e);
                self.sink
                    .test(format!("Warning: user {} not confirmed: {}", username, e));
                false
            }
        };

        // Let the session store catch up before the browser logs in
        sleep(self.config.settle_delay).await;

        self.sink.test(format!("User {} created", username));
        Ok(CreatedUser {
            credentials: Credentials::new(username, password),
            user_id: created.user_id,
            confirmed,
        })
    }

    async fn create_once(
        &self,
        url: &str,
        request: &CreateUserRequest<'_>,
    ) -> E2eResult<CreateUserResponse> {
        let resp = self.client.post(url).json(request).send().await?;
        let status = resp.status();
        let body = resp.text().await.ok();

        if status.is_success() {
            return Ok(body
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_default());
        }

        let status_text = status.canonical_reason().unwrap_or_default().to_string();
        let message = describe_error_body(body.as_deref(), ERROR_BODY_LIMIT);
        if status.is_server_error() {
            Err(E2eError::ServerError {
                status: status.as_u16(),
                status_text,
                message,
            })
        } else {
            Err(E2eError::ValidationFailure {
                status: status.as_u16(),
                status_text,
                message,
            })
        }
    }

    /// Ask the backend whether any user exists
    pub async fn users_exist(&self, backend_address: &str) -> E2eResult<bool> {
        let url = endpoint(backend_address, &self.config.exists_path);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let body: UsersExistResponse = resp.json().await?;
        Ok(body.users_exist)
    }

    async fn confirm_visible(&self, backend_address: &str) -> E2eResult<()> {
        let attempts = self.config.visibility_attempts.max(1);
        for attempt in 1..=attempts {
            match self.users_exist(backend_address).await {
                Ok(true) => {
                    debug!("User visible after {} check(s)", attempt);
                    return Ok(());
                }
                Ok(false) => debug!("User not visible yet ({}/{})", attempt, attempts),
                Err(e) => debug!("Users-exist check failed ({}/{}): {}", attempt, attempts, e),
            }
            if attempt < attempts {
                sleep(self.config.visibility_interval).await;
            }
        }
        Err(E2eError::VisibilityTimeout { attempts })
    }
}

fn endpoint(address: &str, path: &str) -> String {
    format!("{}{}", address.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_config() -> UserConfig {
        UserConfig {
            retry_base_delay: Duration::from_millis(10),
            visibility_attempts: 3,
            visibility_interval: Duration::from_millis(5),
            settle_delay: Duration::from_millis(1),
            ..UserConfig::default()
        }
    }

    #[test]
    fn test_generated_credentials_are_unique() {
        let a = Credentials::generate();
        let b = Credentials::generate();
        assert_ne!(a.username, b.username);
        assert_ne!(a.password, b.password);
        assert!(a.username.starts_with("e2e-"));
        assert!(a.password.len() >= 12);
    }

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("http://127.0.0.1:5555/", "/api/users/exists"),
            "http://127.0.0.1:5555/api/users/exists"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_exhausts_retries() {
        let provisioner = UserProvisioner::new(quick_config(), LogSink::disabled()).unwrap();
        // Port 9 (discard) on loopback is closed on test machines
        let err = provisioner
            .make_user("http://127.0.0.1:9", "user", "password-123456")
            .await
            .unwrap_err();
        assert!(matches!(err, E2eError::Network(_)), "got {:?}", err);
    }
}
