//! Browser login with network-level failure diagnosis
//!
//! UI state alone is a poor signal for why a login did not land on the
//! dashboard, so the automator watches the login POST and the follow-up
//! identity check and classifies the outcome from those responses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::LoginConfig;
use crate::error::{describe_error_body, E2eError, E2eResult, LoginDiagnostics};
use crate::log_sink::LogSink;

const ERROR_BODY_LIMIT: usize = 200;

/// A network response observed by the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub url: String,
    pub method: String,
    pub status: u16,
    /// `None` when the body could not be read as text
    #[serde(default)]
    pub body: Option<String>,
}

/// Selects responses by URL fragment, method and optionally status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMatcher {
    pub url_contains: String,
    pub method: String,
    pub status: Option<u16>,
}

impl ResponseMatcher {
    pub fn new(url_contains: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            url_contains: url_contains.into(),
            method: method.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, response: &CapturedResponse) -> bool {
        response.url.contains(&self.url_contains)
            && response.method.eq_ignore_ascii_case(&self.method)
            && self.status.map_or(true, |s| s == response.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
}

/// The browser operations login needs.
///
/// Responses are recorded in arrival order; [`response_cursor`] marks a
/// position so a wait started after an action still sees responses that
/// arrived while the action ran.
///
/// [`response_cursor`]: BrowserPage::response_cursor
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn goto(&self, url: &str) -> E2eResult<()>;

    async fn current_url(&self) -> E2eResult<String>;

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()>;

    async fn click(&self, selector: &str) -> E2eResult<()>;

    /// Number of responses recorded so far
    fn response_cursor(&self) -> usize;

    /// First response at or after `since` that matches, or `None` on timeout
    async fn wait_for_response(
        &self,
        matcher: &ResponseMatcher,
        since: usize,
        timeout: Duration,
    ) -> E2eResult<Option<CapturedResponse>>;

    /// Whether the URL came to contain `fragment` within `timeout`
    async fn wait_for_url(&self, fragment: &str, timeout: Duration) -> E2eResult<bool>;

    /// Text of the first visible element matching `selector`
    async fn visible_text(&self, selector: &str) -> E2eResult<Option<String>>;

    async fn screenshot(&self, path: &Path) -> E2eResult<()>;

    async fn cookies(&self) -> E2eResult<Vec<BrowserCookie>>;

    /// Release the page and its browser
    async fn close(&self) -> E2eResult<()> {
        Ok(())
    }
}

/// Opens a fresh, isolated browser page per test
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn new_page(&self) -> E2eResult<Arc<dyn BrowserPage>>;
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub final_url: String,
    pub session_cookie: Option<BrowserCookie>,
}

/// What the login POST said
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginResponseClass {
    Accepted,
    Rejected { status: u16, message: String },
}

/// Classify the login POST response.
///
/// Non-200 is a failure described from the body; a 200 whose JSON body has
/// `success: false` is a failure carrying the embedded message.
pub fn classify_login_response(response: &CapturedResponse) -> LoginResponseClass {
    if response.status != 200 {
        return LoginResponseClass::Rejected {
            status: response.status,
            message: describe_error_body(response.body.as_deref(), ERROR_BODY_LIMIT),
        };
    }

    let logical_failure = response
        .body
        .as_deref()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(text).ok())
        .filter(|json| json.get("success").and_then(|v| v.as_bool()) == Some(false));

    match logical_failure {
        Some(json) => {
            let message = ["error", "message"]
                .iter()
                .find_map(|field| json.get(*field).and_then(|v| v.as_str()))
                .unwrap_or("login reported success: false")
                .to_string();
            LoginResponseClass::Rejected {
                status: response.status,
                message,
            }
        }
        None => LoginResponseClass::Accepted,
    }
}

/// Drives the login form for one test
pub struct LoginAutomator {
    base_url: String,
    config: LoginConfig,
    sink: LogSink,
}

impl LoginAutomator {
    pub fn new(base_url: impl Into<String>, config: LoginConfig, sink: LogSink) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            config,
            sink,
        }
    }

    /// Log in through the UI and wait for the dashboard
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        page: &dyn BrowserPage,
    ) -> E2eResult<LoginOutcome> {
        let login_url = format!("{}{}", self.base_url, self.config.login_route);
        info!("Logging in as {} via {}", username, login_url);
        self.sink.test(format!("Logging in as {}", username));

        page.goto(&login_url).await?;
        let landed = page.current_url().await?;
        if !landed.contains(&self.config.login_route) {
            return Err(E2eError::UnexpectedRedirect {
                expected: self.config.login_route.clone(),
                actual: landed,
            });
        }

        page.fill(&self.config.username_selector, username).await?;
        page.fill(&self.config.password_selector, password).await?;

        let cursor = page.response_cursor();
        let result = self.submit_and_follow(page, cursor).await;

        let final_url = match result {
            Ok(url) => url,
            Err(reason) => return Err(self.fail(page, reason).await),
        };

        let session_cookie = match page.cookies().await {
            Ok(cookies) => cookies
                .into_iter()
                .find(|c| c.name == self.config.session_cookie),
            Err(e) => {
                debug!("Could not read cookies: {}", e);
                None
            }
        };
        if session_cookie.is_none() {
            warn!(
                "Logged in but no {} session cookie is visible",
                self.config.session_cookie
            );
            self.sink.test(format!(
                "Warning: no {} session cookie after login",
                self.config.session_cookie
            ));
        }

        self.sink.test(format!("Logged in, at {}", final_url));
        Ok(LoginOutcome {
            final_url,
            session_cookie,
        })
    }

    async fn submit_and_follow(&self, page: &dyn BrowserPage, cursor: usize) -> E2eResult<String> {
        page.click(&self.config.submit_selector).await?;

        let login_matcher = ResponseMatcher::new(&self.config.login_request, "POST");
        let response = page
            .wait_for_response(&login_matcher, cursor, self.config.response_timeout)
            .await?
            .ok_or_else(|| E2eError::LoginRequestFailure {
                status: None,
                message: format!(
                    "no POST {} response within {} ms",
                    self.config.login_request,
                    self.config.response_timeout.as_millis()
                ),
            })?;

        debug!("Login response {} from {}", response.status, response.url);
        if let LoginResponseClass::Rejected { status, message } = classify_login_response(&response)
        {
            return Err(E2eError::LoginRequestFailure {
                status: Some(status),
                message,
            });
        }

        // The app only navigates once its identity check succeeds
        let auth_matcher =
            ResponseMatcher::new(&self.config.auth_check_request, "GET").with_status(200);
        let auth = page
            .wait_for_response(&auth_matcher, cursor, self.config.auth_check_timeout)
            .await?;
        if auth.is_none() {
            let url = page.current_url().await?;
            if url.contains(&self.config.login_route) {
                return Err(E2eError::AuthCheckTimeout {
                    timeout_ms: self.config.auth_check_timeout.as_millis() as u64,
                    url,
                });
            }
            debug!("Auth check not observed but page already left the login route");
        }

        if !page
            .wait_for_url(&self.config.dashboard_route, self.config.navigation_timeout)
            .await?
        {
            return Err(E2eError::NavigationTimeout {
                expected: self.config.dashboard_route.clone(),
                actual: page.current_url().await.unwrap_or_default(),
            });
        }

        page.current_url().await
    }

    /// Attach the visible error banner and a screenshot to a login failure
    async fn fail(&self, page: &dyn BrowserPage, reason: E2eError) -> E2eError {
        let banner = page
            .visible_text(&self.config.error_banner_selector)
            .await
            .ok()
            .flatten()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let path = self.screenshot_path();
        let screenshot = match page.screenshot(&path).await {
            Ok(()) => Some(path),
            Err(e) => {
                debug!("Failure screenshot not captured: {}", e);
                None
            }
        };

        let err = E2eError::LoginFailed {
            reason: Box::new(reason),
            diagnostics: LoginDiagnostics { banner, screenshot },
        };
        warn!("{}", err);
        self.sink.test(err.to_string());
        err
    }

    fn screenshot_path(&self) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        self.config
            .screenshot_dir
            .join(format!("login-failure-{}.png", stamp))
    }
}
