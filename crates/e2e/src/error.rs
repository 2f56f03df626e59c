//! Error types for E2E environments

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::retry::Retryable;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Build failed (exit code {}): {output}", fmt_exit_code(.exit_code))]
    BuildFailure {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{process} did not start within {timeout_ms} ms. Output:\n{output}")]
    StartupTimeout {
        process: String,
        timeout_ms: u64,
        output: String,
    },

    #[error("{process} exited ({status}) before it was ready. Output:\n{output}")]
    ExitedEarly {
        process: String,
        status: String,
        output: String,
    },

    #[error("Could not detect the dev server port from its output. Output:\n{output}")]
    PortNotDetected { output: String },

    #[error("{url} not ready after {attempts} attempts")]
    ReadinessTimeout { url: String, attempts: usize },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error {status} {status_text}: {message}")]
    ServerError {
        status: u16,
        status_text: String,
        message: String,
    },

    #[error("Request rejected with {status} {status_text}: {message}")]
    ValidationFailure {
        status: u16,
        status_text: String,
        message: String,
    },

    #[error("Write not visible after {attempts} attempts")]
    VisibilityTimeout { attempts: usize },

    #[error("Expected to be on {expected}, but landed on {actual}")]
    UnexpectedRedirect { expected: String, actual: String },

    #[error("Login request failed{}: {message}", fmt_status(.status))]
    LoginRequestFailure { status: Option<u16>, message: String },

    #[error("Auth check did not succeed within {timeout_ms} ms (still on {url})")]
    AuthCheckTimeout { timeout_ms: u64, url: String },

    #[error("Navigation to {expected} timed out (current URL: {actual})")]
    NavigationTimeout { expected: String, actual: String },

    #[error("{reason}{diagnostics}")]
    LoginFailed {
        reason: Box<E2eError>,
        diagnostics: LoginDiagnostics,
    },

    #[error("Playwright not found. Install with: npm install -D playwright && npx playwright install")]
    PlaywrightNotFound,

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<reqwest::Error> for E2eError {
    fn from(err: reqwest::Error) -> Self {
        E2eError::Network(err.to_string())
    }
}

impl Retryable for E2eError {
    fn is_retryable(&self) -> bool {
        matches!(self, E2eError::Network(_) | E2eError::ServerError { .. })
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

/// Extra context gathered from the page when a login attempt fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginDiagnostics {
    pub banner: Option<String>,
    pub screenshot: Option<PathBuf>,
}

impl fmt::Display for LoginDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(banner) = &self.banner {
            write!(f, " | UI error: {}", banner)?;
        }
        if let Some(path) = &self.screenshot {
            write!(f, " | screenshot: {}", path.display())?;
        }
        Ok(())
    }
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string())
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

/// Marker used when a response body could not be read as text
pub const UNDECODABLE_BODY: &str = "<response body could not be decoded>";

/// Marker used when a response body is present but blank
pub const EMPTY_BODY: &str = "<empty body>";

/// Human-readable failure message from an HTTP error body.
///
/// Prefers the JSON `error` (then `message`) field, falls back to the raw
/// text cut to `max` bytes, to [`EMPTY_BODY`] for blank text, and to
/// [`UNDECODABLE_BODY`] when there is no text.
pub fn describe_error_body(body: Option<&str>, max: usize) -> String {
    let Some(text) = body else {
        return UNDECODABLE_BODY.to_string();
    };
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(text) {
        for field in ["error", "message"] {
            if let Some(message) = json.get(field).and_then(|v| v.as_str()) {
                return message.to_string();
            }
        }
    }
    let text = text.trim();
    if text.is_empty() {
        return EMPTY_BODY.to_string();
    }
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Keep only the tail of `output`, at most `max` bytes, on a char boundary.
pub fn truncate_output(output: &str, max: usize) -> String {
    if output.len() <= max {
        return output.to_string();
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &output[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_keeps_tail() {
        let out = truncate_output("0123456789", 4);
        assert_eq!(out, "...6789");
        assert_eq!(truncate_output("short", 100), "short");
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let out = truncate_output("aé", 1);
        assert_eq!(out, "...");
    }

    #[test]
    fn test_describe_error_body_prefers_json_error() {
        let body = r#"{"success":false,"error":"Authentication failed"}"#;
        assert_eq!(describe_error_body(Some(body), 200), "Authentication failed");
        let body = r#"{"message":"Users already exist"}"#;
        assert_eq!(describe_error_body(Some(body), 200), "Users already exist");
    }

    #[test]
    fn test_describe_error_body_falls_back_to_text() {
        assert_eq!(describe_error_body(Some("  Bad Gateway \n"), 200), "Bad Gateway");
        assert_eq!(describe_error_body(Some("abcdefgh"), 3), "abc...");
        assert_eq!(describe_error_body(Some(r#"{"detail":"x"}"#), 200), r#"{"detail":"x"}"#);
        assert_eq!(describe_error_body(None, 200), UNDECODABLE_BODY);
        assert_eq!(describe_error_body(Some(""), 200), EMPTY_BODY);
        assert_eq!(describe_error_body(Some(" \n "), 200), EMPTY_BODY);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(E2eError::Network("refused".into()).is_retryable());
        assert!(E2eError::ServerError {
            status: 503,
            status_text: "Service Unavailable".into(),
            message: String::new(),
        }
        .is_retryable());
        assert!(!E2eError::ValidationFailure {
            status: 400,
            status_text: "Bad Request".into(),
            message: "nope".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_login_failed_display_folds_diagnostics() {
        let err = E2eError::LoginFailed {
            reason: Box::new(E2eError::LoginRequestFailure {
                status: Some(401),
                message: "Authentication failed".into(),
            }),
            diagnostics: LoginDiagnostics {
                banner: Some("Invalid credentials".into()),
                screenshot: Some(PathBuf::from("shots/login.png")),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("(401)"));
        assert!(msg.contains("Authentication failed"));
        assert!(msg.contains("UI error: Invalid credentials"));
        assert!(msg.contains("shots/login.png"));
    }
}
