//! Shared fakes for the integration tests: an in-process backend HTTP
//! surface and a scripted browser page.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use newsletter_e2e::login::{
    BrowserCookie, BrowserLauncher, BrowserPage, CapturedResponse, ResponseMatcher,
};
use newsletter_e2e::E2eResult;

#[derive(Default)]
pub struct FakeState {
    /// Statuses for successive create-user calls; 201 once exhausted
    pub create_statuses: Mutex<VecDeque<u16>>,
    pub create_calls: Mutex<Vec<(Instant, Value)>>,
    pub users_exist: AtomicBool,
    /// Keep reporting no users even after a successful create
    pub hide_users: AtomicBool,
    pub exist_checks: AtomicUsize,
    pub health_checks: AtomicUsize,
}

pub struct FakeBackend {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        Self::with_statuses(&[]).await
    }

    pub async fn with_statuses(statuses: &[u16]) -> Self {
        let state = Arc::new(FakeState::default());
        state.create_statuses.lock().extend(statuses.iter().copied());

        let app = Router::new()
            .route("/health_check", get(health))
            .route("/api/initial_password", post(create_user))
            .route("/api/users/exists", get(users_exist))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn create_calls(&self) -> usize {
        self.state.create_calls.lock().len()
    }
}

async fn health(State(state): State<Arc<FakeState>>) -> &'static str {
    state.health_checks.fetch_add(1, Ordering::SeqCst);
    "ok"
}

async fn create_user(
    State(state): State<Arc<FakeState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.create_calls.lock().push((Instant::now(), body.clone()));
    let status = state.create_statuses.lock().pop_front().unwrap_or(201);

    match status {
        200..=299 => {
            if !state.hide_users.load(Ordering::SeqCst) {
                state.users_exist.store(true, Ordering::SeqCst);
            }
            (
                StatusCode::CREATED,
                Json(json!({
                    "success": true,
                    "username": body["username"],
                    "message": "User created",
                    "user_id": "user-1",
                })),
            )
        }
        400..=499 => (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({ "error": "Passwords do not match" })),
        ),
        _ => (
            StatusCode::from_u16(status).unwrap(),
            Json(json!({ "error": "database is locked" })),
        ),
    }
}

async fn users_exist(State(state): State<Arc<FakeState>>) -> Json<Value> {
    state.exist_checks.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "users_exist": state.users_exist.load(Ordering::SeqCst) }))
}

/// Write a shell script and return the argv that runs it through `/bin/sh`
pub fn sh_script(dir: &Path, name: &str, body: &str) -> (PathBuf, Vec<String>) {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    (
        PathBuf::from("/bin/sh"),
        vec![path.to_string_lossy().into_owned()],
    )
}

/// Alive and not a zombie
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => !Path::new("/proc").exists(),
    }
}

/// Page that behaves like a working login form: submitting records the
/// login and auth-check responses and lands on the dashboard.
pub struct ScriptedPage {
    url: Mutex<String>,
    responses: Mutex<Vec<CapturedResponse>>,
    pub closed: AtomicBool,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self {
            url: Mutex::new("about:blank".into()),
            responses: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn origin(&self) -> String {
        let url = self.url.lock().clone();
        match url.find("/login") {
            Some(i) => url[..i].to_string(),
            None => url,
        }
    }
}

#[async_trait]
impl BrowserPage for ScriptedPage {
    async fn goto(&self, url: &str) -> E2eResult<()> {
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> E2eResult<String> {
        Ok(self.url.lock().clone())
    }

    async fn fill(&self, _selector: &str, _value: &str) -> E2eResult<()> {
        Ok(())
    }

    async fn click(&self, _selector: &str) -> E2eResult<()> {
        let origin = self.origin();
        self.responses.lock().extend([
            CapturedResponse {
                url: format!("{}/login", origin),
                method: "POST".into(),
                status: 200,
                body: Some(r#"{"success":true}"#.into()),
            },
            CapturedResponse {
                url: format!("{}/api/auth/me", origin),
                method: "GET".into(),
                status: 200,
                body: Some("{}".into()),
            },
        ]);
        *self.url.lock() = format!("{}/admin/dashboard", origin);
        Ok(())
    }

    fn response_cursor(&self) -> usize {
        self.responses.lock().len()
    }

    async fn wait_for_response(
        &self,
        matcher: &ResponseMatcher,
        since: usize,
        _timeout: Duration,
    ) -> E2eResult<Option<CapturedResponse>> {
        Ok(self
            .responses
            .lock()
            .iter()
            .skip(since)
            .find(|r| matcher.matches(r))
            .cloned())
    }

    async fn wait_for_url(&self, fragment: &str, _timeout: Duration) -> E2eResult<bool> {
        Ok(self.url.lock().contains(fragment))
    }

    async fn visible_text(&self, _selector: &str) -> E2eResult<Option<String>> {
        Ok(None)
    }

    async fn screenshot(&self, _path: &Path) -> E2eResult<()> {
        Ok(())
    }

    async fn cookies(&self) -> E2eResult<Vec<BrowserCookie>> {
        Ok(vec![BrowserCookie {
            name: "id".into(),
            value: "session".into(),
        }])
    }

    async fn close(&self) -> E2eResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one shared [`ScriptedPage`]
pub struct ScriptedLauncher {
    pub page: Arc<ScriptedPage>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            page: Arc::new(ScriptedPage::new()),
        }
    }
}

#[async_trait]
impl BrowserLauncher for ScriptedLauncher {
    async fn new_page(&self) -> E2eResult<Arc<dyn BrowserPage>> {
        Ok(self.page.clone())
    }
}
