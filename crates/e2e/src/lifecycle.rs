//! Per-test environment lifecycle
//!
//! One [`TestEnvironment`] owns one backend, one frontend, one user and at
//! most one browser page. Setup runs those up in order; teardown stops them
//! in reverse and is safe to call any number of times.

use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::backend::{BackendInstance, BackendSupervisor};
use crate::binary::BinaryProvisioner;
use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::frontend::{FrontendInstance, FrontendSupervisor};
use crate::log_sink::{sanitize_test_name, LogSink};
use crate::login::{BrowserLauncher, BrowserPage, LoginAutomator};
use crate::users::{Credentials, UserProvisioner};

/// Where a test environment is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Init,
    BackendStarting,
    BackendReady,
    FrontendStarting,
    FrontendReady,
    UserCreated,
    LoggedIn,
    TestRunning,
    Teardown,
    Done,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Init => "INIT",
            LifecycleState::BackendStarting => "BACKEND_STARTING",
            LifecycleState::BackendReady => "BACKEND_READY",
            LifecycleState::FrontendStarting => "FRONTEND_STARTING",
            LifecycleState::FrontendReady => "FRONTEND_READY",
            LifecycleState::UserCreated => "USER_CREATED",
            LifecycleState::LoggedIn => "LOGGED_IN",
            LifecycleState::TestRunning => "TEST_RUNNING",
            LifecycleState::Teardown => "TEARDOWN",
            LifecycleState::Done => "DONE",
            LifecycleState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a test body gets to work with
#[derive(Clone, Serialize)]
pub struct SessionContext {
    pub test_name: String,
    pub backend_url: String,
    pub backend_port: u16,
    pub frontend_url: String,
    pub frontend_port: u16,
    pub credentials: Credentials,
    pub user_id: Option<String>,
    pub backend_pid: Option<u32>,
    pub frontend_pid: Option<u32>,
    /// Logged-in page, when setup was given a browser
    #[serde(skip)]
    pub page: Option<Arc<dyn BrowserPage>>,
    #[serde(skip)]
    pub log: LogSink,
}

impl SessionContext {
    pub fn page(&self) -> Option<&dyn BrowserPage> {
        self.page.as_deref()
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("test_name", &self.test_name)
            .field("backend_url", &self.backend_url)
            .field("frontend_url", &self.frontend_url)
            .field("username", &self.credentials.username)
            .field("logged_in", &self.page.is_some())
            .finish()
    }
}

/// The processes and browser page belonging to one test
pub struct TestEnvironment {
    config: HarnessConfig,
    test_name: String,
    sink: LogSink,
    state: LifecycleState,
    backend: Option<BackendInstance>,
    frontend: Option<FrontendInstance>,
    page: Option<Arc<dyn BrowserPage>>,
}

impl TestEnvironment {
    pub fn new(config: HarnessConfig, test_name: &str) -> Self {
        let sink = LogSink::for_test(&config.log_dir, test_name);
        Self {
            config,
            test_name: sanitize_test_name(test_name),
            sink,
            state: LifecycleState::Init,
            backend: None,
            frontend: None,
            page: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn log(&self) -> &LogSink {
        &self.sink
    }

    fn transition(&mut self, next: LifecycleState) {
        info!(test = %self.test_name, "{} -> {}", self.state, next);
        self.sink.test(format!("State: {} -> {}", self.state, next));
        self.state = next;
    }

    /// Record a failure; the next teardown finishes the run
    pub fn fail(&mut self, reason: impl fmt::Display) {
        error!(test = %self.test_name, "Failed in {}: {}", self.state, reason);
        self.sink
            .test(format!("FAILED in {}: {}", self.state, reason));
        self.state = LifecycleState::Failed;
    }

    /// Bring up backend, frontend and a fresh user; log in when given a launcher.
    ///
    /// On error the environment keeps whatever was started so far, and the
    /// caller is expected to [`teardown`](Self::teardown).
    pub async fn setup(
        &mut self,
        launcher: Option<&dyn BrowserLauncher>,
    ) -> E2eResult<SessionContext> {
        if self.state != LifecycleState::Init {
            return Err(E2eError::Config(format!(
                "setup called in state {}",
                self.state
            )));
        }

        let binary = BinaryProvisioner::from_config(&self.config.backend)
            .ensure_binary(&self.config.backend.root)
            .await?;

        self.transition(LifecycleState::BackendStarting);
        let supervisor =
            BackendSupervisor::new(binary, self.config.backend.clone(), self.sink.clone())?;
        let backend = self.backend.insert(supervisor.spawn(&self.test_name).await?);
        let backend_url = backend.address.clone();
        let backend_port = backend.port;
        let backend_pid = backend.pid();
        self.transition(LifecycleState::BackendReady);

        self.transition(LifecycleState::FrontendStarting);
        let supervisor = FrontendSupervisor::new(self.config.frontend.clone(), self.sink.clone())?;
        let frontend = self.frontend.insert(supervisor.spawn(backend_port).await?);
        let frontend_url = frontend.url.clone();
        let frontend_port = frontend.port;
        let frontend_pid = frontend.pid();
        self.transition(LifecycleState::FrontendReady);

        let credentials = Credentials::generate();
        let user = UserProvisioner::new(self.config.users.clone(), self.sink.clone())?
            .make_user(&backend_url, &credentials.username, &credentials.password)
            .await?;
        self.transition(LifecycleState::UserCreated);

        if let Some(launcher) = launcher {
            let page = launcher.new_page().await?;
            self.page = Some(page.clone());
            LoginAutomator::new(&frontend_url, self.config.login.clone(), self.sink.clone())
                .login(&credentials.username, &credentials.password, page.as_ref())
                .await?;
            self.transition(LifecycleState::LoggedIn);
        }

        Ok(SessionContext {
            test_name: self.test_name.clone(),
            backend_url,
            backend_port,
            frontend_url,
            frontend_port,
            credentials,
            user_id: user.user_id,
            backend_pid,
            frontend_pid,
            page: self.page.clone(),
            log: self.sink.clone(),
        })
    }

    /// Mark the test body as running
    pub fn begin_test(&mut self) {
        self.transition(LifecycleState::TestRunning);
    }

    /// Close the page, then stop frontend and backend. Never fails.
    pub async fn teardown(&mut self) {
        if self.state == LifecycleState::Done {
            return;
        }
        self.transition(LifecycleState::Teardown);

        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                let err = E2eError::Cleanup(format!("closing browser page: {}", e));
                warn!("{}", err);
                self.sink.test(err.to_string());
            }
        }
        if let Some(mut frontend) = self.frontend.take() {
            frontend.stop().await;
        }
        if let Some(mut backend) = self.backend.take() {
            backend.stop().await;
        }

        self.transition(LifecycleState::Done);
    }
}

/// Run `body` inside a fresh, logged-in environment.
///
/// Teardown always runs: after setup failures, after the body returns and
/// after the body panics (the panic is resumed once teardown is done).
pub async fn run_test<T, F, Fut>(
    config: HarnessConfig,
    test_name: &str,
    launcher: &dyn BrowserLauncher,
    body: F,
) -> E2eResult<T>
where
    F: FnOnce(SessionContext) -> Fut,
    Fut: Future<Output = T>,
{
    let mut env = TestEnvironment::new(config, test_name);

    let session = match env.setup(Some(launcher)).await {
        Ok(session) => session,
        Err(e) => {
            env.fail(&e);
            env.teardown().await;
            return Err(e);
        }
    };

    env.begin_test();
    let outcome = AssertUnwindSafe(async move { body(session).await })
        .catch_unwind()
        .await;

    if let Err(panic) = &outcome {
        env.fail(panic_message(panic.as_ref()));
    }
    env.teardown().await;

    match outcome {
        Ok(value) => Ok(value),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("test body panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("test body panicked: {}", s)
    } else {
        "test body panicked".to_string()
    }
}
