//! Newsletter E2E Environment Harness
//!
//! Gives every browser test its own throwaway stack:
//! - Builds the backend test server binary if it is missing
//! - Spawns a backend per test and discovers its address from stdout
//! - Spawns a frontend dev server pointed at that backend
//! - Creates a fresh user through the backend API
//! - Logs in through Playwright, diagnosing failures from network responses
//! - Tears everything down again, even when the test panics
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  run_test / TestEnvironment                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  BinaryProvisioner::ensure_binary(root) -> PathBuf          │
//! │  BackendSupervisor::spawn(test_name)    -> BackendInstance  │
//! │     └── announcement line on stdout + GET /health_check     │
//! │  FrontendSupervisor::spawn(port)        -> FrontendInstance │
//! │     └── ready marker + "Local: http://localhost:<port>"     │
//! │  UserProvisioner::make_user(..)         -> CreatedUser      │
//! │     └── RetryPolicy + users-exist confirmation              │
//! │  LoginAutomator::login(.., page)        -> LoginOutcome     │
//! │     └── POST /login, GET /api/auth/me, dashboard URL        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ManagedProcess: line capture, SIGTERM -> SIGKILL (group)   │
//! │  LogSink: <log_dir>/<test>.log  [ts] [SOURCE] message       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod binary;
pub mod config;
pub mod error;
pub mod frontend;
pub mod lifecycle;
pub mod log_sink;
pub mod login;
pub mod playwright;
pub mod process;
pub mod readiness;
pub mod retry;
pub mod telemetry;
pub mod users;

pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use lifecycle::{run_test, LifecycleState, SessionContext, TestEnvironment};
pub use log_sink::{LogSink, LogSource};
pub use login::{BrowserLauncher, BrowserPage, LoginAutomator};
pub use playwright::PlaywrightLauncher;
pub use users::{Credentials, UserProvisioner};
