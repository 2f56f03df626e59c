//! Playwright browser automation
//!
//! A small Node driver owns the real browser. Commands go to it as JSON
//! lines on stdin; replies and network-response events come back as JSON
//! lines on stdout:
//!
//! ```text
//! -> {"id":3,"op":"click","selector":"button[type=\"submit\"]"}
//! <- {"event":"response","url":".../login","method":"POST","status":200,"body":"{}"}
//! <- {"id":3,"ok":true,"value":null}
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, ChildStderr, Command as TokioCommand};
use tokio::sync::{oneshot, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::duration_ms;
use crate::error::{E2eError, E2eResult};
use crate::login::{BrowserCookie, BrowserLauncher, BrowserPage, CapturedResponse, ResponseMatcher};

const DRIVER_SCRIPT: &str = r##"
const { createRequire } = require('module');
const path = require('path');
const readline = require('readline');

const projectRequire = createRequire(path.join(process.cwd(), 'driver.js'));
const playwright = projectRequire('playwright');
const opts = JSON.parse(process.argv[process.argv.length - 1]);
const send = (msg) => process.stdout.write(JSON.stringify(msg) + '\n');

(async () => {
  const browser = await playwright[opts.browser].launch({ headless: opts.headless });
  const context = await browser.newContext({
    viewport: { width: opts.width, height: opts.height },
  });
  const page = await context.newPage();

  page.on('response', async (response) => {
    let body = null;
    try { body = await response.text(); } catch (_) {}
    send({
      event: 'response',
      url: response.url(),
      method: response.request().method(),
      status: response.status(),
      body,
    });
  });

  const ops = {
    goto: async (m) => { await page.goto(m.url); return null; },
    url: async () => page.url(),
    fill: async (m) => { await page.fill(m.selector, m.value); return null; },
    click: async (m) => { await page.click(m.selector); return null; },
    waitForUrl: async (m) => {
      try {
        await page.waitForURL((u) => u.toString().includes(m.fragment), { timeout: m.timeout });
        return true;
      } catch (_) {
        return false;
      }
    },
    visibleText: async (m) => {
      const el = page.locator(m.selector).first();
      if (!(await el.isVisible())) return null;
      return await el.textContent();
    },
    screenshot: async (m) => { await page.screenshot({ path: m.path, fullPage: true }); return null; },
    cookies: async () => context.cookies(),
    close: async () => { await browser.close(); return null; },
  };

  send({ event: 'ready' });

  const rl = readline.createInterface({ input: process.stdin });
  for await (const line of rl) {
    let msg;
    try { msg = JSON.parse(line); } catch (_) { continue; }
    try {
      const op = ops[msg.op];
      if (!op) throw new Error(`unknown op ${msg.op}`);
      send({ id: msg.id, ok: true, value: await op(msg) });
    } catch (err) {
      send({ id: msg.id, ok: false, error: String((err && err.message) || err) });
    }
    if (msg.op === 'close') break;
  }
  await browser.close().catch(() => {});
  process.exit(0);
})().catch((err) => {
  send({ event: 'fatal', error: String((err && err.stack) || err) });
  process.exit(1);
});
"##;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,
    /// Directory whose `node_modules` provides `playwright`
    pub project_dir: PathBuf,
    /// Program (and leading args) that runs the driver script
    pub driver_command: Vec<String>,
    #[serde(with = "duration_ms")]
    pub launch_timeout: Duration,
    /// Upper bound for a single page action
    #[serde(with = "duration_ms")]
    pub action_timeout: Duration,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            project_dir: PathBuf::from("."),
            driver_command: vec!["node".to_string()],
            launch_timeout: Duration::from_secs(30),
            action_timeout: Duration::from_secs(30),
        }
    }
}

/// Check if Playwright is installed
pub fn check_playwright_installed(project_dir: &Path) -> E2eResult<()> {
    let output = Command::new("npx")
        .args(["playwright", "--version"])
        .current_dir(project_dir)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match output {
        Ok(status) if status.success() => Ok(()),
        _ => Err(E2eError::PlaywrightNotFound),
    }
}

type Reply = Result<Value, String>;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DriverMessage {
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event(DriverEvent),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum DriverEvent {
    Ready,
    Response(CapturedResponse),
    Fatal { error: String },
}

/// State shared between a page handle and its stdout reader task
#[derive(Default)]
struct DriverShared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    responses: Mutex<Vec<CapturedResponse>>,
    arrived: Notify,
}

impl DriverShared {
    fn find_response(&self, matcher: &ResponseMatcher, since: usize) -> Option<CapturedResponse> {
        self.responses
            .lock()
            .iter()
            .skip(since)
            .find(|r| matcher.matches(r))
            .cloned()
    }
}

/// One browser page driven through the Node driver process
pub struct PlaywrightPage {
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    shared: Arc<DriverShared>,
    next_id: AtomicU64,
    action_timeout: Duration,
    _driver_dir: TempDir,
}

impl PlaywrightPage {
    /// Start the driver and wait until its browser page is open
    pub async fn launch(config: &PlaywrightConfig) -> E2eResult<Self> {
        let (program, args) = config
            .driver_command
            .split_first()
            .ok_or_else(|| E2eError::Config("browser driver command is empty".into()))?;

        let driver_dir = tempfile::tempdir()?;
        let script = driver_dir.path().join("driver.js");
        std::fs::write(&script, DRIVER_SCRIPT)?;

        let opts = json!({
            "browser": config.browser.as_str(),
            "headless": config.headless,
            "width": config.viewport_width,
            "height": config.viewport_height,
        });

        debug!("Launching browser driver: {} {}", program, script.display());
        let mut child = TokioCommand::new(program)
            .args(args)
            .arg(&script)
            .arg(opts.to_string())
            .current_dir(&config.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| E2eError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        let stdio = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match stdio {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => return Err(E2eError::Browser("driver stdio was not captured".into())),
        };

        let shared = Arc::new(DriverShared::default());
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(read_driver_output(stdout, shared.clone(), ready_tx));
        tokio::spawn(log_driver_stderr(stderr));

        match timeout(config.launch_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                return Err(E2eError::Browser(format!("driver failed to start: {}", e)))
            }
            Ok(Err(_)) => {
                return Err(E2eError::Browser("driver exited before it was ready".into()))
            }
            Err(_) => {
                return Err(E2eError::Browser(format!(
                    "driver not ready within {} ms",
                    config.launch_timeout.as_millis()
                )))
            }
        }

        info!("Browser ready ({})", config.browser.as_str());
        Ok(Self {
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            shared,
            next_id: AtomicU64::new(1),
            action_timeout: config.action_timeout,
            _driver_dir: driver_dir,
        })
    }

    async fn call(&self, op: &str, args: Value, limit: Duration) -> E2eResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut msg = match args {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        msg.insert("id".into(), id.into());
        msg.insert("op".into(), op.into());
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            .await
            {
                self.shared.pending.lock().remove(&id);
                return Err(E2eError::Browser(format!("{}: driver unavailable: {}", op, e)));
            }
        }

        match timeout(limit, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(E2eError::Browser(format!("{}: {}", op, message))),
            Ok(Err(_)) => Err(E2eError::Browser(format!("{}: driver exited", op))),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(E2eError::Browser(format!(
                    "{}: no reply within {} ms",
                    op,
                    limit.as_millis()
                )))
            }
        }
    }

    async fn act(&self, op: &str, args: Value) -> E2eResult<Value> {
        self.call(op, args, self.action_timeout).await
    }
}

#[async_trait]
impl BrowserPage for PlaywrightPage {
    async fn goto(&self, url: &str) -> E2eResult<()> {
        self.act("goto", json!({ "url": url })).await.map(drop)
    }

    async fn current_url(&self) -> E2eResult<String> {
        let value = self.act("url", json!({})).await?;
        value
            .as_str()
            .map(String::from)
            .ok_or_else(|| E2eError::Browser(format!("url: unexpected reply {}", value)))
    }

    async fn fill(&self, selector: &str, value: &str) -> E2eResult<()> {
        self.act("fill", json!({ "selector": selector, "value": value }))
            .await
            .map(drop)
    }

    async fn click(&self, selector: &str) -> E2eResult<()> {
        self.act("click", json!({ "selector": selector })).await.map(drop)
    }

    fn response_cursor(&self) -> usize {
        self.shared.responses.lock().len()
    }

    async fn wait_for_response(
        &self,
        matcher: &ResponseMatcher,
        since: usize,
        limit: Duration,
    ) -> E2eResult<Option<CapturedResponse>> {
        let deadline = Instant::now() + limit;
        loop {
            // Register before checking so a response landing in between wakes us
            let arrived = self.shared.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(found) = self.shared.find_response(matcher, since) {
                return Ok(Some(found));
            }
            if timeout_at(deadline, arrived).await.is_err() {
                return Ok(self.shared.find_response(matcher, since));
            }
        }
    }

    async fn wait_for_url(&self, fragment: &str, limit: Duration) -> E2eResult<bool> {
        let value = self
            .call(
                "waitForUrl",
                json!({ "fragment": fragment, "timeout": limit.as_millis() as u64 }),
                limit + self.action_timeout,
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn visible_text(&self, selector: &str) -> E2eResult<Option<String>> {
        let value = self.act("visibleText", json!({ "selector": selector })).await?;
        Ok(value.as_str().map(String::from))
    }

    async fn screenshot(&self, path: &Path) -> E2eResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.act("screenshot", json!({ "path": path }))
            .await
            .map(drop)
    }

    async fn cookies(&self) -> E2eResult<Vec<BrowserCookie>> {
        let value = self.act("cookies", json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn close(&self) -> E2eResult<()> {
        if let Err(e) = self.call("close", json!({}), Duration::from_secs(5)).await {
            debug!("Browser close: {}", e);
        }
        let mut child = self.child.lock().await;
        if timeout(Duration::from_secs(2), child.wait()).await.is_err() {
            warn!("Browser driver did not exit, killing it");
            child.start_kill()?;
            child.wait().await?;
        }
        Ok(())
    }
}

async fn read_driver_output(
    stdout: ChildStdout,
    shared: Arc<DriverShared>,
    ready: oneshot::Sender<Result<(), String>>,
) {
    let mut ready = Some(ready);
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Browser driver output unreadable: {}", e);
                break;
            }
        };

        let msg = match serde_json::from_str::<DriverMessage>(&line) {
            Ok(msg) => msg,
            Err(_) => {
                debug!("[driver] {}", line);
                continue;
            }
        };

        match msg {
            DriverMessage::Reply {
                id,
                ok,
                value,
                error,
            } => {
                let reply = if ok {
                    Ok(value)
                } else {
                    Err(error.unwrap_or_else(|| "unknown driver error".into()))
                };
                if let Some(tx) = shared.pending.lock().remove(&id) {
                    let _ = tx.send(reply);
                }
            }
            DriverMessage::Event(DriverEvent::Ready) => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            DriverMessage::Event(DriverEvent::Response(response)) => {
                shared.responses.lock().push(response);
                shared.arrived.notify_waiters();
            }
            DriverMessage::Event(DriverEvent::Fatal { error: message }) => {
                error!("Browser driver failed: {}", message);
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(message));
                }
            }
        }
    }

    // Dropping the senders fails every outstanding call
    shared.pending.lock().clear();
    shared.arrived.notify_waiters();
}

async fn log_driver_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[driver stderr] {}", line);
    }
}

/// Launches one Playwright page per test
pub struct PlaywrightLauncher {
    config: PlaywrightConfig,
}

impl PlaywrightLauncher {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    /// Fail early when the project has no Playwright install
    pub fn verified(config: PlaywrightConfig) -> E2eResult<Self> {
        check_playwright_installed(&config.project_dir)?;
        Ok(Self::new(config))
    }
}

#[async_trait]
impl BrowserLauncher for PlaywrightLauncher {
    async fn new_page(&self) -> E2eResult<Arc<dyn BrowserPage>> {
        let page = PlaywrightPage::launch(&self.config).await?;
        Ok(Arc::new(page))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Stand-in driver speaking the same line protocol without a browser
    const FAKE_DRIVER: &str = r#"
echo '{"event":"ready"}'
echo 'plain log line'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"op":"click"'*)
      echo '{"event":"response","url":"http://localhost:1/login","method":"POST","status":401,"body":"{\"error\":\"nope\"}"}'
      echo "{\"id\":$id,\"ok\":true,\"value\":null}" ;;
    *'"op":"url"'*)
      echo "{\"id\":$id,\"ok\":true,\"value\":\"http://localhost:1/login\"}" ;;
    *'"op":"cookies"'*)
      echo "{\"id\":$id,\"ok\":true,\"value\":[{\"name\":\"id\",\"value\":\"abc\",\"path\":\"/\"}]}" ;;
    *'"op":"close"'*)
      echo "{\"id\":$id,\"ok\":true,\"value\":null}"
      exit 0 ;;
    *)
      echo "{\"id\":$id,\"ok\":false,\"error\":\"unsupported\"}" ;;
  esac
done
"#;

    fn fake_config(dir: &Path) -> PlaywrightConfig {
        let driver = dir.join("fake-driver.sh");
        std::fs::write(&driver, FAKE_DRIVER).unwrap();
        PlaywrightConfig {
            driver_command: vec!["/bin/sh".into(), driver.to_string_lossy().into_owned()],
            launch_timeout: Duration::from_secs(5),
            action_timeout: Duration::from_secs(5),
            ..PlaywrightConfig::default()
        }
    }

    #[test]
    fn test_driver_messages_parse() {
        let reply: DriverMessage =
            serde_json::from_str(r#"{"id":7,"ok":true,"value":"x"}"#).unwrap();
        assert!(matches!(reply, DriverMessage::Reply { id: 7, ok: true, .. }));

        let event: DriverMessage = serde_json::from_str(
            r#"{"event":"response","url":"http://h/api/auth/me","method":"GET","status":200,"body":null}"#,
        )
        .unwrap();
        match event {
            DriverMessage::Event(DriverEvent::Response(r)) => {
                assert_eq!(r.status, 200);
                assert_eq!(r.body, None);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(serde_json::from_str::<DriverMessage>(r#"{"level":"info"}"#).is_err());
    }

    #[test]
    fn test_config_deserializes_partial_yaml() {
        let yaml = "browser: firefox\nheadless: false\naction_timeout: 1500\n";
        let config: PlaywrightConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.browser, Browser::Firefox);
        assert!(!config.headless);
        assert_eq!(config.action_timeout, Duration::from_millis(1500));
        assert_eq!(config.viewport_width, 1280);
    }

    #[tokio::test]
    async fn test_page_round_trips_commands_and_records_responses() {
        let dir = tempfile::tempdir().unwrap();
        let page = PlaywrightPage::launch(&fake_config(dir.path())).await.unwrap();

        assert_eq!(page.current_url().await.unwrap(), "http://localhost:1/login");

        let cursor = page.response_cursor();
        assert_eq!(cursor, 0);
        page.click("button").await.unwrap();

        let matcher = ResponseMatcher::new("/login", "POST");
        let found = page
            .wait_for_response(&matcher, cursor, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.status, 401);
        assert_eq!(found.body.as_deref(), Some(r#"{"error":"nope"}"#));

        let later = page
            .wait_for_response(&matcher, cursor + 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(later.is_none());

        let cookies = page.cookies().await.unwrap();
        assert_eq!(cookies[0].value, "abc");

        let err = page.fill("input", "x").await.unwrap_err();
        assert!(err.to_string().contains("unsupported"));

        page.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_that_exits_before_ready_fails_launch() {
        let config = PlaywrightConfig {
            driver_command: vec!["/bin/sh".into(), "-c".into(), "exit 3".into()],
            launch_timeout: Duration::from_secs(5),
            ..PlaywrightConfig::default()
        };
        let err = PlaywrightPage::launch(&config).await.err().unwrap();
        assert!(matches!(err, E2eError::Browser(_)), "got {:?}", err);
    }
}
