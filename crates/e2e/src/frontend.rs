//! Frontend dev server - spawned per test and pointed at that test's backend
//!
//! The dev server falls back to another port when its default is taken, which
//! is routine with parallel workers, so the bound port is always read back
//! from its output rather than assumed.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::FrontendConfig;
use crate::error::{E2eError, E2eResult};
use crate::log_sink::{LogSink, LogSource};
use crate::process::{ManagedProcess, ProcessSpec};
use crate::readiness::Readiness;

static ANSI_ESCAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ANSI regex"));

static LOCAL_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Local:\s+http://localhost:(\d+)").expect("valid Local: regex"));

/// Remove terminal colour/cursor escape sequences
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Port from the dev server's `Local:   http://localhost:<port>/` banner
pub fn extract_local_port(output: &str) -> Option<u16> {
    let clean = strip_ansi(output);
    LOCAL_URL
        .captures(&clean)
        .and_then(|caps| caps.get(1))
        .and_then(|port| port.as_str().parse().ok())
}

/// A running dev server owned by exactly one test
pub struct FrontendInstance {
    pub port: u16,
    pub url: String,
    /// Port of the backend this dev server proxies to
    pub backend_port: u16,
    process: ManagedProcess,
}

impl FrontendInstance {
    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub async fn stop(&mut self) {
        self.process.stop().await;
    }
}

pub struct FrontendSupervisor {
    config: FrontendConfig,
    sink: LogSink,
    client: reqwest::Client,
}

impl FrontendSupervisor {
    pub fn new(config: FrontendConfig, sink: LogSink) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            config,
            sink,
            client,
        })
    }

    /// Start the dev server with `BACKEND_PORT` set and wait until it serves pages
    pub async fn spawn(&self, backend_port: u16) -> E2eResult<FrontendInstance> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| E2eError::Config("frontend command is empty".into()))?;

        info!("Spawning frontend against backend port {}", backend_port);
        let spec = ProcessSpec::new("frontend", program, LogSource::Frontend)
            .args(args.iter().cloned())
            .cwd(&self.config.dir)
            .env("BACKEND_PORT", backend_port.to_string());

        let mut process = ManagedProcess::spawn(spec, self.sink.clone())?;

        let port = match self.await_started(&mut process).await {
            Ok(port) => port,
            Err(e) => {
                process.stop().await;
                return Err(e);
            }
        };

        let url = format!("http://localhost:{}", port);
        if let Err(e) = self.await_reachable(&url).await {
            process.stop().await;
            return Err(e);
        }

        // Give client-side hydration a moment before anyone clicks
        sleep(self.config.settle_delay).await;

        info!("Frontend ready at {}", url);
        self.sink.test(format!("Frontend ready at {}", url));
        Ok(FrontendInstance {
            port,
            url,
            backend_port,
            process,
        })
    }

    /// Both the ready marker and the bound port must show up, each within its bound
    async fn await_started(&self, process: &mut ManagedProcess) -> E2eResult<u16> {
        let output = process.output().clone();
        let marker = self.config.ready_marker.clone();

        let marker_seen = Readiness::new(self.config.poll_interval, self.config.ready_timeout)
            .wait_for(|| {
                let seen = strip_ansi(&output.snapshot()).contains(&marker);
                let exited = process.try_exit_status();
                async move {
                    match (seen, exited) {
                        (true, _) => Some(Ok(())),
                        (false, Some(status)) => Some(Err(status)),
                        (false, None) => None,
                    }
                }
            })
            .await;

        match marker_seen {
            Ok(Ok(())) => {}
            Ok(Err(status)) => {
                return Err(E2eError::ExitedEarly {
                    process: "frontend".into(),
                    status: status.to_string(),
                    output: output.tail(),
                })
            }
            Err(_) => {
                return Err(E2eError::StartupTimeout {
                    process: "frontend".into(),
                    timeout_ms: self.config.ready_timeout.as_millis() as u64,
                    output: output.tail(),
                })
            }
        }

        Readiness::new(self.config.poll_interval, self.config.port_timeout)
            .wait_for(|| {
                let port = extract_local_port(&output.snapshot());
                async move { port }
            })
            .await
            .map_err(|_| E2eError::PortNotDetected {
                output: output.tail(),
            })
    }

    async fn await_reachable(&self, url: &str) -> E2eResult<()> {
        Readiness::new(self.config.probe_interval, self.config.probe_timeout)
            .wait_for(|| {
                let request = self.client.get(url).send();
                async move {
                    match request.await {
                        Ok(resp) => {
                            debug!("Frontend probe returned {}", resp.status());
                            Some(())
                        }
                        Err(_) => None,
                    }
                }
            })
            .await
            .map_err(|timeout| E2eError::ReadinessTimeout {
                url: url.to_string(),
                attempts: timeout.attempts,
            })
    }
}
