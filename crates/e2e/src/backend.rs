//! Backend management - spawning the per-test server and discovering where it listens
//!
//! The backend binds an ephemeral port and announces itself with one JSON
//! line on stdout, e.g.
//!
//! ```text
//! 2024-01-01T00:00:00Z INFO {"address":"http://127.0.0.1:5555","port":5555,"test_name":"login"}
//! ```

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{E2eError, E2eResult};
use crate::log_sink::{sanitize_test_name, LogSink, LogSource};
use crate::process::{ManagedProcess, ProcessSpec};
use crate::readiness::Readiness;

/// Service-discovery line printed by the backend once it is listening
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceAnnouncement {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub test_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Find the first announcement in cumulative output.
///
/// Each line may carry an arbitrary logger prefix before the JSON object.
pub fn parse_announcement(output: &str) -> Option<ServiceAnnouncement> {
    output.lines().find_map(parse_announcement_line)
}

fn parse_announcement_line(line: &str) -> Option<ServiceAnnouncement> {
    // Streaming parse stops at the object's end, so trailing logger text is ignored
    line.match_indices('{').find_map(|(start, _)| {
        serde_json::Deserializer::from_str(&line[start..])
            .into_iter::<ServiceAnnouncement>()
            .next()
            .and_then(Result::ok)
    })
}

/// A running backend owned by exactly one test
pub struct BackendInstance {
    pub port: u16,
    pub address: String,
    pub test_name: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_id: Option<String>,
    process: ManagedProcess,
}

impl BackendInstance {
    pub fn process(&self) -> &ManagedProcess {
        &self.process
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Terminate the backend; idempotent and infallible
    pub async fn stop(&mut self) {
        self.process.stop().await;
    }
}

/// Spawns backends from an already-provisioned binary
pub struct BackendSupervisor {
    binary: PathBuf,
    config: BackendConfig,
    sink: LogSink,
    client: reqwest::Client,
}

impl BackendSupervisor {
    pub fn new(
        binary: impl Into<PathBuf>,
        config: BackendConfig,
        sink: LogSink,
    ) -> E2eResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            binary: binary.into(),
            config,
            sink,
            client,
        })
    }

    /// Start a backend with its own database namespace and wait until it is healthy
    pub async fn spawn(&self, test_name: &str) -> E2eResult<BackendInstance> {
        let namespace = sanitize_test_name(test_name);
        info!("Spawning backend for {}", namespace);

        let mut spec = ProcessSpec::new("backend", &self.binary, LogSource::Backend)
            .args(self.config.args.iter().cloned())
            .cwd(&self.config.root)
            .env("TEST_NAME", &namespace)
            // Users are created through the API only
            .env("CREATE_USER", "false");
        if self.config.verbose {
            spec = spec.env("TEST_LOG", "true");
        }

        let mut process = ManagedProcess::spawn(spec, self.sink.clone())?;

        let announcement = match self.await_announcement(&mut process).await {
            Ok(announcement) => announcement,
            Err(e) => {
                process.stop().await;
                return Err(e);
            }
        };

        if let Some(echoed) = &announcement.test_name {
            if echoed != &namespace {
                warn!("Backend announced test name {} but {} was requested", echoed, namespace);
                self.sink.test(format!(
                    "Backend announced test name {} (requested {})",
                    echoed, namespace
                ));
            }
        }

        info!("Backend announced {} (port {})", announcement.address, announcement.port);
        self.sink
            .test(format!("Backend announced {}", announcement.address));

        if let Err(e) = self.await_healthy(&announcement.address).await {
            process.stop().await;
            return Err(e);
        }

        self.sink.test("Backend is healthy");
        Ok(BackendInstance {
            port: announcement.port,
            address: announcement.address,
            test_name: namespace,
            username: announcement.username,
            password: announcement.password,
            user_id: announcement.user_id,
            process,
        })
    }

    async fn await_announcement(
        &self,
        process: &mut ManagedProcess,
    ) -> E2eResult<ServiceAnnouncement> {
        let output = process.output().clone();
        let readiness = Readiness::new(self.config.announce_interval, self.config.announce_timeout);

        let outcome = readiness
            .wait_for(|| {
                let found = match parse_announcement(&output.snapshot()) {
                    Some(announcement) => Some(Ok(announcement)),
                    None => process.try_exit_status().map(Err),
                };
                async move { found }
            })
            .await;

        match outcome {
            Ok(Ok(announcement)) => Ok(announcement),
            Ok(Err(status)) => Err(E2eError::ExitedEarly {
                process: "backend".into(),
                status: status.to_string(),
                output: output.tail(),
            }),
            Err(_) => Err(E2eError::StartupTimeout {
                process: "backend".into(),
                timeout_ms: self.config.announce_timeout.as_millis() as u64,
                output: output.tail(),
            }),
        }
    }

    async fn await_healthy(&self, address: &str) -> E2eResult<()> {
        let url = format!("{}{}", address.trim_end_matches('/'), self.config.health_path);
        let readiness = Readiness::new(self.config.health_interval, self.config.health_timeout);

        readiness
            .wait_for(|| {
                let request = self.client.get(&url).send();
                async move {
                    match request.await {
                        Ok(resp) if resp.status().is_success() => Some(()),
                        Ok(resp) => {
                            debug!("Health check returned {}", resp.status());
                            None
                        }
                        Err(e) => {
                            // Connection refused is expected while the server is starting
                            if !e.is_connect() {
                                debug!("Health check error: {}", e);
                            }
                            None
                        }
                    }
                }
            })
            .await
            .map_err(|timeout| E2eError::ReadinessTimeout {
                url: url.clone(),
                attempts: timeout.attempts,
            })
    }
}
