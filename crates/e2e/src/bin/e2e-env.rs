//! e2e-env - bring up one test environment by hand
//!
//! Run with: cargo run --package newsletter-e2e --bin e2e-env -- up --test-name debug

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use newsletter_e2e::config::HarnessConfig;
use newsletter_e2e::lifecycle::TestEnvironment;
use newsletter_e2e::login::BrowserLauncher;
use newsletter_e2e::playwright::{Browser, PlaywrightLauncher};
use newsletter_e2e::telemetry;

#[derive(Parser, Debug)]
#[command(name = "e2e-env")]
#[command(author, version, about = "Ephemeral backend + frontend environments for E2E debugging")]
struct Cli {
    /// YAML config file (defaults to $E2E_CONFIG, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start an environment, print its details and wait for Ctrl-C
    Up {
        /// Test name; selects the database namespace and log file
        #[arg(short, long)]
        test_name: String,

        /// Also log in through Playwright
        #[arg(long)]
        login: bool,

        /// Backend workspace root
        #[arg(long)]
        root: Option<PathBuf>,

        /// Frontend project directory
        #[arg(long)]
        frontend_dir: Option<PathBuf>,

        /// Directory for per-test log files
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Browser to use (chromium, firefox, webkit)
        #[arg(long)]
        browser: Option<String>,

        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },
}

fn parse_browser(name: &str) -> anyhow::Result<Browser> {
    match name.to_ascii_lowercase().as_str() {
        "chromium" | "chrome" => Ok(Browser::Chromium),
        "firefox" => Ok(Browser::Firefox),
        "webkit" | "safari" => Ok(Browser::Webkit),
        other => bail!("unknown browser '{}'", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    telemetry::init_with(if cli.verbose { "debug" } else { "info" });

    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HarnessConfig::from_env().context("loading config from environment")?,
    };

    match cli.command {
        Commands::Up {
            test_name,
            login,
            root,
            frontend_dir,
            log_dir,
            browser,
            headed,
        } => {
            if let Some(root) = root {
                config.backend.root = root;
            }
            if let Some(dir) = frontend_dir {
                config.browser.project_dir = dir.clone();
                config.frontend.dir = dir;
            }
            if let Some(dir) = log_dir {
                config.log_dir = dir;
            }
            if let Some(name) = browser {
                config.browser.browser = parse_browser(&name)?;
            }
            if headed {
                config.browser.headless = false;
            }
            config.validate()?;

            let launcher = if login {
                Some(PlaywrightLauncher::verified(config.browser.clone())?)
            } else {
                None
            };

            let mut env = TestEnvironment::new(config, &test_name);
            let session = match env
                .setup(launcher.as_ref().map(|l| l as &dyn BrowserLauncher))
                .await
            {
                Ok(session) => session,
                Err(e) => {
                    env.fail(&e);
                    env.teardown().await;
                    return Err(e.into());
                }
            };

            println!("{}", serde_json::to_string_pretty(&session)?);
            if let Some(path) = env.log().path() {
                info!("Logging to {}", path.display());
            }

            env.begin_test();
            info!("Environment is up; press Ctrl-C to tear it down");
            let waited = tokio::signal::ctrl_c().await;
            env.teardown().await;
            waited.context("waiting for Ctrl-C")?;
        }
    }

    Ok(())
}
