//! Make sure the backend test server binary exists before any test spawns it

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use crate::config::BackendConfig;
use crate::error::{truncate_output, E2eError, E2eResult};
use crate::process::ERROR_OUTPUT_LIMIT;

/// Builds the backend binary on demand
#[derive(Debug, Clone)]
pub struct BinaryProvisioner {
    binary: PathBuf,
    build_command: Vec<String>,
}

impl BinaryProvisioner {
    pub fn new(binary: impl Into<PathBuf>, build_command: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            build_command,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.binary.clone(), config.build_command.clone())
    }

    /// Path of the binary under `root`, building it first if it is missing
    pub async fn ensure_binary(&self, root: &Path) -> E2eResult<PathBuf> {
        let path = if self.binary.is_absolute() {
            self.binary.clone()
        } else {
            root.join(&self.binary)
        };

        if path.exists() {
            return Ok(path);
        }

        let (program, args) = self
            .build_command
            .split_first()
            .ok_or_else(|| E2eError::Config("build command is empty".into()))?;

        info!(
            "{} not found, building with `{}`",
            path.display(),
            self.build_command.join(" ")
        );

        let output = Command::new(program)
            .args(args)
            .current_dir(root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| E2eError::BuildFailure {
                exit_code: None,
                output: format!("failed to run {}: {}", program, e),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(E2eError::BuildFailure {
                exit_code: output.status.code(),
                output: truncate_output(&combined, ERROR_OUTPUT_LIMIT),
            });
        }

        if !path.exists() {
            return Err(E2eError::BuildFailure {
                exit_code: output.status.code(),
                output: format!(
                    "build succeeded but {} is still missing\n{}",
                    path.display(),
                    truncate_output(&combined, ERROR_OUTPUT_LIMIT)
                ),
            });
        }

        info!("Built {}", path.display());
        Ok(path)
    }
}
