//! External updater and extractor collaborators

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::job::UpdateResult;
use crate::error::UpdateError;

/// Applies a staged package, returning the process exit status
#[async_trait]
pub trait Updater: Send + Sync {
    async fn apply(&self, package: &Path) -> Result<i32, UpdateError>;
}

/// Unpacks a staged archive into a work directory
#[async_trait]
pub trait PackageExtractor: Send + Sync {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<(), UpdateError>;
}

/// Runs a host executable with the package path as its only argument
pub struct ProcessUpdater {
    program: PathBuf,
}

impl ProcessUpdater {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Updater for ProcessUpdater {
    async fn apply(&self, package: &Path) -> Result<i32, UpdateError> {
        info!(program = %self.program.display(), package = %package.display(), "Running updater");
        let mut child = Command::new(&self.program)
            .arg(package)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                UpdateError::Updater(format!("cannot start {}: {}", self.program.display(), e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(output = %line, "updater");
            }
        }
        let status = child.wait().await?;
        // Killed by a signal counts as a generic failure
        Ok(status.code().unwrap_or(-1))
    }
}

/// Runs `<program> -xzf <archive> -C <dest>`
pub struct TarExtractor {
    program: PathBuf,
}

impl TarExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl PackageExtractor for TarExtractor {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<(), UpdateError> {
        let output = Command::new(&self.program)
            .arg("-xzf")
            .arg(archive)
            .arg("-C")
            .arg(dest)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                UpdateError::UnsupportedPackage(format!(
                    "cannot start {}: {}",
                    self.program.display(),
                    e
                ))
            })?;
        if !output.status.success() {
            return Err(UpdateError::UnsupportedPackage(format!(
                "extraction failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// What an updater exit status means for the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterOutcome {
    Success,
    /// New client staged, the process must be restarted by its supervisor
    RestartRequested,
    Failed(UpdateResult),
}

pub const EXIT_NOT_ENOUGH_STORAGE: i32 = 2;
pub const EXIT_OUT_OF_MEMORY: i32 = 3;
pub const EXIT_INTEGRITY_FAILURE: i32 = 5;
pub const EXIT_UNSUPPORTED_PACKAGE: i32 = 6;

/// Map an exit status; `restart_code` is only honoured when given
pub fn classify_exit(code: i32, restart_code: Option<i32>, fallback: UpdateResult) -> UpdaterOutcome {
    match code {
        0 => UpdaterOutcome::Success,
        c if Some(c) == restart_code => UpdaterOutcome::RestartRequested,
        EXIT_NOT_ENOUGH_STORAGE => UpdaterOutcome::Failed(UpdateResult::NotEnoughStorage),
        EXIT_OUT_OF_MEMORY => UpdaterOutcome::Failed(UpdateResult::OutOfMemory),
        EXIT_INTEGRITY_FAILURE => UpdaterOutcome::Failed(UpdateResult::IntegrityFailure),
        EXIT_UNSUPPORTED_PACKAGE => UpdaterOutcome::Failed(UpdateResult::UnsupportedPackage),
        _ => UpdaterOutcome::Failed(fallback),
    }
}
