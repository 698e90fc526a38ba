//! Update jobs and their durable markers

use std::path::{Path, PathBuf};

use lwm2m_core::objects::{firmware, software};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::UpdateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Downloading,
    Downloaded,
    /// Package being checked; stays here with `verified` set once it passed
    Verifying,
    Updating,
    Updated,
    Failed,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Downloading => "downloading",
            UpdateState::Downloaded => "downloaded",
            UpdateState::Verifying => "verifying",
            UpdateState::Updating => "updating",
            UpdateState::Updated => "updated",
            UpdateState::Failed => "failed",
        }
    }

    /// Allowed forward transitions; reset to Idle is handled separately
    fn can_enter(&self, next: UpdateState) -> bool {
        use UpdateState::*;
        matches!(
            (self, next),
            (Idle | Failed | Updated | Downloaded | Verifying, Downloading)
                | (Downloading, Downloaded)
                | (Downloaded, Verifying)
                | (Downloaded | Verifying, Updating)
                | (Updating, Updated)
                | (Downloading | Downloaded | Verifying | Updating, Failed)
                | (Idle, Failed)
        )
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome vocabulary shared by objects 5 and 9
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateResult {
    Initial,
    Downloading,
    /// Firmware applied
    Success,
    /// Software package verified and delivered
    Verified,
    /// Software package installed
    Installed,
    NotEnoughStorage,
    OutOfMemory,
    ConnectionLost,
    IntegrityFailure,
    UnsupportedPackage,
    InvalidUri,
    UpdateFailed,
    UnsupportedProtocol,
    InstallFailure,
    UninstallFailure,
}

impl UpdateResult {
    /// Firmware Update Result (/5/0/5)
    pub fn firmware_code(&self) -> i64 {
        match self {
            UpdateResult::Initial
            | UpdateResult::Downloading
            | UpdateResult::Verified
            | UpdateResult::Installed => firmware::RESULT_INITIAL,
            UpdateResult::Success => firmware::RESULT_SUCCESS,
            UpdateResult::NotEnoughStorage => firmware::RESULT_NOT_ENOUGH_FLASH,
            UpdateResult::OutOfMemory => firmware::RESULT_OUT_OF_RAM,
            UpdateResult::ConnectionLost => firmware::RESULT_CONNECTION_LOST,
            UpdateResult::IntegrityFailure => firmware::RESULT_INTEGRITY_FAILURE,
            UpdateResult::UnsupportedPackage => firmware::RESULT_UNSUPPORTED_PACKAGE,
            UpdateResult::InvalidUri => firmware::RESULT_INVALID_URI,
            UpdateResult::UpdateFailed
            | UpdateResult::InstallFailure
            | UpdateResult::UninstallFailure => firmware::RESULT_UPDATE_FAILED,
            UpdateResult::UnsupportedProtocol => firmware::RESULT_UNSUPPORTED_PROTOCOL,
        }
    }

    /// Software Management Update Result (/9/x/9)
    pub fn software_code(&self) -> i64 {
        match self {
            UpdateResult::Initial => software::RESULT_INITIAL,
            UpdateResult::Downloading => software::RESULT_DOWNLOADING,
            UpdateResult::Success | UpdateResult::Installed => software::RESULT_INSTALLED,
            UpdateResult::Verified => software::RESULT_DOWNLOADED_VERIFIED,
            UpdateResult::NotEnoughStorage => software::RESULT_NOT_ENOUGH_STORAGE,
            UpdateResult::OutOfMemory => software::RESULT_OUT_OF_MEMORY,
            UpdateResult::ConnectionLost => software::RESULT_CONNECTION_LOST,
            UpdateResult::IntegrityFailure => software::RESULT_INTEGRITY_FAILURE,
            UpdateResult::UnsupportedPackage => software::RESULT_UNSUPPORTED_PACKAGE,
            UpdateResult::InvalidUri | UpdateResult::UnsupportedProtocol => {
                software::RESULT_INVALID_URI
            }
            UpdateResult::UpdateFailed => software::RESULT_UPDATE_ERROR,
            UpdateResult::InstallFailure => software::RESULT_INSTALL_FAILURE,
            UpdateResult::UninstallFailure => software::RESULT_UNINSTALL_FAILURE,
        }
    }
}

impl From<&UpdateError> for UpdateResult {
    fn from(err: &UpdateError) -> Self {
        match err {
            UpdateError::ConnectionLost(_) => UpdateResult::ConnectionLost,
            UpdateError::InvalidUri(_) => UpdateResult::InvalidUri,
            UpdateError::UnsupportedProtocol(_) => UpdateResult::UnsupportedProtocol,
            UpdateError::NotEnoughStorage(_) => UpdateResult::NotEnoughStorage,
            UpdateError::OutOfMemory(_) => UpdateResult::OutOfMemory,
            UpdateError::Integrity(_) => UpdateResult::IntegrityFailure,
            UpdateError::UnsupportedPackage(_) => UpdateResult::UnsupportedPackage,
            UpdateError::Updater(_) | UpdateError::InvalidState(_) => UpdateResult::UpdateFailed,
            UpdateError::Io(e) if is_storage_full(e) => UpdateResult::NotEnoughStorage,
            UpdateError::Io(_) | UpdateError::Marker(_) => UpdateResult::UpdateFailed,
        }
    }
}

/// ENOSPC / EDQUOT
pub fn is_storage_full(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(28) | Some(122))
}

/// How the package reached the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Delivery {
    Push,
    Pull { uri: String },
}

/// One update job per object instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateJob {
    pub object: u16,
    pub instance: u16,
    pub state: UpdateState,
    pub result: UpdateResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Delivery>,
    /// Path of the staged package once fully received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<PathBuf>,
    /// Software package passed digest verification
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub activated: bool,
    /// Exit code of the last updater run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updater_exit: Option<i32>,
}

impl UpdateJob {
    pub fn new(object: u16, instance: u16) -> Self {
        Self {
            object,
            instance,
            state: UpdateState::Idle,
            result: UpdateResult::Initial,
            delivery: None,
            staged: None,
            verified: false,
            activated: false,
            updater_exit: None,
        }
    }

    pub fn key(&self) -> (u16, u16) {
        (self.object, self.instance)
    }

    pub fn transition(&mut self, next: UpdateState) -> Result<(), UpdateError> {
        if !self.state.can_enter(next) {
            return Err(UpdateError::InvalidState(format!(
                "/{}/{} cannot go from {} to {}",
                self.object, self.instance, self.state, next
            )));
        }
        debug!(
            object = self.object,
            instance = self.instance,
            from = %self.state,
            to = %next,
            "Update job transition"
        );
        if next == UpdateState::Downloading {
            self.verified = false;
            self.activated = false;
            self.updater_exit = None;
            self.staged = None;
            self.result = UpdateResult::Downloading;
        }
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self, result: UpdateResult) {
        warn!(
            object = self.object,
            instance = self.instance,
            from = %self.state,
            ?result,
            "Update job failed"
        );
        self.state = UpdateState::Failed;
        self.result = result;
    }

    /// Clear the job; refused while the updater runs
    pub fn reset(&mut self) -> Result<(), UpdateError> {
        if self.state == UpdateState::Updating {
            return Err(UpdateError::InvalidState(format!(
                "/{}/{} is updating",
                self.object, self.instance
            )));
        }
        *self = Self::new(self.object, self.instance);
        Ok(())
    }

    /// Firmware State (/5/0/3)
    pub fn firmware_state(&self) -> i64 {
        match self.state {
            UpdateState::Idle | UpdateState::Updated | UpdateState::Failed => firmware::STATE_IDLE,
            UpdateState::Downloading => firmware::STATE_DOWNLOADING,
            UpdateState::Downloaded | UpdateState::Verifying => firmware::STATE_DOWNLOADED,
            UpdateState::Updating => firmware::STATE_UPDATING,
        }
    }

    /// Software Update State (/9/x/7)
    pub fn software_state(&self) -> i64 {
        match self.state {
            UpdateState::Idle | UpdateState::Failed => software::STATE_INITIAL,
            UpdateState::Downloading => software::STATE_DOWNLOAD_STARTED,
            UpdateState::Downloaded => software::STATE_DOWNLOADED,
            UpdateState::Verifying if self.verified => software::STATE_DELIVERED,
            UpdateState::Verifying => software::STATE_DOWNLOADED,
            UpdateState::Updating => software::STATE_DELIVERED,
            UpdateState::Updated => software::STATE_INSTALLED,
        }
    }

    /// Durable marker location for this job
    pub fn marker_path(staging: &Path, object: u16, instance: u16) -> PathBuf {
        staging.join(format!("{}_{}.job.json", object, instance))
    }

    pub fn package_path(staging: &Path, object: u16, instance: u16) -> PathBuf {
        staging.join(format!("{}_{}.pkg", object, instance))
    }

    pub fn work_dir(staging: &Path, object: u16, instance: u16) -> PathBuf {
        staging.join(format!("{}_{}.d", object, instance))
    }

    /// Write the marker atomically (temp file then rename)
    pub async fn persist(&self, staging: &Path) -> Result<(), UpdateError> {
        let path = Self::marker_path(staging, self.object, self.instance);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Load the last durable state, mapping states that cannot survive a
    /// restart onto failures
    pub async fn restore(
        staging: &Path,
        object: u16,
        instance: u16,
    ) -> Result<Option<Self>, UpdateError> {
        let path = Self::marker_path(staging, object, instance);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut job: UpdateJob = serde_json::from_slice(&body)?;
        job.object = object;
        job.instance = instance;
        match job.state {
            UpdateState::Downloading => job.fail(UpdateResult::ConnectionLost),
            UpdateState::Updating => job.fail(match object {
                software::ID => UpdateResult::InstallFailure,
                _ => UpdateResult::UpdateFailed,
            }),
            _ => {}
        }
        Ok(Some(job))
    }

    pub async fn remove_marker(staging: &Path, object: u16, instance: u16) {
        let path = Self::marker_path(staging, object, instance);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove job marker");
            }
        }
    }
}
