//! Firmware (object 5) and software (object 9) update engine
//!
//! One [`UpdateJob`] per object instance. Long running work (package
//! fetch, staging a pushed package, extraction and digest verification,
//! running the external updater) is spawned as a task whose result comes
//! back to the event loop as a [`TaskEvent`]. The engine itself is only
//! touched from the loop, and every job transition is persisted before it
//! becomes visible through the object resources.

pub mod download;
pub mod job;
pub mod manifest;
pub mod updater;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lwm2m_coap::Security;
use lwm2m_core::objects::{firmware, software};
use lwm2m_core::{ObjectError, Path, Registry, ResourceValue, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use download::{parse_package_uri, NetFetcher, PackageFetcher};
pub use job::{Delivery, UpdateJob, UpdateResult, UpdateState};
pub use updater::{
    classify_exit, PackageExtractor, ProcessUpdater, TarExtractor, Updater, UpdaterOutcome,
};

use crate::config::ClientConfig;
use crate::error::UpdateError;

/// Host collaborators used by the update engine
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn PackageFetcher>,
    pub firmware_updater: Arc<dyn Updater>,
    pub software_updater: Arc<dyn Updater>,
    pub extractor: Arc<dyn PackageExtractor>,
}

impl Collaborators {
    /// Network fetcher and external programs named in the configuration
    ///
    /// `coaps://` package pulls reuse the credentials of the first secured
    /// server account.
    pub fn from_config(config: &ClientConfig) -> Result<Self, UpdateError> {
        let coaps = config
            .servers
            .iter()
            .find_map(|s| s.security.to_security().ok().filter(|sec| *sec != Security::NoSec));
        let fetcher = NetFetcher::new(
            Duration::from_secs(config.update.download_timeout_secs),
            config.transmission.to_params(),
            config.block_szx,
            config.bind,
            coaps,
        )?;
        Ok(Self {
            fetcher: Arc::new(fetcher),
            firmware_updater: Arc::new(ProcessUpdater::new(&config.update.firmware_updater)),
            software_updater: Arc::new(ProcessUpdater::new(&config.update.software_updater)),
            extractor: Arc::new(TarExtractor::new(&config.update.extractor)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct UpdateSettings {
    pub staging_dir: PathBuf,
    pub restart_exit_code: i32,
    pub download_timeout: Duration,
}

impl From<&ClientConfig> for UpdateSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            staging_dir: config.update.staging_dir.clone(),
            restart_exit_code: config.update.restart_exit_code,
            download_timeout: Duration::from_secs(config.update.download_timeout_secs),
        }
    }
}

/// Completion of a spawned job task
#[derive(Debug)]
pub struct TaskEvent {
    pub object: u16,
    pub instance: u16,
    generation: u64,
    outcome: TaskOutcome,
}

#[derive(Debug)]
enum TaskOutcome {
    Fetched(Result<u64, UpdateError>),
    Staged(Result<(), UpdateError>),
    Verified(Result<usize, UpdateError>),
    Applied(Result<i32, UpdateError>),
}

struct RunningTask {
    generation: u64,
    handle: JoinHandle<()>,
    /// The updater owns the outcome once started
    cancellable: bool,
}

pub struct UpdateEngine {
    settings: UpdateSettings,
    collaborators: Collaborators,
    jobs: BTreeMap<(u16, u16), UpdateJob>,
    tasks: HashMap<(u16, u16), RunningTask>,
    generation: u64,
    tx: mpsc::UnboundedSender<TaskEvent>,
    restart_requested: bool,
    restart_taken: bool,
}

/// Resources the update engine answers for instead of the registry
pub fn is_update_resource(object: u16, resource: u16) -> bool {
    match object {
        firmware::ID => matches!(
            resource,
            firmware::PACKAGE | firmware::PACKAGE_URI | firmware::UPDATE
        ),
        software::ID => matches!(
            resource,
            software::PACKAGE
                | software::PACKAGE_URI
                | software::INSTALL
                | software::UNINSTALL
                | software::ACTIVATE
                | software::DEACTIVATE
        ),
        _ => false,
    }
}

/// Package resources accepting Block1 pushes
pub fn is_package_resource(object: u16, resource: u16) -> bool {
    matches!(
        (object, resource),
        (firmware::ID, firmware::PACKAGE) | (software::ID, software::PACKAGE)
    )
}

/// An empty write or a single NUL resets the job
fn is_reset_value(bytes: &[u8]) -> bool {
    bytes.is_empty() || bytes == [0]
}

impl UpdateEngine {
    pub fn new(
        settings: UpdateSettings,
        collaborators: Collaborators,
    ) -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            settings,
            collaborators,
            jobs: BTreeMap::new(),
            tasks: HashMap::new(),
            generation: 0,
            tx,
            restart_requested: false,
            restart_taken: false,
        };
        (engine, rx)
    }

    pub fn job(&self, object: u16, instance: u16) -> Option<&UpdateJob> {
        self.jobs.get(&(object, instance))
    }

    pub fn staging_dir(&self) -> &FsPath {
        &self.settings.staging_dir
    }

    /// True exactly once after an updater asked for a restart
    pub fn take_restart_request(&mut self) -> bool {
        if self.restart_requested && !self.restart_taken {
            self.restart_taken = true;
            return true;
        }
        false
    }

    /// Reload durable job markers for every firmware and software instance
    pub async fn restore(&mut self, registry: &mut Registry) -> Vec<Path> {
        let mut keys: Vec<(u16, u16)> = Vec::new();
        for object in [firmware::ID, software::ID] {
            keys.extend(registry.instance_ids(object).into_iter().map(|i| (object, i)));
        }
        let mut changed = Vec::new();
        for (object, instance) in keys {
            let job = match UpdateJob::restore(&self.settings.staging_dir, object, instance).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!(object, instance, error = %e, "Ignoring unreadable job marker");
                    continue;
                }
            };
            info!(object, instance, state = %job.state, result = ?job.result, "Restored update job");
            let resume_verify = job.state == UpdateState::Verifying && !job.verified;
            self.jobs.insert((object, instance), job);
            self.persist(object, instance).await;
            if resume_verify {
                self.spawn_verify(object, instance);
            }
            changed.extend(self.publish(registry, object, instance));
        }
        changed
    }

    // =========================================================================
    // Server operations
    // =========================================================================

    /// Write of the Package URI resource
    pub async fn write_uri(
        &mut self,
        registry: &mut Registry,
        object: u16,
        instance: u16,
        raw: &[u8],
    ) -> Result<Vec<Path>, ObjectError> {
        let uri = String::from_utf8_lossy(raw).trim().to_string();
        if is_reset_value(uri.as_bytes()) {
            return self.reset(registry, object, instance).await;
        }
        self.cancel_task(object, instance)?;
        if object == firmware::ID {
            let _ = registry.set_value(
                object,
                instance,
                firmware::PACKAGE_URI,
                ResourceValue::single(uri.clone()),
            );
        }

        let job = self.job_mut(object, instance);
        match parse_package_uri(&uri) {
            Ok(url) => {
                job.transition(UpdateState::Downloading)?;
                job.delivery = Some(Delivery::Pull { uri: uri.clone() });
                info!(object, instance, uri = %uri, "Package pull requested");
                self.persist(object, instance).await;
                self.spawn_fetch(object, instance, url);
            }
            Err(e) => {
                job.fail(UpdateResult::from(&e));
                self.persist(object, instance).await;
            }
        }
        Ok(self.publish(registry, object, instance))
    }

    /// First block of a package push arrived
    pub async fn push_started(
        &mut self,
        registry: &mut Registry,
        object: u16,
        instance: u16,
    ) -> Result<Vec<Path>, ObjectError> {
        self.cancel_task(object, instance)?;
        let job = self.job_mut(object, instance);
        job.transition(UpdateState::Downloading)?;
        job.delivery = Some(Delivery::Push);
        self.persist(object, instance).await;
        Ok(self.publish(registry, object, instance))
    }

    /// Whole package received, stage it to disk
    pub async fn push_completed(
        &mut self,
        registry: &mut Registry,
        object: u16,
        instance: u16,
        body: Vec<u8>,
    ) -> Result<Vec<Path>, ObjectError> {
        if is_reset_value(&body) {
            return self.reset(registry, object, instance).await;
        }
        let mut changed = Vec::new();
        if self.job(object, instance).map(|j| j.state) != Some(UpdateState::Downloading) {
            changed.extend(self.push_started(registry, object, instance).await?);
        }
        info!(object, instance, bytes = body.len(), "Package push complete");
        self.spawn_stage(object, instance, body);
        Ok(changed)
    }

    /// Push aborted mid-transfer
    pub async fn push_failed(&mut self, registry: &mut Registry, object: u16, instance: u16) -> Vec<Path> {
        let Some(job) = self.jobs.get_mut(&(object, instance)) else {
            return Vec::new();
        };
        if job.state != UpdateState::Downloading {
            return Vec::new();
        }
        job.fail(UpdateResult::ConnectionLost);
        self.persist(object, instance).await;
        self.publish(registry, object, instance)
    }

    /// Execute of Update, Install, Uninstall, Activate or Deactivate
    pub async fn execute(
        &mut self,
        registry: &mut Registry,
        object: u16,
        instance: u16,
        resource: u16,
    ) -> Result<Vec<Path>, ObjectError> {
        let key = (object, instance);
        let job = self.job_mut(object, instance);
        let state = job.state;
        match (object, resource) {
            (firmware::ID, firmware::UPDATE) => {
                if state == UpdateState::Updating {
                    // A second Update while one runs is ignored
                    debug!(object, instance, "Update already in progress");
                    return Ok(Vec::new());
                }
                job.transition(UpdateState::Updating)
                    .map_err(|_| not_ready(key, state, "no downloaded package"))?;
                self.persist(object, instance).await;
                self.spawn_apply(object, instance);
            }
            (software::ID, software::INSTALL) => {
                if !(state == UpdateState::Verifying && job.verified) {
                    return Err(not_ready(key, state, "package not delivered"));
                }
                job.transition(UpdateState::Updating)?;
                self.persist(object, instance).await;
                self.spawn_apply(object, instance);
            }
            (software::ID, software::UNINSTALL) => {
                if state == UpdateState::Idle {
                    return Err(not_ready(key, state, "nothing to uninstall"));
                }
                return self.reset(registry, object, instance).await;
            }
            (software::ID, software::ACTIVATE | software::DEACTIVATE) => {
                if state != UpdateState::Updated {
                    return Err(not_ready(key, state, "package not installed"));
                }
                job.activated = resource == software::ACTIVATE;
                info!(object, instance, activated = job.activated, "Activation state changed");
                self.persist(object, instance).await;
            }
            _ => {
                return Err(ObjectError::MethodNotAllowed(
                    Path::resource(object, instance, resource).to_string(),
                ))
            }
        }
        Ok(self.publish(registry, object, instance))
    }

    /// Clear a job and its staged files; refused while updating
    pub async fn reset(
        &mut self,
        registry: &mut Registry,
        object: u16,
        instance: u16,
    ) -> Result<Vec<Path>, ObjectError> {
        self.cancel_task(object, instance)?;
        self.job_mut(object, instance).reset()?;
        info!(object, instance, "Update job reset");
        let staging = self.settings.staging_dir.clone();
        remove_staged(&staging, object, instance).await;
        if object == firmware::ID {
            let _ = registry.set_value(
                object,
                instance,
                firmware::PACKAGE_URI,
                ResourceValue::single(String::new()),
            );
        }
        UpdateJob::remove_marker(&staging, object, instance).await;
        Ok(self.publish(registry, object, instance))
    }

    // =========================================================================
    // Task completion
    // =========================================================================

    pub async fn on_task_event(&mut self, registry: &mut Registry, event: TaskEvent) -> Vec<Path> {
        let key = (event.object, event.instance);
        match self.tasks.get(&key) {
            Some(task) if task.generation == event.generation => {
                self.tasks.remove(&key);
            }
            _ => {
                debug!(object = key.0, instance = key.1, "Dropping stale task result");
                return Vec::new();
            }
        }
        let (object, instance) = key;
        let staging = self.settings.staging_dir.clone();
        let restart_code = self.settings.restart_exit_code;
        let job = self.job_mut(object, instance);

        let mut verify = false;
        match event.outcome {
            TaskOutcome::Fetched(Ok(_)) | TaskOutcome::Staged(Ok(())) => {
                job.staged = Some(UpdateJob::package_path(&staging, object, instance));
                if let Err(e) = job.transition(UpdateState::Downloaded) {
                    warn!(error = %e, "Download finished in unexpected state");
                    return Vec::new();
                }
                job.result = UpdateResult::Initial;
                if object == software::ID {
                    verify = job.transition(UpdateState::Verifying).is_ok();
                }
            }
            TaskOutcome::Fetched(Err(e)) | TaskOutcome::Staged(Err(e)) => {
                warn!(object, instance, error = %e, "Package download failed");
                job.fail(UpdateResult::from(&e));
                remove_staged(&staging, object, instance).await;
            }
            TaskOutcome::Verified(Ok(files)) => {
                info!(object, instance, files, "Software package verified");
                job.verified = true;
                job.result = UpdateResult::Verified;
            }
            TaskOutcome::Verified(Err(e)) => {
                warn!(object, instance, error = %e, "Software package rejected");
                job.fail(UpdateResult::from(&e));
            }
            TaskOutcome::Applied(result) => {
                let fallback = if object == software::ID {
                    UpdateResult::InstallFailure
                } else {
                    UpdateResult::UpdateFailed
                };
                let restart = (object == software::ID).then_some(restart_code);
                match result {
                    Ok(code) => {
                        job.updater_exit = Some(code);
                        match classify_exit(code, restart, fallback) {
                            UpdaterOutcome::Success => {
                                info!(object, instance, "Update applied");
                                let _ = job.transition(UpdateState::Updated);
                                job.result = if object == software::ID {
                                    UpdateResult::Installed
                                } else {
                                    UpdateResult::Success
                                };
                            }
                            UpdaterOutcome::RestartRequested => {
                                info!(object, instance, code, "Updater requested a restart");
                                let _ = job.transition(UpdateState::Updated);
                                job.result = UpdateResult::Installed;
                                self.restart_requested = true;
                            }
                            UpdaterOutcome::Failed(result) => {
                                warn!(object, instance, code, "Updater failed");
                                job.fail(result);
                            }
                        }
                    }
                    Err(e) => {
                        error!(object, instance, error = %e, "Updater did not run");
                        job.fail(fallback);
                    }
                }
            }
        }
        self.persist(object, instance).await;
        if verify {
            self.spawn_verify(object, instance);
        }
        self.publish(registry, object, instance)
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn spawn<F>(&mut self, object: u16, instance: u16, cancellable: bool, work: F)
    where
        F: std::future::Future<Output = TaskOutcome> + Send + 'static,
    {
        let generation = self.next_generation();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let outcome = work.await;
            let _ = tx.send(TaskEvent {
                object,
                instance,
                generation,
                outcome,
            });
        });
        self.tasks.insert(
            (object, instance),
            RunningTask {
                generation,
                handle,
                cancellable,
            },
        );
    }

    fn spawn_fetch(&mut self, object: u16, instance: u16, url: url::Url) {
        let fetcher = self.collaborators.fetcher.clone();
        let dest = UpdateJob::package_path(&self.settings.staging_dir, object, instance);
        let timeout = self.settings.download_timeout;
        self.spawn(object, instance, true, async move {
            let result = match tokio::time::timeout(timeout, fetcher.fetch(&url, &dest)).await {
                Ok(result) => result,
                Err(_) => Err(UpdateError::ConnectionLost(format!(
                    "download exceeded {}s",
                    timeout.as_secs()
                ))),
            };
            TaskOutcome::Fetched(result)
        });
    }

    fn spawn_stage(&mut self, object: u16, instance: u16, body: Vec<u8>) {
        let dest = UpdateJob::package_path(&self.settings.staging_dir, object, instance);
        self.spawn(object, instance, true, async move {
            let part = dest.with_extension("part");
            let result = async {
                tokio::fs::write(&part, &body).await?;
                tokio::fs::rename(&part, &dest).await?;
                Ok::<(), std::io::Error>(())
            }
            .await
            .map_err(|e| {
                if job::is_storage_full(&e) {
                    UpdateError::NotEnoughStorage(e.to_string())
                } else {
                    UpdateError::Io(e)
                }
            });
            TaskOutcome::Staged(result)
        });
    }

    fn spawn_verify(&mut self, object: u16, instance: u16) {
        let extractor = self.collaborators.extractor.clone();
        let archive = UpdateJob::package_path(&self.settings.staging_dir, object, instance);
        let work_dir = UpdateJob::work_dir(&self.settings.staging_dir, object, instance);
        self.spawn(object, instance, true, async move {
            let result = async {
                match tokio::fs::remove_dir_all(&work_dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                tokio::fs::create_dir_all(&work_dir).await?;
                extractor.extract(&archive, &work_dir).await?;
                manifest::verify_dir(&work_dir).await
            }
            .await;
            TaskOutcome::Verified(result)
        });
    }

    fn spawn_apply(&mut self, object: u16, instance: u16) {
        let updater = if object == software::ID {
            self.collaborators.software_updater.clone()
        } else {
            self.collaborators.firmware_updater.clone()
        };
        let package = UpdateJob::package_path(&self.settings.staging_dir, object, instance);
        self.spawn(object, instance, false, async move {
            TaskOutcome::Applied(updater.apply(&package).await)
        });
    }

    /// Abort a running download or verification
    fn cancel_task(&mut self, object: u16, instance: u16) -> Result<(), UpdateError> {
        let key = (object, instance);
        match self.tasks.get(&key) {
            Some(task) if !task.cancellable => Err(UpdateError::InvalidState(format!(
                "/{}/{} is updating",
                object, instance
            ))),
            Some(_) => {
                if let Some(task) = self.tasks.remove(&key) {
                    task.handle.abort();
                    debug!(object, instance, "Cancelled update task");
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn job_mut(&mut self, object: u16, instance: u16) -> &mut UpdateJob {
        self.jobs
            .entry((object, instance))
            .or_insert_with(|| UpdateJob::new(object, instance))
    }

    async fn persist(&self, object: u16, instance: u16) {
        if let Some(job) = self.jobs.get(&(object, instance)) {
            if let Err(e) = job.persist(&self.settings.staging_dir).await {
                error!(object, instance, error = %e, "Failed to persist update job");
            }
        }
    }

    /// Mirror a job onto its object resources, returning changed paths
    fn publish(&self, registry: &mut Registry, object: u16, instance: u16) -> Vec<Path> {
        let Some(job) = self.jobs.get(&(object, instance)) else {
            return Vec::new();
        };
        let values: Vec<(u16, Value)> = match object {
            firmware::ID => vec![
                (firmware::STATE, Value::Integer(job.firmware_state())),
                (firmware::UPDATE_RESULT, Value::Integer(job.result.firmware_code())),
            ],
            software::ID => vec![
                (software::UPDATE_STATE, Value::Integer(job.software_state())),
                (software::UPDATE_RESULT, Value::Integer(job.result.software_code())),
                (software::ACTIVATION_STATE, Value::Boolean(job.activated)),
            ],
            _ => Vec::new(),
        };
        let mut changed = Vec::new();
        for (resource, value) in values {
            match registry.set_value(object, instance, resource, ResourceValue::Single(value)) {
                Ok(true) => changed.push(Path::resource(object, instance, resource)),
                Ok(false) => {}
                Err(e) => debug!(object, instance, resource, error = %e, "Cannot publish update state"),
            }
        }
        changed
    }
}

fn not_ready(key: (u16, u16), state: UpdateState, reason: &str) -> ObjectError {
    ObjectError::MethodNotAllowed(format!("/{}/{} is {}: {}", key.0, key.1, state, reason))
}

async fn remove_staged(staging: &FsPath, object: u16, instance: u16) {
    let package = UpdateJob::package_path(staging, object, instance);
    for file in [package.clone(), package.with_extension("part")] {
        if let Err(e) = tokio::fs::remove_file(&file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %file.display(), error = %e, "Failed to remove staged file");
            }
        }
    }
    let work_dir = UpdateJob::work_dir(staging, object, instance);
    let _ = tokio::fs::remove_dir_all(&work_dir).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use sha2::{Digest, Sha256};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a fixed body, or fails with a connection error
    struct FakeFetcher {
        body: Option<Vec<u8>>,
    }

    #[async_trait]
    impl PackageFetcher for FakeFetcher {
        async fn fetch(&self, _uri: &url::Url, dest: &FsPath) -> Result<u64, UpdateError> {
            match &self.body {
                Some(body) => {
                    tokio::fs::write(dest, body).await?;
                    Ok(body.len() as u64)
                }
                None => Err(UpdateError::ConnectionLost("refused".into())),
            }
        }
    }

    struct FakeUpdater {
        code: i32,
        runs: AtomicUsize,
        packages: Mutex<Vec<PathBuf>>,
    }

    impl FakeUpdater {
        fn new(code: i32) -> Arc<Self> {
            Arc::new(Self {
                code,
                runs: AtomicUsize::new(0),
                packages: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Updater for FakeUpdater {
        async fn apply(&self, package: &FsPath) -> Result<i32, UpdateError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.packages.lock().push(package.to_path_buf());
            Ok(self.code)
        }
    }

    /// "Extracts" by treating the archive as `name=content` lines
    struct LineExtractor;

    #[async_trait]
    impl PackageExtractor for LineExtractor {
        async fn extract(&self, archive: &FsPath, dest: &FsPath) -> Result<(), UpdateError> {
            let text = tokio::fs::read_to_string(archive).await?;
            for line in text.lines() {
                let (name, content) = line
                    .split_once('=')
                    .ok_or_else(|| UpdateError::UnsupportedPackage("bad archive".into()))?;
                tokio::fs::write(dest.join(name), content.replace("\\n", "\n")).await?;
            }
            Ok(())
        }
    }

    fn archive(binary: &str, manifest_digest_of: &str) -> Vec<u8> {
        let digest = hex::encode(Sha256::digest(manifest_digest_of.as_bytes()));
        format!("lwm2md={}\nchecksums.txt={}  lwm2md\\n\n", binary, digest).into_bytes()
    }

    struct Harness {
        engine: UpdateEngine,
        rx: mpsc::UnboundedReceiver<TaskEvent>,
        registry: Registry,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(fetched: Option<Vec<u8>>, firmware: Arc<FakeUpdater>, software: Arc<FakeUpdater>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let (engine, rx) = UpdateEngine::new(
                UpdateSettings {
                    staging_dir: dir.path().to_path_buf(),
                    restart_exit_code: 10,
                    download_timeout: Duration::from_secs(30),
                },
                Collaborators {
                    fetcher: Arc::new(FakeFetcher { body: fetched }),
                    firmware_updater: firmware,
                    software_updater: software,
                    extractor: Arc::new(LineExtractor),
                },
            );
            let mut registry = Registry::standard();
            registry
                .add_instance(
                    firmware::ID,
                    0,
                    [
                        (firmware::PACKAGE_URI, ResourceValue::single(String::new())),
                        (firmware::STATE, ResourceValue::single(0i64)),
                        (firmware::UPDATE_RESULT, ResourceValue::single(0i64)),
                    ]
                    .into_iter()
                    .collect(),
                )
                .unwrap();
            registry
                .add_instance(
                    software::ID,
                    0,
                    [
                        (software::UPDATE_STATE, ResourceValue::single(0i64)),
                        (software::UPDATE_RESULT, ResourceValue::single(0i64)),
                        (software::ACTIVATION_STATE, ResourceValue::single(false)),
                    ]
                    .into_iter()
                    .collect(),
                )
                .unwrap();
            Self {
                engine,
                rx,
                registry,
                _dir: dir,
            }
        }

        async fn settle(&mut self) {
            while !self.engine.tasks.is_empty() {
                let event = self.rx.recv().await.unwrap();
                self.engine.on_task_event(&mut self.registry, event).await;
            }
        }

        fn int(&self, object: u16, resource: u16) -> i64 {
            self.registry
                .value(object, 0, resource)
                .and_then(|v| v.as_single())
                .and_then(|v| v.as_integer())
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_firmware_pull_and_update() {
        let fw = FakeUpdater::new(0);
        let mut h = Harness::new(Some(b"image".to_vec()), fw.clone(), FakeUpdater::new(0));

        let changed = h
            .engine
            .write_uri(&mut h.registry, 5, 0, b"http://fw.example.net/image.bin")
            .await
            .unwrap();
        assert!(changed.contains(&Path::resource(5, 0, firmware::STATE)));
        assert_eq!(h.int(5, firmware::STATE), firmware::STATE_DOWNLOADING);

        h.settle().await;
        assert_eq!(h.int(5, firmware::STATE), firmware::STATE_DOWNLOADED);

        h.engine.execute(&mut h.registry, 5, 0, firmware::UPDATE).await.unwrap();
        assert_eq!(h.int(5, firmware::STATE), firmware::STATE_UPDATING);
        h.settle().await;
        assert_eq!(h.int(5, firmware::STATE), firmware::STATE_IDLE);
        assert_eq!(h.int(5, firmware::UPDATE_RESULT), firmware::RESULT_SUCCESS);
        assert_eq!(fw.runs.load(Ordering::SeqCst), 1);
        assert!(fw.packages.lock()[0].ends_with("5_0.pkg"));
    }

    #[tokio::test]
    async fn test_pull_failure_and_bad_uris() {
        let mut h = Harness::new(None, FakeUpdater::new(0), FakeUpdater::new(0));
        h.engine
            .write_uri(&mut h.registry, 5, 0, b"coap://fw.example.net/image")
            .await
            .unwrap();
        h.settle().await;
        assert_eq!(h.int(5, firmware::UPDATE_RESULT), firmware::RESULT_CONNECTION_LOST);

        h.engine
            .write_uri(&mut h.registry, 5, 0, b"ftp://fw.example.net/image")
            .await
            .unwrap();
        assert_eq!(h.int(5, firmware::UPDATE_RESULT), firmware::RESULT_UNSUPPORTED_PROTOCOL);

        h.engine.write_uri(&mut h.registry, 5, 0, b"::nonsense").await.unwrap();
        assert_eq!(h.int(5, firmware::UPDATE_RESULT), firmware::RESULT_INVALID_URI);

        h.engine.write_uri(&mut h.registry, 5, 0, b"\0").await.unwrap();
        assert_eq!(h.int(5, firmware::UPDATE_RESULT), firmware::RESULT_INITIAL);
        assert_eq!(h.engine.job(5, 0).unwrap().state, UpdateState::Idle);
    }

    #[tokio::test]
    async fn test_update_without_package_is_rejected() {
        let mut h = Harness::new(None, FakeUpdater::new(0), FakeUpdater::new(0));
        let err = h
            .engine
            .execute(&mut h.registry, 5, 0, firmware::UPDATE)
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectError::MethodNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_reset_refused_while_updating() {
        let fw = FakeUpdater::new(0);
        let mut h = Harness::new(None, fw, FakeUpdater::new(0));
        h.engine.push_started(&mut h.registry, 5, 0).await.unwrap();
        h.engine
            .push_completed(&mut h.registry, 5, 0, b"image".to_vec())
            .await
            .unwrap();
        h.settle().await;
        h.engine.execute(&mut h.registry, 5, 0, firmware::UPDATE).await.unwrap();

        let err = h.engine.write_uri(&mut h.registry, 5, 0, b"").await.unwrap_err();
        assert!(matches!(err, ObjectError::MethodNotAllowed(_)));
        h.settle().await;
        assert_eq!(h.engine.job(5, 0).unwrap().state, UpdateState::Updated);
    }

    #[tokio::test]
    async fn test_reset_forgets_durable_job() {
        let mut h = Harness::new(None, FakeUpdater::new(0), FakeUpdater::new(0));
        h.engine
            .push_completed(&mut h.registry, 5, 0, b"image".to_vec())
            .await
            .unwrap();
        h.settle().await;
        let marker = UpdateJob::marker_path(h.engine.staging_dir(), 5, 0);
        assert!(marker.exists());

        h.engine.write_uri(&mut h.registry, 5, 0, b"").await.unwrap();
        assert!(!marker.exists());
        assert_eq!(h.int(5, firmware::STATE), firmware::STATE_IDLE);

        h.engine.restore(&mut h.registry).await;
        assert_eq!(h.engine.job(5, 0).unwrap().state, UpdateState::Idle);
    }

    #[tokio::test]
    async fn test_software_digest_mismatch_never_installs() {
        let sw = FakeUpdater::new(0);
        let mut h = Harness::new(None, FakeUpdater::new(0), sw.clone());
        h.engine
            .push_completed(&mut h.registry, 9, 0, archive("new client", "other bytes"))
            .await
            .unwrap();
        h.settle().await;

        let job = h.engine.job(9, 0).unwrap();
        assert_eq!(job.state, UpdateState::Failed);
        assert_eq!(h.int(9, software::UPDATE_RESULT), software::RESULT_INTEGRITY_FAILURE);
        assert!(h
            .engine
            .execute(&mut h.registry, 9, 0, software::INSTALL)
            .await
            .is_err());
        assert_eq!(sw.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_software_restart_sentinel_signalled_once() {
        let sw = FakeUpdater::new(10);
        let mut h = Harness::new(None, FakeUpdater::new(0), sw.clone());
        h.engine
            .push_completed(&mut h.registry, 9, 0, archive("new client", "new client"))
            .await
            .unwrap();
        h.settle().await;
        assert_eq!(h.int(9, software::UPDATE_STATE), software::STATE_DELIVERED);
        assert_eq!(h.int(9, software::UPDATE_RESULT), software::RESULT_DOWNLOADED_VERIFIED);

        h.engine.execute(&mut h.registry, 9, 0, software::INSTALL).await.unwrap();
        h.settle().await;
        assert_eq!(h.int(9, software::UPDATE_STATE), software::STATE_INSTALLED);
        assert!(h.engine.take_restart_request());
        assert!(!h.engine.take_restart_request());

        // Installing again does not re-run the updater
        assert!(h
            .engine
            .execute(&mut h.registry, 9, 0, software::INSTALL)
            .await
            .is_err());
        assert_eq!(sw.runs.load(Ordering::SeqCst), 1);
        assert_eq!(h.engine.job(9, 0).unwrap().updater_exit, Some(10));
    }

    #[tokio::test]
    async fn test_software_install_failure_and_activation() {
        let mut h = Harness::new(None, FakeUpdater::new(0), FakeUpdater::new(0));
        h.engine
            .push_completed(&mut h.registry, 9, 0, archive("v2", "v2"))
            .await
            .unwrap();
        h.settle().await;
        assert!(h
            .engine
            .execute(&mut h.registry, 9, 0, software::ACTIVATE)
            .await
            .is_err());
        h.engine.execute(&mut h.registry, 9, 0, software::INSTALL).await.unwrap();
        h.settle().await;
        h.engine.execute(&mut h.registry, 9, 0, software::ACTIVATE).await.unwrap();
        assert_eq!(
            h.registry.value(9, 0, software::ACTIVATION_STATE),
            Some(&ResourceValue::single(true))
        );
        assert!(!h.engine.take_restart_request());

        h.engine.execute(&mut h.registry, 9, 0, software::UNINSTALL).await.unwrap();
        assert_eq!(h.int(9, software::UPDATE_STATE), software::STATE_INITIAL);
    }

    #[tokio::test]
    async fn test_failed_push_leaves_no_staged_file() {
        let mut h = Harness::new(None, FakeUpdater::new(0), FakeUpdater::new(0));
        h.engine.push_started(&mut h.registry, 5, 0).await.unwrap();
        h.engine.push_failed(&mut h.registry, 5, 0).await;
        assert_eq!(h.int(5, firmware::UPDATE_RESULT), firmware::RESULT_CONNECTION_LOST);
        let staged = UpdateJob::package_path(h.engine.staging_dir(), 5, 0);
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn test_restore_reports_durable_state() {
        let mut h = Harness::new(None, FakeUpdater::new(0), FakeUpdater::new(0));
        let mut job = UpdateJob::new(5, 0);
        job.state = UpdateState::Downloading;
        job.persist(h.engine.staging_dir()).await.unwrap();

        h.engine.restore(&mut h.registry).await;
        assert_eq!(h.int(5, firmware::STATE), firmware::STATE_IDLE);
        assert_eq!(h.int(5, firmware::UPDATE_RESULT), firmware::RESULT_CONNECTION_LOST);
    }

    #[tokio::test]
    async fn test_interrupted_update_restores_as_failed() {
        let mut h = Harness::new(None, FakeUpdater::new(0), FakeUpdater::new(0));
        let mut job = UpdateJob::new(5, 0);
        job.state = UpdateState::Updating;
        job.persist(h.engine.staging_dir()).await.unwrap();

        h.engine.restore(&mut h.registry).await;
        assert_eq!(h.int(5, firmware::STATE), firmware::STATE_IDLE);
        assert_eq!(h.int(5, firmware::UPDATE_RESULT), firmware::RESULT_UPDATE_FAILED);
    }
}
