//! Host glue for the Device (3) and System Log (10259) objects
//!
//! Values are read from the running Linux system at read time: os-release
//! and machine-id for identity, /proc/meminfo for memory counters, the
//! local clock, and journald for the system log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, Offset, Utc};
use lwm2m_core::objects::{device, syslog};
use lwm2m_core::{ExecuteAction, ObjectError, ReadSource, Registry, ResourceValue, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

const OS_RELEASE: &str = "/etc/os-release";
const MACHINE_ID: &str = "/etc/machine-id";
const MEMINFO: &str = "/proc/meminfo";
const MODEL_FILES: [&str; 2] = [
    "/sys/firmware/devicetree/base/model",
    "/sys/class/dmi/id/product_name",
];

/// Cursor kept between incremental log reads
const JOURNAL_CURSOR: &str = "journal.cursor";
const JOURNAL_SNAPSHOT: &str = "journal.snapshot";
const JOURNAL_ALL_SNAPSHOT: &str = "journal-all.snapshot";

/// Attach host sources and actions to the registry
pub fn install(registry: &mut Registry, staging_dir: &Path) -> lwm2m_core::Result<()> {
    let os_release = |key: &'static str| Arc::new(OsRelease { key });
    registry.set_source(device::ID, device::MANUFACTURER, os_release("NAME"));
    registry.set_source(device::ID, device::FIRMWARE_VERSION, os_release("VERSION_ID"));
    registry.set_source(device::ID, device::MODEL_NUMBER, Arc::new(Model));
    registry.set_source(device::ID, device::SERIAL_NUMBER, Arc::new(MachineId));
    registry.set_source(device::ID, device::MEMORY_FREE, Arc::new(Memory { key: "MemFree" }));
    registry.set_source(device::ID, device::MEMORY_TOTAL, Arc::new(Memory { key: "MemTotal" }));
    registry.set_source(device::ID, device::CURRENT_TIME, Arc::new(Clock::Time));
    registry.set_source(device::ID, device::UTC_OFFSET, Arc::new(Clock::Offset));
    registry.set_source(device::ID, device::TIMEZONE, Arc::new(Clock::Zone));
    registry.set_action(device::ID, device::REBOOT, Arc::new(Reboot));
    registry.set_value(
        device::ID,
        0,
        device::AVAILABLE_POWER_SOURCES,
        ResourceValue::multiple([Value::Integer(device::POWER_DC)]),
    )?;

    registry.add_instance(
        syslog::ID,
        0,
        [
            (syslog::NAME, ResourceValue::single("journald")),
            (syslog::ENABLED, ResourceValue::single(true)),
        ]
        .into_iter()
        .collect(),
    )?;
    registry.set_source(
        syslog::ID,
        syslog::READ_ALL,
        Arc::new(Journal::journalctl(staging_dir.join(JOURNAL_ALL_SNAPSHOT), None)),
    );
    registry.set_source(
        syslog::ID,
        syslog::READ,
        Arc::new(Journal::journalctl(
            staging_dir.join(JOURNAL_SNAPSHOT),
            Some(&staging_dir.join(JOURNAL_CURSOR)),
        )),
    );
    debug!("Host sources installed");
    Ok(())
}

fn not_found(what: &str) -> ObjectError {
    ObjectError::NotFound(what.to_string())
}

async fn read_text(path: &str) -> lwm2m_core::Result<String> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        debug!(path, error = %e, "Host file unreadable");
        not_found(path)
    })
}

/// Value of `key` in os-release syntax, quotes removed
pub fn os_release_value(text: &str, key: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k.trim() == key).then(|| v.trim().trim_matches('"').trim_matches('\'').to_string())
    })
}

/// Meminfo counter converted from KiB to LwM2M kilobytes (1000 bytes)
pub fn meminfo_kilobytes(text: &str, key: &str) -> Option<i64> {
    text.lines().find_map(|line| {
        let (k, rest) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        let kib: i64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kib * 1024 / 1000)
    })
}

/// `UTC+05:30` style offset
pub fn format_utc_offset(seconds: i32) -> String {
    let sign = if seconds < 0 { '-' } else { '+' };
    let minutes = seconds.unsigned_abs() / 60;
    format!("UTC{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
}

struct OsRelease {
    key: &'static str,
}

#[async_trait]
impl ReadSource for OsRelease {
    async fn read(&self, _instance: u16) -> lwm2m_core::Result<ResourceValue> {
        let text = read_text(OS_RELEASE).await?;
        os_release_value(&text, self.key)
            .map(ResourceValue::single)
            .ok_or_else(|| not_found(self.key))
    }
}

struct Model;

#[async_trait]
impl ReadSource for Model {
    async fn read(&self, _instance: u16) -> lwm2m_core::Result<ResourceValue> {
        for path in MODEL_FILES {
            if let Ok(text) = tokio::fs::read_to_string(path).await {
                let model = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
                if !model.is_empty() {
                    return Ok(ResourceValue::single(model));
                }
            }
        }
        Err(not_found("model"))
    }
}

struct MachineId;

#[async_trait]
impl ReadSource for MachineId {
    async fn read(&self, _instance: u16) -> lwm2m_core::Result<ResourceValue> {
        let text = read_text(MACHINE_ID).await?;
        Ok(ResourceValue::single(text.trim()))
    }
}

struct Memory {
    key: &'static str,
}

#[async_trait]
impl ReadSource for Memory {
    async fn read(&self, _instance: u16) -> lwm2m_core::Result<ResourceValue> {
        let text = read_text(MEMINFO).await?;
        meminfo_kilobytes(&text, self.key)
            .map(ResourceValue::single)
            .ok_or_else(|| not_found(self.key))
    }
}

enum Clock {
    Time,
    Offset,
    Zone,
}

#[async_trait]
impl ReadSource for Clock {
    async fn read(&self, _instance: u16) -> lwm2m_core::Result<ResourceValue> {
        Ok(match self {
            Clock::Time => ResourceValue::Single(Value::Time(Utc::now().timestamp())),
            Clock::Offset => {
                let offset = Local::now().offset().fix().local_minus_utc();
                ResourceValue::single(format_utc_offset(offset))
            }
            Clock::Zone => {
                ResourceValue::single(std::env::var("TZ").unwrap_or_else(|_| "UTC".to_string()))
            }
        })
    }
}

struct Reboot;

#[async_trait]
impl ExecuteAction for Reboot {
    async fn execute(&self, _instance: u16, _argument: &[u8]) -> lwm2m_core::Result<()> {
        info!("Reboot requested by the server");
        // Spawned so the 2.04 goes out before systemd takes the network down
        let mut child = Command::new("systemctl")
            .arg("reboot")
            .spawn()
            .map_err(|e| ObjectError::Failed(format!("systemctl reboot: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                warn!(error = %e, "systemctl reboot did not complete");
            }
        });
        Ok(())
    }
}

/// journald export, everything or only what is new since the last read
///
/// The export is written to a snapshot file once and served from there
/// until the server has received all of it, so block-wise transfers and
/// held-back notifications never lose lines past the cursor.
struct Journal {
    command: Vec<String>,
    snapshot: PathBuf,
}

impl Journal {
    fn journalctl(snapshot: PathBuf, cursor: Option<&Path>) -> Self {
        let mut command = vec!["journalctl".to_string(), "--no-pager".to_string(), "--quiet".to_string()];
        if let Some(cursor) = cursor {
            command.push(format!("--cursor-file={}", cursor.display()));
        }
        Self { command, snapshot }
    }

    async fn take_snapshot(&self) -> lwm2m_core::Result<()> {
        let failed = |e: std::io::Error| ObjectError::Failed(format!("journal snapshot: {}", e));
        let partial = self.snapshot.with_extension("partial");
        let file = tokio::fs::File::create(&partial).await.map_err(failed)?;
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| ObjectError::Failed("empty journal command".to_string()))?;
        let status = Command::new(program)
            .args(args)
            .stdout(file.into_std().await)
            .status()
            .await
            .map_err(|e| ObjectError::Failed(format!("{}: {}", program, e)))?;
        if !status.success() {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(ObjectError::Failed(format!("{} exited with {}", program, status)));
        }
        tokio::fs::rename(&partial, &self.snapshot).await.map_err(failed)?;
        debug!(snapshot = %self.snapshot.display(), "Journal snapshot taken");
        Ok(())
    }
}

#[async_trait]
impl ReadSource for Journal {
    async fn read(&self, _instance: u16) -> lwm2m_core::Result<ResourceValue> {
        if !tokio::fs::try_exists(&self.snapshot).await.unwrap_or(false) {
            self.take_snapshot().await?;
        }
        let bytes = tokio::fs::read(&self.snapshot)
            .await
            .map_err(|e| ObjectError::Failed(format!("journal snapshot: {}", e)))?;
        Ok(ResourceValue::Single(Value::Opaque(bytes)))
    }

    async fn delivered(&self, _instance: u16) {
        match tokio::fs::remove_file(&self.snapshot).await {
            Ok(()) => debug!(snapshot = %self.snapshot.display(), "Journal snapshot delivered"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(snapshot = %self.snapshot.display(), error = %e, "Cannot remove journal snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OS_RELEASE_TEXT: &str = r#"NAME="Laird Linux"
VERSION_ID=93.8.5.4
PRETTY_NAME='Laird Linux 93.8.5.4'
"#;

    #[test]
    fn test_os_release_values() {
        assert_eq!(os_release_value(OS_RELEASE_TEXT, "NAME").as_deref(), Some("Laird Linux"));
        assert_eq!(os_release_value(OS_RELEASE_TEXT, "VERSION_ID").as_deref(), Some("93.8.5.4"));
        assert_eq!(
            os_release_value(OS_RELEASE_TEXT, "PRETTY_NAME").as_deref(),
            Some("Laird Linux 93.8.5.4")
        );
        assert_eq!(os_release_value(OS_RELEASE_TEXT, "VERSION"), None);
    }

    #[test]
    fn test_meminfo_in_lwm2m_kilobytes() {
        let text = "MemTotal:         254240 kB\nMemFree:           10000 kB\n";
        assert_eq!(meminfo_kilobytes(text, "MemTotal"), Some(260341));
        assert_eq!(meminfo_kilobytes(text, "MemFree"), Some(10240));
        assert_eq!(meminfo_kilobytes(text, "MemAvailable"), None);
    }

    #[test]
    fn test_utc_offset_format() {
        assert_eq!(format_utc_offset(0), "UTC+00:00");
        assert_eq!(format_utc_offset(19800), "UTC+05:30");
        assert_eq!(format_utc_offset(-4 * 3600), "UTC-04:00");
    }

    #[tokio::test]
    async fn test_install_registers_the_system_log() {
        let staging = tempfile::tempdir().unwrap();
        let mut registry = Registry::standard();
        registry
            .add_instance(device::ID, 0, [(device::SUPPORTED_BINDINGS, ResourceValue::single("U"))].into_iter().collect())
            .unwrap();
        install(&mut registry, staging.path()).unwrap();

        assert_eq!(registry.instance_ids(syslog::ID), vec![0]);
        assert_eq!(
            registry.value(syslog::ID, 0, syslog::NAME),
            Some(&ResourceValue::single("journald"))
        );
        assert!(registry
            .value(device::ID, 0, device::AVAILABLE_POWER_SOURCES)
            .is_some_and(ResourceValue::is_multiple));
        let time = Clock::Time.read(0).await.unwrap();
        assert!(matches!(time, ResourceValue::Single(Value::Time(t)) if t > 0));
    }

    fn opaque(value: ResourceValue) -> Vec<u8> {
        match value {
            ResourceValue::Single(Value::Opaque(bytes)) => bytes,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_journal_snapshot_kept_until_delivered() {
        let staging = tempfile::tempdir().unwrap();
        let counter = staging.path().join("count");
        // Each run emits the next line, like journalctl moving its cursor
        let script = format!(
            "n=$(cat {0} 2>/dev/null || echo 0); n=$((n+1)); echo $n > {0}; echo line$n",
            counter.display()
        );
        let journal = Journal {
            command: vec!["sh".to_string(), "-c".to_string(), script],
            snapshot: staging.path().join(JOURNAL_SNAPSHOT),
        };

        assert_eq!(opaque(journal.read(0).await.unwrap()), b"line1\n");
        // Not delivered yet, so a second read sees the same lines
        assert_eq!(opaque(journal.read(0).await.unwrap()), b"line1\n");
        journal.delivered(0).await;
        assert!(!journal.snapshot.exists());
        assert_eq!(opaque(journal.read(0).await.unwrap()), b"line2\n");
        journal.delivered(0).await;
        journal.delivered(0).await;
    }

    #[tokio::test]
    async fn test_failed_journal_leaves_no_snapshot() {
        let staging = tempfile::tempdir().unwrap();
        let journal = Journal {
            command: vec!["false".to_string()],
            snapshot: staging.path().join(JOURNAL_SNAPSHOT),
        };
        assert!(matches!(journal.read(0).await, Err(ObjectError::Failed(_))));
        assert!(!journal.snapshot.exists());
        assert!(!journal.snapshot.with_extension("partial").exists());
    }
}
