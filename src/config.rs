use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// All configurable settings with their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Upper bound on how long a synchronous script run keeps draining
    /// messages after dispose.
    pub script_sync_timeout_ms: u64,
    /// How long an async run waits for its completion marker before giving
    /// up and leaving the script resident.
    pub script_async_timeout_ms: u64,
    /// Sleep between polls of the script message channel.
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            script_sync_timeout_ms: 60_000,
            script_async_timeout_ms: 60_000,
            poll_interval_ms: 10,
        }
    }
}

impl Settings {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.script_sync_timeout_ms)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.script_async_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Raw JSON representation — all fields optional for partial overrides.
#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    #[serde(rename = "script.syncTimeoutMs")]
    script_sync_timeout_ms: Option<u64>,
    #[serde(rename = "script.asyncTimeoutMs")]
    script_async_timeout_ms: Option<u64>,
    #[serde(rename = "poll.intervalMs")]
    poll_interval_ms: Option<u64>,
}

/// Resolve settings: defaults → user global → project-local.
pub fn resolve(project_root: Option<&Path>) -> Settings {
    let global_path = dirs::home_dir().map(|h| h.join(".marionette/settings.json"));
    let project_path = project_root.map(|r| r.join(".marionette/settings.json"));
    resolve_with_paths(global_path.as_deref(), project_path.as_deref())
}

/// Testable resolver that accepts explicit file paths (no home dir dependency).
fn resolve_with_paths(global_path: Option<&Path>, project_path: Option<&Path>) -> Settings {
    let mut settings = Settings::default();

    if let Some(path) = global_path {
        apply_file(&mut settings, path);
    }
    if let Some(path) = project_path {
        apply_file(&mut settings, path);
    }

    settings
}

fn apply_file(settings: &mut Settings, path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else { return };
    let Ok(file) = serde_json::from_str::<SettingsFile>(&content) else {
        tracing::warn!("Invalid settings file, ignoring: {}", path.display());
        return;
    };
    if let Some(v) = file.script_sync_timeout_ms {
        if (1_000..=MAX_TIMEOUT_MS).contains(&v) {
            settings.script_sync_timeout_ms = v;
        } else {
            tracing::warn!(
                "script.syncTimeoutMs ({}) out of range (1000..{}), using default",
                v,
                MAX_TIMEOUT_MS
            );
        }
    }
    if let Some(v) = file.script_async_timeout_ms {
        if (1_000..=MAX_TIMEOUT_MS).contains(&v) {
            settings.script_async_timeout_ms = v;
        } else {
            tracing::warn!(
                "script.asyncTimeoutMs ({}) out of range (1000..{}), using default",
                v,
                MAX_TIMEOUT_MS
            );
        }
    }
    if let Some(v) = file.poll_interval_ms {
        if (1..=1_000).contains(&v) {
            settings.poll_interval_ms = v;
        } else {
            tracing::warn!("poll.intervalMs ({}) out of range (1..1000), using default", v);
        }
    }
}
