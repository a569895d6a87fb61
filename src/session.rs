//! Session establishment and teardown against a target process.

use std::collections::HashSet;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Timelike, Utc};
use serde_json::Value;

use crate::config::Settings;
use crate::device::{Capability, Connection, Device, ScriptRuntime};
use crate::scripts::ScriptLoader;
use crate::{Error, Result};

/// Combined metadata probe, run once right after attach. The original
/// library discovered each of these lazily with one script per property.
const PLATFORM_PROBE: &str = r#"
(function () {
    var mod = Process.enumerateModules()[0];
    var magic = [];
    try {
        magic = Array.prototype.slice.call(new Uint8Array(mod.base.readByteArray(6)));
    } catch (e) {}
    var entry = null;
    var elfType = null;
    try {
        elfType = mod.base.add(0x10).readU16();
        entry = mod.base.add(0x18).readPointer().toString();
    } catch (e) {}
    send({
        platform: Process.platform,
        arch: Process.arch,
        pointerSize: Process.pointerSize,
        module: mod.name,
        base: mod.base.toString(),
        magic: magic,
        elfType: elfType,
        entrypoint: entry
    });
})();
"#;

/// What to open a session against: an already-running process, or an
/// executable to launch (suspended) ourselves.
#[derive(Debug, Clone)]
pub enum Target {
    Pid(u32),
    Spawn { path: String, argv: Vec<String> },
}

impl From<u32> for Target {
    fn from(pid: u32) -> Self {
        Target::Pid(pid)
    }
}

impl From<&str> for Target {
    fn from(path: &str) -> Self {
        Target::Spawn {
            path: path.to_string(),
            argv: vec![path.to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Elf,
    Pe,
    MachO,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PlatformInfo {
    pub os: String,
    pub arch: String,
    pub bits: u8,
    pub endianness: Endianness,
    pub file_format: FileFormat,
    pub base_module: Option<String>,
    pub entrypoint: Option<u64>,
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self {
            os: "unknown".to_string(),
            arch: "unknown".to_string(),
            bits: 64,
            endianness: Endianness::Little,
            file_format: FileFormat::Unknown,
            base_module: None,
            entrypoint: None,
        }
    }
}

fn parse_file_format(magic: &[u8]) -> FileFormat {
    match magic {
        [0x7f, b'E', b'L', b'F', ..] => FileFormat::Elf,
        [b'M', b'Z', ..] => FileFormat::Pe,
        [0xcf, 0xfa, 0xed, 0xfe, ..] | [0xca, 0xfe, 0xba, 0xbe, ..] => FileFormat::MachO,
        _ => FileFormat::Unknown,
    }
}

fn parse_platform_payload(payload: &Value) -> PlatformInfo {
    let mut info = PlatformInfo::default();

    if let Some(os) = payload.get("platform").and_then(|v| v.as_str()) {
        info.os = os.to_string();
    }
    if let Some(arch) = payload.get("arch").and_then(|v| v.as_str()) {
        info.arch = arch.to_string();
    }
    if let Some(size) = payload.get("pointerSize").and_then(|v| v.as_u64()) {
        info.bits = (size * 8) as u8;
    }
    if let Some(name) = payload.get("module").and_then(|v| v.as_str()) {
        info.base_module = Some(name.to_string());
    }

    let magic: Vec<u8> = payload
        .get("magic")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|b| b.as_u64().map(|b| b as u8)).collect())
        .unwrap_or_default();
    info.file_format = parse_file_format(&magic);

    // ELF ident byte 5 is the data encoding; everything else we meet in
    // practice is little-endian.
    info.endianness = match info.file_format {
        FileFormat::Elf if magic.get(5) == Some(&2) => Endianness::Big,
        _ => Endianness::Little,
    };

    // ET_DYN images (PIE executables) report a file-relative entrypoint;
    // rebase it onto the load address. e_type 3 is ET_DYN.
    let elf_type = payload.get("elfType").and_then(|v| v.as_u64());
    let base = payload.get("base").and_then(parse_address).unwrap_or(0);
    info.entrypoint = payload.get("entrypoint").and_then(parse_address).map(|entry| {
        if info.file_format == FileFormat::Elf && elf_type == Some(3) {
            base.wrapping_add(entry)
        } else {
            entry
        }
    });

    info
}

fn parse_address(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => u64::from_str_radix(s.trim_start_matches("0x"), 16).ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Match a spawn descriptor against the device's running processes, by
/// full path or by executable name. `None` means nothing is running under
/// that name (or the listing failed) and the target must be spawned.
fn resolve_running(device: &dyn Device, path: &str, name: &str) -> Option<u32> {
    let procs = match device.processes() {
        Ok(procs) => procs,
        Err(e) => {
            tracing::debug!("Process listing failed during target resolution: {}", e);
            return None;
        }
    };
    procs
        .iter()
        .find(|p| p.name == name || p.name == path)
        .map(|p| p.pid)
}

fn generate_session_id(name: &str, pid: u32) -> String {
    let now = Utc::now();
    format!(
        "{}-{}-{:02}h{:02}-{}",
        name,
        now.format("%Y-%m-%d"),
        now.hour(),
        now.minute(),
        pid
    )
}

/// One attached or spawned target process. Owns exactly one connection
/// handle; it is released on `close` or teardown and never shared.
pub struct Session {
    id: String,
    device: Arc<dyn Device>,
    connection: Option<Box<dyn Connection>>,
    pid: u32,
    /// Set only if this controller spawned the target itself.
    spawned_pid: Option<u32>,
    platform: PlatformInfo,
    capabilities: HashSet<Capability>,
    started_at: chrono::DateTime<Utc>,
}

impl Session {
    /// Open a session: spawn the target suspended if `target` is a spawn
    /// descriptor, then attach. Fails with `Spawn` if the executable cannot
    /// be launched and `Attach` if the pid cannot be found on the device.
    pub fn open(
        device: Arc<dyn Device>,
        target: Target,
        envp: Option<&HashMap<String, String>>,
        settings: &Settings,
    ) -> Result<Session> {
        let (pid, spawned_pid, name) = match &target {
            Target::Pid(pid) => (*pid, None, format!("pid{}", pid)),
            Target::Spawn { path, argv } => {
                let name = std::path::Path::new(path)
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("target")
                    .to_string();
                // A descriptor naming an already-running process attaches
                // to it instead of launching a second copy.
                match resolve_running(device.as_ref(), path, &name) {
                    Some(pid) => {
                        tracing::info!(pid, path, "Target is already running, attaching");
                        (pid, None, name)
                    }
                    None => {
                        let pid = device.spawn(path, argv, envp).map_err(|e| Error::Spawn {
                            path: path.clone(),
                            reason: e.to_string(),
                        })?;
                        (pid, Some(pid), name)
                    }
                }
            }
        };

        let mut connection = device.attach(pid).map_err(|e| match e {
            e @ Error::Attach { .. } => e,
            e => Error::Attach {
                pid,
                reason: e.to_string(),
            },
        })?;

        let loader = ScriptLoader::new(settings.clone());
        let probe = loader.run_sync(connection.as_mut(), PLATFORM_PROBE, ScriptRuntime::Default)?;
        let platform = match probe.messages.first() {
            Some(payload) => parse_platform_payload(payload),
            None => {
                tracing::warn!("Platform probe returned nothing, using defaults");
                PlatformInfo::default()
            }
        };

        let mut capabilities = HashSet::new();
        for capability in [
            Capability::JavaBridge,
            Capability::ObjCBridge,
            Capability::ThreadEnumeration,
        ] {
            match connection.supports(capability) {
                Ok(true) => {
                    capabilities.insert(capability);
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(?capability, "Capability probe failed: {}", e),
            }
        }

        let session = Session {
            id: generate_session_id(&name, pid),
            device,
            connection: Some(connection),
            pid,
            spawned_pid,
            platform,
            capabilities,
            started_at: Utc::now(),
        };

        tracing::info!(
            id = session.id,
            pid,
            spawned = spawned_pid.is_some(),
            os = session.platform.os,
            arch = session.platform.arch,
            bits = session.platform.bits,
            "Session open"
        );

        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn spawned_pid(&self) -> Option<u32> {
        self.spawned_pid
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn started_at(&self) -> chrono::DateTime<Utc> {
        self.started_at
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }

    pub fn connection_mut(&mut self) -> Result<&mut (dyn Connection + 'static)> {
        self.connection.as_deref_mut().ok_or(Error::SessionClosed)
    }

    /// Detach the underlying connection. Idempotent: a second call is a
    /// logged no-op. Transport errors that mean the far side is already
    /// gone are absorbed.
    pub fn close(&mut self) -> Result<()> {
        match self.connection.take() {
            Some(mut connection) => match connection.detach() {
                Ok(()) => Ok(()),
                Err(e) if e.target_gone() => {
                    tracing::debug!("Detach found target already gone");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => {
                tracing::debug!(id = self.id, "close: session already closed");
                Ok(())
            }
        }
    }

    /// Drop the connection without detaching. Used when a kill supersedes
    /// the detach.
    pub(crate) fn discard_connection(&mut self) {
        self.connection = None;
    }
}
