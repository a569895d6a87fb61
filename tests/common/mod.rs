//! Shared fixtures: an in-memory device whose connections and scripts
//! record every call and replay scripted message plans.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};

use marionette::device::{
    Capability, Connection, Device, EnumerationOutcome, MessageHandler, ProcessInfo, ScriptHandle,
    ScriptMessage, ScriptRuntime, ThreadInfo,
};
use marionette::{Error, Result};

pub fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// Everything the fake device family was asked to do, in call order per
/// field.
#[derive(Debug, Default)]
pub struct CallLog {
    pub spawned: Vec<String>,
    pub attached: Vec<u32>,
    pub resumed: Vec<u32>,
    pub killed: Vec<u32>,
    pub detached: usize,
    pub loaded_sources: Vec<String>,
    pub unloaded_sources: Vec<String>,
}

/// Scripted behavior for one fake script, matched against the created
/// source by substring.
#[derive(Debug, Clone, Default)]
pub struct ScriptPlan {
    /// Payloads delivered to the handler synchronously during `load`.
    pub on_load: Vec<Value>,
    /// Payloads delivered from a background thread after a delay.
    pub delayed: Vec<(Duration, Value)>,
    /// Payloads flushed when `dispose` is called (dispose returns true).
    pub dispose_flush: Vec<Value>,
    pub compile_error: bool,
    pub load_error: bool,
}

/// The probe payload for a 64-bit little-endian linux ELF target with a
/// fixed load address (ET_EXEC).
pub fn elf_payload(entry: u64) -> Value {
    json!({
        "platform": "linux",
        "arch": "x64",
        "pointerSize": 8,
        "module": "target",
        "base": "0x400000",
        "magic": [0x7f, 0x45, 0x4c, 0x46, 2, 1],
        "elfType": 2,
        "entrypoint": format!("{:#x}", entry),
    })
}

/// A PIE (ET_DYN) linux target: the probed entrypoint is an offset from
/// the load base.
pub fn pie_payload(base: u64, entry_offset: u64) -> Value {
    json!({
        "platform": "linux",
        "arch": "x64",
        "pointerSize": 8,
        "module": "target",
        "base": format!("{:#x}", base),
        "magic": [0x7f, 0x45, 0x4c, 0x46, 2, 1],
        "elfType": 3,
        "entrypoint": format!("{:#x}", entry_offset),
    })
}

/// The probe payload for a windows PE target (no entrypoint trap applies).
pub fn pe_payload() -> Value {
    json!({
        "platform": "windows",
        "arch": "x64",
        "pointerSize": 8,
        "module": "target.exe",
        "magic": [0x4d, 0x5a, 0x90, 0x00, 0x03, 0x00],
    })
}

pub struct FakeDevice {
    pub log: Arc<Mutex<CallLog>>,
    pub spawn_pid: u32,
    pub platform_payload: Value,
    pub capabilities: Vec<Capability>,
    /// `None` means thread enumeration reports `Unsupported`.
    pub threads: Option<Vec<ThreadInfo>>,
    /// Substring-matched plans, first match wins.
    pub plans: Arc<Mutex<Vec<(String, ScriptPlan)>>>,
    /// One-shot error for the next `kill` call.
    pub kill_error: Arc<Mutex<Option<Error>>>,
    pub process_list: Arc<Mutex<Vec<ProcessInfo>>>,
    /// When set, `processes` fails instead of returning the list.
    pub processes_unlistable: Arc<AtomicBool>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(CallLog::default())),
            spawn_pid: 200,
            platform_payload: elf_payload(0x40_1000),
            capabilities: vec![Capability::ThreadEnumeration],
            threads: Some(vec![ThreadInfo {
                id: 1,
                state: Some("running".to_string()),
            }]),
            plans: Arc::new(Mutex::new(Vec::new())),
            kill_error: Arc::new(Mutex::new(None)),
            process_list: Arc::new(Mutex::new(Vec::new())),
            processes_unlistable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn plan(&self, needle: &str, plan: ScriptPlan) {
        self.plans.lock().unwrap().push((needle.to_string(), plan));
    }

    pub fn set_kill_error(&self, e: Error) {
        *self.kill_error.lock().unwrap() = Some(e);
    }

    pub fn add_process(&self, pid: u32, name: &str) {
        self.process_list.lock().unwrap().push(ProcessInfo {
            pid,
            name: name.to_string(),
        });
    }
}

impl Device for FakeDevice {
    fn spawn(
        &self,
        path: &str,
        _argv: &[String],
        _envp: Option<&HashMap<String, String>>,
    ) -> Result<u32> {
        self.log.lock().unwrap().spawned.push(path.to_string());
        Ok(self.spawn_pid)
    }

    fn attach(&self, pid: u32) -> Result<Box<dyn Connection>> {
        self.log.lock().unwrap().attached.push(pid);
        Ok(Box::new(FakeConnection {
            log: Arc::clone(&self.log),
            platform_payload: self.platform_payload.clone(),
            capabilities: self.capabilities.clone(),
            threads: self.threads.clone(),
            plans: Arc::clone(&self.plans),
        }))
    }

    fn resume(&self, pid: u32) -> Result<()> {
        self.log.lock().unwrap().resumed.push(pid);
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        self.log.lock().unwrap().killed.push(pid);
        match self.kill_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn processes(&self) -> Result<Vec<ProcessInfo>> {
        if self.processes_unlistable.load(Ordering::SeqCst) {
            return Err(Error::Device("process listing unavailable".to_string()));
        }
        Ok(self.process_list.lock().unwrap().clone())
    }
}

pub struct FakeConnection {
    log: Arc<Mutex<CallLog>>,
    platform_payload: Value,
    capabilities: Vec<Capability>,
    threads: Option<Vec<ThreadInfo>>,
    plans: Arc<Mutex<Vec<(String, ScriptPlan)>>>,
}

impl FakeConnection {
    fn plan_for(&self, source: &str) -> ScriptPlan {
        // The metadata probe is answered built-in so every test does not
        // have to plan for it.
        if source.contains("enumerateModules") {
            return ScriptPlan {
                on_load: vec![self.platform_payload.clone()],
                ..Default::default()
            };
        }
        self.plans
            .lock()
            .unwrap()
            .iter()
            .find(|(needle, _)| source.contains(needle))
            .map(|(_, plan)| plan.clone())
            .unwrap_or_default()
    }
}

impl Connection for FakeConnection {
    fn create_script(
        &mut self,
        source: &str,
        _runtime: ScriptRuntime,
    ) -> Result<Box<dyn ScriptHandle>> {
        let plan = self.plan_for(source);
        if plan.compile_error {
            return Err(Error::ScriptRuntime(format!(
                "SyntaxError in {:?}",
                source.chars().take(20).collect::<String>()
            )));
        }
        Ok(Box::new(FakeScript {
            log: Arc::clone(&self.log),
            source: source.to_string(),
            plan,
            handler: None,
        }))
    }

    fn detach(&mut self) -> Result<()> {
        self.log.lock().unwrap().detached += 1;
        Ok(())
    }

    fn supports(&mut self, capability: Capability) -> Result<bool> {
        Ok(self.capabilities.contains(&capability))
    }

    fn enumerate_threads(&mut self) -> Result<EnumerationOutcome> {
        Ok(match &self.threads {
            Some(threads) => EnumerationOutcome::Threads(threads.clone()),
            None => EnumerationOutcome::Unsupported,
        })
    }
}

pub struct FakeScript {
    log: Arc<Mutex<CallLog>>,
    source: String,
    plan: ScriptPlan,
    handler: Option<Arc<Mutex<MessageHandler>>>,
}

impl ScriptHandle for FakeScript {
    fn load(&mut self) -> Result<()> {
        if self.plan.load_error {
            return Err(Error::ScriptRuntime("load failed".to_string()));
        }
        self.log.lock().unwrap().loaded_sources.push(self.source.clone());
        if let Some(handler) = &self.handler {
            let mut handler = handler.lock().unwrap();
            for payload in &self.plan.on_load {
                handler(ScriptMessage::Send {
                    payload: payload.clone(),
                    data: None,
                });
            }
        }
        for (delay, payload) in self.plan.delayed.clone() {
            if let Some(handler) = self.handler.clone() {
                thread::spawn(move || {
                    thread::sleep(delay);
                    (handler.lock().unwrap())(ScriptMessage::Send {
                        payload,
                        data: None,
                    });
                });
            }
        }
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        self.log.lock().unwrap().unloaded_sources.push(self.source.clone());
        Ok(())
    }

    fn set_message_handler(&mut self, handler: MessageHandler) -> Result<()> {
        self.handler = Some(Arc::new(Mutex::new(handler)));
        Ok(())
    }

    fn dispose(&mut self) -> Result<bool> {
        if self.plan.dispose_flush.is_empty() {
            return Ok(false);
        }
        if let Some(handler) = &self.handler {
            let mut handler = handler.lock().unwrap();
            for payload in &self.plan.dispose_flush {
                handler(ScriptMessage::Send {
                    payload: payload.clone(),
                    data: None,
                });
            }
        }
        Ok(true)
    }
}
