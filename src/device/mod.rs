//! Consumed contract to the execution host.
//!
//! The real engine behind these traits (memory access, thread control,
//! module introspection) lives in the injected runtime; this crate only
//! needs spawn/attach/kill on a device, script load/unload/messages on a
//! connection, and a couple of typed probes that the original library did
//! with runtime reflection: capability negotiation at session-open time and
//! thread enumeration with an explicit "unsupported on this platform"
//! outcome.

pub mod frida;

use std::collections::HashMap;

use serde_json::Value;

use crate::Result;

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub id: u64,
    pub state: Option<String>,
}

/// Optional facilities a connection may expose, negotiated once at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    JavaBridge,
    ObjCBridge,
    ThreadEnumeration,
}

/// Which engine the injected runtime should compile scripts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptRuntime {
    #[default]
    Default,
    V8,
}

/// Thread enumeration either lists threads or is unsupported on this
/// platform. An explicit variant, not an exception to catch.
#[derive(Debug)]
pub enum EnumerationOutcome {
    Threads(Vec<ThreadInfo>),
    Unsupported,
}

/// A message delivered from an injected script, on the connection's own
/// delivery thread.
#[derive(Debug, Clone)]
pub enum ScriptMessage {
    Send {
        payload: Value,
        data: Option<Vec<u8>>,
    },
    Error {
        description: String,
    },
    Log {
        text: String,
    },
}

pub type MessageHandler = Box<dyn FnMut(ScriptMessage) + Send>;

pub trait ScriptHandle: Send {
    fn load(&mut self) -> Result<()>;

    fn unload(&mut self) -> Result<()>;

    /// Install the handler invoked for every message the script emits.
    /// Must be called before `load` so that load-time messages are seen.
    fn set_message_handler(&mut self, handler: MessageHandler) -> Result<()>;

    /// Invoke the script's dispose contract. Ok(false) when the script does
    /// not take part in the contract (nothing to flush).
    fn dispose(&mut self) -> Result<bool>;
}

pub trait Connection: Send {
    fn create_script(
        &mut self,
        source: &str,
        runtime: ScriptRuntime,
    ) -> Result<Box<dyn ScriptHandle>>;

    fn detach(&mut self) -> Result<()>;

    fn supports(&mut self, capability: Capability) -> Result<bool>;

    fn enumerate_threads(&mut self) -> Result<EnumerationOutcome>;
}

pub trait Device: Send + Sync {
    /// Launch `path` suspended. The returned pid stays suspended until
    /// `resume` is called.
    fn spawn(
        &self,
        path: &str,
        argv: &[String],
        envp: Option<&HashMap<String, String>>,
    ) -> Result<u32>;

    fn attach(&self, pid: u32) -> Result<Box<dyn Connection>>;

    fn resume(&self, pid: u32) -> Result<()>;

    fn kill(&self, pid: u32) -> Result<()>;

    fn processes(&self) -> Result<Vec<ProcessInfo>>;
}

/// Check if a local process is alive. Returns true if the process exists,
/// even if we lack permission to signal it (EPERM).
pub fn is_process_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as i32, 0) };
    if result == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    matches!(err.raw_os_error(), Some(libc::EPERM))
}
