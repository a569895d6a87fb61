//! Frida-backed implementation of the device contract.
//!
//! All frida objects are confined to one dedicated worker thread; the
//! `Device`/`Connection`/`ScriptHandle` implementations are thin id-keyed
//! proxies that exchange commands with it over an mpsc channel. Replies come
//! back over per-call channels, so every public call is a blocking
//! round-trip on the caller's thread.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::Duration;

use frida::{Message, ScriptHandler};
use serde_json::Value;

use super::{
    Capability, Connection, Device, EnumerationOutcome, MessageHandler, ProcessInfo,
    ScriptHandle, ScriptMessage, ScriptRuntime, ThreadInfo,
};
use crate::error::TransportErrorKind;
use crate::{Error, Result};

const PROBE_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

enum Cmd {
    Spawn {
        path: String,
        argv: Vec<String>,
        envp: Option<HashMap<String, String>>,
        reply: Sender<Result<u32>>,
    },
    Attach {
        pid: u32,
        reply: Sender<Result<u64>>,
    },
    Resume {
        pid: u32,
        reply: Sender<Result<()>>,
    },
    Kill {
        pid: u32,
        reply: Sender<Result<()>>,
    },
    Processes {
        reply: Sender<Result<Vec<ProcessInfo>>>,
    },
    Detach {
        conn: u64,
        reply: Sender<Result<()>>,
    },
    Supports {
        conn: u64,
        capability: Capability,
        reply: Sender<Result<bool>>,
    },
    EnumerateThreads {
        conn: u64,
        reply: Sender<Result<EnumerationOutcome>>,
    },
    CreateScript {
        conn: u64,
        source: String,
        runtime: ScriptRuntime,
        reply: Sender<Result<u64>>,
    },
    ScriptSetHandler {
        script: u64,
        handler: MessageHandler,
        reply: Sender<Result<()>>,
    },
    ScriptLoad {
        script: u64,
        reply: Sender<Result<()>>,
    },
    ScriptUnload {
        script: u64,
        reply: Sender<Result<()>>,
    },
    ScriptDispose {
        script: u64,
        reply: Sender<Result<bool>>,
    },
}

/// Classify a frida error at the lowest boundary we own. Everything above
/// this sees a typed `TransportErrorKind`, never message text.
fn transport_error(e: impl std::fmt::Display) -> Error {
    let message = e.to_string();
    let lower = message.to_lowercase();
    let kind = if lower.contains("detached") {
        TransportErrorKind::Detached
    } else if lower.contains("closed") {
        TransportErrorKind::ConnectionClosed
    } else {
        TransportErrorKind::Other
    };
    Error::Transport { kind, message }
}

fn worker_died<T>() -> Result<T> {
    Err(Error::Device("frida worker thread died".to_string()))
}

/// Drop every script registered under a detached connection from the
/// worker's registries, so they do not accumulate across sessions.
fn evict_owned_scripts<T>(
    conn: u64,
    scripts: &mut HashMap<u64, T>,
    owners: &mut HashMap<u64, u64>,
) {
    let owned: Vec<u64> = owners
        .iter()
        .filter(|(_, owner)| **owner == conn)
        .map(|(script, _)| *script)
        .collect();
    for script in owned {
        owners.remove(&script);
        scripts.remove(&script);
    }
}

fn translate_message(message: Message, data: Option<Vec<u8>>) -> ScriptMessage {
    match message {
        Message::Send(msg) => ScriptMessage::Send {
            payload: msg.payload.returns,
            data,
        },
        Message::Other(value) => {
            let payload = value.get("payload").cloned().unwrap_or(value);
            ScriptMessage::Send { payload, data }
        }
        Message::Log(log) => ScriptMessage::Log { text: log.payload },
        Message::Error(err) => ScriptMessage::Error {
            description: format!(
                "{} at {}:{}:{}",
                err.description, err.file_name, err.line_number, err.column_number
            ),
        },
    }
}

/// Forwards frida messages into the caller-supplied handler.
struct Forwarder {
    inner: MessageHandler,
}

impl ScriptHandler for Forwarder {
    fn on_message(&mut self, message: Message, data: Option<Vec<u8>>) {
        (self.inner)(translate_message(message, data));
    }
}

/// Handler used by the worker's own one-shot probes (capability checks,
/// thread enumeration): pushes payloads into a channel.
struct ProbeSink {
    tx: Sender<Value>,
}

impl ScriptHandler for ProbeSink {
    fn on_message(&mut self, message: Message, data: Option<Vec<u8>>) {
        if let ScriptMessage::Send { payload, .. } = translate_message(message, data) {
            let _ = self.tx.send(payload);
        }
    }
}

fn capability_probe_source(capability: Capability) -> &'static str {
    match capability {
        Capability::JavaBridge => {
            "try { send(typeof Java !== 'undefined' && Java.available); } catch (e) { send(false); }"
        }
        Capability::ObjCBridge => {
            "try { send(typeof ObjC !== 'undefined' && ObjC.available); } catch (e) { send(false); }"
        }
        Capability::ThreadEnumeration => {
            "try { send(Process.enumerateThreads().length >= 0); } catch (e) { send(false); }"
        }
    }
}

const THREAD_ENUM_SOURCE: &str = r#"
try {
    send(Process.enumerateThreads().map(function (t) {
        return { id: t.id, state: t.state };
    }));
} catch (e) {
    send("unsupported");
}
"#;

fn frida_worker(cmd_rx: Receiver<Cmd>) {
    use frida::{DeviceManager, DeviceType, Frida, ScriptOption, SpawnOptions};

    // Initialize frida on this thread (unsafe because it touches global state).
    let frida = unsafe { Frida::obtain() };
    let device_manager = DeviceManager::obtain(&frida);

    let devices = device_manager.enumerate_all_devices();
    let mut device = match devices.into_iter().find(|d| d.get_type() == DeviceType::Local) {
        Some(d) => d,
        None => {
            tracing::error!("No local frida device found, worker exiting");
            return;
        }
    };

    // Sessions and scripts are leaked to 'static: frida ties their lifetime
    // to borrows the command-loop structure cannot express, and a controller
    // holds at most a handful per process.
    let mut sessions: HashMap<u64, &'static mut frida::Session<'static>> = HashMap::new();
    let mut scripts: HashMap<u64, &'static mut frida::Script<'static>> = HashMap::new();
    let mut script_owner: HashMap<u64, u64> = HashMap::new();
    let mut next_id: u64 = 1;

    // Run a one-shot probe script on a session and wait for its first payload.
    let run_probe = |session: &mut frida::Session<'static>, source: &str| -> Option<Value> {
        let mut script = session.create_script(source, &mut ScriptOption::new()).ok()?;
        let (tx, rx) = channel();
        script.handle_message(ProbeSink { tx }).ok()?;
        script.load().ok()?;
        let payload = rx.recv_timeout(PROBE_REPLY_TIMEOUT).ok();
        if let Err(e) = script.unload() {
            tracing::debug!("Probe script unload failed: {}", e);
        }
        payload
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            Cmd::Spawn {
                path,
                argv,
                envp,
                reply,
            } => {
                let result = (|| -> Result<u32> {
                    let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
                    let mut spawn_opts = SpawnOptions::new().argv(&argv_refs);

                    if let Some(ref env_vars) = envp {
                        let env_tuples: Vec<(&str, &str)> = env_vars
                            .iter()
                            .map(|(k, v)| (k.as_str(), v.as_str()))
                            .collect();
                        spawn_opts = spawn_opts.envp(env_tuples);
                    }

                    let pid = device.spawn(&path, &spawn_opts).map_err(transport_error)?;
                    tracing::info!("Spawned {} suspended with pid {}", path, pid);
                    Ok(pid)
                })();
                let _ = reply.send(result);
            }

            Cmd::Attach { pid, reply } => {
                let result = (|| -> Result<u64> {
                    let session = device.attach(pid).map_err(transport_error)?;
                    let leaked: &'static mut frida::Session<'static> =
                        Box::leak(Box::new(unsafe { std::mem::transmute(session) }));
                    let id = next_id;
                    next_id += 1;
                    sessions.insert(id, leaked);
                    tracing::debug!("Attached to pid {} as connection {}", pid, id);
                    Ok(id)
                })();
                let _ = reply.send(result);
            }

            Cmd::Resume { pid, reply } => {
                let _ = reply.send(device.resume(pid).map_err(transport_error));
            }

            Cmd::Kill { pid, reply } => {
                let result = device.kill(pid).map_err(|e| {
                    let msg = e.to_string();
                    if msg.to_lowercase().contains("permission") {
                        Error::PermissionDenied(msg)
                    } else if msg.to_lowercase().contains("not found") {
                        Error::ProcessNotFound(pid)
                    } else {
                        transport_error(e)
                    }
                });
                let _ = reply.send(result);
            }

            Cmd::Processes { reply } => {
                let procs = device
                    .enumerate_processes()
                    .iter()
                    .map(|p| ProcessInfo {
                        pid: p.get_pid(),
                        name: p.get_name().to_string(),
                    })
                    .collect();
                let _ = reply.send(Ok(procs));
            }

            Cmd::Detach { conn, reply } => {
                let result = match sessions.remove(&conn) {
                    Some(session) => {
                        evict_owned_scripts(conn, &mut scripts, &mut script_owner);
                        let _ = session.detach();
                        Ok(())
                    }
                    None => Err(Error::transport(
                        TransportErrorKind::ConnectionClosed,
                        format!("connection {} already detached", conn),
                    )),
                };
                let _ = reply.send(result);
            }

            Cmd::Supports {
                conn,
                capability,
                reply,
            } => {
                let result = match sessions.get_mut(&conn) {
                    Some(session) => {
                        let supported = run_probe(session, capability_probe_source(capability))
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        Ok(supported)
                    }
                    None => Err(Error::transport(
                        TransportErrorKind::ConnectionClosed,
                        "connection gone",
                    )),
                };
                let _ = reply.send(result);
            }

            Cmd::EnumerateThreads { conn, reply } => {
                let result = match sessions.get_mut(&conn) {
                    Some(session) => match run_probe(session, THREAD_ENUM_SOURCE) {
                        Some(Value::Array(items)) => {
                            let threads = items
                                .iter()
                                .filter_map(|t| {
                                    Some(ThreadInfo {
                                        id: t.get("id")?.as_u64()?,
                                        state: t
                                            .get("state")
                                            .and_then(|s| s.as_str())
                                            .map(|s| s.to_string()),
                                    })
                                })
                                .collect();
                            Ok(EnumerationOutcome::Threads(threads))
                        }
                        _ => Ok(EnumerationOutcome::Unsupported),
                    },
                    None => Err(Error::transport(
                        TransportErrorKind::ConnectionClosed,
                        "connection gone",
                    )),
                };
                let _ = reply.send(result);
            }

            Cmd::CreateScript {
                conn,
                source,
                runtime,
                reply,
            } => {
                let result = (|| -> Result<u64> {
                    let session = sessions.get_mut(&conn).ok_or_else(|| {
                        Error::transport(TransportErrorKind::ConnectionClosed, "connection gone")
                    })?;
                    // TODO: route `runtime` through ScriptOption once the
                    // bindings expose runtime selection.
                    let _ = runtime;
                    let script = session
                        .create_script(&source, &mut ScriptOption::new())
                        .map_err(|e| Error::ScriptRuntime(e.to_string()))?;
                    let leaked: &'static mut frida::Script<'static> =
                        Box::leak(Box::new(unsafe { std::mem::transmute(script) }));
                    let id = next_id;
                    next_id += 1;
                    scripts.insert(id, leaked);
                    script_owner.insert(id, conn);
                    Ok(id)
                })();
                let _ = reply.send(result);
            }

            Cmd::ScriptSetHandler {
                script,
                handler,
                reply,
            } => {
                let result = match scripts.get_mut(&script) {
                    Some(s) => s
                        .handle_message(Forwarder { inner: handler })
                        .map_err(transport_error),
                    None => Err(Error::transport(
                        TransportErrorKind::ConnectionClosed,
                        "script gone",
                    )),
                };
                let _ = reply.send(result);
            }

            Cmd::ScriptLoad { script, reply } => {
                let result = match scripts.get_mut(&script) {
                    Some(s) => s.load().map_err(|e| Error::ScriptRuntime(e.to_string())),
                    None => Err(Error::transport(
                        TransportErrorKind::ConnectionClosed,
                        "script gone",
                    )),
                };
                let _ = reply.send(result);
            }

            Cmd::ScriptUnload { script, reply } => {
                let result = match scripts.remove(&script) {
                    Some(s) => {
                        script_owner.remove(&script);
                        s.unload().map_err(transport_error)
                    }
                    None => Err(Error::transport(
                        TransportErrorKind::ConnectionClosed,
                        "script already unloaded",
                    )),
                };
                let _ = reply.send(result);
            }

            Cmd::ScriptDispose { script, reply } => {
                let result = match scripts.get_mut(&script) {
                    Some(s) => {
                        // The dispose contract rides the message channel:
                        // scripts that opt in react to this control message
                        // by flushing and acknowledging.
                        let msg = serde_json::json!({ "type": "dispose" });
                        s.post(&msg.to_string(), None)
                            .map(|_| true)
                            .map_err(transport_error)
                    }
                    None => Err(Error::transport(
                        TransportErrorKind::ConnectionClosed,
                        "script gone",
                    )),
                };
                let _ = reply.send(result);
            }
        }
    }
}

/// Device backed by the local frida installation.
pub struct FridaDevice {
    cmd_tx: Sender<Cmd>,
}

impl FridaDevice {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = channel();
        thread::spawn(move || frida_worker(cmd_rx));
        Self { cmd_tx }
    }

    fn roundtrip<T>(&self, cmd: Cmd, rx: Receiver<Result<T>>) -> Result<T> {
        if self.cmd_tx.send(cmd).is_err() {
            return worker_died();
        }
        match rx.recv() {
            Ok(result) => result,
            Err(_) => worker_died(),
        }
    }
}

impl Default for FridaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for FridaDevice {
    fn spawn(
        &self,
        path: &str,
        argv: &[String],
        envp: Option<&HashMap<String, String>>,
    ) -> Result<u32> {
        let (reply, rx) = channel();
        self.roundtrip(
            Cmd::Spawn {
                path: path.to_string(),
                argv: argv.to_vec(),
                envp: envp.cloned(),
                reply,
            },
            rx,
        )
    }

    fn attach(&self, pid: u32) -> Result<Box<dyn Connection>> {
        let (reply, rx) = channel();
        let conn = self.roundtrip(Cmd::Attach { pid, reply }, rx)?;
        Ok(Box::new(FridaConnection {
            id: conn,
            cmd_tx: self.cmd_tx.clone(),
        }))
    }

    fn resume(&self, pid: u32) -> Result<()> {
        let (reply, rx) = channel();
        self.roundtrip(Cmd::Resume { pid, reply }, rx)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let (reply, rx) = channel();
        self.roundtrip(Cmd::Kill { pid, reply }, rx)
    }

    fn processes(&self) -> Result<Vec<ProcessInfo>> {
        let (reply, rx) = channel();
        self.roundtrip(Cmd::Processes { reply }, rx)
    }
}

struct FridaConnection {
    id: u64,
    cmd_tx: Sender<Cmd>,
}

impl FridaConnection {
    fn roundtrip<T>(&self, cmd: Cmd, rx: Receiver<Result<T>>) -> Result<T> {
        if self.cmd_tx.send(cmd).is_err() {
            return worker_died();
        }
        match rx.recv() {
            Ok(result) => result,
            Err(_) => worker_died(),
        }
    }
}

impl Connection for FridaConnection {
    fn create_script(
        &mut self,
        source: &str,
        runtime: ScriptRuntime,
    ) -> Result<Box<dyn ScriptHandle>> {
        let (reply, rx) = channel();
        let script = self.roundtrip(
            Cmd::CreateScript {
                conn: self.id,
                source: source.to_string(),
                runtime,
                reply,
            },
            rx,
        )?;
        Ok(Box::new(FridaScript {
            id: script,
            cmd_tx: self.cmd_tx.clone(),
            unloaded: false,
        }))
    }

    fn detach(&mut self) -> Result<()> {
        let (reply, rx) = channel();
        self.roundtrip(Cmd::Detach { conn: self.id, reply }, rx)
    }

    fn supports(&mut self, capability: Capability) -> Result<bool> {
        let (reply, rx) = channel();
        self.roundtrip(
            Cmd::Supports {
                conn: self.id,
                capability,
                reply,
            },
            rx,
        )
    }

    fn enumerate_threads(&mut self) -> Result<EnumerationOutcome> {
        let (reply, rx) = channel();
        self.roundtrip(Cmd::EnumerateThreads { conn: self.id, reply }, rx)
    }
}

struct FridaScript {
    id: u64,
    cmd_tx: Sender<Cmd>,
    unloaded: bool,
}

impl FridaScript {
    fn roundtrip<T>(&self, cmd: Cmd, rx: Receiver<Result<T>>) -> Result<T> {
        if self.cmd_tx.send(cmd).is_err() {
            return worker_died();
        }
        match rx.recv() {
            Ok(result) => result,
            Err(_) => worker_died(),
        }
    }
}

impl ScriptHandle for FridaScript {
    fn load(&mut self) -> Result<()> {
        let (reply, rx) = channel();
        self.roundtrip(Cmd::ScriptLoad { script: self.id, reply }, rx)
    }

    fn unload(&mut self) -> Result<()> {
        if self.unloaded {
            return Ok(());
        }
        self.unloaded = true;
        let (reply, rx) = channel();
        self.roundtrip(Cmd::ScriptUnload { script: self.id, reply }, rx)
    }

    fn set_message_handler(&mut self, handler: MessageHandler) -> Result<()> {
        let (reply, rx) = channel();
        self.roundtrip(
            Cmd::ScriptSetHandler {
                script: self.id,
                handler,
                reply,
            },
            rx,
        )
    }

    fn dispose(&mut self) -> Result<bool> {
        let (reply, rx) = channel();
        self.roundtrip(Cmd::ScriptDispose { script: self.id, reply }, rx)
    }
}
