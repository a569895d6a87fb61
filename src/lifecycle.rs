//! Startup and shutdown sequencing.
//!
//! Startup: open the session, handle the platform quirk for ELF targets
//! spawned under a tracing primitive, then resume or stay suspended as
//! requested. Shutdown: reverse every tracked resource in a fixed order and
//! release the target, killing it only if we spawned it. The controller is
//! an explicit instance with teardown on `Drop`, not a process-wide exit
//! hook.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{self, Settings};
use crate::device::{is_process_alive, Device, EnumerationOutcome, ScriptMessage, ScriptRuntime};
use crate::scripts::{ScriptLoader, ScriptOptions, ScriptResult};
use crate::session::{FileFormat, Session, Target};
use crate::tracker::{CleanupReport, ResourceKind, ResourceTracker};
use crate::{Error, Result};

/// Linear state machine, never re-entered backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    SessionOpen,
    PlatformPrepared,
    Resumed,
    Suspended,
    Active,
    TearingDown,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Resume the target once startup finishes. Without it a spawned
    /// target stays suspended until `resume()` is called.
    pub resume: bool,
    pub envp: Option<HashMap<String, String>>,
    /// Explicit settings; resolved from config files when absent.
    pub settings: Option<Settings>,
}

/// Trap installed at the entrypoint of spawned ELF targets. The runtime
/// starts under a tracing primitive; intercepting the first instruction
/// lets it be stripped before user code proceeds. The entry handler clears
/// itself after firing. Exit calls are trapped too so a fast-exiting
/// target is still observed.
const ENTRYPOINT_TRAP: &str = r#"
(function () {
    var entry = ptr("ENTRY_ADDR");
    var trap = Interceptor.attach(entry, function () {
        send("entrypoint-hit");
        trap.detach();
    });
    ['exit', '_exit'].forEach(function (name) {
        var target = Module.findExportByName(null, name);
        if (target !== null) {
            Interceptor.attach(target, function () {
                send("exit-hit");
            });
        }
    });
})();
"#;

/// Catch-all run at the start of teardown, before individual reversals.
const DETACH_ALL: &str = "Interceptor.detachAll();";

/// Orchestrates one instrumented target from attach to release.
pub struct Controller {
    state: LifecycleState,
    resumed: bool,
    /// Address of the entrypoint trap, when one was installed.
    entry_trap: Option<u64>,
    session: Session,
    tracker: ResourceTracker,
    loader: ScriptLoader,
}

impl Controller {
    /// Open a session against `target` and drive it to `Active`.
    pub fn launch(device: Arc<dyn Device>, target: Target, opts: LaunchOptions) -> Result<Self> {
        let settings = opts.settings.clone().unwrap_or_else(|| config::resolve(None));
        let session = Session::open(device, target, opts.envp.as_ref(), &settings)?;

        let mut controller = Self {
            state: LifecycleState::SessionOpen,
            resumed: false,
            entry_trap: None,
            session,
            tracker: ResourceTracker::new(),
            loader: ScriptLoader::new(settings),
        };

        controller.prepare_platform()?;
        controller.state = LifecycleState::PlatformPrepared;

        if opts.resume {
            controller.resume_target()?;
            controller.state = LifecycleState::Resumed;
        } else if controller.session.spawned_pid().is_some() {
            controller.state = LifecycleState::Suspended;
        } else {
            // An attached target was never suspended by us.
            controller.state = LifecycleState::Resumed;
        }

        controller.state = LifecycleState::Active;
        Ok(controller)
    }

    /// Platform-specific startup quirks. Only spawned ELF targets need
    /// work: trap the entrypoint (and exit calls), then let the suspended
    /// target run up to the trap so the tracing flag gets stripped there.
    fn prepare_platform(&mut self) -> Result<()> {
        if self.session.platform().os == "linux" {
            match self.session.connection_mut()?.enumerate_threads() {
                Ok(EnumerationOutcome::Unsupported) => {
                    tracing::error!(
                        "Can't enumerate threads. Check sysctl kernel.yama.ptrace_scope=0 or run as root."
                    );
                }
                Ok(EnumerationOutcome::Threads(threads)) => {
                    tracing::debug!(count = threads.len(), "Enumerated target threads");
                }
                Err(e) => tracing::debug!("Thread enumeration probe failed: {}", e),
            }
        }

        let Some(pid) = self.session.spawned_pid() else {
            return Ok(());
        };
        if self.session.platform().file_format != FileFormat::Elf {
            return Ok(());
        }
        let Some(entry) = self.session.platform().entrypoint else {
            tracing::warn!("Entrypoint unknown for ELF target, skipping entrypoint trap");
            return Ok(());
        };

        let source = ENTRYPOINT_TRAP.replace("ENTRY_ADDR", &format!("{:#x}", entry));
        let conn = self.session.connection_mut()?;
        let mut script = conn.create_script(&source, ScriptRuntime::Default)?;
        script.set_message_handler(Box::new(|msg| match msg {
            ScriptMessage::Send { payload, .. } => {
                tracing::debug!(?payload, "Entrypoint trap message");
            }
            ScriptMessage::Error { description } => {
                tracing::error!("Entrypoint trap error: {}", description);
            }
            ScriptMessage::Log { text } => tracing::debug!("Entrypoint trap log: {}", text),
        }))?;
        script.load()?;

        self.tracker.install(ResourceKind::Breakpoint, entry, move || {
            let mut script = script;
            match script.dispose() {
                Ok(_) => {}
                Err(e) if e.target_gone() => return Ok(()),
                Err(e) => tracing::debug!("Entrypoint trap dispose failed: {}", e),
            }
            script.unload()
        })?;
        self.entry_trap = Some(entry);

        // Run up to the trap; the target blocks at its first instruction.
        self.session.device().resume(pid)?;
        tracing::debug!(pid, entry = format_args!("{:#x}", entry), "Entrypoint trap armed");

        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            LifecycleState::TearingDown | LifecycleState::Closed => Err(Error::SessionClosed),
            _ => Ok(()),
        }
    }

    fn resume_target(&mut self) -> Result<()> {
        let Some(pid) = self.session.spawned_pid() else {
            tracing::info!("resume: session was attached, target already running");
            return Ok(());
        };

        if let Some(entry) = self.entry_trap.take() {
            // Clearing the trap is the resume-equivalent: the target is
            // blocked at the entrypoint and proceeds once it is gone.
            if self.tracker.reverse(ResourceKind::Breakpoint, entry)? {
                self.resumed = true;
                return Ok(());
            }
        }

        self.session.device().resume(pid)?;
        self.resumed = true;
        Ok(())
    }

    /// Resume a spawned-but-suspended target. Logged no-op for sessions
    /// created via attach.
    pub fn resume(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.resume_target()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn loaded_scripts(&self) -> Vec<&str> {
        self.tracker.loaded_scripts()
    }

    /// Register a breakpoint's reversal action.
    pub fn track_breakpoint<F>(&mut self, address: u64, clear: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.ensure_active()?;
        self.tracker.install(ResourceKind::Breakpoint, address, clear)
    }

    /// Register a function replacement's reversal action.
    pub fn track_replacement<F>(&mut self, address: u64, restore: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.ensure_active()?;
        self.tracker.install(ResourceKind::Replacement, address, restore)
    }

    /// Register an enter-hook's reversal action.
    pub fn track_enter_hook<F>(&mut self, address: u64, detach: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.ensure_active()?;
        self.tracker.install(ResourceKind::EnterHook, address, detach)
    }

    /// Register a per-thread instruction trace's stop action.
    pub fn track_trace<F>(&mut self, thread_id: u64, stop: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.ensure_active()?;
        self.tracker.install(ResourceKind::Trace, thread_id, stop)
    }

    /// Register an allocated memory block's free action.
    pub fn track_allocation<F>(&mut self, block: u64, free: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.ensure_active()?;
        self.tracker.install(ResourceKind::Memory, block, free)
    }

    /// Run an instrumentation snippet in the target.
    pub fn run_script(&mut self, source: &str, opts: ScriptOptions) -> Result<ScriptResult> {
        self.ensure_active()?;
        self.loader
            .run(self.session.connection_mut()?, Some(&mut self.tracker), source, opts)
    }

    /// Run a snippet that bridges an asynchronous in-target operation:
    /// blocks until `marker` is observed.
    pub fn run_script_async(&mut self, source: &str, marker: &str) -> Result<ScriptResult> {
        self.ensure_active()?;
        self.loader
            .run_async(self.session.connection_mut()?, &mut self.tracker, source, marker)
    }

    /// Tear the session down: reverse every tracked resource in order,
    /// then kill the target if we spawned it or detach if we attached.
    /// Idempotent; a second call observes a no-op. Returns an error only
    /// for a kill refused while the target is verifiably still alive.
    pub fn quit(&mut self) -> Result<CleanupReport> {
        if matches!(self.state, LifecycleState::TearingDown | LifecycleState::Closed) {
            tracing::debug!("quit: teardown already performed");
            return Ok(CleanupReport::default());
        }
        self.state = LifecycleState::TearingDown;
        tracing::info!(id = self.session.id(), "Tearing down session");

        // Catch-all interceptor detach, before individual reversals and
        // well before any memory is freed.
        if let Ok(conn) = self.session.connection_mut() {
            let _ = self.loader.run_sync(conn, DETACH_ALL, ScriptRuntime::Default);
        }

        let report = self.tracker.reverse_all();
        if !report.is_clean() {
            tracing::warn!(
                reversed = report.reversed,
                failed = report.failures.len(),
                "Teardown reversed resources with failures"
            );
        }

        let outcome = match self.session.spawned_pid() {
            Some(pid) => {
                let result = self.kill_spawned(pid);
                // Kill supersedes detach.
                self.session.discard_connection();
                result
            }
            None => {
                if let Err(e) = self.session.close() {
                    tracing::warn!("Detach failed during teardown: {}", e);
                }
                Ok(())
            }
        };

        self.state = LifecycleState::Closed;
        outcome.map(|()| report)
    }

    fn kill_spawned(&self, pid: u32) -> Result<()> {
        match self.session.device().kill(pid) {
            Ok(()) => {
                tracing::info!(pid, "Killed spawned target");
                Ok(())
            }
            Err(e) if e.target_gone() => {
                tracing::debug!(pid, "Target already gone before kill");
                Ok(())
            }
            Err(e @ (Error::PermissionDenied(_) | Error::ProcessNotFound(_))) => {
                // The process may simply be dead already. Only a kill
                // refused while the target is verifiably alive propagates.
                let alive = match self.session.device().processes() {
                    Ok(procs) => procs.iter().any(|p| p.pid == pid),
                    Err(e) => {
                        tracing::debug!("Process listing failed, probing pid directly: {}", e);
                        is_process_alive(pid)
                    }
                };
                if alive {
                    tracing::error!(pid, "Device kill failed with target apparently still alive");
                    Err(e)
                } else {
                    tracing::debug!(pid, "Target already dead, kill not needed");
                    Ok(())
                }
            }
            Err(e) => {
                tracing::warn!(pid, "Kill failed: {}", e);
                Ok(())
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if !matches!(self.state, LifecycleState::Closed) {
            tracing::debug!("Controller dropped without quit, tearing down");
            if let Err(e) = self.quit() {
                tracing::warn!("Teardown on drop failed: {}", e);
            }
        }
    }
}
