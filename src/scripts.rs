//! Injection of instrumentation snippets into the target.
//!
//! The connection delivers script messages on its own thread; they are
//! marshalled back into synchronous results through an mpsc channel with
//! blocking waits and short sleeps. Compile and runtime errors from the
//! target are logged and yield an empty result: one failed probe must not
//! abort the caller's broader operation.

use std::sync::mpsc::{channel, Receiver};
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

use crate::config::Settings;
use crate::device::{Connection, ScriptHandle, ScriptMessage, ScriptRuntime};
use crate::tracker::ResourceTracker;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    /// Delay execution and leave the script resident; the caller is
    /// responsible for its eventual unload (via session teardown).
    pub timeout: Option<Duration>,
    /// Block until this exact payload string arrives, bridging an
    /// asynchronous in-target operation into a synchronous call.
    pub complete_marker: Option<String>,
    pub runtime: ScriptRuntime,
}

/// Messages and raw data a script produced, in arrival order.
#[derive(Debug, Default)]
pub struct ScriptResult {
    pub messages: Vec<Value>,
    pub data: Vec<Option<Vec<u8>>>,
}

pub struct ScriptLoader {
    settings: Settings,
}

impl ScriptLoader {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run a snippet synchronously: load, force the dispose contract,
    /// unload, return everything it sent.
    pub fn run_sync(
        &self,
        conn: &mut dyn Connection,
        source: &str,
        runtime: ScriptRuntime,
    ) -> Result<ScriptResult> {
        self.run(
            conn,
            None,
            source,
            ScriptOptions {
                runtime,
                ..Default::default()
            },
        )
    }

    /// Load a snippet and block until `marker` arrives, then dispose and
    /// unload. Marker payloads are not included in the returned messages.
    pub fn run_async(
        &self,
        conn: &mut dyn Connection,
        tracker: &mut ResourceTracker,
        source: &str,
        marker: &str,
    ) -> Result<ScriptResult> {
        self.run(
            conn,
            Some(tracker),
            source,
            ScriptOptions {
                complete_marker: Some(marker.to_string()),
                ..Default::default()
            },
        )
    }

    /// Compile and load `source` into the target's script runtime.
    ///
    /// Without a timeout or marker the call is fully synchronous: the
    /// script runs during load, is disposed and unloaded immediately, and
    /// its messages are returned. With `timeout` set the source is wrapped
    /// in a delayed-execution shim, the call returns at once and the script
    /// stays resident, registered with `tracker`. With `complete_marker`
    /// set the call blocks (polling) until the marker payload is observed
    /// or the configured async timeout lapses, in which case the script is
    /// left resident.
    pub fn run(
        &self,
        conn: &mut dyn Connection,
        tracker: Option<&mut ResourceTracker>,
        source: &str,
        opts: ScriptOptions,
    ) -> Result<ScriptResult> {
        let mut result = ScriptResult::default();

        let wrapped;
        let effective_source = match opts.timeout {
            Some(t) => {
                wrapped = format!(
                    "setTimeout(function () {{\n{}\n}}, {});",
                    source,
                    t.as_millis()
                );
                &wrapped
            }
            None => source,
        };

        let mut script = match conn.create_script(effective_source, opts.runtime) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Error compiling script: {}", e);
                return Ok(result);
            }
        };

        let (tx, rx) = channel::<ScriptMessage>();
        if let Err(e) = script.set_message_handler(Box::new(move |msg| {
            let _ = tx.send(msg);
        })) {
            tracing::error!("Error installing message handler: {}", e);
            return Ok(result);
        }

        if let Err(e) = script.load() {
            tracing::error!("Error running script: {}", e);
            let _ = script.unload();
            return Ok(result);
        }

        // Resident path: hand the script to the tracker and return at once.
        if opts.timeout.is_some() {
            self.drain(&rx, &mut result);
            self.track(tracker, source, script);
            return Ok(result);
        }

        if let Some(ref marker) = opts.complete_marker {
            let deadline = Instant::now() + self.settings.async_timeout();
            let completed = self.wait_for_marker(&rx, marker, deadline, &mut result);
            if !completed {
                tracing::warn!(
                    "Completion marker '{}' not observed within {:?}, leaving script resident",
                    marker,
                    self.settings.async_timeout()
                );
                self.track(tracker, source, script);
                return Ok(result);
            }
        }

        self.drain(&rx, &mut result);

        match script.dispose() {
            Ok(true) => {
                // Dispose may flush one last batch of messages; the flush
                // drain is bounded by the synchronous-script timeout so a
                // chatty script cannot hold the caller indefinitely.
                let deadline = Instant::now() + self.settings.sync_timeout();
                self.drain_until(&rx, &mut result, deadline);
            }
            Ok(false) => {}
            Err(e) if e.target_gone() => {
                tracing::debug!("Target gone before dispose, skipping unload");
                return Ok(result);
            }
            Err(e) => tracing::debug!("Dispose failed: {}", e),
        }

        if let Err(e) = script.unload() {
            if e.target_gone() {
                tracing::debug!("Target gone during unload");
            } else {
                tracing::warn!("Failed to unload script: {}", e);
            }
        }

        Ok(result)
    }

    fn track(
        &self,
        tracker: Option<&mut ResourceTracker>,
        source: &str,
        mut script: Box<dyn ScriptHandle>,
    ) {
        let excerpt: String = source.chars().take(60).collect();
        match tracker {
            Some(tracker) => {
                tracker.track_script(Uuid::new_v4().to_string(), excerpt, script);
            }
            None => {
                // No registry to hand the script to; forcing the unload now
                // is the only way to not leak it in the target.
                tracing::warn!(excerpt, "Resident script has no tracker, force-unloading");
                let _ = script.dispose();
                let _ = script.unload();
            }
        }
    }

    /// Collect every message already pending, without blocking.
    fn drain(&self, rx: &Receiver<ScriptMessage>, result: &mut ScriptResult) {
        while let Ok(msg) = rx.try_recv() {
            self.collect(msg, result);
        }
    }

    /// Keep collecting as long as messages arrive within one poll interval
    /// of each other, stopping at `deadline` regardless.
    fn drain_until(
        &self,
        rx: &Receiver<ScriptMessage>,
        result: &mut ScriptResult,
        deadline: Instant,
    ) {
        while Instant::now() < deadline {
            match rx.recv_timeout(self.settings.poll_interval()) {
                Ok(msg) => self.collect(msg, result),
                Err(_) => break,
            }
        }
    }

    /// Poll the channel until the marker payload arrives or the deadline
    /// passes. Returns whether the marker was observed.
    fn wait_for_marker(
        &self,
        rx: &Receiver<ScriptMessage>,
        marker: &str,
        deadline: Instant,
        result: &mut ScriptResult,
    ) -> bool {
        loop {
            while let Ok(msg) = rx.try_recv() {
                if let ScriptMessage::Send { ref payload, .. } = msg {
                    if payload.as_str() == Some(marker) {
                        return true;
                    }
                }
                self.collect(msg, result);
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.settings.poll_interval());
        }
    }

    fn collect(&self, msg: ScriptMessage, result: &mut ScriptResult) {
        match msg {
            ScriptMessage::Send { payload, data } => {
                tracing::debug!(?payload, "Script message");
                result.messages.push(payload);
                result.data.push(data);
            }
            ScriptMessage::Error { description } => {
                tracing::error!("Script runtime error: {}", description);
            }
            ScriptMessage::Log { text } => {
                tracing::debug!("Script log: {}", text);
            }
        }
    }
}
