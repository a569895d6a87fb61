//! Registry of every reversible side effect installed in the target.
//!
//! Each category maps an install key (address, block handle, or thread id)
//! to the action that undoes it. Loaded scripts are kept as an ordered list,
//! newest first, so a script that depends on an earlier one unloads before
//! its dependency. `reverse_all` drains everything in a fixed category
//! order; reversing memory before the hooks that read it would be a
//! use-after-free inside the target.

use std::collections::HashMap;

use crate::device::ScriptHandle;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Per-thread instruction trace, keyed by thread id.
    Trace,
    /// On-enter interceptor, keyed by address.
    EnterHook,
    /// Function replacement, keyed by address.
    Replacement,
    /// Breakpoint, keyed by address.
    Breakpoint,
    /// Allocated block in the target, keyed by block handle.
    Memory,
}

type Reversal = Box<dyn FnOnce() -> Result<()> + Send>;

struct TrackedScript {
    id: String,
    excerpt: String,
    handle: Box<dyn ScriptHandle>,
}

#[derive(Debug)]
pub struct CleanupFailure {
    pub category: &'static str,
    pub key: Option<u64>,
    pub error: Error,
}

/// Outcome of a best-effort teardown pass. Failures are collected, never
/// raised.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub reversed: usize,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run every reversal action in `actions`, recording outcomes in `report`.
/// A failure never stops the remaining actions. Errors that say the target
/// is already gone count as success: the goal state (resource not held) is
/// already satisfied.
fn try_each<I>(category: &'static str, actions: I, report: &mut CleanupReport)
where
    I: IntoIterator<Item = (Option<u64>, Reversal)>,
{
    for (key, action) in actions {
        match action() {
            Ok(()) => report.reversed += 1,
            Err(e) if e.target_gone() => {
                tracing::debug!(category, ?key, "Target already gone, reversal satisfied");
                report.reversed += 1;
            }
            Err(e) => {
                tracing::warn!(category, ?key, error = %e, "Failed to reverse resource");
                report.failures.push(CleanupFailure {
                    category,
                    key,
                    error: e,
                });
            }
        }
    }
}

#[derive(Default)]
pub struct ResourceTracker {
    traces: HashMap<u64, Reversal>,
    enter_hooks: HashMap<u64, Reversal>,
    replacements: HashMap<u64, Reversal>,
    breakpoints: HashMap<u64, Reversal>,
    memory: HashMap<u64, Reversal>,
    scripts: Vec<TrackedScript>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn category(&mut self, kind: ResourceKind) -> &mut HashMap<u64, Reversal> {
        match kind {
            ResourceKind::Trace => &mut self.traces,
            ResourceKind::EnterHook => &mut self.enter_hooks,
            ResourceKind::Replacement => &mut self.replacements,
            ResourceKind::Breakpoint => &mut self.breakpoints,
            ResourceKind::Memory => &mut self.memory,
        }
    }

    /// Register a resource. A key may only be installed once per kind; a
    /// duplicate install fails and leaves the existing registration
    /// untouched.
    pub fn install<F>(&mut self, kind: ResourceKind, key: u64, reversal: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let map = self.category(kind);
        if map.contains_key(&key) {
            return Err(Error::DuplicateResource { kind, key });
        }
        map.insert(key, Box::new(reversal));
        tracing::debug!(?kind, key = format_args!("{:#x}", key), "Installed resource");
        Ok(())
    }

    pub fn contains(&self, kind: ResourceKind, key: u64) -> bool {
        match kind {
            ResourceKind::Trace => self.traces.contains_key(&key),
            ResourceKind::EnterHook => self.enter_hooks.contains_key(&key),
            ResourceKind::Replacement => self.replacements.contains_key(&key),
            ResourceKind::Breakpoint => self.breakpoints.contains_key(&key),
            ResourceKind::Memory => self.memory.contains_key(&key),
        }
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Trace => self.traces.len(),
            ResourceKind::EnterHook => self.enter_hooks.len(),
            ResourceKind::Replacement => self.replacements.len(),
            ResourceKind::Breakpoint => self.breakpoints.len(),
            ResourceKind::Memory => self.memory.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
            && self.enter_hooks.is_empty()
            && self.replacements.is_empty()
            && self.breakpoints.is_empty()
            && self.memory.is_empty()
            && self.scripts.is_empty()
    }

    /// Reverse and remove a single resource. Ok(false) when nothing is
    /// tracked under the key.
    pub fn reverse(&mut self, kind: ResourceKind, key: u64) -> Result<bool> {
        match self.category(kind).remove(&key) {
            Some(reversal) => {
                tracing::debug!(?kind, key = format_args!("{:#x}", key), "Reversing resource");
                reversal()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Track a resident script. Inserted at the front: later scripts unload
    /// before earlier ones.
    pub fn track_script(&mut self, id: String, excerpt: String, handle: Box<dyn ScriptHandle>) {
        tracing::debug!(id, excerpt, "Tracking resident script");
        self.scripts.insert(0, TrackedScript { id, excerpt, handle });
    }

    /// Ids of every resident script, in unload order.
    pub fn loaded_scripts(&self) -> Vec<&str> {
        self.scripts.iter().map(|s| s.id.as_str()).collect()
    }

    /// Reverse every tracked resource, best effort, in the documented
    /// order: traces, then enter-hooks, replacements and breakpoints, then
    /// script unloads, then memory frees. The registry is empty afterwards.
    pub fn reverse_all(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        try_each(
            "trace",
            self.traces.drain().map(|(k, r)| (Some(k), r)),
            &mut report,
        );
        try_each(
            "enter_hook",
            self.enter_hooks.drain().map(|(k, r)| (Some(k), r)),
            &mut report,
        );
        try_each(
            "replacement",
            self.replacements.drain().map(|(k, r)| (Some(k), r)),
            &mut report,
        );
        try_each(
            "breakpoint",
            self.breakpoints.drain().map(|(k, r)| (Some(k), r)),
            &mut report,
        );

        let scripts: Vec<TrackedScript> = self.scripts.drain(..).collect();
        try_each(
            "script",
            scripts.into_iter().map(|mut s| {
                let action: Reversal = Box::new(move || {
                    tracing::debug!(id = s.id, excerpt = s.excerpt, "Unloading script");
                    // Force the dispose contract even if the script never
                    // signalled completion, then unload.
                    match s.handle.dispose() {
                        Ok(_) => {}
                        Err(e) if e.target_gone() => return Ok(()),
                        Err(e) => tracing::debug!(error = %e, "Dispose failed before unload"),
                    }
                    s.handle.unload()
                });
                (None, action)
            }),
            &mut report,
        );

        try_each(
            "memory",
            self.memory.drain().map(|(k, r)| (Some(k), r)),
            &mut report,
        );

        report
    }
}
