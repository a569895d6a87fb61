use thiserror::Error;

use crate::tracker::ResourceKind;

/// Typed code for failures on the connection to the target, so callers can
/// distinguish "the far side is already gone" from a genuine fault without
/// matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The session was detached (by us or by the target exiting).
    Detached,
    /// The underlying connection is closed.
    ConnectionClosed,
    /// Anything else the connection layer reports.
    Other,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("ATTACH_FAILED: could not attach to pid {pid}: {reason}")]
    Attach { pid: u32, reason: String },

    #[error("SPAWN_FAILED: could not spawn '{path}': {reason}")]
    Spawn { path: String, reason: String },

    #[error("DUPLICATE_RESOURCE: {kind:?} already tracked under key {key:#x}")]
    DuplicateResource { kind: ResourceKind, key: u64 },

    #[error("SESSION_CLOSED: session has already been torn down")]
    SessionClosed,

    #[error("SCRIPT_RUNTIME: {0}")]
    ScriptRuntime(String),

    #[error("PERMISSION_DENIED: {0}")]
    PermissionDenied(String),

    #[error("PROCESS_NOT_FOUND: no process with pid {0} on the device")]
    ProcessNotFound(u32),

    #[error("TRANSPORT: {kind:?}: {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("DEVICE: {0}")]
    Device(String),
}

impl Error {
    /// True when the error means the target (or the connection to it) is
    /// already gone, so the teardown postcondition is trivially satisfied.
    pub fn target_gone(&self) -> bool {
        matches!(
            self,
            Error::Transport {
                kind: TransportErrorKind::Detached | TransportErrorKind::ConnectionClosed,
                ..
            }
        )
    }

    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Error::Transport {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_gone_covers_detached_and_closed() {
        assert!(Error::transport(TransportErrorKind::Detached, "x").target_gone());
        assert!(Error::transport(TransportErrorKind::ConnectionClosed, "x").target_gone());
        assert!(!Error::transport(TransportErrorKind::Other, "x").target_gone());
    }

    #[test]
    fn test_target_gone_false_for_device_errors() {
        assert!(!Error::PermissionDenied("kill".into()).target_gone());
        assert!(!Error::ProcessNotFound(42).target_gone());
        assert!(!Error::SessionClosed.target_gone());
    }

    #[test]
    fn test_duplicate_resource_message_names_kind_and_key() {
        let e = Error::DuplicateResource {
            kind: ResourceKind::Breakpoint,
            key: 0x2000,
        };
        let msg = e.to_string();
        assert!(msg.contains("Breakpoint"));
        assert!(msg.contains("0x2000"));
    }
}
