pub mod config;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod scripts;
pub mod session;
pub mod tracker;

pub use error::{Error, Result, TransportErrorKind};
pub use lifecycle::{Controller, LaunchOptions, LifecycleState};
pub use scripts::{ScriptLoader, ScriptOptions, ScriptResult};
pub use session::{Session, Target};
pub use tracker::{CleanupReport, ResourceKind, ResourceTracker};
