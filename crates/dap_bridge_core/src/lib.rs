//! DAP Bridge Core
//!
//! A reusable async library for driving debug adapters (debugpy, delve, lldb-dap, ...)
//! over the Debug Adapter Protocol. Provides the wire framer, a sequence-correlating
//! protocol client, adapter process supervision, a session state tracker and the
//! high-level backend that sequences them into debugging operations.

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod process;
pub mod protocol;
pub mod tracker;
pub mod traffic;
pub mod types;

// Re-export commonly used types
pub use backend::{StandaloneDapBackend, StartParams};
pub use client::{DapClient, EventListener};
pub use config::{AdapterLaunchSpec, AdapterTransport, DebugConfig, LaunchConfiguration, RequestKind};
pub use error::{DapError, ErrorKind};
pub use process::{AdapterProcess, DebugAdapterManager, ProcessState};
pub use tracker::{DebugStateTracker, RunState, StopReason};

/// Result type alias using DapError
pub type Result<T> = std::result::Result<T, DapError>;
