use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Handshake step that failed while bringing an adapter up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeStage {
    Connect,
    Initialize,
    Launch,
    Attach,
    ConfigurationDone,
}

impl HandshakeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeStage::Connect => "connect",
            HandshakeStage::Initialize => "initialize",
            HandshakeStage::Launch => "launch",
            HandshakeStage::Attach => "attach",
            HandshakeStage::ConfigurationDone => "configurationDone",
        }
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum DapError {
    #[error("No debug adapter configured for '{0}'")]
    UnknownAdapter(String),

    #[error("Failed to spawn debug adapter '{command}': {cause}")]
    SpawnFailed { command: String, cause: String },

    #[error("Adapter handshake failed during {stage}: {cause}")]
    HandshakeFailed { stage: HandshakeStage, cause: String },

    #[error("Adapter transport closed: {reason}")]
    TransportClosed { reason: String },

    #[error("Request '{command}' timed out{}", seq_suffix(.seq))]
    RequestTimeout { command: String, seq: Option<u64> },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("No active debug session. Call start_debugging first.")]
    NoActiveSession,

    #[error("Debuggee is not stopped (state: {state})")]
    NotStopped { state: String },

    #[error("Operation '{operation}' is already in progress")]
    OperationInProgress { operation: String },

    #[error("Breakpoint at {file}:{line} rejected: {reason}")]
    BreakpointRejected {
        file: String,
        line: u32,
        reason: String,
    },

    #[error("Request '{command}' failed: {message}")]
    RequestFailed { command: String, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn seq_suffix(seq: &Option<u64>) -> String {
    match seq {
        Some(seq) => format!(" (seq {seq})"),
        None => String::new(),
    }
}

/// Stable, caller-facing classification of a [`DapError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    UnknownAdapter,
    SpawnFailed,
    HandshakeFailed,
    TransportClosed,
    RequestTimeout,
    FramingError,
    NoActiveSession,
    NotStopped,
    OperationInProgress,
    BreakpointRejected,
    RequestFailed,
    InvalidResponse,
    InvalidArgument,
    ConfigError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownAdapter => "UnknownAdapter",
            ErrorKind::SpawnFailed => "SpawnFailed",
            ErrorKind::HandshakeFailed => "HandshakeFailed",
            ErrorKind::TransportClosed => "TransportClosed",
            ErrorKind::RequestTimeout => "RequestTimeout",
            ErrorKind::FramingError => "FramingError",
            ErrorKind::NoActiveSession => "NoActiveSession",
            ErrorKind::NotStopped => "NotStopped",
            ErrorKind::OperationInProgress => "OperationInProgress",
            ErrorKind::BreakpointRejected => "BreakpointRejected",
            ErrorKind::RequestFailed => "RequestFailed",
            ErrorKind::InvalidResponse => "InvalidResponse",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DapError::UnknownAdapter(_) => ErrorKind::UnknownAdapter,
            DapError::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            DapError::HandshakeFailed { .. } => ErrorKind::HandshakeFailed,
            DapError::TransportClosed { .. } => ErrorKind::TransportClosed,
            DapError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            DapError::Framing(_) => ErrorKind::FramingError,
            DapError::NoActiveSession => ErrorKind::NoActiveSession,
            DapError::NotStopped { .. } => ErrorKind::NotStopped,
            DapError::OperationInProgress { .. } => ErrorKind::OperationInProgress,
            DapError::BreakpointRejected { .. } => ErrorKind::BreakpointRejected,
            DapError::RequestFailed { .. } => ErrorKind::RequestFailed,
            DapError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            DapError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            DapError::Config(_) => ErrorKind::ConfigError,
            DapError::Io(_) | DapError::Json(_) => ErrorKind::Internal,
        }
    }

    /// Transport-level failures that leave the session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DapError::TransportClosed { .. } | DapError::Framing(_)
        )
    }

    pub fn transport_closed(reason: impl Into<String>) -> Self {
        Self::TransportClosed {
            reason: reason.into(),
        }
    }

    pub fn handshake(stage: HandshakeStage, cause: impl fmt::Display) -> Self {
        Self::HandshakeFailed {
            stage,
            cause: cause.to_string(),
        }
    }

    pub fn request_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            command: command.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let timeout_err = DapError::RequestTimeout {
            command: "stackTrace".to_string(),
            seq: Some(7),
        };
        assert_eq!(timeout_err.to_string(), "Request 'stackTrace' timed out (seq 7)");

        let op_timeout = DapError::RequestTimeout {
            command: "step_over".to_string(),
            seq: None,
        };
        assert_eq!(op_timeout.to_string(), "Request 'step_over' timed out");

        let handshake = DapError::handshake(HandshakeStage::ConfigurationDone, "adapter refused");
        assert_eq!(
            handshake.to_string(),
            "Adapter handshake failed during configurationDone: adapter refused"
        );

        let rejected = DapError::BreakpointRejected {
            file: "main.py".to_string(),
            line: 12,
            reason: "no code".to_string(),
        };
        assert_eq!(rejected.to_string(), "Breakpoint at main.py:12 rejected: no code");
    }

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(DapError::NoActiveSession.kind().as_str(), "NoActiveSession");
        assert_eq!(
            DapError::Framing("short body".into()).kind(),
            ErrorKind::FramingError
        );
        assert_eq!(
            DapError::transport_closed("gone").kind().to_string(),
            "TransportClosed"
        );
        assert_eq!(
            serde_json::to_value(ErrorKind::OperationInProgress).unwrap(),
            serde_json::json!("OperationInProgress")
        );
    }

    #[test]
    fn test_only_transport_errors_are_fatal() {
        assert!(DapError::transport_closed("eof").is_fatal());
        assert!(DapError::Framing("bad header".into()).is_fatal());
        assert!(!DapError::RequestTimeout {
            command: "next".into(),
            seq: Some(3)
        }
        .is_fatal());
        assert!(!DapError::request_failed("evaluate", "NameError").is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let dap_err: DapError = io_err.into();
        match dap_err {
            DapError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io variant"),
        }
    }
}
