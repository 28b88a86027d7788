//! Error types for the coppercli machine control plane.
//!
//! Each layer gets its own error enum; all of them fold into the top-level
//! [`Error`] via `thiserror`'s `#[from]`, the way a public API wants a single
//! result type while still letting callers match on the originating layer.

use thiserror::Error;

/// Errors from the byte-stream link (`Link`, §4.1).
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("not authorized to open {port}")]
    Unauthorized { port: String },

    #[error("port {port} is already in use")]
    PortInUse { port: String },

    #[error("invalid port: {port}")]
    InvalidPort { port: String },

    #[error("invalid address: {address}")]
    InvalidAddress { address: String },

    #[error("connection refused to {address}")]
    ConnectRefused { address: String },

    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Errors in interpreting the GRBL wire protocol.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("malformed status report: {line}")]
    MalformedStatus { line: String },

    #[error("malformed probe report: {line}")]
    MalformedProbe { line: String },

    #[error("ok received with no pending command")]
    UnsolicitedOk,

    #[error("unsupported firmware version: {reported}, require at least {minimum}")]
    UnsupportedVersion { reported: String, minimum: String },
}

/// A controller alarm or numeric error reported by GRBL.
#[derive(Error, Debug, Clone)]
pub enum FirmwareError {
    #[error("ALARM:{code} {message}")]
    Alarm { code: u32, message: String },

    #[error("error:{code} {message}")]
    Code { code: u32, message: String },
}

/// Errors in the workflow/controller layer (`ControllerCore` and subclasses).
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("precondition violated: {reason}")]
    PreconditionViolated { reason: String },

    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("safety condition failed: {reason}")]
    Safety { reason: String },

    #[error("cancelled by user")]
    UserAborted,
}

/// Top-level error type used across the workspace's public APIs.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Workflow(WorkflowError::Timeout { .. }))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_alarm(&self) -> bool {
        matches!(self, Error::Firmware(FirmwareError::Alarm { .. }))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(TransportError::Io {
            message: e.to_string(),
        })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
