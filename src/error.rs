//! Core error type. Every externally triggered operation returns a
//! `CoreError`, and the HTTP layer turns it into a structured JSON
//! response instead of letting a failure escape the handler.

use axum::http::StatusCode;

/// Failure category, independent of the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    ResourceConflict,
    ResourceAbsent,
    ExternalFailure,
    ExhaustionFailure,
    Internal,
}

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Server already running on port {0}")]
    AlreadyRunning(u16),

    #[error("Port {0} is already in use by another application")]
    PortUnavailable(u16),

    #[error("No server running on port {0}")]
    ServerNotRunning(u16),

    #[error("Process {0} not found")]
    ScriptNotFound(u32),

    #[error("Process {0} is not running")]
    ScriptNotRunning(u32),

    #[error("No running script found on port {0}")]
    NoActiveScript(u16),

    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Dependency install failed ({})", .0.map(|c| format!("exit code {}", c)).unwrap_or_else(|| "terminated by signal".to_string()))]
    InstallFailed(Option<i32>),

    #[error("Working directory does not exist or is not a directory: {0}")]
    InvalidWorkingDirectory(String),

    #[error("No available port found")]
    NoPortAvailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::InvalidWorkingDirectory(_) => ErrorKind::InvalidInput,
            Self::AlreadyRunning(_) | Self::PortUnavailable(_) => ErrorKind::ResourceConflict,
            Self::ServerNotRunning(_)
            | Self::ScriptNotFound(_)
            | Self::ScriptNotRunning(_)
            | Self::NoActiveScript(_) => ErrorKind::ResourceAbsent,
            Self::Bind { .. } | Self::SpawnFailed { .. } | Self::InstallFailed(_) | Self::Io(_) => {
                ErrorKind::ExternalFailure
            }
            Self::NoPortAvailable => ErrorKind::ExhaustionFailure,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status code mapping
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_)
            | Self::InvalidWorkingDirectory(_)
            | Self::AlreadyRunning(_)
            | Self::PortUnavailable(_)
            | Self::ServerNotRunning(_)
            | Self::ScriptNotFound(_)
            | Self::ScriptNotRunning(_)
            | Self::Bind { .. } => StatusCode::BAD_REQUEST,
            Self::NoActiveScript(_)
            | Self::SpawnFailed { .. }
            | Self::InstallFailed(_)
            | Self::NoPortAvailable
            | Self::Io(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::PortUnavailable(_) => "PORT_UNAVAILABLE",
            Self::ServerNotRunning(_) => "NOT_RUNNING",
            Self::ScriptNotFound(_) => "NOT_FOUND",
            Self::ScriptNotRunning(_) => "NOT_RUNNING",
            Self::NoActiveScript(_) => "NO_ACTIVE_SCRIPT",
            Self::Bind { .. } => "BIND_FAILED",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::InstallFailed(_) => "INSTALL_FAILED",
            Self::InvalidWorkingDirectory(_) => "INVALID_WORKING_DIRECTORY",
            Self::NoPortAvailable => "NO_PORT_AVAILABLE",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "errorCode": self.error_code(),
        })
    }
}

impl axum::response::IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
