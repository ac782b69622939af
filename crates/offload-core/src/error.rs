//! The kernel's closed error taxonomy.
//!
//! Every fallible kernel operation returns [`KernelError`], which carries a
//! machine-matchable [`ErrorCode`], a human message, and an optional context
//! map. Adapters must serialize the code verbatim so callers can branch on
//! it rather than on prose.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of error codes the kernel can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    InvalidDirectory,
    TaskNotFound,
    ScheduleNotFound,
    TaskCannotCancel,
    InvalidOperation,
    DependencyCycle,
    ResourceExhausted,
    OutputBufferLimitExceeded,
    RequestTimeout,
    SubscriptionLimitExceeded,
    ProcessSpawnFailed,
    StorageFailure,
    SystemError,
    Shutdown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "VALIDATION",
            Self::InvalidDirectory => "INVALID_DIRECTORY",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::ScheduleNotFound => "SCHEDULE_NOT_FOUND",
            Self::TaskCannotCancel => "TASK_CANNOT_CANCEL",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::DependencyCycle => "DEPENDENCY_CYCLE",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::OutputBufferLimitExceeded => "OUTPUT_BUFFER_LIMIT_EXCEEDED",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::SubscriptionLimitExceeded => "SUBSCRIPTION_LIMIT_EXCEEDED",
            Self::ProcessSpawnFailed => "PROCESS_SPAWN_FAILED",
            Self::StorageFailure => "STORAGE_FAILURE",
            Self::SystemError => "SYSTEM_ERROR",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// A kernel error: code, message, context, and (for aggregate emit
/// failures) the underlying per-handler causes.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct KernelError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<KernelError>,
}

impl KernelError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: BTreeMap::new(),
            causes: Vec::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn invalid_directory(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidDirectory, message)
    }

    pub fn task_not_found(id: uuid::Uuid) -> Self {
        Self::new(ErrorCode::TaskNotFound, format!("task {id} not found"))
    }

    pub fn schedule_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::ScheduleNotFound,
            format!("schedule {id} not found"),
        )
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidOperation, message)
    }

    pub fn storage(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::StorageFailure, err.to_string())
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SystemError, message)
    }

    pub fn shutdown() -> Self {
        Self::new(ErrorCode::Shutdown, "kernel is shutting down")
    }

    /// Build the composite error returned by an emit whose handlers failed.
    pub fn aggregate(causes: Vec<KernelError>) -> Self {
        let mut err = Self::new(
            ErrorCode::SystemError,
            format!("{} event handler(s) failed", causes.len()),
        );
        err.causes = causes;
        err
    }

    /// Find this error or any cause carrying the given code. Lets callers
    /// surface a business failure buried inside an aggregate emit error.
    pub fn find_code(&self, code: ErrorCode) -> Option<&KernelError> {
        if self.code == code {
            return Some(self);
        }
        self.causes.iter().find_map(|cause| cause.find_code(code))
    }

    /// The most specific failure to show a caller: the first non-aggregate
    /// cause, or the error itself.
    pub fn primary(&self) -> &KernelError {
        self.causes.first().map_or(self, |cause| cause.primary())
    }
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        // The db layer reports through anyhow; anything crossing into the
        // kernel from there is a storage failure.
        Self::storage(format!("{err:#}"))
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
