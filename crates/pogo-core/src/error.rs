use std::fmt;

/// Main error type for pogo
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Job spec rejected before a job was created
    InvalidSpec(String),

    /// Namespace is not loaded in the coordination store
    UnknownNamespace(String),

    /// Target expression references a tag the namespace does not define
    UnknownTag(String),

    /// Coordination store cannot be reached
    StoreUnavailable(String),

    /// Compare-and-set write lost the race
    CasConflict(String),

    /// Worker session dropped with tasks in flight
    WorkerLost(String),

    /// No worker could accept the dispatch
    DispatchRejected(String),

    /// Per-host or whole-job timer expired
    Timeout(String),

    /// Operation was cancelled before completion
    Cancelled(String),

    /// Host can never become runnable
    DeadlockDetected(String),

    /// Serialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Unexpected internal errors
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::InvalidSpec(msg) => write!(f, "Invalid job spec: {}", msg),
            Error::UnknownNamespace(msg) => write!(f, "Unknown namespace: {}", msg),
            Error::UnknownTag(msg) => write!(f, "Unknown tag: {}", msg),
            Error::StoreUnavailable(msg) => write!(f, "Coordination store unavailable: {}", msg),
            Error::CasConflict(msg) => write!(f, "Version conflict: {}", msg),
            Error::WorkerLost(msg) => write!(f, "Worker lost: {}", msg),
            Error::DispatchRejected(msg) => write!(f, "Dispatch rejected: {}", msg),
            Error::Timeout(msg) => write!(f, "Timeout: {}", msg),
            Error::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            Error::DeadlockDetected(msg) => write!(f, "Deadlock detected: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external error types
impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::InvalidSpec(format!("YAML parse error: {}", error))
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid spec error
    pub fn invalid_spec<T: Into<String>>(msg: T) -> Self {
        Error::InvalidSpec(msg.into())
    }

    /// Create a new unknown namespace error
    pub fn unknown_namespace<T: Into<String>>(msg: T) -> Self {
        Error::UnknownNamespace(msg.into())
    }

    /// Create a new store unavailable error
    pub fn store_unavailable<T: Into<String>>(msg: T) -> Self {
        Error::StoreUnavailable(msg.into())
    }

    /// Create a new dispatch rejected error
    pub fn dispatch_rejected<T: Into<String>>(msg: T) -> Self {
        Error::DispatchRejected(msg.into())
    }

    /// Create a new internal error
    pub fn internal<T: Into<String>>(msg: T) -> Self {
        Error::Internal(msg.into())
    }

    /// Create a not-implemented error
    pub fn not_implemented<T: Into<String>>(msg: T) -> Self {
        Error::Internal(format!("Not implemented: {}", msg.into()))
    }
}

impl Error {
    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Config(_) => 500,
            Error::InvalidSpec(_) => 400,
            Error::UnknownNamespace(_) => 404,
            Error::UnknownTag(_) => 400,
            Error::StoreUnavailable(_) => 503,
            Error::CasConflict(_) => 409,
            Error::WorkerLost(_) => 502,
            Error::DispatchRejected(_) => 503,
            Error::Timeout(_) => 504,
            Error::Cancelled(_) => 409,
            Error::DeadlockDetected(_) => 409,
            Error::Serialization(_) => 500,
            Error::Io(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Get error kind for the wire shape and monitoring
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "Config",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::UnknownNamespace(_) => "UnknownNamespace",
            Error::UnknownTag(_) => "UnknownTag",
            Error::StoreUnavailable(_) => "CoordinationStoreUnavailable",
            Error::CasConflict(_) => "CASConflict",
            Error::WorkerLost(_) => "WorkerLost",
            Error::DispatchRejected(_) => "DispatchRejected",
            Error::Timeout(_) => "Timeout",
            Error::Cancelled(_) => "Cancelled",
            Error::DeadlockDetected(_) => "DeadlockDetected",
            Error::Serialization(_) => "Internal",
            Error::Io(_) => "Internal",
            Error::Internal(_) => "Internal",
        }
    }
}
