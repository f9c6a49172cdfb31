//! sqlmux Error Types

use thiserror::Error;

/// Result type alias for sqlmux operations
pub type Result<T> = std::result::Result<T, Error>;

/// MySQL error code: access denied
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
/// MySQL error code: unknown database
pub const ER_BAD_DB_ERROR: u16 = 1049;
/// MySQL error code: too many connections
pub const ER_CON_COUNT_ERROR: u16 = 1040;
/// MySQL error code: unknown command
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
/// MySQL error code: no database selected
pub const ER_NO_DB_ERROR: u16 = 1046;
/// MySQL error code: generic server error
pub const ER_UNKNOWN_ERROR: u16 = 1105;

/// sqlmux error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Authentication errors
    #[error("Access denied for user '{user}'@'{host}' (using password: {})", yes_no(.using_password))]
    AccessDenied {
        user: String,
        host: String,
        using_password: bool,
    },

    #[error("Unknown database '{0}'")]
    BadDatabase(String),

    #[error("No database selected")]
    NoDatabase,

    // Routing errors
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("No master configured for cluster {0}")]
    NoMaster(String),

    // Backend errors
    #[error("Backend error {code} ({state}): {message}")]
    Backend {
        code: u16,
        state: String,
        message: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Too many connections")]
    TooManyConnections,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

fn yes_no(flag: &bool) -> &'static str {
    if *flag { "YES" } else { "NO" }
}

impl Error {
    /// Check if this error is a connection-level fault that a fresh dial may cure
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Protocol(_)
                | Error::Io(_)
        )
    }

    /// MySQL error code reported to clients for this error
    pub fn mysql_code(&self) -> u16 {
        match self {
            Error::AccessDenied { .. } => ER_ACCESS_DENIED_ERROR,
            Error::BadDatabase(_) => ER_BAD_DB_ERROR,
            Error::NoDatabase => ER_NO_DB_ERROR,
            Error::TooManyConnections => ER_CON_COUNT_ERROR,
            Error::Backend { code, .. } => *code,
            _ => ER_UNKNOWN_ERROR,
        }
    }

    /// SQLSTATE reported to clients for this error
    pub fn sql_state(&self) -> &str {
        match self {
            Error::AccessDenied { .. } => "28000",
            Error::BadDatabase(_) | Error::NoDatabase => "42000",
            Error::TooManyConnections => "08004",
            Error::Backend { state, .. } => state,
            _ => "HY000",
        }
    }
}
