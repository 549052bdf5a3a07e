use thiserror::Error;

/// Why a single fetch produced no document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("connection failed for {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("could not decode body of {url}: {reason}")]
    BodyDecodeFailed { url: String, reason: String },
}

impl FetchError {
    /// Failures worth another attempt: timeouts, dropped connections, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::ConnectionFailed { .. } => true,
            FetchError::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            FetchError::BodyDecodeFailed { .. } => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "timeout",
            FetchError::ConnectionFailed { .. } => "connection",
            FetchError::HttpStatus { .. } => "http-status",
            FetchError::BodyDecodeFailed { .. } => "body-decode",
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("could not encode column {column}: {source}")]
    Encode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Problems with the run configuration. These are the only fatal errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid page range {input:?}: {reason}")]
    PageRange { input: String, reason: String },

    #[error("invalid selector {selector:?} for field {field}: {reason}")]
    Selector {
        field: String,
        selector: String,
        reason: String,
    },

    #[error("invalid rating pattern: {0}")]
    RatingPattern(String),

    #[error("unknown gate check {0:?}")]
    GateCheck(String),

    #[error("could not read rules file {path}: {reason}")]
    RulesFile { path: String, reason: String },

    #[error("invalid HTTP setting: {0}")]
    Http(String),

    #[error("{0}")]
    Invalid(String),
}
