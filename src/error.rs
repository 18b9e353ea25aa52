use std::fmt;

#[derive(Debug)]
pub enum ElogError {
    Database(String),
    Api { status: Option<u16>, message: String },
    Authentication(String),
    Lock(String),
    /// SQLite rolled back the open transaction on its own.
    TransactionLost(String),
    Config(String),
    Io(std::io::Error),
    Json(serde_json::Error),
    Yaml(serde_yaml::Error),
    Other(String),
}

impl ElogError {
    pub fn api(message: impl Into<String>) -> Self {
        ElogError::Api { status: None, message: message.into() }
    }

    /// Errors that abort a whole run instead of a single experiment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ElogError::Authentication(_) | ElogError::Lock(_) | ElogError::TransactionLost(_))
    }
}

impl fmt::Display for ElogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElogError::Database(e) => write!(f, "Database error: {}", e),
            ElogError::Api { status: Some(code), message } => write!(f, "API error ({}): {}", code, message),
            ElogError::Api { status: None, message } => write!(f, "API error: {}", message),
            ElogError::Authentication(e) => write!(f, "Authentication error: {}", e),
            ElogError::Lock(e) => write!(f, "{}", e),
            ElogError::TransactionLost(e) => write!(f, "Transaction lost: {}", e),
            ElogError::Config(e) => write!(f, "Configuration error: {}", e),
            ElogError::Io(e) => write!(f, "IO error: {}", e),
            ElogError::Json(e) => write!(f, "JSON error: {}", e),
            ElogError::Yaml(e) => write!(f, "YAML error: {}", e),
            ElogError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for ElogError {}

impl From<rusqlite::Error> for ElogError {
    fn from(err: rusqlite::Error) -> Self {
        ElogError::Database(err.to_string())
    }
}

impl From<std::io::Error> for ElogError {
    fn from(err: std::io::Error) -> Self {
        ElogError::Io(err)
    }
}

impl From<serde_json::Error> for ElogError {
    fn from(err: serde_json::Error) -> Self {
        ElogError::Json(err)
    }
}

impl From<serde_yaml::Error> for ElogError {
    fn from(err: serde_yaml::Error) -> Self {
        ElogError::Yaml(err)
    }
}

impl From<reqwest::Error> for ElogError {
    fn from(err: reqwest::Error) -> Self {
        ElogError::Api {
            status: err.status().map(|s| s.as_u16()),
            message: format!("Network error: {}", err),
        }
    }
}

impl From<String> for ElogError {
    fn from(err: String) -> Self {
        ElogError::Other(err)
    }
}

impl From<&str> for ElogError {
    fn from(err: &str) -> Self {
        ElogError::Other(err.to_string())
    }
}
