//! Error types for modtools

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModToolsError>;

#[derive(Error, Debug)]
pub enum ModToolsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ModToolsError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ModToolsError::InvalidInput(_) => 3,
            ModToolsError::Platform(PlatformError::Authentication(_)) => 2,
            ModToolsError::Credential(_) => 2,
            ModToolsError::Platform(_) => 1,
            ModToolsError::Config(_) => 1,
            ModToolsError::Database(_) => 1,
            ModToolsError::Action(_) => 1,
        }
    }

    /// Whether the error is a transient remote failure worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ModToolsError::Platform(PlatformError::Network(_))
                | ModToolsError::Platform(PlatformError::RateLimit(_))
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Local storage failures. Fatal to the current drain.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Unexpected response: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("OS keyring unavailable: {0}")]
    KeyringUnavailable(String),

    #[error("Keyring operation failed: {0}")]
    Keyring(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("{subject} is already queued for {list}")]
    Duplicate { subject: String, list: String },

    #[error("No action with id {0}")]
    NotFound(i64),

    #[error("Action {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: i64,
        expected: String,
        actual: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_invalid_input() {
        let error = ModToolsError::InvalidInput("not a post URL".to_string());
        assert_eq!(error.exit_code(), 3);
    }

    #[test]
    fn test_exit_code_authentication_error() {
        let error = ModToolsError::Platform(PlatformError::Authentication(
            "Invalid identifier or password".to_string(),
        ));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_missing_credentials() {
        let error = ModToolsError::Credential(CredentialError::NotFound(
            "modtools.bluesky/me.bsky.social".to_string(),
        ));
        assert_eq!(error.exit_code(), 2);
    }

    #[test]
    fn test_exit_code_other_errors() {
        let db = ModToolsError::Database(DbError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "File not found",
        )));
        assert_eq!(db.exit_code(), 1);

        let network = ModToolsError::Platform(PlatformError::Network("timeout".to_string()));
        assert_eq!(network.exit_code(), 1);

        let duplicate = ModToolsError::Action(ActionError::Duplicate {
            subject: "did:plc:a".to_string(),
            list: "at://did:plc:me/app.bsky.graph.list/1".to_string(),
        });
        assert_eq!(duplicate.exit_code(), 1);

        let config = ModToolsError::Config(ConfigError::MissingField("bluesky.handle".to_string()));
        assert_eq!(config.exit_code(), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ModToolsError::Platform(PlatformError::Network("reset".to_string())).is_transient());
        assert!(ModToolsError::Platform(PlatformError::RateLimit("429".to_string())).is_transient());
        assert!(!ModToolsError::Platform(PlatformError::Rejected("bad".to_string())).is_transient());
        assert!(
            !ModToolsError::Platform(PlatformError::Authentication("401".to_string()))
                .is_transient()
        );
        assert!(!ModToolsError::InvalidInput("x".to_string()).is_transient());
    }

    #[test]
    fn test_error_message_formatting() {
        let error = ModToolsError::Platform(PlatformError::Rejected(
            "InvalidRequest: subject must be a DID".to_string(),
        ));
        assert_eq!(
            error.to_string(),
            "Platform error: Request rejected: InvalidRequest: subject must be a DID"
        );

        let error = ModToolsError::Action(ActionError::InvalidTransition {
            id: 7,
            expected: "pending".to_string(),
            actual: "done".to_string(),
        });
        assert_eq!(error.to_string(), "Action error: Action 7 is done, expected pending");
    }

    #[test]
    fn test_error_conversion_from_db_error() {
        let db_error = DbError::Corrupt("unknown status 'queued'".to_string());
        let error: ModToolsError = db_error.into();
        match error {
            ModToolsError::Database(_) => {}
            _ => panic!("Expected ModToolsError::Database"),
        }
    }

    #[test]
    fn test_platform_error_clone() {
        let original = PlatformError::Network("Connection failed".to_string());
        let cloned = original.clone();
        assert_eq!(original.to_string(), cloned.to_string());
    }
}
