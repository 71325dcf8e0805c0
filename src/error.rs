//! Error types for the optimization engine.

use thiserror::Error;

/// Main error type for the optimization engine.
#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Invalid search space: {0}")]
    InvalidSearchSpace(String),

    #[error("Simulation error: {0}")]
    SimulationError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Trial journal error: {0}")]
    JournalError(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl OptimizeError {
    /// Whether this error came from a simulator or metrics collaborator.
    ///
    /// Such errors are confined to a single trial and never abort a run.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            OptimizeError::SimulationError(_) | OptimizeError::MetricsError(_)
        )
    }
}

/// Result type alias for optimization operations.
pub type Result<T> = std::result::Result<T, OptimizeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collaborator_failure_classification() {
        assert!(OptimizeError::SimulationError("boom".into()).is_collaborator_failure());
        assert!(OptimizeError::MetricsError("nan".into()).is_collaborator_failure());
        assert!(!OptimizeError::ConfigError("bad".into()).is_collaborator_failure());
        assert!(!OptimizeError::Cancelled.is_collaborator_failure());
    }

    #[test]
    fn test_error_display() {
        let err = OptimizeError::InvalidSearchSpace("no objectives".into());
        assert_eq!(err.to_string(), "Invalid search space: no objectives");
    }
}
