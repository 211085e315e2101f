use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/**
 * Crate error type - miette diagnostics on top of thiserror
 *
 * Infrastructure failures travel as `AppError` until an orchestrator turns
 * them into persisted domain error records.
 */
#[derive(Error, Debug, Diagnostic)]
pub enum AppError {
    #[error("IO error: {0}")]
    #[diagnostic(code(isocalc::io_error))]
    Io(#[from] std::io::Error),

    #[error("IO error: {message}")]
    #[diagnostic(code(isocalc::io_error_detailed))]
    IoDetailed {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Database error: {0}")]
    #[diagnostic(
        code(isocalc::database_error),
        help("Check database connection and schema integrity")
    )]
    DatabaseError(String),

    #[error("Scratch pad codec error: {0}")]
    #[diagnostic(
        code(isocalc::codec_error),
        help("The stored scratch pad is truncated or was written by an unknown format version")
    )]
    Codec(String),

    #[error("Blob encoding error: {0}")]
    #[diagnostic(code(isocalc::blob_error))]
    Blob(String),

    #[error("Column '{column}' is already set on {node}")]
    #[diagnostic(
        code(isocalc::column_already_set),
        help("Each column may be set at most once per pad")
    )]
    ColumnAlreadySet { column: String, node: String },

    #[error("Cannot attach a {child} pad beside {existing} children")]
    #[diagnostic(
        code(isocalc::mixed_child_level),
        help("All children of one pad must be of the same kind")
    )]
    MixedChildLevel { child: String, existing: String },

    #[error("Cache invariant violated: {0}")]
    #[diagnostic(
        code(isocalc::cache_invariant),
        help("A cache row holds either a scratch pad or an error message, never both or neither")
    )]
    CacheInvariant(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(isocalc::config_error))]
    Config(String),
}

impl AppError {
    pub fn database_error(message: impl Into<String>) -> Self {
        AppError::DatabaseError(message.into())
    }

    pub fn codec_error(message: impl Into<String>) -> Self {
        AppError::Codec(message.into())
    }

    pub fn io_error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        AppError::IoDetailed {
            message: message.into(),
            path,
        }
    }
}

impl From<bincode::Error> for AppError {
    fn from(error: bincode::Error) -> Self {
        AppError::Blob(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_and_codec_errors() {
        let bincode_error = bincode::deserialize::<Vec<i64>>(&[0xff]).unwrap_err();
        let app_error: AppError = bincode_error.into();
        assert!(matches!(app_error, AppError::Blob(_)));

        let error = AppError::codec_error("unknown node type 9");
        assert_eq!(
            error.to_string(),
            "Scratch pad codec error: unknown node type 9"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let app_error: AppError = io_error.into();

        assert!(matches!(app_error, AppError::Io(_)));
    }

    #[test]
    fn test_error_display() {
        let error = AppError::ColumnAlreadySet {
            column: "Mean".to_string(),
            node: "Cycle 3".to_string(),
        };
        let display = format!("{}", error);
        assert!(display.contains("Mean"));
        assert!(display.contains("Cycle 3"));
    }
}
