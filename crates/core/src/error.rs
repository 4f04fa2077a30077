// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when reading run log files or log directories.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Log file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Permission denied reading log: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Logs directory not found: {path}")]
    DirNotFound { path: PathBuf },

    #[error("Invalid log name: {name}")]
    InvalidName { name: String },
}

impl LogError {
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }

    /// Like [`LogError::io`], but a missing path is reported as a missing directory.
    pub fn dir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::DirNotFound { path },
            _ => Self::io(path, source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_classifies_not_found() {
        let err = LogError::io("/tmp/x.log", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, LogError::NotFound { .. }));
    }

    #[test]
    fn io_classifies_permission_denied() {
        let err = LogError::io("/tmp/x.log", io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(matches!(err, LogError::PermissionDenied { .. }));
    }

    #[test]
    fn io_keeps_other_errors() {
        let err = LogError::io("/tmp/x.log", io::Error::other("disk on fire"));
        assert!(matches!(err, LogError::Io { .. }));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn dir_maps_missing_to_dir_not_found() {
        let err = LogError::dir("/nope", io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, LogError::DirNotFound { .. }));
    }
}
