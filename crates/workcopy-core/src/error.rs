use thiserror::Error;
use url::Url;

/// Errors reported by the capability layer (`Storage`, `BackupStore`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient failure: the backend could not be reached. Callers may retry.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Errors surfaced by working copy operations.
///
/// Every variant that concerns a single document carries its resource so the
/// caller can name it to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkingCopyError {
    #[error("Storage unavailable for {resource}: {message}")]
    StorageUnavailable { resource: Url, message: String },

    #[error("Failed to back up {resource}: {message}")]
    BackupWriteFailed { resource: Url, message: String },

    #[error("Confirmation cancelled")]
    ConfirmationCancelled,

    #[error("Overwriting {resource} was denied")]
    OverwriteDenied { resource: Url },

    #[error("Failed to resolve {resource}: {message}")]
    ResolutionFailed { resource: Url, message: String },

    #[error("Failed to save {resource}: {message}")]
    SaveFailed { resource: Url, message: String },

    #[error("Working copy {resource} is disposed")]
    Disposed { resource: Url },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl WorkingCopyError {
    /// Map a storage failure while reading `resource`.
    pub fn resolution(resource: &Url, err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(message) => WorkingCopyError::StorageUnavailable {
                resource: resource.clone(),
                message,
            },
            other => WorkingCopyError::ResolutionFailed {
                resource: resource.clone(),
                message: other.to_string(),
            },
        }
    }

    /// Map a storage failure while writing `resource`.
    pub fn save(resource: &Url, err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(message) => WorkingCopyError::StorageUnavailable {
                resource: resource.clone(),
                message,
            },
            other => WorkingCopyError::SaveFailed {
                resource: resource.clone(),
                message: other.to_string(),
            },
        }
    }

    /// Map a failure while writing a backup of `resource`.
    pub fn backup(resource: &Url, err: StorageError) -> Self {
        WorkingCopyError::BackupWriteFailed {
            resource: resource.clone(),
            message: err.to_string(),
        }
    }

    /// The resource this error is about, if any.
    pub fn resource(&self) -> Option<&Url> {
        match self {
            WorkingCopyError::StorageUnavailable { resource, .. }
            | WorkingCopyError::BackupWriteFailed { resource, .. }
            | WorkingCopyError::OverwriteDenied { resource }
            | WorkingCopyError::ResolutionFailed { resource, .. }
            | WorkingCopyError::SaveFailed { resource, .. }
            | WorkingCopyError::Disposed { resource } => Some(resource),
            WorkingCopyError::ConfirmationCancelled | WorkingCopyError::InvalidArgument(_) => {
                None
            }
        }
    }

    /// Transient errors a caller may choose to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkingCopyError::StorageUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_unavailable_maps_to_distinct_kind() {
        let resource = url("file:///tmp/a.txt");

        let err = WorkingCopyError::resolution(
            &resource,
            StorageError::Unavailable("share offline".into()),
        );
        assert!(err.is_retryable());
        assert_eq!(err.resource(), Some(&resource));

        let err = WorkingCopyError::resolution(&resource, StorageError::NotFound("gone".into()));
        assert!(!err.is_retryable());
        assert!(matches!(err, WorkingCopyError::ResolutionFailed { .. }));
    }

    #[test]
    fn test_save_error_names_resource() {
        let resource = url("file:///tmp/report.txt");
        let err = WorkingCopyError::save(&resource, StorageError::Io("disk full".into()));

        let message = err.to_string();
        assert!(message.contains("/tmp/report.txt"));
        assert!(message.contains("disk full"));
    }
}
