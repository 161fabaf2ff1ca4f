use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Table,
    User,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Table => write!(f, "table"),
            ResourceType::User => write!(f, "user"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    NotConnected,
    ConnectionError,
    AuthorizationError,
    TableExists,
    UserExists,
    TableNotFound,
    UserNotFound,
    InvalidVisibilityLabel,
    MutationRejected,
    ScannerClosed,
    BackendUnavailable,
    WritersPending,
    InvalidConfig,
}

impl StoreErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreErrorCode::NotConnected => "not_connected",
            StoreErrorCode::ConnectionError => "connection_error",
            StoreErrorCode::AuthorizationError => "authorization_error",
            StoreErrorCode::TableExists => "table_exists",
            StoreErrorCode::UserExists => "user_exists",
            StoreErrorCode::TableNotFound => "table_not_found",
            StoreErrorCode::UserNotFound => "user_not_found",
            StoreErrorCode::InvalidVisibilityLabel => "invalid_visibility_label",
            StoreErrorCode::MutationRejected => "mutation_rejected",
            StoreErrorCode::ScannerClosed => "scanner_closed",
            StoreErrorCode::BackendUnavailable => "backend_unavailable",
            StoreErrorCode::WritersPending => "writers_pending",
            StoreErrorCode::InvalidConfig => "invalid_config",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("session is not connected")]
    NotConnected,
    #[error("connection error: {message}")]
    Connection { message: String },
    #[error("authorization error: {message}")]
    Authorization { message: String },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("invalid visibility label '{expression}' at byte {position}: {reason}")]
    InvalidVisibility {
        expression: String,
        position: usize,
        reason: String,
    },
    #[error("mutations rejected for table '{table}': {message}")]
    MutationRejected { table: String, message: String },
    #[error("scanner closed")]
    ScannerClosed,
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },
    #[error("{tables} batch writer(s) still open; close them before reconnecting")]
    WritersPending { tables: usize },
    #[error("invalid config value for '{key}': {message}")]
    InvalidConfig { key: String, message: String },
}

impl StoreError {
    pub fn code(&self) -> StoreErrorCode {
        match self {
            StoreError::NotConnected => StoreErrorCode::NotConnected,
            StoreError::Connection { .. } => StoreErrorCode::ConnectionError,
            StoreError::Authorization { .. } => StoreErrorCode::AuthorizationError,
            StoreError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Table => StoreErrorCode::TableExists,
                ResourceType::User => StoreErrorCode::UserExists,
            },
            StoreError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Table => StoreErrorCode::TableNotFound,
                ResourceType::User => StoreErrorCode::UserNotFound,
            },
            StoreError::InvalidVisibility { .. } => StoreErrorCode::InvalidVisibilityLabel,
            StoreError::MutationRejected { .. } => StoreErrorCode::MutationRejected,
            StoreError::ScannerClosed => StoreErrorCode::ScannerClosed,
            StoreError::Unavailable { .. } => StoreErrorCode::BackendUnavailable,
            StoreError::WritersPending { .. } => StoreErrorCode::WritersPending,
            StoreError::InvalidConfig { .. } => StoreErrorCode::InvalidConfig,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub(crate) fn table_exists(table: &str) -> Self {
        StoreError::AlreadyExists {
            resource_type: ResourceType::Table,
            resource_id: table.to_string(),
        }
    }

    pub(crate) fn table_not_found(table: &str) -> Self {
        StoreError::NotFound {
            resource_type: ResourceType::Table,
            resource_id: table.to_string(),
        }
    }

    /// Rewraps a backend failure raised while shipping mutations so callers of
    /// the write path see one variant regardless of the underlying cause.
    /// Unavailability passes through untouched; the caller decides on retry.
    pub(crate) fn into_rejection(self, table: &str) -> Self {
        match self {
            err @ (StoreError::MutationRejected { .. } | StoreError::Unavailable { .. }) => err,
            other => StoreError::MutationRejected {
                table: table.to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::{ResourceType, StoreError, StoreErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(StoreErrorCode::TableNotFound.as_str(), "table_not_found");
        assert_eq!(StoreErrorCode::TableExists.as_str(), "table_exists");
        assert_eq!(StoreErrorCode::NotConnected.as_str(), "not_connected");
        assert_eq!(
            StoreErrorCode::InvalidVisibilityLabel.as_str(),
            "invalid_visibility_label"
        );
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = StoreError::NotFound {
            resource_type: ResourceType::Table,
            resource_id: "meter_readings".into(),
        };
        assert_eq!(err.code(), StoreErrorCode::TableNotFound);
        assert_eq!(err.code_str(), "table_not_found");
        assert_eq!(
            StoreError::table_exists("meter_readings").code(),
            StoreErrorCode::TableExists
        );
    }

    #[test]
    fn rejection_wrapping_keeps_unavailable() {
        let wrapped = StoreError::table_not_found("t").into_rejection("t");
        assert_eq!(wrapped.code(), StoreErrorCode::MutationRejected);

        let unavailable = StoreError::Unavailable {
            message: "offline".into(),
        }
        .into_rejection("t");
        assert_eq!(unavailable.code(), StoreErrorCode::BackendUnavailable);
    }
}
