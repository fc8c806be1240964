use thiserror::Error;
use uuid::Uuid;

/// Crate-wide error type. One variant per wire-level error code exposed by
/// the node protocol, plus internal infrastructure failures.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("argument must not be empty: {0}")]
    NullArgument(String),

    #[error("argument out of range: {0}")]
    ArgumentOutOfRange(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("user '{0}' does not exist")]
    UserNotFound(String),

    #[error("group '{0}' does not exist")]
    GroupNotFound(String),

    #[error("entity type '{0}' does not exist")]
    EntityTypeNotFound(String),

    #[error("entity '{1}' does not exist within entity type '{0}'")]
    EntityNotFound(String, String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("the event cache is empty")]
    EventCacheEmpty,

    #[error("event '{0}' is no longer held in the event cache")]
    EventNotCached(Uuid),

    #[error("persistent storage contains no events")]
    PersistentStorageEmpty,

    #[error("buffer flush failed: {0}")]
    BufferFlushing(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AccessError {
    /// The wire-level error code for this error. Stable across releases;
    /// clients rebuild the matching variant from it.
    pub fn code(&self) -> &'static str {
        match self {
            AccessError::Io(_) => "IOException",
            AccessError::InvalidArgument(_) => "ArgumentException",
            AccessError::NullArgument(_) => "ArgumentNullException",
            AccessError::ArgumentOutOfRange(_) => "ArgumentOutOfRangeException",
            AccessError::NotFound(_) => "NotFoundException",
            AccessError::UserNotFound(_) => "UserNotFoundException",
            AccessError::GroupNotFound(_) => "GroupNotFoundException",
            AccessError::EntityTypeNotFound(_) => "EntityTypeNotFoundException",
            AccessError::EntityNotFound(_, _) => "EntityNotFoundException",
            AccessError::AlreadyExists(_) => "ArgumentException",
            AccessError::ServiceUnavailable(_) => "ServiceUnavailableException",
            AccessError::EventCacheEmpty => "EventCacheEmptyException",
            AccessError::EventNotCached(_) => "EventNotCachedException",
            AccessError::PersistentStorageEmpty => "PersistentStorageEmptyException",
            AccessError::BufferFlushing(_) => "BufferFlushingException",
            AccessError::Storage(_) => "StorageException",
            AccessError::Serialization(_) => "SerializationException",
            AccessError::Network(_) => "NetworkException",
            AccessError::Timeout(_) => "TimeoutException",
            AccessError::Cancelled => "OperationCanceledException",
            AccessError::Configuration(_) => "ConfigurationException",
            AccessError::Internal(_) => "InternalServerException",
        }
    }

    /// Whether the client retry layer may retry this error. Only transport
    /// failures qualify; application errors surface unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AccessError::Network(_) | AccessError::Timeout(_) | AccessError::Io(_)
        )
    }

    /// Whether this error should be collapsed to `ServiceUnavailable` at the
    /// server edge when `override_internal_server_errors` is set.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            AccessError::Internal(_) | AccessError::Storage(_) | AccessError::Io(_)
        )
    }

    /// Structured attributes carried alongside the code and message on the
    /// wire, keyed by parameter name.
    pub fn attributes(&self) -> Vec<(String, String)> {
        match self {
            AccessError::UserNotFound(user) => vec![("User".to_string(), user.clone())],
            AccessError::GroupNotFound(group) => vec![("Group".to_string(), group.clone())],
            AccessError::EntityTypeNotFound(entity_type) => {
                vec![("EntityType".to_string(), entity_type.clone())]
            }
            AccessError::EntityNotFound(entity_type, entity) => vec![
                ("EntityType".to_string(), entity_type.clone()),
                ("Entity".to_string(), entity.clone()),
            ],
            AccessError::EventNotCached(id) => {
                vec![("EventId".to_string(), id.to_string())]
            }
            _ => Vec::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AccessError>;

// Error conversions for common error types

impl From<serde_json::Error> for AccessError {
    fn from(e: serde_json::Error) -> Self {
        AccessError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for AccessError {
    fn from(e: bincode::error::EncodeError) -> Self {
        AccessError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for AccessError {
    fn from(e: bincode::error::DecodeError) -> Self {
        AccessError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(
            AccessError::UserNotFound("u1".to_string()).code(),
            "UserNotFoundException"
        );
        assert_eq!(AccessError::EventCacheEmpty.code(), "EventCacheEmptyException");
        assert_eq!(
            AccessError::BufferFlushing("x".to_string()).code(),
            "BufferFlushingException"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(AccessError::Network("refused".to_string()).is_transient());
        assert!(AccessError::Timeout("connect".to_string()).is_transient());
        assert!(!AccessError::UserNotFound("u1".to_string()).is_transient());
        assert!(!AccessError::InvalidArgument("bad".to_string()).is_transient());
    }

    #[test]
    fn test_not_found_attributes() {
        let err = AccessError::EntityNotFound("Clients".to_string(), "AcmeCorp".to_string());
        let attrs = err.attributes();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, "EntityType");
        assert_eq!(attrs[1].1, "AcmeCorp");
    }
}
