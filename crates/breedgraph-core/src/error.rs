/// Domain failures shared by every BreedGraph layer.
///
/// Store and API crates carry these inside `anyhow::Error`; callers recover the
/// kind with `downcast_ref::<DomainError>()`.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("no result found: {0}")]
    NoResultFound(String),
    #[error("identity exists: {0}")]
    IdentityExists(String),
    #[error("protected node: {0}")]
    ProtectedNode(String),
    #[error("protected relationship: {0}")]
    ProtectedRelationship(String),
    #[error("illegal operation: {0}")]
    IllegalOperation(String),
    #[error("unauthorised operation: {0}")]
    UnauthorisedOperation(String),
    #[error("relationship exists: {0}")]
    RelationshipExists(String),
    #[error("too many retries: {0}")]
    TooManyRetries(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl DomainError {
    /// Stable snake_case name of the error kind, used in CLI and bus output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoResultFound(_) => "no_result_found",
            Self::IdentityExists(_) => "identity_exists",
            Self::ProtectedNode(_) => "protected_node",
            Self::ProtectedRelationship(_) => "protected_relationship",
            Self::IllegalOperation(_) => "illegal_operation",
            Self::UnauthorisedOperation(_) => "unauthorised_operation",
            Self::RelationshipExists(_) => "relationship_exists",
            Self::TooManyRetries(_) => "too_many_retries",
            Self::Validation(_) => "validation",
        }
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
