use tonic::Status;

/// Error taxonomy for the driver (§7). Variants are kinds, not wire types: every RPC surface
/// converts them into the matching `tonic::Status` code via `From`.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    /// Malformed input, a bucket-name policy violation, or a disallowed mount arg.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A dependency is not ready yet (Attachment Record not written, mounter pod not Running,
    /// orchestrator API transient failure). The caller should retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The CSI node daemon is not registered on the target node, the access mode is
    /// unsupported, or credentials could not be resolved.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Optimistic-concurrency failure on the Attachment Record. Handled internally with
    /// bounded retry; only escalates to `Unavailable` after retries are exhausted.
    #[error("conflict: {0}")]
    Conflict(String),

    /// `volumeID` unknown to the controller. Translated to success on delete per the CSI spec.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unexpected filesystem/mount failure or other bug-shaped condition. Not retried.
    #[error("internal error: {0}")]
    Internal(String),

    /// `CreateVolume` idempotency violation: same name, different capacity/parameters.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Wraps an underlying `kube` API error, classified as best as possible.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),
}

impl DriverError {
    /// Wrap an error with the operation name and identifying context, per §7's propagation
    /// policy ("wrap failures with the operation name, volumeID, and workload UID"). Never pass
    /// credential material here.
    pub fn context(self, operation: &str, context: impl std::fmt::Display) -> Self {
        let wrap = |msg: String| format!("{operation} [{context}]: {msg}");
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(wrap(m)),
            Self::Unavailable(m) => Self::Unavailable(wrap(m)),
            Self::FailedPrecondition(m) => Self::FailedPrecondition(wrap(m)),
            Self::Conflict(m) => Self::Conflict(wrap(m)),
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::Internal(m) => Self::Internal(wrap(m)),
            Self::AlreadyExists(m) => Self::AlreadyExists(wrap(m)),
            other @ Self::Kube(_) => other,
        }
    }
}

impl From<DriverError> for Status {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::InvalidArgument(m) => Status::invalid_argument(m),
            DriverError::Unavailable(m) => Status::unavailable(m),
            DriverError::FailedPrecondition(m) => Status::failed_precondition(m),
            DriverError::Conflict(m) => Status::unavailable(format!("conflict: {m}")),
            DriverError::NotFound(m) => Status::not_found(m),
            DriverError::Internal(m) => Status::internal(m),
            DriverError::AlreadyExists(m) => Status::already_exists(m),
            DriverError::Kube(e) => Status::internal(format!("kubernetes api error: {e}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
