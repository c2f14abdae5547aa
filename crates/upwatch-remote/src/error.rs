//! ---
//! upw_section: "05-networking-external-interfaces"
//! upw_subsection: "module"
//! upw_type: "source"
//! upw_scope: "code"
//! upw_description: "Error taxonomy for remote device record access."
//! upw_version: "v0.0.0-prealpha"
//! upw_owner: "tbd"
//! ---

/// Result alias for remote store operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Failures reported by a [`crate::RemoteStateStore`]. None of them is fatal;
/// the next reconciliation pass retries with fresh state.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Transport failure, timeout, or a server-side error.
    #[error("remote store unreachable: {0}")]
    Unreachable(String),
    /// The device record does not exist.
    #[error("device record not found: {0}")]
    RecordNotFound(String),
    /// The store refused the write.
    #[error("remote store rejected write ({status}): {body}")]
    WriteRejected {
        /// HTTP status returned by the store.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// Credentials were refused or could not be refreshed.
    #[error("remote authentication failed: {0}")]
    Auth(String),
    /// The store answered with a payload that could not be understood.
    #[error("unexpected remote payload: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Short label used for log fields and metric outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteError::Unreachable(_) => "unreachable",
            RemoteError::RecordNotFound(_) => "record_not_found",
            RemoteError::WriteRejected { .. } => "write_rejected",
            RemoteError::Auth(_) => "auth",
            RemoteError::Decode(_) => "decode",
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Unreachable(err.to_string())
        }
    }
}

impl From<url::ParseError> for RemoteError {
    fn from(err: url::ParseError) -> Self {
        RemoteError::Unreachable(format!("invalid remote url: {err}"))
    }
}
