//! The four §7 error kinds, grounded in `storage-operator/src/util/error.rs`'s
//! `thiserror`-derived enum shape.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// User-visible: surfaced as `Degraded` + failure comment.
    #[error("validation failed: {0}")]
    Validation(previewctl_types::ProjectValidationError),

    /// Cluster/db/network failure; current lifecycle step fails fast.
    #[error("transient infrastructure failure: {0}")]
    Transient(#[from] anyhow::Error),

    /// Quota rejection; not an error to the caller, but modeled here so
    /// call sites can match on it uniformly.
    #[error("rejected by policy: {0}")]
    Policy(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<previewctl_cluster::ClusterError> for Error {
    fn from(e: previewctl_cluster::ClusterError) -> Self {
        match e {
            previewctl_cluster::ClusterError::NotFound(m) => Error::NotFound(m),
            other => Error::Transient(other.into()),
        }
    }
}

impl From<previewctl_forge::ForgeError> for Error {
    fn from(e: previewctl_forge::ForgeError) -> Self {
        match e {
            previewctl_forge::ForgeError::NotFound { owner, repo } => {
                Error::NotFound(format!("{owner}/{repo}"))
            }
            other => Error::Transient(other.into()),
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        Error::Transient(e.into())
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Error::Transient(e.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
