use std::fmt::Display;

/// Extension methods for Kubernetes API errors.
pub trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_already_exists(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }

    fn is_already_exists(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => true,
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Rejected input. Returned to the caller, no state changed.
    #[error("{0}")]
    Validation(String),
    /// Missing row or remote object. Delete paths treat it as success.
    #[error("{0}")]
    NotFound(String),
    /// Concurrent modification or duplicate. The caller may retry.
    #[error("{0}")]
    Conflict(String),
    /// Provider, SSH, helm or kubectl failure. Recorded on the owner's status.
    #[error("{0}")]
    Driver(String),
    /// Aggregated failures of a reconciliation cycle.
    #[error("{0}")]
    Reconcile(String),
    /// Retried by the polling or kubectl loop.
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
    /// No driver registered for the requested key.
    #[error("{0}")]
    Unsupported(String),
    #[error("operation cancelled")]
    Cancelled,
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Conflict(_) | Error::Reconcile(_) | Error::Io(_) => true,
            Error::KubeApi(kube::Error::Api(e)) => e.code >= 500 || e.code == 409 || e.code == 429,
            Error::KubeApi(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }

    /// Wraps the error with `msg`, keeping its kind. Wrapped library errors
    /// are classified first.
    pub fn context(self, msg: impl Display) -> Self {
        match self.classify() {
            Error::Validation(e) => Error::Validation(format!("{}: {}", msg, e)),
            Error::NotFound(e) => Error::NotFound(format!("{}: {}", msg, e)),
            Error::Conflict(e) => Error::Conflict(format!("{}: {}", msg, e)),
            Error::Driver(e) => Error::Driver(format!("{}: {}", msg, e)),
            Error::Reconcile(e) => Error::Reconcile(format!("{}: {}", msg, e)),
            Error::Transient(e) => Error::Transient(format!("{}: {}", msg, e)),
            Error::Fatal(e) => Error::Fatal(format!("{}: {}", msg, e)),
            Error::Unsupported(e) => Error::Unsupported(format!("{}: {}", msg, e)),
            Error::Cancelled => Error::Cancelled,
            other => Error::Fatal(format!("{}: {}", msg, other)),
        }
    }

    /// Maps wrapped library errors onto the error taxonomy.
    fn classify(self) -> Self {
        match self {
            Error::KubeApi(e) => {
                if e.is_not_found() {
                    Error::NotFound(e.to_string())
                } else if e.is_conflict() {
                    Error::Conflict(e.to_string())
                } else {
                    match &e {
                        kube::Error::Api(a) if a.code == 400 || a.code == 422 => {
                            Error::Validation(e.to_string())
                        }
                        kube::Error::Api(a) if a.code < 500 && a.code != 429 => {
                            Error::Fatal(e.to_string())
                        }
                        _ => Error::Transient(e.to_string()),
                    }
                }
            }
            Error::Serde(e) => Error::Validation(e.to_string()),
            Error::Yaml(e) => Error::Validation(e.to_string()),
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Error::NotFound(e.to_string())
            }
            Error::Io(e) => Error::Transient(e.to_string()),
            Error::Any(e) => Error::Fatal(format!("{:#}", e)),
            other => other,
        }
    }
}

/// `context` for any result whose error converts into [`Error`].
pub trait Context<T> {
    fn context(self, msg: impl Display) -> Result<T>;

    fn with_context<D: Display, F: FnOnce() -> D>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> Context<T> for std::result::Result<T, E> {
    fn context(self, msg: impl Display) -> Result<T> {
        self.map_err(|e| e.into().context(msg))
    }

    fn with_context<D: Display, F: FnOnce() -> D>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().context(f()))
    }
}
