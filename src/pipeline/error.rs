//! Error types for stores and merge cycles

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    /// A raw snapshot table has not been created yet (nothing polled)
    MissingTable(String),
    InvalidData(String),
    /// Connection mutex poisoned by a panicking holder
    LockPoisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::LockPoisoned
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::MissingTable(t) => write!(f, "Table missing: {}", t),
            StoreError::InvalidData(msg) => write!(f, "Invalid stored data: {}", msg),
            StoreError::LockPoisoned => write!(f, "Database connection lock poisoned"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Failure of a differencing/merge cycle for one system
#[derive(Debug)]
pub enum PipelineError {
    /// A derived row references a station the registry does not know yet.
    /// The whole cycle is aborted before any write.
    UnresolvedStation { system: String, station_id: String },
    /// Storage failure; the merge transaction was rolled back
    Store(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        PipelineError::Store(err)
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Store(StoreError::Database(err))
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::UnresolvedStation { system, station_id } => write!(
                f,
                "Station '{}' of system '{}' is not registered",
                station_id, system
            ),
            PipelineError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Store(e) => Some(e),
            _ => None,
        }
    }
}
