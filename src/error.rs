#[derive(Debug, thiserror::Error)]
pub enum BandmonError {
    #[error("must run as root")]
    NotRoot,
    /// A kprobe could not be installed. Fatal at startup: the tracker
    /// cannot run half-instrumented.
    #[error("probe attach failed: {0}")]
    Attach(String),
    /// Drain or lookup against the kernel counter table failed. The
    /// sampler logs this and skips the iteration.
    #[error("counter table error: {0}")]
    CounterTable(String),
    /// A record append failed. The sampler logs this, drops the record,
    /// and continues with the rest of the batch.
    #[error("persistence error: {0}")]
    Persistence(#[source] rusqlite::Error),
    /// Malformed window, limit, or bucket size.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The store failed while answering a query.
    #[error("query error: {0}")]
    Query(#[source] rusqlite::Error),
    /// The retention sweep failed. Retried on the next scheduled sweep
    /// only, never inside the call.
    #[error("retention sweep error: {0}")]
    Retention(#[source] rusqlite::Error),
    #[error("storage open error: {0}")]
    StorageOpen(#[source] rusqlite::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}
