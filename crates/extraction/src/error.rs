/// Errors surfaced from the database collaborator (connection, cursor,
/// parser/schema failures). Consumed by the core, never constructed by it.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database connection failed: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("failed to parse a row: {0}")]
    Parse(String),
}

/// A handler raised an exception while processing a dispatched message. What
/// happens next is governed by the dispatcher's `fatal_exceptions` policy.
#[derive(Debug, thiserror::Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

/// Top-level error type for fallible operations on `ExtractorQueue` and
/// `Extractor`. Recoverable, expected conditions (out-of-order push, ack of
/// an unknown message, missed saved acks) are logged as warnings rather than
/// modeled here; see DESIGN.md.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("failed to read queue state file {path}: {source}")]
    StateRead {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write queue state file {path}: {source}")]
    StateWrite {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode queue state: {0}")]
    StateDecode(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("message kind did not match the queue it was pushed to: {0}")]
    MismatchedMessageKind(&'static str),
}
