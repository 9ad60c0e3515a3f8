use grpcio::RpcStatusCode;
use thiserror::Error;

pub type BigtableResult<T> = Result<T, BigtableError>;

/// Every public failure is status-shaped: [`BigtableError::code`] yields a
/// gRPC status code regardless of where the error originated, so callers can
/// classify uniformly.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BigtableError {
    /// A protocol status returned by the server (or synthesized for a
    /// per-entry bulk failure).
    #[error("RPC failure: {code:?} {message}")]
    Rpc { code: RpcStatusCode, message: String },

    /// The transport failed before the server produced a status.
    #[error("gRPC transport error: {0}")]
    Transport(String),

    /// The read stream violated chunk framing. Fatal for that stream.
    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("Invalid row response: {0}")]
    InvalidRowResponse(String),

    /// Request rejected client-side before dispatch. Never retried.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Bigtable connection error: {0}")]
    Connection(String),

    /// Bigtable connection recycle request
    #[error("Bigtable recycle request")]
    Recycle,

    /// General pool errors.
    #[error("Pool error: {0}")]
    Pool(String),
}

impl BigtableError {
    /// The closest gRPC status code for this error.
    pub fn code(&self) -> RpcStatusCode {
        match self {
            BigtableError::Rpc { code, .. } => *code,
            BigtableError::Transport(_)
            | BigtableError::Connection(_)
            | BigtableError::Recycle
            | BigtableError::Pool(_) => RpcStatusCode::UNAVAILABLE,
            BigtableError::InvalidChunk(_) | BigtableError::InvalidRowResponse(_) => {
                RpcStatusCode::INTERNAL
            }
            BigtableError::Validation(_) => RpcStatusCode::INVALID_ARGUMENT,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            BigtableError::Rpc { .. } => "storage.bigtable.error.rpc",
            BigtableError::Transport(_) => "storage.bigtable.error.transport",
            BigtableError::InvalidChunk(_) => "storage.bigtable.error.invalid_chunk",
            BigtableError::InvalidRowResponse(_) => "storage.bigtable.error.invalid_row_response",
            BigtableError::Validation(_) => "storage.bigtable.error.validation",
            BigtableError::Connection(_) => "storage.bigtable.error.connection",
            BigtableError::Recycle => "storage.bigtable.error.recycle",
            BigtableError::Pool(_) => "storage.bigtable.error.pool",
        }
    }
}

impl From<grpcio::Error> for BigtableError {
    fn from(e: grpcio::Error) -> Self {
        match e {
            grpcio::Error::RpcFailure(status) => BigtableError::Rpc {
                code: status.code(),
                message: status.message().to_owned(),
            },
            e => BigtableError::Transport(e.to_string()),
        }
    }
}
