use std::io;
use std::time::Duration;

use thiserror::Error;

/// Ways a single command/response transaction with the board can fail.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The command could not be written within the write timeout. It may or
    /// may not have reached the board.
    #[error("serial write timed out after {0:?}")]
    WriteTimeout(Duration),
    /// No complete reply line arrived within the read timeout.
    #[error("no reply line within {0:?}")]
    ReadTimeout(Duration),
    /// The reply was not framed as `OK`, `ERROR` or `<value>` + `OK`.
    #[error("reply did not end with 'OK' (got {line:?})")]
    ProtocolViolation { line: String },
    /// The board explicitly answered `ERROR`.
    #[error("device replied 'ERROR'")]
    DeviceError,
    /// The value line could not be decoded as an integer.
    #[error("could not decode value {value:?}")]
    InvalidValue { value: String },
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransactionError {
    /// Errors after which the framing of the connection can no longer be
    /// trusted. Anything else can be retried by the operator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransactionError::WriteTimeout(_)
                | TransactionError::ProtocolViolation { .. }
                | TransactionError::Io(_)
        )
    }
}

/// Reasons the console loop stops.
#[derive(Debug, Error)]
pub enum ConsoleError {
    /// An operator command failed in a way that leaves the connection unusable.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    /// A sample could not be written to the CSV recording.
    #[error("CSV recording failed: {0}")]
    Record(#[source] io::Error),
}
