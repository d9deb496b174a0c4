use std::time::Duration;

use polars_error::PolarsError;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum ExchangeError {
    /// Failure raised inside the external engine while it served a batch
    /// request. The engine boundary serializes errors to strings before
    /// handing them over, so only the message survives the crossing.
    #[error("external engine error: {0}")]
    Engine(String),
    #[error("shuffle read with an aggregator is not supported; aggregate downstream instead")]
    UnsupportedAggregation,
    #[error("shuffle read with a key ordering is not supported; sort downstream instead")]
    UnsupportedOrdering,
    /// Signaled by the fetch collaborator; never retried here.
    #[error("corrupt shuffle block: {0}")]
    CorruptBlock(String),
    #[error("task cancelled")]
    Cancelled,
    #[error("no engine response within {0:?}")]
    EngineTimeout(Duration),
    #[error(transparent)]
    Arrow(#[from] PolarsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
