use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("aggregator allocation failed")]
    AggregatorAlloc,
    #[error("aggregator window activation failed")]
    WindowActivation,
    #[error("failed to start flow-tag server: {0}")]
    Ipc(io::Error),
    #[error("conntrack error: {0}")]
    Conntrack(conntrack::error::Error),
}
