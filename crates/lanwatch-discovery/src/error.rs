//! Error types for the discovery engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to start discovery worker: {0}")]
    WorkerStart(#[source] std::io::Error),
    #[error("Discovery worker stopped before answering")]
    WorkerStopped,
    #[error("Discovery worker panicked")]
    WorkerPanicked,
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;
