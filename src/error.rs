//! Typed service-level errors

use crate::records::Stage;
use thiserror::Error;

/// Failures the orchestrating service distinguishes for callers
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unknown source record: {0}")]
    UnknownSource(String),

    #[error("Stage {stage:?} failed for source {source_id}: {message}")]
    StageFailed {
        stage: Stage,
        source_id: String,
        message: String,
    },
}
