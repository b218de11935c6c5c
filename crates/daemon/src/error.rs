use crate::SourceKind;

/// Failures that are visible to the caller of a fusion cycle.
///
/// Per-source and per-file problems are logged and skipped; only the
/// "nothing left to work with" conditions surface here.
#[derive(thiserror::Error, Debug)]
pub enum FusionError {
    #[error("{kind} source unavailable: {reason}")]
    SourceUnavailable { kind: SourceKind, reason: String },
    #[error("all {attempted} sources failed, no data for this cycle")]
    AllSourcesFailed { attempted: usize },
    #[error("all {attempted} sub-queries failed")]
    AllSubQueriesFailed { attempted: usize },
    #[error("no atmospheric parameters available for prediction")]
    AllParametersUnavailable,
    #[error("parameter {0} unavailable and no historical fallback loaded")]
    MissingFallback(String),
    #[error("prediction model failed: {0}")]
    Model(String),
    #[error(transparent)]
    Store(#[from] crate::StoreError),
}
