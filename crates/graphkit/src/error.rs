//! Error taxonomy shared by every component.
//!
//! Mirrors the error-bridging pattern used throughout the teacher's
//! checkpointer crates: a flat, `#[non_exhaustive]` `thiserror` enum with a
//! stable `code()` for cross-process reporting, plus a wrapping type for
//! orchestration (`MaintenanceOperationError`, spec §7).

use thiserror::Error;

/// Top-level error type returned by every public `graphkit` operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Caller-provided data violates a stated constraint.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced id is not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// A relationship endpoint does not resolve to an extant entity.
    #[error("foreign key missing: {0}")]
    ForeignKeyMissing(String),

    /// Canonical-id collision between incompatible relationship types.
    #[error("type conflict for canonical id {canonical_id}: existing {existing}, incoming {incoming}")]
    TypeConflict {
        /// The canonical relationship id that collided.
        canonical_id: String,
        /// The relationship type already stored under this id.
        existing: String,
        /// The relationship type the caller attempted to write.
        incoming: String,
    },

    /// A downstream store failed its readiness check.
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// A partitioned queue is at capacity.
    #[error("queue overflow: partition {partition} at depth {depth}")]
    QueueOverflow {
        /// Partition index that is full.
        partition: usize,
        /// Observed depth at rejection time.
        depth: usize,
    },

    /// A per-store circuit breaker is open.
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// An operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Checksum mismatch or missing artifacts during restore verification.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Restore token does not exist or was never issued.
    #[error("restore token invalid: {0}")]
    RestoreTokenInvalid(String),

    /// Restore token's TTL has elapsed.
    #[error("restore token expired at {0}")]
    RestoreTokenExpired(chrono::DateTime<chrono::Utc>),

    /// Phase 2 restore was invoked without a token.
    #[error("a restore token is required before apply")]
    RestoreTokenRequired,

    /// `requireSecondApproval` is set but the token was never approved.
    #[error("restore requires approval before apply")]
    RestoreApprovalRequired,

    /// Preview validation flagged blocking issues and the token is unapproved.
    #[error("restore validation failed: {0}")]
    RestoreValidationFailed(String),

    /// Embedding dimension mismatch, or the vector index is missing.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Low-level query execution failure.
    #[error("query error [{code}]: {cause}")]
    Query {
        /// Stable error code for the failing query class.
        code: String,
        /// Human-readable cause.
        cause: String,
    },

    /// Malformed property payload; no partial writes were performed.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Wraps any of the above with orchestration context (spec §7).
    #[error("{stage} failed in {component} ({code}): {cause}")]
    Maintenance {
        /// Stable machine-readable error code.
        code: String,
        /// HTTP-style status code for API surfaces.
        status_code: u16,
        /// Component that raised the error (e.g. "backup", "history").
        component: String,
        /// Stage within that component's operation.
        stage: String,
        /// Underlying cause, flattened to a string for portability.
        cause: String,
    },
}

impl Error {
    /// Stable machine-readable code for this error, used in API responses
    /// and in the `pipeline:error` / terminal events (spec §7).
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::ForeignKeyMissing(_) => "FOREIGN_KEY_MISSING",
            Error::TypeConflict { .. } => "TYPE_CONFLICT",
            Error::DependencyUnavailable(_) => "DEPENDENCY_UNAVAILABLE",
            Error::QueueOverflow { .. } => "QUEUE_OVERFLOW",
            Error::CircuitOpen(_) => "CIRCUIT_OPEN",
            Error::Timeout(_) => "TIMEOUT_ERROR",
            Error::Integrity(_) => "INTEGRITY_ERROR",
            Error::RestoreTokenInvalid(_) => "RESTORE_TOKEN_INVALID",
            Error::RestoreTokenExpired(_) => "RESTORE_TOKEN_EXPIRED",
            Error::RestoreTokenRequired => "RESTORE_TOKEN_REQUIRED",
            Error::RestoreApprovalRequired => "RESTORE_APPROVAL_REQUIRED",
            Error::RestoreValidationFailed(_) => "RESTORE_VALIDATION_FAILED",
            Error::EmbeddingUnavailable(_) => "EMBEDDING_UNAVAILABLE",
            Error::Query { .. } => "QUERY_ERROR",
            Error::Malformed(_) => "MALFORMED_PAYLOAD",
            Error::Maintenance { .. } => "MAINTENANCE_OPERATION_ERROR",
        }
    }

    /// Wrap `self` as a [`Error::Maintenance`] with orchestration context.
    #[must_use]
    pub fn into_maintenance(self, component: &str, stage: &str) -> Self {
        let code = self.code().to_string();
        Error::Maintenance {
            code,
            status_code: 500,
            component: component.to_string(),
            stage: stage.to_string(),
            cause: self.to_string(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
