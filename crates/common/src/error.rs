use arrow_schema::ArrowError;
use thiserror::Error;

/// Canonical LFQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`LfqError::Schema`] / [`LfqError::BuilderArgument`] / [`LfqError::UnsupportedCast`]:
///   raised by the call that built the offending plan node
/// - [`LfqError::OptimizationInvariant`]: an optimizer rule produced an inconsistent plan
/// - [`LfqError::Execution`] / [`LfqError::OutOfMemory`] / [`LfqError::Cancelled`]:
///   runtime failures; they abort the whole query
/// - [`LfqError::InvalidConfig`]: config/environment/path contract violations
/// - [`LfqError::Unsupported`]: valid request for a shape not implemented
#[derive(Debug, Error)]
pub enum LfqError {
    /// Unknown column, type mismatch, or incompatible set-operation inputs.
    #[error("schema error: {0}")]
    Schema(String),

    /// Conflicting or missing builder arguments.
    ///
    /// Examples:
    /// - both `on` and `left_on`/`right_on` given to a join
    /// - compression level passed for a codec without levels
    #[error("invalid argument: {0}")]
    BuilderArgument(String),

    /// No cast exists between the two data types.
    #[error("unsupported cast from {from} to {to}")]
    UnsupportedCast {
        /// Source type rendered with its `Display` form.
        from: String,
        /// Target type rendered with its `Display` form.
        to: String,
    },

    /// An optimizer rule broke a plan invariant. Internal bug, never user input.
    #[error("optimizer invariant violated: {0}")]
    OptimizationInvariant(String),

    /// Runtime execution failures after planning succeeded.
    ///
    /// Examples:
    /// - arithmetic overflow in `sum`
    /// - spill file decode failures
    #[error("execution error: {0}")]
    Execution(String),

    /// Execution error annotated with the operator and partition that raised it.
    #[error("{operator}[partition {partition}]: {source}")]
    Operator {
        /// Physical operator name.
        operator: String,
        /// Output partition being computed.
        partition: usize,
        /// Underlying error.
        #[source]
        source: Box<LfqError>,
    },

    /// A blocking operator exceeded the memory budget.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The query was cancelled by its caller.
    #[error("query cancelled")]
    Cancelled,

    /// Invalid or inconsistent configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Valid request for a feature/shape not implemented in current version.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow kernel failures.
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
}

impl LfqError {
    /// Wrap `self` with operator context unless it already carries some.
    ///
    /// `Cancelled` stays unwrapped so callers can match on it directly.
    #[must_use]
    pub fn with_operator(self, operator: &str, partition: usize) -> Self {
        match self {
            e @ (LfqError::Operator { .. } | LfqError::Cancelled) => e,
            other => LfqError::Operator {
                operator: operator.to_string(),
                partition,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error with operator context removed.
    #[must_use]
    pub fn root(&self) -> &LfqError {
        match self {
            LfqError::Operator { source, .. } => source.root(),
            other => other,
        }
    }

    /// Rebuild an owned copy for fan-out to several consumers.
    ///
    /// Non-cloneable payloads (`Io`, `Arrow`) are flattened to `Execution`.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            LfqError::Schema(s) => LfqError::Schema(s.clone()),
            LfqError::BuilderArgument(s) => LfqError::BuilderArgument(s.clone()),
            LfqError::UnsupportedCast { from, to } => LfqError::UnsupportedCast {
                from: from.clone(),
                to: to.clone(),
            },
            LfqError::OptimizationInvariant(s) => LfqError::OptimizationInvariant(s.clone()),
            LfqError::Execution(s) => LfqError::Execution(s.clone()),
            LfqError::Operator {
                operator,
                partition,
                source,
            } => LfqError::Operator {
                operator: operator.clone(),
                partition: *partition,
                source: Box::new(source.duplicate()),
            },
            LfqError::OutOfMemory(s) => LfqError::OutOfMemory(s.clone()),
            LfqError::Cancelled => LfqError::Cancelled,
            LfqError::InvalidConfig(s) => LfqError::InvalidConfig(s.clone()),
            LfqError::Unsupported(s) => LfqError::Unsupported(s.clone()),
            LfqError::Io(e) => LfqError::Execution(format!("io error: {e}")),
            LfqError::Arrow(e) => LfqError::Execution(format!("arrow error: {e}")),
        }
    }
}

/// Standard LFQ result alias.
pub type Result<T> = std::result::Result<T, LfqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_context_wraps_once() {
        let err = LfqError::Execution("sum overflow".to_string())
            .with_operator("HashAggregateExec", 3)
            .with_operator("ProjectionExec", 3);
        let text = err.to_string();
        assert!(text.starts_with("HashAggregateExec[partition 3]"), "{text}");
        assert!(matches!(err.root(), LfqError::Execution(_)));
    }

    #[test]
    fn cancelled_is_never_wrapped() {
        let err = LfqError::Cancelled.with_operator("SortExec", 0);
        assert!(matches!(err, LfqError::Cancelled));
    }
}
