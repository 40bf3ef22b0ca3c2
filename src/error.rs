//! Unified error handling for gradforge
//!
//! A single crate-level error type consolidating the error kinds the
//! runtime can surface:
//! - Planner errors (no feasible plan for the device budget)
//! - Fatal primitive/copy errors (abort the step)
//! - Invariant breaches (bugs, abort immediately)
//! - Device runtime errors (allocation, stream, event, copy plumbing)
//! - User errors (invalid configuration or network description)

use crate::device::DeviceError;

/// Unified error type for gradforge.
#[derive(Debug, thiserror::Error)]
pub enum GradForgeError {
    /// No candidate plan confirms within the device budget. The caller
    /// should reduce the batch size or the network size.
    #[error("planner infeasible: {0}")]
    PlannerInfeasible(String),

    /// A DNN primitive failed. Aborts the step; no retry.
    #[error("primitive failed at layer {layer}: {reason}")]
    FatalPrimitive { layer: usize, reason: String },

    /// A device-to-host or host-to-device copy failed. Aborts the step.
    #[error("transfer failed at layer {layer}: {reason}")]
    FatalCopy { layer: usize, reason: String },

    /// A runtime invariant was breached. This indicates a bug.
    #[error("invariant breached: {0}")]
    Invariant(String),

    /// Device runtime error (allocation, stream, event plumbing).
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Invalid engine or network configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid layer stack description.
    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    /// Operation not supported by the active primitive library.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Lock poisoned (a thread panicked while holding it). Indicates a bug.
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GradForgeError {
    /// Categorize the error for handling decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            GradForgeError::PlannerInfeasible(_) => ErrorCategory::Planner,
            GradForgeError::FatalPrimitive { .. } | GradForgeError::FatalCopy { .. } => {
                ErrorCategory::Fatal
            }
            GradForgeError::InvalidConfiguration(_)
            | GradForgeError::InvalidNetwork(_)
            | GradForgeError::Unsupported(_) => ErrorCategory::User,
            GradForgeError::Device(_) => ErrorCategory::Backend,
            GradForgeError::Invariant(_)
            | GradForgeError::LockPoisoned(_)
            | GradForgeError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Planner errors are the only kind the caller is expected to react to
    /// (shrink the batch or the network and try again).
    pub fn is_planner_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Planner)
    }

    /// Check if this is a user-facing error (actionable by users).
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Fatal errors terminate the step; the process is expected to exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Fatal | ErrorCategory::Internal
        )
    }
}

/// Error category for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No feasible plan - caller should shrink the workload
    Planner,
    /// Primitive or copy failure - the step is aborted
    Fatal,
    /// Invalid input or configuration
    User,
    /// Device runtime failure
    Backend,
    /// Bug in the runtime itself
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Planner => write!(f, "Planner"),
            ErrorCategory::Fatal => write!(f, "Fatal"),
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for GradForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        GradForgeError::LockPoisoned(err.to_string())
    }
}

/// Helper type alias for Results using GradForgeError.
pub type GradResult<T> = std::result::Result<T, GradForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            GradForgeError::PlannerInfeasible("8 candidates".into()).category(),
            ErrorCategory::Planner
        );
        assert_eq!(
            GradForgeError::FatalPrimitive {
                layer: 3,
                reason: "conv forward".into()
            }
            .category(),
            ErrorCategory::Fatal
        );
        assert_eq!(
            GradForgeError::InvalidConfiguration("batch size 0".into()).category(),
            ErrorCategory::User
        );
        assert_eq!(
            GradForgeError::Invariant("size mismatch".into()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_is_planner_error() {
        assert!(GradForgeError::PlannerInfeasible("x".into()).is_planner_error());
        assert!(!GradForgeError::Internal("x".into()).is_planner_error());
    }

    #[test]
    fn test_fatal_display_names_layer() {
        let err = GradForgeError::FatalPrimitive {
            layer: 7,
            reason: "workspace query".into(),
        };
        assert_eq!(
            err.to_string(),
            "primitive failed at layer 7: workspace query"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::PoisonError;

        fn convert<T>(err: PoisonError<T>) -> GradForgeError {
            GradForgeError::from(err)
        }
        let _ = convert::<i32> as fn(PoisonError<i32>) -> GradForgeError;
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Planner.to_string(), "Planner");
        assert_eq!(ErrorCategory::Fatal.to_string(), "Fatal");
        assert_eq!(ErrorCategory::Backend.to_string(), "Backend");
    }
}
