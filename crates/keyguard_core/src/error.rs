use snafu::{IntoError, Snafu};

use crate::store::StoreError;

/// What a guarded call reports to its caller.
///
/// [`GuardError::RateLimited`] and [`GuardError::LockBusy`] are rejections: expected outcomes
/// carrying the message configured on the policy. Everything else is a genuine failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GuardError {
    #[snafu(display("{message}"))]
    RateLimited { key: String, message: String },

    #[snafu(display("{message}"))]
    LockBusy { key: String, message: String },

    #[snafu(display("invalid guard policy: {reason}"))]
    InvalidPolicy { reason: String },

    #[snafu(display("store error while guarding '{key}': {source}"))]
    Store { key: String, source: StoreError },

    #[snafu(display("guarded operation failed: {source}"))]
    Inner { source: crate::Error },
}

impl GuardError {
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            GuardError::RateLimited { .. } | GuardError::LockBusy { .. }
        )
    }

    /// The resolved key the error concerns, when there is one.
    pub fn key(&self) -> Option<&str> {
        match self {
            GuardError::RateLimited { key, .. }
            | GuardError::LockBusy { key, .. }
            | GuardError::Store { key, .. } => Some(key),
            GuardError::InvalidPolicy { .. } | GuardError::Inner { .. } => None,
        }
    }

    /// Wraps an operation's error. A [`GuardError`] from a nested guard is passed through as is.
    pub(crate) fn inner(error: impl Into<crate::Error>) -> Self {
        match error.into().downcast::<GuardError>() {
            Ok(nested) => *nested,
            Err(source) => InnerSnafu.into_error(source),
        }
    }
}
