//! Fatal conditions raised by the training core
//!
//! Everything else travels as a plain `anyhow::Error`. These three variants
//! are kept as a typed enum so callers can `downcast_ref::<CoreError>()` and
//! tell a bad input apart from a diverged run or a lost worker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A vector or tensor width does not match what the stage was built for.
    #[error("dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// The loss became NaN or infinite. The run stops without checkpointing.
    #[error("loss diverged at {stage} step {step}: {value}")]
    Diverged {
        stage: &'static str,
        step: usize,
        value: f64,
    },

    /// A worker failed or timed out at a synchronization barrier.
    #[error("synchronization failure: {reason}")]
    SyncFailure { reason: String },
}

impl CoreError {
    pub fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    pub fn sync(reason: impl Into<String>) -> Self {
        Self::SyncFailure {
            reason: reason.into(),
        }
    }
}

/// Fail with [`CoreError::DimensionMismatch`] unless `actual == expected`.
pub fn ensure_dim(context: &str, expected: usize, actual: usize) -> anyhow::Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(CoreError::dimension(context, expected, actual).into())
    }
}

/// Fail with [`CoreError::Diverged`] if `value` is not finite.
pub fn ensure_finite(stage: &'static str, step: usize, value: f64) -> anyhow::Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(CoreError::Diverged { stage, step, value }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dim_mismatch_downcasts() {
        let err = ensure_dim("features", 768, 512).unwrap_err();
        match err.downcast_ref::<CoreError>() {
            Some(CoreError::DimensionMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(*expected, 768);
                assert_eq!(*actual, 512);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ensure_dim("features", 4, 4).is_ok());
    }

    #[test]
    fn test_ensure_finite() {
        assert!(ensure_finite("decomposer", 3, 0.5).is_ok());
        let err = ensure_finite("decomposer", 3, f64::NAN).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::Diverged { step: 3, .. })
        ));
        assert!(ensure_finite("trigger", 0, f64::INFINITY).is_err());
    }
}
