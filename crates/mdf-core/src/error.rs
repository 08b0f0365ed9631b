//! Error types for the MDF control plane.
//!
//! A single error enum, [`MdfError`], covers every failure the control
//! plane can surface. The taxonomy is deliberately small:
//!
//! - **`InvalidParameter`** - caller-supplied configuration violates a
//!   hardware bound (divider range, decimation minimum, group capacity).
//!   Never retried.
//! - **`InvalidState`** - an operation was attempted from a lifecycle state
//!   that does not permit it. Indicates a caller programming error.
//! - **`Busy`** - a shared resource (typically the clock rate lock) is held
//!   by another owner. The caller may retry after releasing its own pending
//!   operation.
//! - **`Timeout`** / **`HardwareFault`** - a status bit did not reach the
//!   expected value within the bounded poll budget. The affected resource
//!   is left de-configured, never half-started.
//! - **`Config`** - the TOML configuration parsed but failed semantic
//!   validation.
//!
//! No error is retried internally beyond the bounded polling built into
//! start/stop sequences; retry policy is a caller decision.

use thiserror::Error;

/// Convenience alias for results using the control-plane error type.
pub type MdfResult<T> = std::result::Result<T, MdfError>;

/// Primary error type for the MDF control plane.
#[derive(Error, Debug)]
pub enum MdfError {
    /// Caller-supplied value violates a hardware bound.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation attempted from a lifecycle state that does not permit it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Shared resource already held by another owner.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// A status bit did not reach the expected value within the poll budget.
    #[error("timeout waiting for {what} (register {offset:#05x}, mask {mask:#010x})")]
    Timeout {
        /// What was being waited for.
        what: &'static str,
        /// Byte offset of the polled register.
        offset: u32,
        /// Bit mask that never reached the expected value.
        mask: u32,
    },

    /// The hardware reported an identity or activation failure.
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    /// Configuration parsed but failed semantic validation.
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MdfError::InvalidParameter("decimation factor 1 below minimum 2".into());
        assert_eq!(
            err.to_string(),
            "invalid parameter: decimation factor 1 below minimum 2"
        );
    }

    #[test]
    fn test_timeout_display_includes_register() {
        let err = MdfError::Timeout {
            what: "serial interface active",
            offset: 0x80,
            mask: 0x8000_0000,
        };
        let text = err.to_string();
        assert!(text.contains("serial interface active"));
        assert!(text.contains("0x080"));
        assert!(text.contains("0x80000000"));
    }
}
