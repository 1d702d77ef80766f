use std::time::Duration;
use thiserror::Error;

/// Device-level errors shared by charger, meter and vehicle drivers.
///
/// `MustRetry` and `NotAvailable` are control-flow signals rather than
/// failures: the loop defers on the former and silently skips the latter.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// Transient driver condition (token refresh, protocol mode unknown).
    /// The control loop leaves state untouched and retries next tick.
    #[error("operation must be retried")]
    MustRetry,

    /// Capability not supported by this device.
    #[error("not available")]
    NotAvailable,

    /// Operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Device reports a fault state.
    #[error("device fault: {0}")]
    Fault(String),

    /// Transport or protocol failure.
    #[error("communication error: {0}")]
    Communication(String),
}

impl DeviceError {
    pub fn is_must_retry(&self) -> bool {
        matches!(self, DeviceError::MustRetry)
    }

    pub fn is_not_available(&self) -> bool {
        matches!(self, DeviceError::NotAvailable)
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
