//! Z-axis stage abstraction
//!
//! The focus engine talks to piezo or motorised Z stages only through the
//! [`StageActuator`] trait. Adapters for specific controllers live outside
//! this workspace; [`mock::MockStage`] backs the simulator and tests.

pub mod mock;

use thiserror::Error;

/// Errors reported by a Z stage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    /// Controller refused the command (hardware status code or message)
    #[error("stage rejected command to {target_um:+.4} um: {reason}")]
    CommandRejected {
        /// Requested absolute position
        target_um: f64,
        /// Controller-provided reason
        reason: String,
    },

    /// Requested position lies outside the stage travel
    #[error("target {target_um:+.4} um outside travel [{min_um:.4}, {max_um:.4}] um")]
    OutOfRange {
        /// Requested absolute position
        target_um: f64,
        /// Lower travel limit
        min_um: f64,
        /// Upper travel limit
        max_um: f64,
    },

    /// Controller did not answer before the deadline
    #[error("stage timed out: {0}")]
    Timeout(String),

    /// Transport-level failure
    #[error("stage communication error: {0}")]
    Communication(String),
}

/// Result type for stage operations
pub type StageResult<T> = Result<T, StageError>;

/// Capability set of an absolute Z stage, positions in micrometres
///
/// Every call must return within a bounded time; slow controllers should map
/// their own deadline onto [`StageError::Timeout`].
pub trait StageActuator: Send {
    /// Read the current Z position
    fn get_z_um(&mut self) -> StageResult<f64>;

    /// Command an absolute Z position
    fn move_z_um(&mut self, target_um: f64) -> StageResult<()>;

    /// Whether `get_z_um` reflects an independent position sensor
    ///
    /// Open-loop stages echo the last command; callers then treat the
    /// commanded value as the measured one.
    fn supports_readback(&self) -> bool {
        true
    }
}

impl StageActuator for Box<dyn StageActuator> {
    fn get_z_um(&mut self) -> StageResult<f64> {
        (**self).get_z_um()
    }

    fn move_z_um(&mut self, target_um: f64) -> StageResult<()> {
        (**self).move_z_um(target_um)
    }

    fn supports_readback(&self) -> bool {
        (**self).supports_readback()
    }
}
