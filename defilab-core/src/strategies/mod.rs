//! Reference strategies.

pub mod basis;
pub mod threshold;

pub use basis::{BasisParams, BasisStrategy};
pub use threshold::{ThresholdParams, ThresholdStrategy};
