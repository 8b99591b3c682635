//! Error types for exposure runs.
//!
//! Only `Config`, `WorkerFault` and `Cancelled` abort a run. Per-point
//! problems (`OracleError`, `DataError`) are collected into the report.

use thiserror::Error;

/// Fatal errors of an exposure run.
#[derive(Error, Debug)]
pub enum ExposureError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker fault: {0}")]
    WorkerFault(String),

    #[error("exposure computation cancelled")]
    Cancelled,
}

impl ExposureError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn worker_fault(msg: impl Into<String>) -> Self {
        Self::WorkerFault(msg.into())
    }
}

/// Failure of the visibility oracle for a single target point.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("viewshed failed: {0}")]
    Failed(String),

    #[error("viewshed shape mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    ShapeMismatch { er: usize, ec: usize, ar: usize, ac: usize },

    #[error("viewshed value {value} at ({row}, {col}) is not 0, 1 or NaN")]
    InvalidValue { row: usize, col: usize, value: f64 },
}

impl OracleError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Reason a candidate target point was dropped before scheduling.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("point ({x}, {y}) lies outside the region")]
    OutsideRegion { x: f64, y: f64 },

    #[error("no elevation under point ({x}, {y})")]
    NoElevation { x: f64, y: f64 },

    #[error("invalid weight {weight} for point ({x}, {y})")]
    InvalidWeight { x: f64, y: f64, weight: f64 },

    #[error("missing {attribute} under point ({x}, {y})")]
    NoAttributes {
        x: f64,
        y: f64,
        attribute: &'static str,
    },
}

/// Result type alias for exposure operations
pub type Result<T> = std::result::Result<T, ExposureError>;
