//! Visibility oracle seam.
//!
//! The line-of-sight computation is supplied by the host. The exposure
//! source is the viewshed origin; `target_height` is the eye height of the
//! people looking at it.

use ndarray::Array2;

use crate::error::OracleError;
use crate::region::LocalWindow;

/// Everything an oracle needs for one partial viewshed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OracleRequest {
    pub x: f64,
    pub y: f64,
    pub observer_height: f64,
    pub target_height: f64,
    pub max_distance: f64,
    pub curvature: bool,
    /// Refraction coefficient when refraction is accounted for.
    pub refraction: Option<f64>,
    pub window: LocalWindow,
}

/// Binary viewshed provider.
///
/// Must return a grid of the window's shape holding 0 (not visible),
/// 1 (visible) or NaN (outside the analysis mask). The origin cell is 1.
pub trait VisibilityOracle: Send + Sync {
    fn viewshed(&self, request: &OracleRequest) -> Result<Array2<f64>, OracleError>;
}

impl<F> VisibilityOracle for F
where
    F: Fn(&OracleRequest) -> Result<Array2<f64>, OracleError> + Send + Sync,
{
    fn viewshed(&self, request: &OracleRequest) -> Result<Array2<f64>, OracleError> {
        self(request)
    }
}

/// Check an oracle grid against the window shape and the {0, 1, NaN} domain.
pub(crate) fn validate_viewshed(
    viewshed: &Array2<f64>,
    window: &LocalWindow,
) -> Result<(), OracleError> {
    let (er, ec) = window.shape();
    let (ar, ac) = viewshed.dim();
    if (er, ec) != (ar, ac) {
        return Err(OracleError::ShapeMismatch { er, ec, ar, ac });
    }
    if let Some(((row, col), &value)) = viewshed
        .indexed_iter()
        .find(|(_, &v)| !(v.is_nan() || v == 0.0 || v == 1.0))
    {
        return Err(OracleError::InvalidValue { row, col, value });
    }
    Ok(())
}
