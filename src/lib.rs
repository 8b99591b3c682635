//! Weighted cumulative viewshed exposure.
//!
//! For every exposure source point a local viewshed is requested from a
//! [`VisibilityOracle`], weighted by a [`Parametrisation`] and accumulated
//! into one region-wide raster. Sources are split across a worker pool; each
//! worker owns its own raster and the rasters are reduced after the join.

pub mod accumulate;
pub mod dsm;
pub mod error;
pub mod exposure;
pub mod oracle;
pub mod parametrise;
pub mod region;
pub mod scheduler;
pub mod target;

#[cfg(feature = "python")]
mod python;

pub use dsm::{DerivedKind, Dsm};
pub use error::{DataError, ExposureError, OracleError, Result};
pub use exposure::{
    compute_exposure, ExposureConfig, ExposureReport, ExposureRun, RasterSummary, Refraction,
};
pub use oracle::{OracleRequest, VisibilityOracle};
pub use parametrise::Parametrisation;
pub use region::{LocalWindow, Range, Region};
pub use target::{PointSample, SkipReason, SkippedPoint, WeightSource};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn viewexposure(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    register_exposure_module(py_module)?;
    register_dsm_module(py_module)?;
    py_module.add("__doc__", "Weighted cumulative viewshed exposure implemented in Rust.")?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_exposure_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    py_module.add_class::<python::ExposureParams>()?;
    py_module.add_class::<python::ExposureResult>()?;
    py_module.add_class::<python::ExposureRunner>()?;
    py_module.add_function(wrap_pyfunction!(python::compute_exposure, py_module)?)?;
    Ok(())
}

#[cfg(feature = "python")]
fn register_dsm_module(py_module: &Bound<'_, PyModule>) -> PyResult<()> {
    let submodule = PyModule::new(py_module.py(), "dsm")?;
    submodule.add("__doc__", "Derived terrain grids used by the exposure weightings.")?;
    submodule.add_function(wrap_pyfunction!(
        python::precompute_corner_elevations,
        &submodule
    )?)?;
    submodule.add_function(wrap_pyfunction!(
        python::precompute_slope_components,
        &submodule
    )?)?;
    py_module.add_submodule(&submodule)?;
    Ok(())
}
