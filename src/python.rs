//! Python bindings.
//!
//! Arrays are copied into owned buffers and the computation runs with the GIL
//! released, so a runner's `progress()` can be polled from another thread.
//! The Python oracle re-acquires the GIL for each viewshed call.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use numpy::{IntoPyArray, PyArray2, PyReadonlyArray2};
use pyo3::exceptions::{PyInterruptedError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::dsm::{compute_corner_elevations, compute_slope_components, Dsm};
use crate::error::{ExposureError, OracleError};
use crate::exposure::{ExposureConfig, ExposureReport, ExposureRun, Refraction};
use crate::oracle::{OracleRequest, VisibilityOracle};
use crate::parametrise::Parametrisation;
use crate::region::{Range, Region};
use crate::target::{PointSample, WeightSource};

impl From<ExposureError> for PyErr {
    fn from(e: ExposureError) -> Self {
        match e {
            ExposureError::Config(msg) => PyValueError::new_err(msg),
            ExposureError::WorkerFault(msg) => PyRuntimeError::new_err(msg),
            ExposureError::Cancelled => PyInterruptedError::new_err("exposure computation cancelled"),
        }
    }
}

/// Run parameters, created once in Python.
#[pyclass]
#[derive(Clone)]
pub struct ExposureParams {
    #[pyo3(get, set)]
    pub function: String,
    #[pyo3(get, set)]
    pub b1_distance: Option<f64>,
    /// Exposure range in map units; `None` covers the whole region.
    #[pyo3(get, set)]
    pub range: Option<f64>,
    #[pyo3(get, set)]
    pub observer_height: f64,
    #[pyo3(get, set)]
    pub refraction: bool,
    #[pyo3(get, set)]
    pub refraction_coeff: f64,
    #[pyo3(get, set)]
    pub curvature: bool,
    #[pyo3(get, set)]
    pub workers: usize,
}

#[pymethods]
impl ExposureParams {
    #[new]
    #[pyo3(signature = (
        function = "distance_decay",
        b1_distance = None,
        range = Some(100.0),
        observer_height = 1.5,
        refraction = false,
        refraction_coeff = 0.14286,
        curvature = false,
        workers = 1
    ))]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        function: &str,
        b1_distance: Option<f64>,
        range: Option<f64>,
        observer_height: f64,
        refraction: bool,
        refraction_coeff: f64,
        curvature: bool,
        workers: usize,
    ) -> Self {
        Self {
            function: function.to_string(),
            b1_distance,
            range,
            observer_height,
            refraction,
            refraction_coeff,
            curvature,
            workers,
        }
    }
}

impl ExposureParams {
    fn to_config(&self) -> Result<ExposureConfig, ExposureError> {
        Ok(ExposureConfig {
            function: Parametrisation::from_name(&self.function, self.b1_distance)?,
            range: self.range.map_or(Range::Infinite, Range::Finite),
            observer_height: self.observer_height,
            refraction: Refraction {
                enabled: self.refraction,
                coefficient: self.refraction_coeff,
            },
            curvature: self.curvature,
            worker_count: self.workers,
        })
    }
}

/// Cumulative raster and run statistics.
#[pyclass]
pub struct ExposureResult {
    #[pyo3(get)]
    pub raster: Py<PyArray2<f64>>,
    #[pyo3(get)]
    pub contributing_points: usize,
    /// `(index, x, y, reason)` of every point that did not contribute.
    #[pyo3(get)]
    pub skipped: Vec<(usize, f64, f64, String)>,
    #[pyo3(get)]
    pub min: Option<f64>,
    #[pyo3(get)]
    pub max: Option<f64>,
    #[pyo3(get)]
    pub mean: Option<f64>,
    #[pyo3(get)]
    pub nodata_cells: usize,
}

fn report_to_py(py: Python, report: ExposureReport) -> PyResult<Py<ExposureResult>> {
    let skipped = report
        .skipped
        .iter()
        .map(|s| (s.index, s.x, s.y, s.reason.to_string()))
        .collect();
    Py::new(
        py,
        ExposureResult {
            raster: report.raster.into_pyarray(py).unbind(),
            contributing_points: report.contributing_points,
            skipped,
            min: report.summary.min,
            max: report.summary.max,
            mean: report.summary.mean,
            nodata_cells: report.summary.nodata_cells,
        },
    )
}

/// Oracle backed by a Python callable.
///
/// The callable receives the request as keyword arguments (`x`, `y`,
/// `observer_height`, `target_height`, `max_distance`, `curvature`,
/// `refraction`, and the window's `north`, `south`, `east`, `west`, `rows`,
/// `cols`) and returns a float64 array of shape `(rows, cols)`.
struct PyOracle {
    callable: Py<PyAny>,
}

impl PyOracle {
    fn call(&self, py: Python<'_>, req: &OracleRequest) -> PyResult<Array2<f64>> {
        let w = req.window;
        let kwargs = PyDict::new(py);
        kwargs.set_item("x", req.x)?;
        kwargs.set_item("y", req.y)?;
        kwargs.set_item("observer_height", req.observer_height)?;
        kwargs.set_item("target_height", req.target_height)?;
        kwargs.set_item("max_distance", req.max_distance)?;
        kwargs.set_item("curvature", req.curvature)?;
        kwargs.set_item("refraction", req.refraction)?;
        kwargs.set_item("north", w.north)?;
        kwargs.set_item("south", w.south)?;
        kwargs.set_item("east", w.east)?;
        kwargs.set_item("west", w.west)?;
        kwargs.set_item("rows", w.rows)?;
        kwargs.set_item("cols", w.cols)?;

        let out = self.callable.bind(py).call((), Some(&kwargs))?;
        let grid: PyReadonlyArray2<f64> = out.extract()?;
        Ok(grid.as_array().to_owned())
    }
}

impl VisibilityOracle for PyOracle {
    fn viewshed(&self, request: &OracleRequest) -> Result<Array2<f64>, OracleError> {
        Python::with_gil(|py| {
            self.call(py, request)
                .map_err(|e| OracleError::failed(format!("viewshed callable failed: {e}")))
        })
    }
}

fn read_points(points: &PyReadonlyArray2<f64>) -> PyResult<Vec<PointSample>> {
    let pts = points.as_array();
    match pts.ncols() {
        2 => Ok(pts.rows().into_iter().map(|p| PointSample::new(p[0], p[1])).collect()),
        3 => Ok(pts
            .rows()
            .into_iter()
            .map(|p| PointSample::weighted(p[0], p[1], p[2]))
            .collect()),
        n => Err(PyValueError::new_err(format!(
            "points must have 2 (x, y) or 3 (x, y, weight) columns, got {n}"
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_exposure(
    py: Python,
    dsm: PyReadonlyArray2<f64>,
    bounds: (f64, f64, f64, f64),
    ns_res: f64,
    ew_res: f64,
    points: PyReadonlyArray2<f64>,
    viewshed: Py<PyAny>,
    params: &ExposureParams,
    weights: Option<PyReadonlyArray2<f64>>,
    progress: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
) -> PyResult<Py<ExposureResult>> {
    let (north, south, east, west) = bounds;
    let config = params.to_config()?;
    let region = Region::new(north, south, east, west, ns_res, ew_res)?;
    let dsm = Dsm::new(region, dsm.as_array().to_owned())?;
    let samples = read_points(&points)?;
    let weight_grid = weights.map(|w| w.as_array().to_owned());
    let oracle = PyOracle { callable: viewshed };

    let report = py.allow_threads(|| {
        let run = ExposureRun::with_handles(config, progress, cancelled)?;
        let source = weight_grid
            .as_ref()
            .map_or(WeightSource::PerPoint, |w| WeightSource::Raster(w.view()));
        run.run(&dsm, &samples, source, &oracle)
    })?;
    report_to_py(py, report)
}

/// Compute the weighted cumulative viewshed of `points` over `dsm`.
///
/// `bounds` is `(north, south, east, west)`; `viewshed` is the visibility
/// callable described on the module.
#[pyfunction]
#[pyo3(signature = (dsm, bounds, ns_res, ew_res, points, viewshed, params, weights=None))]
#[allow(clippy::too_many_arguments)]
pub fn compute_exposure(
    py: Python,
    dsm: PyReadonlyArray2<f64>,
    bounds: (f64, f64, f64, f64),
    ns_res: f64,
    ew_res: f64,
    points: PyReadonlyArray2<f64>,
    viewshed: Py<PyAny>,
    params: &ExposureParams,
    weights: Option<PyReadonlyArray2<f64>>,
) -> PyResult<Py<ExposureResult>> {
    run_exposure(
        py,
        dsm,
        bounds,
        ns_res,
        ew_res,
        points,
        viewshed,
        params,
        weights,
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicBool::new(false)),
    )
}

/// Runner that exposes pollable progress() and cancel() methods.
///
/// Usage from Python:
///     runner = ExposureRunner()
///     # in a worker thread:
///     result = runner.compute(dsm, bounds, res, res, points, viewshed, params)
///     # from the main thread:
///     done = runner.progress()
///     runner.cancel()
#[pyclass]
pub struct ExposureRunner {
    progress: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

impl Default for ExposureRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[pymethods]
impl ExposureRunner {
    #[new]
    pub fn new() -> Self {
        Self {
            progress: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Number of source points processed so far.
    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[pyo3(signature = (dsm, bounds, ns_res, ew_res, points, viewshed, params, weights=None))]
    #[allow(clippy::too_many_arguments)]
    pub fn compute(
        &self,
        py: Python,
        dsm: PyReadonlyArray2<f64>,
        bounds: (f64, f64, f64, f64),
        ns_res: f64,
        ew_res: f64,
        points: PyReadonlyArray2<f64>,
        viewshed: Py<PyAny>,
        params: &ExposureParams,
        weights: Option<PyReadonlyArray2<f64>>,
    ) -> PyResult<Py<ExposureResult>> {
        self.progress.store(0, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        run_exposure(
            py,
            dsm,
            bounds,
            ns_res,
            ew_res,
            points,
            viewshed,
            params,
            weights,
            self.progress.clone(),
            self.cancelled.clone(),
        )
    }
}

/// Corner elevations `(a, b, c, d)` = (NW, NE, SE, SW) of every cell.
#[pyfunction]
pub fn precompute_corner_elevations(
    py: Python,
    dsm: PyReadonlyArray2<f64>,
) -> PyResult<(
    Py<PyArray2<f64>>,
    Py<PyArray2<f64>>,
    Py<PyArray2<f64>>,
    Py<PyArray2<f64>>,
)> {
    let owned = dsm.as_array().to_owned();
    let grids = py.allow_threads(|| compute_corner_elevations(owned.view()));
    Ok((
        grids.a.into_pyarray(py).unbind(),
        grids.b.into_pyarray(py).unbind(),
        grids.c.into_pyarray(py).unbind(),
        grids.d.into_pyarray(py).unbind(),
    ))
}

/// East-west and north-south slope angles (radians) of every cell.
#[pyfunction]
pub fn precompute_slope_components(
    py: Python,
    dsm: PyReadonlyArray2<f64>,
    cell_size: f64,
) -> PyResult<(Py<PyArray2<f64>>, Py<PyArray2<f64>>)> {
    if !(cell_size.is_finite() && cell_size > 0.0) {
        return Err(PyValueError::new_err(format!(
            "cell_size must be positive, got {cell_size}"
        )));
    }
    let owned = dsm.as_array().to_owned();
    let grids = py.allow_threads(|| compute_slope_components(owned.view(), cell_size));
    Ok((
        grids.ew.into_pyarray(py).unbind(),
        grids.ns.into_pyarray(py).unbind(),
    ))
}
