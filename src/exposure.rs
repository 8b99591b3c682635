//! Cumulative exposure orchestration.
//!
//! `ExposureRun` is the per-run context: it owns the worker pool and the
//! progress/cancel handles, validates the configuration before any work and
//! releases the pool when dropped, whichever way the run ends.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use ndarray_stats::QuantileExt;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::accumulate::reduce;
use crate::dsm::Dsm;
use crate::error::{ExposureError, Result};
use crate::oracle::VisibilityOracle;
use crate::parametrise::Parametrisation;
use crate::region::Range;
use crate::scheduler::{run_workers, ComputeContext};
use crate::target::{prepare_targets, PointSample, SkippedPoint, WeightSource};

/// Default refraction coefficient of the visibility oracle.
pub const DEFAULT_REFRACTION_COEFF: f64 = 0.14286;

/// Atmospheric refraction setting passed through to the oracle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refraction {
    pub enabled: bool,
    pub coefficient: f64,
}

impl Default for Refraction {
    fn default() -> Self {
        Self {
            enabled: false,
            coefficient: DEFAULT_REFRACTION_COEFF,
        }
    }
}

impl Refraction {
    fn coefficient(&self) -> Option<f64> {
        self.enabled.then_some(self.coefficient)
    }
}

/// Parameters of one exposure run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureConfig {
    pub function: Parametrisation,
    pub range: Range,
    /// Eye height above the terrain of people looking at the sources.
    pub observer_height: f64,
    pub refraction: Refraction,
    /// Account for earth curvature in the viewshed.
    pub curvature: bool,
    pub worker_count: usize,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            function: Parametrisation::default(),
            range: Range::default(),
            observer_height: 1.5,
            refraction: Refraction::default(),
            curvature: false,
            worker_count: 1,
        }
    }
}

impl ExposureConfig {
    pub fn validate(&self) -> Result<()> {
        if let Range::Finite(r) = self.range {
            if !(r.is_finite() && r > 0.0) {
                return Err(ExposureError::config(format!(
                    "exposure range must be positive, got {r}"
                )));
            }
        }
        if !(self.observer_height.is_finite() && self.observer_height >= 0.0) {
            return Err(ExposureError::config(format!(
                "observer height must be non-negative, got {}",
                self.observer_height
            )));
        }
        if self.refraction.enabled && !self.refraction.coefficient.is_finite() {
            return Err(ExposureError::config("refraction coefficient must be finite"));
        }
        if self.worker_count < 1 {
            return Err(ExposureError::config("worker count must be at least 1"));
        }
        self.function.validate(self.range)
    }
}

/// Value range of the cumulative raster, NoData cells excluded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterSummary {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub nodata_cells: usize,
    pub cells: usize,
}

impl RasterSummary {
    pub fn of(raster: &Array2<f64>) -> Self {
        let finite = |v: f64| (!v.is_nan()).then_some(v);
        let (sum, n) = raster
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0, 0usize), |(s, n), &v| (s + v, n + 1));
        Self {
            min: finite(*raster.min_skipnan()),
            max: finite(*raster.max_skipnan()),
            mean: (n > 0).then(|| sum / n as f64),
            nodata_cells: raster.len() - n,
            cells: raster.len(),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct ExposureReport {
    /// Cumulative exposure over the region, NaN where nothing contributed.
    pub raster: Array2<f64>,
    /// Points dropped before scheduling or skipped by the oracle.
    pub skipped: Vec<SkippedPoint>,
    pub contributing_points: usize,
    pub summary: RasterSummary,
}

impl ExposureReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

/// Per-run context owning the worker pool and control handles.
pub struct ExposureRun {
    config: ExposureConfig,
    pool: ThreadPool,
    progress: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

impl ExposureRun {
    pub fn new(config: ExposureConfig) -> Result<Self> {
        Self::with_handles(
            config,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Build a run that reports into externally owned progress/cancel flags.
    pub fn with_handles(
        config: ExposureConfig,
        progress: Arc<AtomicUsize>,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.worker_count)
            .thread_name(|i| format!("exposure-worker-{i}"))
            .build()
            .map_err(|e| ExposureError::worker_fault(format!("cannot start workers: {e}")))?;
        Ok(Self {
            config,
            pool,
            progress,
            cancelled,
        })
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.config
    }

    /// Number of source points processed so far.
    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Relaxed)
    }

    /// Stop the run in progress; the next `run` starts uncancelled.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Compute the cumulative exposure of `samples` over `dsm`.
    pub fn run(
        &self,
        dsm: &Dsm,
        samples: &[PointSample],
        weights: WeightSource<'_>,
        oracle: &dyn VisibilityOracle,
    ) -> Result<ExposureReport> {
        let region = dsm.region();
        if let WeightSource::Raster(grid) = weights {
            if grid.dim() != region.shape() {
                return Err(ExposureError::config(
                    "weight raster must have the same shape as the elevation grid",
                ));
            }
        }

        let config = &self.config;
        let range = region.resolve_range(config.range);
        self.progress.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);

        tracing::info!(
            function = config.function.name(),
            range,
            workers = config.worker_count,
            points = samples.len(),
            rows = region.rows(),
            cols = region.cols(),
            "Starting exposure computation"
        );

        // Derived grids are complete before any worker reads them.
        let attributes = config.function.required_attributes();
        if let Some(kind) = attributes {
            self.pool.install(|| dsm.precompute(kind));
        }

        let (targets, mut skipped) = prepare_targets(samples, dsm, weights, attributes);

        let ctx = ComputeContext {
            dsm,
            oracle,
            function: config.function,
            range,
            observer_height: config.observer_height,
            curvature: config.curvature,
            refraction: config.refraction.coefficient(),
        };
        let outputs = run_workers(
            &self.pool,
            &targets,
            config.worker_count,
            &ctx,
            &self.progress,
            &self.cancelled,
        )?;

        let mut contributing_points = 0;
        let mut rasters = Vec::with_capacity(outputs.len());
        for out in outputs {
            contributing_points += out.contributed;
            skipped.extend(out.skipped);
            rasters.push(out.raster);
        }
        skipped.sort_by_key(|s| s.index);

        let raster = reduce(region.shape(), rasters)?.into_array();
        let summary = RasterSummary::of(&raster);

        tracing::info!(
            contributing = contributing_points,
            skipped = skipped.len(),
            nodata_cells = summary.nodata_cells,
            "Exposure computation finished"
        );

        Ok(ExposureReport {
            raster,
            skipped,
            contributing_points,
            summary,
        })
    }
}

/// One-shot convenience wrapper around [`ExposureRun`].
pub fn compute_exposure(
    config: ExposureConfig,
    dsm: &Dsm,
    samples: &[PointSample],
    weights: WeightSource<'_>,
    oracle: &dyn VisibilityOracle,
) -> Result<ExposureReport> {
    ExposureRun::new(config)?.run(dsm, samples, weights, oracle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsm::compute_corner_elevations;
    use crate::error::OracleError;
    use crate::oracle::OracleRequest;
    use crate::region::Region;
    use crate::target::SkipReason;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    type OracleResult = std::result::Result<Array2<f64>, OracleError>;

    fn flat(size: usize) -> Dsm {
        let s = size as f64;
        Dsm::new(Region::square(s, 0.0, s, 0.0, 1.0).unwrap(), Array2::zeros((size, size))).unwrap()
    }

    fn hilly(size: usize) -> Dsm {
        let s = size as f64;
        let elev = Array2::from_shape_fn((size, size), |(r, c)| {
            ((r as f64) * 0.7).sin() * 3.0 + ((c as f64) * 0.4).cos() * 2.0
        });
        Dsm::new(Region::square(s, 0.0, s, 0.0, 1.0).unwrap(), elev).unwrap()
    }

    /// Deterministic pseudo-random point cloud.
    fn scatter(n: usize, size: f64, seed: u64) -> Vec<PointSample> {
        let mut state = seed;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        (0..n)
            .map(|_| {
                let x = (next() * size).floor() + 0.5;
                let y = (next() * size).floor() + 0.5;
                PointSample::weighted(x, y, 0.5 + next())
            })
            .collect()
    }

    /// Circular viewshed with a coordinate-dependent occlusion pattern.
    fn patterned(req: &OracleRequest) -> OracleResult {
        let w = req.window;
        Ok(Array2::from_shape_fn(w.shape(), |(r, c)| {
            let dx = c as f64 + 0.5 - w.target_col;
            let dy = r as f64 + 0.5 - w.target_row;
            if dx.hypot(dy) > req.max_distance {
                return f64::NAN;
            }
            let gr = w.row_off + r;
            let gc = w.col_off + c;
            let salt = (req.x * 7.0 + req.y * 13.0) as usize;
            if (gr * 3 + gc * 5 + salt) % 4 == 0 && (dx != 0.0 || dy != 0.0) {
                0.0
            } else {
                1.0
            }
        }))
    }

    fn assert_grids_close(a: &Array2<f64>, b: &Array2<f64>) {
        assert_eq!(a.dim(), b.dim());
        for ((idx, x), y) in a.indexed_iter().zip(b.iter()) {
            if x.is_nan() || y.is_nan() {
                assert!(x.is_nan() && y.is_nan(), "NoData mismatch at {idx:?}: {x} vs {y}");
            } else {
                assert_relative_eq!(*x, *y, max_relative = 1e-9, epsilon = 1e-12);
            }
        }
    }

    fn config(function: Parametrisation, range: Range, workers: usize) -> ExposureConfig {
        ExposureConfig {
            function,
            range,
            worker_count: workers,
            ..ExposureConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(ExposureConfig::default().validate().is_ok());
        let bad = [
            ExposureConfig { worker_count: 0, ..Default::default() },
            ExposureConfig { observer_height: -1.0, ..Default::default() },
            ExposureConfig { range: Range::Finite(0.0), ..Default::default() },
            ExposureConfig {
                function: Parametrisation::FuzzyViewshed { b1_distance: 10.0 },
                range: Range::Infinite,
                ..Default::default()
            },
        ];
        for cfg in bad {
            assert!(matches!(ExposureRun::new(cfg), Err(ExposureError::Config(_))));
        }
    }

    #[test]
    fn test_two_corner_scenario() {
        let dsm = flat(10);
        let blocked_a = [(5, 5), (5, 6), (6, 5), (6, 6)];
        let blocked_b = [(4, 4), (4, 5), (5, 4), (5, 5)];
        let oracle = move |req: &OracleRequest| -> OracleResult {
            let w = req.window;
            let blocked: &[(usize, usize)] = if req.x < 5.0 { &blocked_a } else { &blocked_b };
            Ok(Array2::from_shape_fn(w.shape(), |(r, c)| {
                if blocked.contains(&(w.row_off + r, w.col_off + c)) {
                    0.0
                } else {
                    1.0
                }
            }))
        };
        let samples = [PointSample::new(0.5, 9.5), PointSample::new(9.5, 0.5)];
        let report = compute_exposure(
            config(Parametrisation::Binary, Range::Finite(20.0), 2),
            &dsm,
            &samples,
            WeightSource::PerPoint,
            &oracle,
        )
        .unwrap();

        let mut expected = Array2::from_elem((10, 10), 2.0);
        for &(r, c) in blocked_a.iter().chain(blocked_b.iter()) {
            expected[[r, c]] -= 1.0;
        }
        assert_eq!(expected[[5, 5]], 0.0);
        assert_eq!(report.raster, expected);
        assert_eq!(report.contributing_points, 2);
        assert_eq!(report.skipped_count(), 0);
        assert_eq!(report.summary.max, Some(2.0));
        assert_eq!(report.summary.min, Some(0.0));
        assert_eq!(report.summary.nodata_cells, 0);
    }

    #[test]
    fn test_corner_point_infinite_range_uses_full_region() {
        let dsm = flat(8);
        let seen = Mutex::new(Vec::new());
        let oracle = |req: &OracleRequest| -> OracleResult {
            seen.lock().unwrap().push((req.window.offset(), req.window.shape(), req.max_distance));
            Ok(Array2::ones(req.window.shape()))
        };
        let report = compute_exposure(
            config(Parametrisation::Binary, Range::Infinite, 1),
            &dsm,
            &[PointSample::new(0.0, 0.0)],
            WeightSource::PerPoint,
            &oracle,
        )
        .unwrap();
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen, vec![((0, 0), (8, 8), 8.0)]);
        assert!(report.raster.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_binary_counts_observing_points() {
        let dsm = flat(24);
        let samples: Vec<_> = scatter(30, 24.0, 7)
            .into_iter()
            .map(|p| PointSample::new(p.x, p.y))
            .collect();
        let report = compute_exposure(
            config(Parametrisation::Binary, Range::Finite(6.0), 3),
            &dsm,
            &samples,
            WeightSource::PerPoint,
            &patterned,
        )
        .unwrap();

        let region = dsm.region();
        let mut counts = Array2::<f64>::zeros(region.shape());
        let mut touched = Array2::from_elem(region.shape(), false);
        for p in &samples {
            let w = region.clip_window(p.x, p.y, 6.0).unwrap();
            let req = OracleRequest {
                x: p.x,
                y: p.y,
                observer_height: 0.0,
                target_height: 1.5,
                max_distance: 6.0,
                curvature: false,
                refraction: None,
                window: w,
            };
            let vs = patterned(&req).unwrap();
            for ((r, c), &v) in vs.indexed_iter() {
                let g = (w.row_off + r, w.col_off + c);
                if !v.is_nan() {
                    touched[g] = true;
                    counts[g] += v;
                }
            }
        }
        for ((idx, &v), &t) in report.raster.indexed_iter().zip(touched.iter()) {
            if t {
                assert_eq!(v, counts[idx], "count mismatch at {idx:?}");
            } else {
                assert!(v.is_nan(), "expected NoData at {idx:?}");
            }
        }
    }

    #[test]
    fn test_permutation_invariance() {
        let dsm = hilly(30);
        let samples = scatter(40, 30.0, 11);
        let mut reversed = samples.clone();
        reversed.reverse();
        let mut rotated = samples.clone();
        rotated.rotate_left(13);

        for function in [
            Parametrisation::DistanceDecay,
            Parametrisation::FuzzyViewshed { b1_distance: 2.0 },
            Parametrisation::VisualMagnitude,
            Parametrisation::SolidAngle,
        ] {
            let cfg = config(function, Range::Finite(7.0), 2);
            let base = compute_exposure(cfg, &dsm, &samples, WeightSource::PerPoint, &patterned).unwrap();
            for other in [&reversed, &rotated] {
                let r = compute_exposure(cfg, &dsm, other, WeightSource::PerPoint, &patterned).unwrap();
                assert_grids_close(&base.raster, &r.raster);
            }
        }
    }

    #[test]
    fn test_partition_invariance() {
        let dsm = hilly(30);
        let samples = scatter(37, 30.0, 5);
        let single = compute_exposure(
            config(Parametrisation::SolidAngle, Range::Finite(9.0), 1),
            &dsm,
            &samples,
            WeightSource::PerPoint,
            &patterned,
        )
        .unwrap();
        for workers in [2, 3, 8, 64] {
            let multi = compute_exposure(
                config(Parametrisation::SolidAngle, Range::Finite(9.0), workers),
                &dsm,
                &samples,
                WeightSource::PerPoint,
                &patterned,
            )
            .unwrap();
            assert_grids_close(&single.raster, &multi.raster);
            assert_eq!(multi.contributing_points, samples.len());
        }
    }

    #[test]
    fn test_skipped_points_are_reported() {
        let mut elev = Array2::zeros((10, 10));
        elev[[0, 0]] = f64::NAN;
        let dsm = Dsm::new(Region::square(10.0, 0.0, 10.0, 0.0, 1.0).unwrap(), elev).unwrap();
        let oracle = |req: &OracleRequest| -> OracleResult {
            if req.x > 9.0 {
                Err(OracleError::failed("r.viewshed exited with status 1"))
            } else {
                Ok(Array2::ones(req.window.shape()))
            }
        };
        let samples = [
            PointSample::new(0.5, 9.5),
            PointSample::new(9.5, 9.5),
            PointSample::new(4.5, 4.5),
            PointSample::new(-3.0, 4.5),
        ];
        let report = compute_exposure(
            config(Parametrisation::Binary, Range::Finite(2.0), 2),
            &dsm,
            &samples,
            WeightSource::PerPoint,
            &oracle,
        )
        .unwrap();
        assert_eq!(report.contributing_points, 1);
        let indices: Vec<usize> = report.skipped.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 3]);
        assert!(matches!(report.skipped[1].reason, SkipReason::Oracle(_)));
        assert!(matches!(report.skipped[0].reason, SkipReason::Data(_)));
        assert!(report.raster[[0, 9]].is_nan());
        assert_eq!(report.raster[[5, 4]], 1.0);
    }

    #[test]
    fn test_weight_raster_shape_checked() {
        let dsm = flat(5);
        let weights = Array2::ones((4, 5));
        let err = compute_exposure(
            ExposureConfig::default(),
            &dsm,
            &[PointSample::new(2.5, 2.5)],
            WeightSource::Raster(weights.view()),
            &patterned,
        )
        .unwrap_err();
        assert!(matches!(err, ExposureError::Config(_)));
    }

    #[test]
    fn test_refraction_and_curvature_reach_oracle() {
        let dsm = flat(5);
        let oracle = |req: &OracleRequest| -> OracleResult {
            assert_eq!(req.refraction, Some(0.13));
            assert!(req.curvature);
            Ok(Array2::ones(req.window.shape()))
        };
        let cfg = ExposureConfig {
            refraction: Refraction { enabled: true, coefficient: 0.13 },
            curvature: true,
            ..ExposureConfig::default()
        };
        let report = compute_exposure(cfg, &dsm, &[PointSample::new(2.5, 2.5)], WeightSource::PerPoint, &oracle).unwrap();
        assert_eq!(report.contributing_points, 1);
    }

    #[test]
    fn test_cancelled_run_has_no_raster() {
        let dsm = flat(5);
        let cancelled = Arc::new(AtomicBool::new(false));
        let run = ExposureRun::with_handles(
            ExposureConfig::default(),
            Arc::new(AtomicUsize::new(0)),
            cancelled.clone(),
        )
        .unwrap();
        let oracle = |req: &OracleRequest| -> OracleResult {
            cancelled.store(true, Ordering::Relaxed);
            Ok(Array2::ones(req.window.shape()))
        };
        let samples = [PointSample::new(1.5, 1.5), PointSample::new(3.5, 3.5)];
        let err = run
            .run(&dsm, &samples, WeightSource::PerPoint, &oracle)
            .unwrap_err();
        assert!(matches!(err, ExposureError::Cancelled));
        assert_eq!(run.progress(), 1);
    }

    #[test]
    fn test_run_context_reusable_after_cancel() {
        let dsm = flat(5);
        let run = ExposureRun::new(ExposureConfig::default()).unwrap();
        run.cancel();
        let report = run
            .run(&dsm, &[PointSample::new(2.5, 2.5)], WeightSource::PerPoint, &patterned)
            .unwrap();
        assert_eq!(report.contributing_points, 1);
        assert_eq!(run.progress(), 1);
    }

    #[test]
    fn test_precompute_runs_on_worker_pool() {
        let dsm = hilly(12);
        let run = ExposureRun::new(ExposureConfig {
            function: Parametrisation::SolidAngle,
            ..ExposureConfig::default()
        })
        .unwrap();
        let samples = scatter(5, 12.0, 3);
        let threads = Mutex::new(Vec::new());
        let oracle = |req: &OracleRequest| -> OracleResult {
            threads.lock().unwrap().push(rayon::current_num_threads());
            Ok(Array2::ones(req.window.shape()))
        };
        run.run(&dsm, &samples, WeightSource::PerPoint, &oracle).unwrap();
        assert!(threads.into_inner().unwrap().iter().all(|&n| n == 1));

        let reference = compute_corner_elevations(dsm.elevation());
        let cached = dsm.corner_grids();
        assert_eq!(cached.a.dim(), reference.a.dim());
        for (x, y) in cached.c.iter().zip(reference.c.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_empty_input_gives_nodata_raster() {
        let dsm = flat(4);
        let report = compute_exposure(ExposureConfig::default(), &dsm, &[], WeightSource::PerPoint, &patterned).unwrap();
        assert!(report.raster.iter().all(|v| v.is_nan()));
        assert_eq!(report.summary.min, None);
        assert_eq!(report.summary.mean, None);
        assert_eq!(report.summary.nodata_cells, 16);
    }
}
