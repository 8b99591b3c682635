//! Local compute unit and the shared-nothing worker pool.
//!
//! Each worker owns a full-size cumulative raster and walks its contiguous
//! slice of source points sequentially: window → oracle → parametrise →
//! merge. Workers only share read-only inputs and the progress/cancel
//! atomics; their rasters are reduced after the join.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rayon::prelude::*;
use rayon::ThreadPool;

use crate::accumulate::{CumulativeRaster, PartialGrid};
use crate::dsm::Dsm;
use crate::error::{ExposureError, OracleError, Result};
use crate::oracle::{validate_viewshed, OracleRequest, VisibilityOracle};
use crate::parametrise::{Parametrisation, TargetLocal};
use crate::target::{SkipReason, SkippedPoint, TargetPoint};

/// Height of the exposure source above the terrain in the viewshed call.
const SOURCE_HEIGHT: f64 = 0.0;

/// Read-only inputs shared by all workers of a run.
pub struct ComputeContext<'a> {
    pub dsm: &'a Dsm,
    pub oracle: &'a dyn VisibilityOracle,
    pub function: Parametrisation,
    /// Resolved exposure range.
    pub range: f64,
    /// Eye height of the people looking at the sources.
    pub observer_height: f64,
    pub curvature: bool,
    pub refraction: Option<f64>,
}

/// Weighted partial grid for one source point.
pub fn compute_partial(
    target: &TargetPoint,
    ctx: &ComputeContext<'_>,
) -> std::result::Result<PartialGrid, OracleError> {
    let region = ctx.dsm.region();
    let window = region
        .clip_window(target.x, target.y, ctx.range)
        .map_err(|e| OracleError::failed(e.to_string()))?;

    let request = OracleRequest {
        x: target.x,
        y: target.y,
        observer_height: SOURCE_HEIGHT,
        target_height: ctx.observer_height,
        max_distance: ctx.range,
        curvature: ctx.curvature,
        refraction: ctx.refraction,
        window,
    };
    let viewshed = ctx.oracle.viewshed(&request)?;
    validate_viewshed(&viewshed, &window)?;

    let grid = ctx.function.parametrise(
        &window,
        &TargetLocal::new(target, &window),
        viewshed.view(),
        region,
        ctx.range,
        ctx.dsm.window(&window),
        ctx.observer_height,
    );

    Ok(PartialGrid {
        offset: window.offset(),
        grid,
    })
}

/// Result of one worker.
#[derive(Debug)]
pub struct WorkerOutput {
    pub raster: CumulativeRaster,
    pub skipped: Vec<SkippedPoint>,
    pub contributed: usize,
}

/// Split `targets` into at most `n` contiguous, near-equal slices.
pub fn partition(targets: &[TargetPoint], n: usize) -> Vec<&[TargetPoint]> {
    let parts = n.clamp(1, targets.len().max(1));
    let base = targets.len() / parts;
    let extra = targets.len() % parts;

    let mut slices = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        slices.push(&targets[start..start + len]);
        start += len;
    }
    slices
}

fn run_worker(
    worker: usize,
    targets: &[TargetPoint],
    ctx: &ComputeContext<'_>,
    progress: &AtomicUsize,
    cancel: &AtomicBool,
) -> Result<WorkerOutput> {
    tracing::debug!(worker, points = targets.len(), "Worker started");

    let mut raster = CumulativeRaster::new(ctx.dsm.region().shape());
    let mut skipped = Vec::new();
    let mut contributed = 0;

    for target in targets {
        if cancel.load(Ordering::Relaxed) {
            return Err(ExposureError::Cancelled);
        }

        match compute_partial(target, ctx) {
            Ok(partial) => {
                raster.merge(&partial)?;
                contributed += 1;
            }
            Err(e) => {
                tracing::warn!(
                    worker,
                    point = target.index,
                    x = target.x,
                    y = target.y,
                    error = %e,
                    "Skipping exposure source"
                );
                skipped.push(SkippedPoint {
                    index: target.index,
                    x: target.x,
                    y: target.y,
                    reason: SkipReason::Oracle(e),
                });
            }
        }
        progress.fetch_add(1, Ordering::Relaxed);
    }

    tracing::debug!(worker, contributed, skipped = skipped.len(), "Worker finished");
    Ok(WorkerOutput {
        raster,
        skipped,
        contributed,
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

/// Run one worker per partition on `pool` and wait for all of them.
///
/// A panicking worker becomes `WorkerFault`; any fatal worker error aborts
/// the whole run.
pub fn run_workers(
    pool: &ThreadPool,
    targets: &[TargetPoint],
    workers: usize,
    ctx: &ComputeContext<'_>,
    progress: &AtomicUsize,
    cancel: &AtomicBool,
) -> Result<Vec<WorkerOutput>> {
    let partitions = partition(targets, workers);

    pool.install(|| {
        partitions
            .into_par_iter()
            .enumerate()
            .map(|(worker, part)| {
                panic::catch_unwind(AssertUnwindSafe(|| {
                    run_worker(worker, part, ctx, progress, cancel)
                }))
                .map_err(|payload| {
                    ExposureError::worker_fault(format!(
                        "worker {worker} panicked: {}",
                        panic_message(payload)
                    ))
                })?
            })
            .collect::<Result<Vec<_>>>()
    })
}
