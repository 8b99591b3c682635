//! Exposure-source points and their validation against the DSM.

use ndarray::ArrayView2;

use crate::dsm::{CornerElevations, DerivedKind, Dsm, SlopeComponents};
use crate::error::{DataError, OracleError};

/// Candidate point as delivered by the sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointSample {
    pub x: f64,
    pub y: f64,
    pub weight: Option<f64>,
}

impl PointSample {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, weight: None }
    }

    pub fn weighted(x: f64, y: f64, weight: f64) -> Self {
        Self {
            x,
            y,
            weight: Some(weight),
        }
    }
}

/// Where point weights come from.
#[derive(Debug, Clone, Copy, Default)]
pub enum WeightSource<'a> {
    /// Per-point weight, 1.0 when the sample has none.
    #[default]
    PerPoint,
    /// Value of a region-aligned weight raster under each point.
    Raster(ArrayView2<'a, f64>),
}

/// Validated exposure source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetPoint {
    /// Position in the input stream.
    pub index: usize,
    pub x: f64,
    pub y: f64,
    /// Terrain elevation under the point.
    pub elevation: f64,
    pub weight: f64,
    pub corners: Option<CornerElevations>,
    pub slopes: Option<SlopeComponents>,
}

/// Why a point did not contribute.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Data(DataError),
    Oracle(OracleError),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Data(e) => write!(f, "{e}"),
            SkipReason::Oracle(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedPoint {
    pub index: usize,
    pub x: f64,
    pub y: f64,
    pub reason: SkipReason,
}

/// Turn raw samples into target points, dropping the ones without data.
///
/// `attributes` names the derived grid the selected weighting needs; it must
/// already be precomputed or is computed here on first use.
pub fn prepare_targets(
    samples: &[PointSample],
    dsm: &Dsm,
    weights: WeightSource<'_>,
    attributes: Option<DerivedKind>,
) -> (Vec<TargetPoint>, Vec<SkippedPoint>) {
    let mut targets = Vec::with_capacity(samples.len());
    let mut skipped = Vec::new();

    for (index, sample) in samples.iter().enumerate() {
        match prepare_one(index, sample, dsm, weights, attributes) {
            Ok(t) => targets.push(t),
            Err(e) => {
                tracing::warn!(
                    point = index,
                    x = sample.x,
                    y = sample.y,
                    error = %e,
                    "Dropping exposure source"
                );
                skipped.push(SkippedPoint {
                    index,
                    x: sample.x,
                    y: sample.y,
                    reason: SkipReason::Data(e),
                });
            }
        }
    }

    (targets, skipped)
}

fn prepare_one(
    index: usize,
    sample: &PointSample,
    dsm: &Dsm,
    weights: WeightSource<'_>,
    attributes: Option<DerivedKind>,
) -> Result<TargetPoint, DataError> {
    let (x, y) = (sample.x, sample.y);
    let (row, col) = dsm
        .region()
        .cell_of(x, y)
        .ok_or(DataError::OutsideRegion { x, y })?;
    let elevation = dsm
        .elevation_at(row, col)
        .ok_or(DataError::NoElevation { x, y })?;

    let weight = match weights {
        WeightSource::PerPoint => sample.weight.unwrap_or(1.0),
        WeightSource::Raster(grid) => grid.get((row, col)).copied().unwrap_or(f64::NAN),
    };
    if !weight.is_finite() {
        return Err(DataError::InvalidWeight { x, y, weight });
    }

    let mut corners = None;
    let mut slopes = None;
    match attributes {
        Some(DerivedKind::CornerElevations) => {
            corners = Some(dsm.corners_at(row, col).ok_or(DataError::NoAttributes {
                x,
                y,
                attribute: "corner elevations",
            })?);
        }
        Some(DerivedKind::SlopeComponents) => {
            slopes = Some(dsm.slopes_at(row, col).ok_or(DataError::NoAttributes {
                x,
                y,
                attribute: "slope components",
            })?);
        }
        None => {}
    }

    Ok(TargetPoint {
        index,
        x,
        y,
        elevation,
        weight,
        corners,
        slopes,
    })
}
