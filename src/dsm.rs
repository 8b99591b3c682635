//! Elevation accessor with lazily cached derived grids.
//!
//! Corner elevations feed the solid-angle weighting, slope components feed
//! visual magnitude. Each derived grid is computed once per `Dsm` through a
//! `OnceLock`, so the precompute finishes before any worker reads it.

use std::sync::OnceLock;

use ndarray::{s, Array2, ArrayView2};
use rayon::prelude::*;

use crate::error::{ExposureError, Result};
use crate::region::{LocalWindow, Region};

/// Derived grid kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedKind {
    CornerElevations,
    SlopeComponents,
}

/// Corner elevations of one cell: A north-west, B north-east, C south-east,
/// D south-west.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CornerElevations {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl CornerElevations {
    pub fn is_valid(&self) -> bool {
        [self.a, self.b, self.c, self.d].iter().all(|v| v.is_finite())
    }
}

/// Slope angles (radians) of one cell along the east-west and north-south axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlopeComponents {
    /// Positive when elevation rises toward east.
    pub ew: f64,
    /// Positive when elevation rises toward north.
    pub ns: f64,
}

impl SlopeComponents {
    pub fn is_valid(&self) -> bool {
        self.ew.is_finite() && self.ns.is_finite()
    }
}

/// Corner elevation grids.
pub struct CornerGrids {
    pub a: Array2<f64>,
    pub b: Array2<f64>,
    pub c: Array2<f64>,
    pub d: Array2<f64>,
}

/// Slope angle grids (radians).
pub struct SlopeGrids {
    pub ew: Array2<f64>,
    pub ns: Array2<f64>,
}

/// Read-only digital surface model over the global region. NaN is NoData.
pub struct Dsm {
    region: Region,
    elevation: Array2<f64>,
    corners: OnceLock<CornerGrids>,
    slopes: OnceLock<SlopeGrids>,
}

impl Dsm {
    pub fn new(region: Region, elevation: Array2<f64>) -> Result<Self> {
        if elevation.dim() != region.shape() {
            let (er, ec) = region.shape();
            let (ar, ac) = elevation.dim();
            return Err(ExposureError::config(format!(
                "elevation grid shape ({ar}, {ac}) does not match region ({er}, {ec})"
            )));
        }
        Ok(Self {
            region,
            elevation,
            corners: OnceLock::new(),
            slopes: OnceLock::new(),
        })
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn elevation(&self) -> ArrayView2<f64> {
        self.elevation.view()
    }

    /// Elevation of a cell, `None` for NoData or out-of-range indices.
    pub fn elevation_at(&self, row: usize, col: usize) -> Option<f64> {
        self.elevation
            .get((row, col))
            .copied()
            .filter(|v| v.is_finite())
    }

    /// Elevation sub-grid under a local window.
    pub fn window(&self, window: &LocalWindow) -> ArrayView2<f64> {
        self.elevation.slice(s![
            window.row_off..window.row_off + window.rows,
            window.col_off..window.col_off + window.cols
        ])
    }

    /// Force computation of a derived grid kind.
    pub fn precompute(&self, kind: DerivedKind) {
        match kind {
            DerivedKind::CornerElevations => {
                self.corner_grids();
            }
            DerivedKind::SlopeComponents => {
                self.slope_grids();
            }
        }
    }

    pub fn corner_grids(&self) -> &CornerGrids {
        self.corners
            .get_or_init(|| compute_corner_elevations(self.elevation.view()))
    }

    pub fn slope_grids(&self) -> &SlopeGrids {
        self.slopes
            .get_or_init(|| compute_slope_components(self.elevation.view(), self.region.res))
    }

    pub fn corners_at(&self, row: usize, col: usize) -> Option<CornerElevations> {
        let g = self.corner_grids();
        let corners = CornerElevations {
            a: *g.a.get((row, col))?,
            b: *g.b.get((row, col))?,
            c: *g.c.get((row, col))?,
            d: *g.d.get((row, col))?,
        };
        corners.is_valid().then_some(corners)
    }

    pub fn slopes_at(&self, row: usize, col: usize) -> Option<SlopeComponents> {
        let g = self.slope_grids();
        let slopes = SlopeComponents {
            ew: *g.ew.get((row, col))?,
            ns: *g.ns.get((row, col))?,
        };
        slopes.is_valid().then_some(slopes)
    }
}

/// Mean of the finite cells among `cells`, NaN if there are none.
#[inline]
fn finite_mean(cells: [Option<f64>; 4]) -> f64 {
    let (sum, n) = cells
        .iter()
        .flatten()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), &v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// Corner elevations as the mean of the cells sharing each corner.
///
/// Neighbours outside the grid or NoData are left out of the mean.
pub(crate) fn compute_corner_elevations(dsm: ArrayView2<f64>) -> CornerGrids {
    let (rows, cols) = dsm.dim();
    let at = |r: isize, c: isize| -> Option<f64> {
        if r < 0 || c < 0 || r >= rows as isize || c >= cols as isize {
            None
        } else {
            Some(dsm[[r as usize, c as usize]])
        }
    };

    let per_row: Vec<Vec<[f64; 4]>> = (0..rows)
        .into_par_iter()
        .map(|row| {
            let r = row as isize;
            (0..cols)
                .map(|col| {
                    let c = col as isize;
                    let center = at(r, c);
                    [
                        finite_mean([at(r - 1, c - 1), at(r - 1, c), at(r, c - 1), center]),
                        finite_mean([at(r - 1, c), at(r - 1, c + 1), center, at(r, c + 1)]),
                        finite_mean([center, at(r, c + 1), at(r + 1, c), at(r + 1, c + 1)]),
                        finite_mean([at(r, c - 1), center, at(r + 1, c - 1), at(r + 1, c)]),
                    ]
                })
                .collect()
        })
        .collect();

    let mut grids = CornerGrids {
        a: Array2::from_elem((rows, cols), f64::NAN),
        b: Array2::from_elem((rows, cols), f64::NAN),
        c: Array2::from_elem((rows, cols), f64::NAN),
        d: Array2::from_elem((rows, cols), f64::NAN),
    };
    for (row, values) in per_row.into_iter().enumerate() {
        for (col, [a, b, c, d]) in values.into_iter().enumerate() {
            grids.a[[row, col]] = a;
            grids.b[[row, col]] = b;
            grids.c[[row, col]] = c;
            grids.d[[row, col]] = d;
        }
    }
    grids
}

/// Directional slope angles using Horn's 3×3 kernel.
///
/// Edge neighbours replicate the nearest in-grid cell and NoData neighbours
/// take the centre value, so only NoData centres yield NaN.
pub(crate) fn compute_slope_components(dsm: ArrayView2<f64>, cell_size: f64) -> SlopeGrids {
    let (rows, cols) = dsm.dim();
    let eight_cell_size = 8.0 * cell_size;

    let per_row: Vec<Vec<(f64, f64)>> = (0..rows)
        .into_par_iter()
        .map(|row| {
            (0..cols)
                .map(|col| {
                    let e = dsm[[row, col]];
                    if !e.is_finite() {
                        return (f64::NAN, f64::NAN);
                    }
                    let z = |dr: isize, dc: isize| -> f64 {
                        let r = (row as isize + dr).clamp(0, rows as isize - 1) as usize;
                        let c = (col as isize + dc).clamp(0, cols as isize - 1) as usize;
                        let v = dsm[[r, c]];
                        if v.is_finite() {
                            v
                        } else {
                            e
                        }
                    };
                    let (a, b, c) = (z(-1, -1), z(-1, 0), z(-1, 1));
                    let (d, f) = (z(0, -1), z(0, 1));
                    let (g, h, i) = (z(1, -1), z(1, 0), z(1, 1));

                    let dz_dx = ((c + 2.0 * f + i) - (a + 2.0 * d + g)) / eight_cell_size;
                    let dz_dy = ((a + 2.0 * b + c) - (g + 2.0 * h + i)) / eight_cell_size;
                    (dz_dx.atan(), dz_dy.atan())
                })
                .collect()
        })
        .collect();

    let mut grids = SlopeGrids {
        ew: Array2::from_elem((rows, cols), f64::NAN),
        ns: Array2::from_elem((rows, cols), f64::NAN),
    };
    for (row, values) in per_row.into_iter().enumerate() {
        for (col, (ew, ns)) in values.into_iter().enumerate() {
            grids.ew[[row, col]] = ew;
            grids.ns[[row, col]] = ns;
        }
    }
    grids
}
