//! Parametrisation of binary viewsheds into weighted exposure grids.
//!
//! Every function maps NaN to NaN and invisible cells to 0; visible cells
//! get `weight` times a geometric factor. Geometry is measured from the
//! centre of each observer cell to the exposure source:
//!
//! - `dx`: east offset, `dy`: north offset (planar, map units)
//! - `dz`: observer eye elevation minus source elevation
//!
//! References:
//! - Chamberlain BC, Meitner MJ (2013) A route-based visibility analysis
//!   for landscape management.
//! - Van Oosterom A, Strackee J (1983) The solid angle of a plane triangle.

use ndarray::{Array2, ArrayView2, Zip};

use crate::dsm::{CornerElevations, DerivedKind, SlopeComponents};
use crate::error::{ExposureError, Result};
use crate::region::{LocalWindow, Range, Region};
use crate::target::TargetPoint;

/// Distances at or below this fraction of a cell count as zero.
const ZERO_DISTANCE: f64 = 1e-9;

/// Weighting law applied to every partial viewshed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Parametrisation {
    /// Visible cells get the point weight.
    Binary,
    /// Cell area over squared planar distance.
    #[default]
    DistanceDecay,
    /// Full weight up to `b1_distance`, then a Cauchy-type falloff to the range.
    FuzzyViewshed { b1_distance: f64 },
    /// Cell area over squared distance, scaled by the incidence on the source's
    /// slope in the east-west and north-south planes.
    VisualMagnitude,
    /// Solid angle subtended by the source's cell.
    SolidAngle,
}

impl Parametrisation {
    /// Parse a function name as used by the command-line tool.
    pub fn from_name(name: &str, b1_distance: Option<f64>) -> Result<Self> {
        match name {
            "binary" => Ok(Self::Binary),
            "distance_decay" => Ok(Self::DistanceDecay),
            "fuzzy_viewshed" => {
                let b1_distance = b1_distance.ok_or_else(|| {
                    ExposureError::config("fuzzy_viewshed requires b1_distance")
                })?;
                Ok(Self::FuzzyViewshed { b1_distance })
            }
            "visual_magnitude" => Ok(Self::VisualMagnitude),
            "solid_angle" => Ok(Self::SolidAngle),
            other => Err(ExposureError::config(format!(
                "unknown parametrisation function '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::DistanceDecay => "distance_decay",
            Self::FuzzyViewshed { .. } => "fuzzy_viewshed",
            Self::VisualMagnitude => "visual_magnitude",
            Self::SolidAngle => "solid_angle",
        }
    }

    /// Derived grid the function reads for each source point.
    pub fn required_attributes(&self) -> Option<DerivedKind> {
        match self {
            Self::VisualMagnitude => Some(DerivedKind::SlopeComponents),
            Self::SolidAngle => Some(DerivedKind::CornerElevations),
            Self::Binary | Self::DistanceDecay | Self::FuzzyViewshed { .. } => None,
        }
    }

    /// Check the function parameters against the exposure range.
    pub fn validate(&self, range: Range) -> Result<()> {
        if let Self::FuzzyViewshed { b1_distance } = *self {
            let Range::Finite(range) = range else {
                return Err(ExposureError::config(
                    "fuzzy_viewshed needs a finite exposure range",
                ));
            };
            if !(b1_distance.is_finite() && b1_distance >= 0.0) {
                return Err(ExposureError::config(format!(
                    "b1_distance must be non-negative, got {b1_distance}"
                )));
            }
            if b1_distance >= range {
                return Err(ExposureError::config(format!(
                    "b1_distance ({b1_distance}) must be smaller than the exposure range ({range})"
                )));
            }
        }
        Ok(())
    }

    /// Weight a partial viewshed over `window`.
    ///
    /// `dsm_window` is the elevation under the window, `target_height` the eye
    /// height added to it for observer cells.
    #[allow(clippy::too_many_arguments)]
    pub fn parametrise(
        &self,
        window: &LocalWindow,
        target: &TargetLocal,
        viewshed: ArrayView2<f64>,
        region: &Region,
        range: f64,
        dsm_window: ArrayView2<f64>,
        target_height: f64,
    ) -> Array2<f64> {
        let geom = Geometry {
            res: region.res,
            target_row: target.row,
            target_col: target.col,
            own_cell: window.target_cell(),
        };
        let weight = target.weight;

        match *self {
            Self::Binary => map_visible(viewshed, dsm_window, |_, _| weight),
            Self::DistanceDecay => map_visible(viewshed, dsm_window, |(r, c), _| {
                let (dx, dy) = geom.planar_offset(r, c);
                let d = geom.floor_distance(r, c, dx.hypot(dy));
                distance_decay(d, geom.res) * weight
            }),
            Self::FuzzyViewshed { b1_distance } => {
                map_visible(viewshed, dsm_window, |(r, c), _| {
                    let (dx, dy) = geom.planar_offset(r, c);
                    fuzzy_membership(dx.hypot(dy), b1_distance, range) * weight
                })
            }
            Self::VisualMagnitude => {
                let Some(slopes) = target.slopes else {
                    return no_contribution(viewshed);
                };
                map_visible(viewshed, dsm_window, |(r, c), z| {
                    let (dx, dy) = geom.planar_offset(r, c);
                    let dz = z + target_height - target.elevation;
                    let d = geom.floor_distance(r, c, (dx * dx + dy * dy + dz * dz).sqrt());
                    visual_magnitude(dx, dy, dz, d, slopes, geom.res) * weight
                })
            }
            Self::SolidAngle => {
                let Some(corners) = target.corners else {
                    return no_contribution(viewshed);
                };
                let (cell_row, cell_col) = geom.own_cell;
                let quad = CellQuad::new(cell_row, cell_col, corners, geom.res);
                map_visible(viewshed, dsm_window, |(r, c), z| {
                    let (x, y) = geom.cell_center(r, c);
                    quad.solid_angle([x, y, z + target_height]) * weight
                })
            }
        }
    }
}

/// All-NaN grid for a source lacking the attributes its weighting needs.
fn no_contribution(viewshed: ArrayView2<f64>) -> Array2<f64> {
    Array2::from_elem(viewshed.raw_dim(), f64::NAN)
}

/// Source attributes expressed in the local window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetLocal {
    /// Fractional row inside the window.
    pub row: f64,
    /// Fractional column inside the window.
    pub col: f64,
    pub elevation: f64,
    pub weight: f64,
    pub corners: Option<CornerElevations>,
    pub slopes: Option<SlopeComponents>,
}

impl TargetLocal {
    pub fn new(target: &TargetPoint, window: &LocalWindow) -> Self {
        Self {
            row: window.target_row,
            col: window.target_col,
            elevation: target.elevation,
            weight: target.weight,
            corners: target.corners,
            slopes: target.slopes,
        }
    }
}

struct Geometry {
    res: f64,
    target_row: f64,
    target_col: f64,
    /// Window cell holding the source.
    own_cell: (usize, usize),
}

impl Geometry {
    /// Distances inside the source's own cell never drop below the cell size.
    #[inline]
    fn floor_distance(&self, row: usize, col: usize, d: f64) -> f64 {
        if (row, col) == self.own_cell {
            d.max(self.res)
        } else {
            d
        }
    }

    /// East/north offset of a cell centre from the source.
    #[inline]
    fn planar_offset(&self, row: usize, col: usize) -> (f64, f64) {
        (
            (col as f64 + 0.5 - self.target_col) * self.res,
            (self.target_row - row as f64 - 0.5) * self.res,
        )
    }

    /// Cell centre in window coordinates (east, north), origin at the
    /// window's north-west corner.
    #[inline]
    fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        ((col as f64 + 0.5) * self.res, -(row as f64 + 0.5) * self.res)
    }
}

/// Apply `f` to visible cells; NaN stays NaN, invisible cells become 0.
fn map_visible<F>(viewshed: ArrayView2<f64>, dsm_window: ArrayView2<f64>, f: F) -> Array2<f64>
where
    F: Fn((usize, usize), f64) -> f64,
{
    let mut out = Array2::<f64>::zeros(viewshed.raw_dim());
    Zip::indexed(&mut out)
        .and(&viewshed)
        .and(&dsm_window)
        .for_each(|idx, o, &v, &z| {
            *o = if v.is_nan() {
                f64::NAN
            } else if v == 0.0 {
                0.0
            } else {
                f(idx, z)
            };
        });
    out
}

/// Substitute a zero distance with the cell size.
#[inline]
fn nonzero_distance(d: f64, res: f64) -> f64 {
    if d <= ZERO_DISTANCE * res {
        res
    } else {
        d
    }
}

#[inline]
fn distance_decay(d: f64, res: f64) -> f64 {
    let d = nonzero_distance(d, res);
    (res * res) / (d * d)
}

#[inline]
fn fuzzy_membership(d: f64, b1: f64, range: f64) -> f64 {
    if d <= b1 {
        1.0
    } else {
        let t = (d - b1) / (range - b1);
        1.0 / (1.0 + t * t)
    }
}

/// Cosine of the angle between the slope normal and a view vector in one
/// vertical plane, with angles over 90° reflected back.
#[inline]
fn incidence_cos(slope: f64, horizontal: f64, vertical: f64) -> f64 {
    let len = horizontal.hypot(vertical);
    if len == 0.0 {
        return 1.0;
    }
    let (nx, nz) = (-slope.sin(), slope.cos());
    ((nx * horizontal + nz * vertical) / len).abs().min(1.0)
}

#[inline]
fn visual_magnitude(dx: f64, dy: f64, dz: f64, d: f64, slopes: SlopeComponents, res: f64) -> f64 {
    if dz.is_nan() {
        return f64::NAN;
    }
    let d = nonzero_distance(d, res);
    let cos_beta = incidence_cos(slopes.ew, dx, dz);
    let cos_theta = incidence_cos(slopes.ns, dy, dz);
    cos_beta * cos_theta * (res * res) / (d * d)
}

type Vec3 = [f64; 3];

#[inline]
fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline]
fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
fn norm(a: Vec3) -> f64 {
    dot(a, a).sqrt()
}

/// Signed solid angle of triangle (r1, r2, r3) seen from the origin.
fn triangle_solid_angle(r1: Vec3, r2: Vec3, r3: Vec3) -> f64 {
    let (n1, n2, n3) = (norm(r1), norm(r2), norm(r3));
    let numer = dot(r1, cross(r2, r3));
    let denom = n1 * n2 * n3 + dot(r1, r2) * n3 + dot(r1, r3) * n2 + dot(r2, r3) * n1;
    2.0 * numer.atan2(denom)
}

/// Corners of the source cell in window coordinates.
struct CellQuad {
    a: Vec3,
    b: Vec3,
    c: Vec3,
    d: Vec3,
}

impl CellQuad {
    fn new(row: usize, col: usize, corners: CornerElevations, res: f64) -> Self {
        let west = col as f64 * res;
        let east = west + res;
        let north = -(row as f64) * res;
        let south = north - res;
        Self {
            a: [west, north, corners.a],
            b: [east, north, corners.b],
            c: [east, south, corners.c],
            d: [west, south, corners.d],
        }
    }

    /// Solid angle of the quad from `eye`, split along the A–C diagonal.
    fn solid_angle(&self, eye: Vec3) -> f64 {
        if eye[2].is_nan() {
            return f64::NAN;
        }
        let (ra, rb, rc, rd) = (
            sub(self.a, eye),
            sub(self.b, eye),
            sub(self.c, eye),
            sub(self.d, eye),
        );
        (triangle_solid_angle(ra, rb, rc) + triangle_solid_angle(ra, rc, rd)).abs()
    }
}
