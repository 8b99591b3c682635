//! NaN-aware accumulation of partial exposure grids.
//!
//! Addition treats NaN as "no contribution": NaN + NaN stays NaN, anything
//! else sums with NaN read as zero. The law is commutative and associative,
//! so merge order and worker partitioning do not change the result.

use ndarray::{s, Array2, ArrayView2, Zip};

use crate::error::{ExposureError, Result};

/// Weighted grid of one source, placed at `offset` in the global frame.
#[derive(Debug, Clone)]
pub struct PartialGrid {
    /// (row, col) of the grid's first cell in the global raster.
    pub offset: (usize, usize),
    pub grid: Array2<f64>,
}

#[inline(always)]
fn nan_add(acc: f64, v: f64) -> f64 {
    match (acc.is_nan(), v.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => v,
        (false, true) => acc,
        (false, false) => acc + v,
    }
}

/// Running sum over the global region.
#[derive(Debug, Clone)]
pub struct CumulativeRaster {
    data: Array2<f64>,
}

impl CumulativeRaster {
    /// All-NaN raster.
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            data: Array2::from_elem(shape, f64::NAN),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn view(&self) -> ArrayView2<f64> {
        self.data.view()
    }

    pub fn into_array(self) -> Array2<f64> {
        self.data
    }

    /// Add a partial grid at its offset.
    pub fn merge(&mut self, partial: &PartialGrid) -> Result<()> {
        let (rows, cols) = self.data.dim();
        let (r0, c0) = partial.offset;
        let (h, w) = partial.grid.dim();
        if r0 + h > rows || c0 + w > cols {
            return Err(ExposureError::worker_fault(format!(
                "partial grid ({h}, {w}) at ({r0}, {c0}) exceeds raster ({rows}, {cols})"
            )));
        }

        Zip::from(self.data.slice_mut(s![r0..r0 + h, c0..c0 + w]))
            .and(&partial.grid)
            .for_each(|acc, &v| *acc = nan_add(*acc, v));
        Ok(())
    }

    /// Add another full raster of the same shape.
    pub fn absorb(&mut self, other: &CumulativeRaster) -> Result<()> {
        if self.shape() != other.shape() {
            let (er, ec) = self.shape();
            let (ar, ac) = other.shape();
            return Err(ExposureError::worker_fault(format!(
                "partial raster shape ({ar}, {ac}) does not match ({er}, {ec})"
            )));
        }
        Zip::from(&mut self.data)
            .and(&other.data)
            .par_for_each(|acc, &v| *acc = nan_add(*acc, v));
        Ok(())
    }
}

/// Fold worker rasters into one; an empty input gives an all-NaN raster.
pub fn reduce(
    shape: (usize, usize),
    partials: impl IntoIterator<Item = CumulativeRaster>,
) -> Result<CumulativeRaster> {
    let mut iter = partials.into_iter();
    let Some(mut total) = iter.next() else {
        return Ok(CumulativeRaster::new(shape));
    };
    for p in iter {
        total.absorb(&p)?;
    }
    if total.shape() != shape {
        return Err(ExposureError::worker_fault("reduced raster has the wrong shape"));
    }
    Ok(total)
}
