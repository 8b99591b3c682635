//! Global raster frame and aligned local windows.
//!
//! Windows are grown outward to whole cells and then clipped to the region,
//! so a window always lies inside the region and keeps the target's cell.

use crate::error::{ExposureError, Result};

/// Tolerance (in cells) when snapping a coordinate to the cell grid.
const SNAP_EPS: f64 = 1e-9;

/// Exposure range: a finite radius or the whole region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Range {
    Finite(f64),
    Infinite,
}

impl Default for Range {
    fn default() -> Self {
        Range::Finite(100.0)
    }
}

/// Global computational region with square cells.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
    pub res: f64,
    rows: usize,
    cols: usize,
}

impl Region {
    /// Build a region, rejecting inverted bounds and non-square cells.
    pub fn new(north: f64, south: f64, east: f64, west: f64, ns_res: f64, ew_res: f64) -> Result<Self> {
        let all = [north, south, east, west, ns_res, ew_res];
        if all.iter().any(|v| !v.is_finite()) {
            return Err(ExposureError::config("region bounds and resolution must be finite"));
        }
        if ns_res <= 0.0 || ew_res <= 0.0 {
            return Err(ExposureError::config(format!(
                "resolution must be positive, got ns={ns_res}, ew={ew_res}"
            )));
        }
        if (ns_res - ew_res).abs() > SNAP_EPS * ns_res.max(ew_res) {
            return Err(ExposureError::config(format!(
                "cells must be square, got ns={ns_res}, ew={ew_res}"
            )));
        }
        if north <= south {
            return Err(ExposureError::config(format!(
                "north ({north}) must be greater than south ({south})"
            )));
        }
        if east <= west {
            return Err(ExposureError::config(format!(
                "east ({east}) must be greater than west ({west})"
            )));
        }

        let rows = whole_cells(north - south, ns_res).ok_or_else(|| {
            ExposureError::config(format!(
                "north-south extent {} is not a whole number of {ns_res} cells",
                north - south
            ))
        })?;
        let cols = whole_cells(east - west, ew_res).ok_or_else(|| {
            ExposureError::config(format!(
                "east-west extent {} is not a whole number of {ew_res} cells",
                east - west
            ))
        })?;
        if rows == 0 || cols == 0 {
            return Err(ExposureError::config("region is smaller than one cell"));
        }

        Ok(Self {
            north,
            south,
            east,
            west,
            res: ns_res,
            rows,
            cols,
        })
    }

    /// Shorthand for a region with a single resolution.
    pub fn square(north: f64, south: f64, east: f64, west: f64, res: f64) -> Result<Self> {
        Self::new(north, south, east, west, res, res)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Cell containing `(x, y)`, or `None` outside the region.
    ///
    /// The south and east boundaries belong to the last row/column.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !(x.is_finite() && y.is_finite()) {
            return None;
        }
        if x < self.west || x > self.east || y < self.south || y > self.north {
            return None;
        }
        let row = (((self.north - y) / self.res).floor() as usize).min(self.rows - 1);
        let col = (((x - self.west) / self.res).floor() as usize).min(self.cols - 1);
        Some((row, col))
    }

    /// Centre coordinates of a cell.
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.west + (col as f64 + 0.5) * self.res,
            self.north - (row as f64 + 0.5) * self.res,
        )
    }

    /// Radius used for window derivation; `Infinite` covers the whole region.
    pub fn resolve_range(&self, range: Range) -> f64 {
        match range {
            Range::Finite(r) => r,
            Range::Infinite => (self.north - self.south).max(self.east - self.west),
        }
    }

    /// Square window of half-width `range` around `(center_x, center_y)`,
    /// grown outward to the cell grid and clipped to the region.
    pub fn clip_window(&self, center_x: f64, center_y: f64, range: f64) -> Result<LocalWindow> {
        if !(range.is_finite() && range > 0.0) {
            return Err(ExposureError::config(format!(
                "exposure range must be positive and finite, got {range}"
            )));
        }
        let Some((cell_row, cell_col)) = self.cell_of(center_x, center_y) else {
            return Err(ExposureError::config(format!(
                "window centre ({center_x}, {center_y}) lies outside the region"
            )));
        };

        let res = self.res;
        let north = self.south + snap_ceil((center_y + range - self.south) / res) * res;
        let south = self.south + snap_floor((center_y - range - self.south) / res) * res;
        let east = self.west + snap_ceil((center_x + range - self.west) / res) * res;
        let west = self.west + snap_floor((center_x - range - self.west) / res) * res;

        // The target's own cell is always part of the window.
        let cell_north = self.north - cell_row as f64 * res;
        let cell_west = self.west + cell_col as f64 * res;
        let north = north.max(cell_north).min(self.north);
        let south = south.min(cell_north - res).max(self.south);
        let east = east.max(cell_west + res).min(self.east);
        let west = west.min(cell_west).max(self.west);

        let row_off = ((self.north - north) / res).round() as usize;
        let col_off = ((west - self.west) / res).round() as usize;
        let rows = ((((north - south) / res).round() as usize).max(1)).min(self.rows - row_off);
        let cols = ((((east - west) / res).round() as usize).max(1)).min(self.cols - col_off);

        Ok(LocalWindow {
            north,
            south,
            east,
            west,
            rows,
            cols,
            row_off,
            col_off,
            target_row: (north - center_y) / res,
            target_col: (center_x - west) / res,
        })
    }
}

/// Region-aligned sub-window around one target point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalWindow {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
    pub rows: usize,
    pub cols: usize,
    /// Offset of the window's first row inside the region.
    pub row_off: usize,
    /// Offset of the window's first column inside the region.
    pub col_off: usize,
    /// Fractional row of the target, in cells from the window's north edge.
    pub target_row: f64,
    /// Fractional column of the target, in cells from the window's west edge.
    pub target_col: f64,
}

impl LocalWindow {
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn offset(&self) -> (usize, usize) {
        (self.row_off, self.col_off)
    }

    /// Cell of the window holding the target point.
    pub fn target_cell(&self) -> (usize, usize) {
        let row = (self.target_row.max(0.0).floor() as usize).min(self.rows - 1);
        let col = (self.target_col.max(0.0).floor() as usize).min(self.cols - 1);
        (row, col)
    }
}

/// Number of cells spanning `extent`, if it is a whole number.
fn whole_cells(extent: f64, res: f64) -> Option<usize> {
    let n = extent / res;
    let r = n.round();
    ((n - r).abs() <= SNAP_EPS * r.max(1.0)).then_some(r as usize)
}

#[inline]
fn snap_ceil(v: f64) -> f64 {
    let r = v.round();
    if (v - r).abs() < SNAP_EPS {
        r
    } else {
        v.ceil()
    }
}

#[inline]
fn snap_floor(v: f64) -> f64 {
    let r = v.round();
    if (v - r).abs() < SNAP_EPS {
        r
    } else {
        v.floor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn region_10() -> Region {
        Region::square(10.0, 0.0, 10.0, 0.0, 1.0).unwrap()
    }

    #[test]
    fn test_region_shape() {
        let reg = Region::square(100.0, 50.0, 30.0, 0.0, 2.0).unwrap();
        assert_eq!(reg.shape(), (25, 15));
    }

    #[test]
    fn test_region_rejects_non_square_cells() {
        let err = Region::new(10.0, 0.0, 10.0, 0.0, 1.0, 2.0).unwrap_err();
        assert!(matches!(err, ExposureError::Config(_)));
    }

    #[test]
    fn test_region_rejects_inverted_bounds() {
        assert!(Region::square(0.0, 10.0, 10.0, 0.0, 1.0).is_err());
        assert!(Region::square(10.0, 0.0, 0.0, 10.0, 1.0).is_err());
        assert!(Region::square(10.0, 0.0, 10.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_region_rejects_partial_cells() {
        let err = Region::square(10.5, 0.0, 10.0, 0.0, 1.0).unwrap_err();
        assert!(matches!(err, ExposureError::Config(_)));
        assert!(Region::square(10.0, 0.0, 10.25, 0.0, 0.5).is_err());
        // float noise in the extent is tolerated
        let reg = Region::square(0.3, 0.0, 0.3, 0.0, 0.1).unwrap();
        assert_eq!(reg.shape(), (3, 3));
    }

    #[test]
    fn test_window_bounds_match_offsets() {
        let reg = Region::square(1_000.0, 400.0, 900.0, 150.0, 2.5).unwrap();
        for (x, y, range) in [(160.0, 990.0, 7.0), (523.7, 611.2, 40.0), (899.0, 401.0, 12.5)] {
            let w = reg.clip_window(x, y, range).unwrap();
            assert_relative_eq!(w.north, reg.north - w.row_off as f64 * reg.res, epsilon = 1e-9);
            assert_relative_eq!(w.west, reg.west + w.col_off as f64 * reg.res, epsilon = 1e-9);
            assert_relative_eq!(w.north - w.south, w.rows as f64 * reg.res, epsilon = 1e-9);
            assert_relative_eq!(w.east - w.west, w.cols as f64 * reg.res, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_cell_of() {
        let reg = region_10();
        assert_eq!(reg.cell_of(0.5, 9.5), Some((0, 0)));
        assert_eq!(reg.cell_of(9.5, 0.5), Some((9, 9)));
        assert_eq!(reg.cell_of(10.0, 0.0), Some((9, 9)));
        assert_eq!(reg.cell_of(10.5, 5.0), None);
    }

    #[test]
    fn test_window_interior_grows_outward() {
        let reg = region_10();
        let w = reg.clip_window(5.5, 5.5, 2.0).unwrap();
        // 5.5 ± 2 → [3.5, 7.5] grows to [3, 8]
        assert_relative_eq!(w.west, 3.0);
        assert_relative_eq!(w.east, 8.0);
        assert_relative_eq!(w.south, 3.0);
        assert_relative_eq!(w.north, 8.0);
        assert_eq!(w.shape(), (5, 5));
        assert_eq!(w.offset(), (2, 3));
        assert_relative_eq!(w.target_row, 2.5);
        assert_relative_eq!(w.target_col, 2.5);
        assert_eq!(w.target_cell(), (2, 2));
    }

    #[test]
    fn test_window_exact_multiple_does_not_grow() {
        let reg = region_10();
        let w = reg.clip_window(5.0, 5.0, 2.0).unwrap();
        assert_eq!(w.shape(), (4, 4));
        assert_eq!(w.offset(), (3, 3));
    }

    #[test]
    fn test_window_clipped_at_edges() {
        let reg = region_10();
        let w = reg.clip_window(0.5, 9.5, 3.0).unwrap();
        assert_relative_eq!(w.north, 10.0);
        assert_relative_eq!(w.west, 0.0);
        assert_eq!(w.offset(), (0, 0));
        assert_eq!(w.shape(), (4, 4));
        assert_relative_eq!(w.target_row, 0.5);
        assert_relative_eq!(w.target_col, 0.5);
    }

    #[test]
    fn test_window_corner_with_infinite_range_is_full_region() {
        let reg = region_10();
        let range = reg.resolve_range(Range::Infinite);
        assert_relative_eq!(range, 10.0);
        let w = reg.clip_window(0.0, 0.0, range).unwrap();
        assert_eq!(w.offset(), (0, 0));
        assert_eq!(w.shape(), reg.shape());
    }

    #[test]
    fn test_window_always_contained() {
        let reg = Region::square(37.0, 3.0, 91.0, 12.0, 1.0).unwrap();
        for i in 0..40 {
            let x = 12.0 + (i as f64 * 7.31) % 79.0;
            let y = 3.0 + (i as f64 * 3.17) % 34.0;
            for range in [0.4, 1.0, 5.5, 20.0, 500.0] {
                let w = reg.clip_window(x, y, range).unwrap();
                assert!(w.rows > 0 && w.cols > 0);
                assert!(w.row_off + w.rows <= reg.rows());
                assert!(w.col_off + w.cols <= reg.cols());
                assert!(w.north <= reg.north && w.south >= reg.south);
                assert!(w.east <= reg.east && w.west >= reg.west);
                let (tr, tc) = w.target_cell();
                assert!(tr < w.rows && tc < w.cols);
            }
        }
    }

    #[test]
    fn test_window_rejects_bad_range() {
        let reg = region_10();
        assert!(reg.clip_window(5.0, 5.0, 0.0).is_err());
        assert!(reg.clip_window(5.0, 5.0, -3.0).is_err());
        assert!(reg.clip_window(5.0, 5.0, f64::INFINITY).is_err());
    }
}
