use time::OffsetDateTime;

use crate::{squared_planar_distance, BoundingBox, Coordinate};

#[derive(thiserror::Error, Debug)]
pub enum SwathError {
    #[error("swath arrays disagree: expected {expected} cells, got lat={latitudes} lon={longitudes} values={values}")]
    ShapeMismatch {
        expected: usize,
        latitudes: usize,
        longitudes: usize,
        values: usize,
    },
    #[error("expected one scan-line timestamp per row ({rows}), got {timestamps}")]
    TimestampLength { rows: usize, timestamps: usize },
    #[error("failed to read swath file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("all {attempted} swath files failed to read")]
    AllFilesFailed { attempted: usize },
}

/// One satellite pass: co-indexed row-major coordinate and value arrays with
/// a timestamp per scan line (row).
#[derive(Debug, Clone)]
pub struct SwathGrid {
    rows: usize,
    cols: usize,
    latitudes: Vec<f64>,
    longitudes: Vec<f64>,
    values: Vec<f64>,
    scan_times: Vec<Option<OffsetDateTime>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelMatch {
    pub row: usize,
    pub col: usize,
    pub value: f64,
    /// Where the pixel actually is, not the requested target
    pub coordinate: Coordinate,
    pub scan_time: Option<OffsetDateTime>,
    pub squared_distance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocateOutcome {
    Located(PixelMatch),
    /// Target is outside the area this swath observed
    NoCoverage,
}

impl SwathGrid {
    pub fn new(
        rows: usize,
        cols: usize,
        latitudes: Vec<f64>,
        longitudes: Vec<f64>,
        values: Vec<f64>,
        scan_times: Vec<Option<OffsetDateTime>>,
    ) -> Result<Self, SwathError> {
        let expected = rows * cols;
        if latitudes.len() != expected || longitudes.len() != expected || values.len() != expected
        {
            return Err(SwathError::ShapeMismatch {
                expected,
                latitudes: latitudes.len(),
                longitudes: longitudes.len(),
                values: values.len(),
            });
        }
        if scan_times.len() != rows {
            return Err(SwathError::TimestampLength {
                rows,
                timestamps: scan_times.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            latitudes,
            longitudes,
            values,
            scan_times,
        })
    }

    fn coordinate_at(&self, index: usize) -> Coordinate {
        Coordinate::new(self.latitudes[index], self.longitudes[index])
    }

    /// Extent of the finite pixel coordinates
    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::from_points((0..self.latitudes.len()).map(|i| self.coordinate_at(i)))
    }

    /// Half the coarser of the average row and column spacing
    fn half_pitch(&self, bounds: &BoundingBox) -> f64 {
        let lat_pitch = (bounds.north - bounds.south) / self.rows.saturating_sub(1).max(1) as f64;
        let lon_pitch = (bounds.east - bounds.west) / self.cols.saturating_sub(1).max(1) as f64;
        lat_pitch.max(lon_pitch) / 2.0
    }

    /// Nearest pixel to `target` by squared planar distance.
    ///
    /// A target outside the swath extent (plus half a pixel) returns
    /// `NoCoverage` without scanning the grid. Pixels with non-finite
    /// coordinates never match. Ties keep the first pixel in row-major order.
    pub fn locate(&self, target: Coordinate) -> LocateOutcome {
        let Some(bounds) = self.bounds() else {
            return LocateOutcome::NoCoverage;
        };
        if !target.is_finite() || !bounds.expand(self.half_pitch(&bounds)).contains(target) {
            return LocateOutcome::NoCoverage;
        }

        let mut best: Option<(usize, f64)> = None;
        for index in 0..self.latitudes.len() {
            let pixel = self.coordinate_at(index);
            if !pixel.is_finite() {
                continue;
            }
            let distance = squared_planar_distance(pixel, target);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((index, distance));
            }
        }

        match best {
            Some((index, squared_distance)) => {
                let row = index / self.cols;
                LocateOutcome::Located(PixelMatch {
                    row,
                    col: index % self.cols,
                    value: self.values[index],
                    coordinate: self.coordinate_at(index),
                    scan_time: self.scan_times[row],
                    squared_distance,
                })
            }
            None => LocateOutcome::NoCoverage,
        }
    }
}

#[cfg(test)]
/// Regular grid over 40.5..40.9 / -74.3..-73.7
pub(crate) fn nyc_grid(rows: usize, cols: usize) -> SwathGrid {
    let mut latitudes = Vec::with_capacity(rows * cols);
    let mut longitudes = Vec::with_capacity(rows * cols);
    let mut values = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            latitudes.push(40.5 + 0.4 * r as f64 / (rows - 1) as f64);
            longitudes.push(-74.3 + 0.6 * c as f64 / (cols - 1) as f64);
            values.push((r * cols + c) as f64 * 1e14);
        }
    }
    let start = time::macros::datetime!(2024-08-12 15:00 UTC);
    let scan_times = (0..rows)
        .map(|r| Some(start + time::Duration::seconds(r as i64 * 3)))
        .collect();
    SwathGrid::new(rows, cols, latitudes, longitudes, values, scan_times).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn brute_force(grid: &SwathGrid, target: Coordinate) -> usize {
        let mut best = 0;
        for i in 0..grid.latitudes.len() {
            if squared_planar_distance(grid.coordinate_at(i), target)
                < squared_planar_distance(grid.coordinate_at(best), target)
            {
                best = i;
            }
        }
        best
    }

    #[test]
    fn finds_planted_minimum() {
        let mut grid = nyc_grid(11, 11);
        let target = Coordinate::new(40.7128, -74.0060);
        // move pixel (5,5) onto the target and give it a marker value
        let planted = 5 * 11 + 5;
        grid.latitudes[planted] = target.latitude;
        grid.longitudes[planted] = target.longitude;
        grid.values[planted] = 4.2e15;

        let LocateOutcome::Located(found) = grid.locate(target) else {
            panic!("expected coverage");
        };
        assert_eq!((found.row, found.col), (5, 5));
        assert_eq!(found.value, 4.2e15);
        assert_eq!(found.coordinate, target);
        assert_eq!(
            found.scan_time,
            Some(datetime!(2024-08-12 15:00:15 UTC))
        );
    }

    #[test]
    fn matches_brute_force_for_inside_targets() {
        let grid = nyc_grid(9, 13);
        for lat in [40.51, 40.6, 40.7128, 40.83, 40.89] {
            for lon in [-74.29, -74.1, -74.006, -73.8, -73.71] {
                let target = Coordinate::new(lat, lon);
                let LocateOutcome::Located(found) = grid.locate(target) else {
                    panic!("{target} should be covered");
                };
                let expected = brute_force(&grid, target);
                assert_eq!(found.row * 13 + found.col, expected, "target {target}");
            }
        }
    }

    #[test]
    fn target_outside_swath_is_no_coverage() {
        let grid = nyc_grid(5, 5);
        let la = Coordinate::new(34.05, -118.24);
        assert_eq!(grid.locate(la), LocateOutcome::NoCoverage);
    }

    #[test]
    fn nan_pixels_are_ignored() {
        let mut grid = nyc_grid(5, 5);
        let target = Coordinate::new(40.5, -74.3);
        grid.latitudes[0] = f64::NAN;
        let LocateOutcome::Located(found) = grid.locate(target) else {
            panic!("expected coverage");
        };
        assert_ne!((found.row, found.col), (0, 0));
    }

    #[test]
    fn rejects_inconsistent_shapes() {
        let err = SwathGrid::new(2, 2, vec![0.0; 4], vec![0.0; 3], vec![0.0; 4], vec![None; 2])
            .unwrap_err();
        assert!(matches!(err, SwathError::ShapeMismatch { .. }));

        let err = SwathGrid::new(2, 2, vec![0.0; 4], vec![0.0; 4], vec![0.0; 4], vec![None; 3])
            .unwrap_err();
        assert!(matches!(
            err,
            SwathError::TimestampLength {
                rows: 2,
                timestamps: 3
            }
        ));
    }
}
