// THEORY:
// The `HoughTransform` finds dominant straight lines in a small 2D grid. Every
// "on" cell votes for all of the lines that could pass through it, expressed in
// polar form `rho = x·cos(θ) + y·sin(θ)`. Cells that lie on a common line pile
// their votes into the same accumulator bin. An airplane streak is one long
// line, so its best line collects a vote from almost every pixel. A clump of
// stars or noise spreads its votes thin.
//
// Key architectural principles:
// 1.  **Fixed theta axis**: 360 bins of half a degree cover 0-180°. Bin `k` maps to
//     `k / 2` degrees.
// 2.  **Signed rho axis**: `round(2·rmax)` bins span `[-rmax, rmax]`, with
//     `rmax` the grid diagonal. Emitted lines always have a non-negative rho. A
//     negative one is reflected by turning theta around by 180°.
// 3.  **Plateau-safe peak picking**: A bin survives only if it beats its 8
//     neighbors. Ties are settled by scan order (strictly greater than
//     neighbors scanned before it, at least equal to those after it), so a
//     flat plateau yields exactly one line.
// 4.  **Cost**: O(W·H·360) per call. It runs on group bounding boxes, which are
//     small, and on whole frames only for diagnostics.

use std::f64::consts::PI;

pub const HOUGH_WIDTH: usize = 360;

/// A candidate line in polar form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    /// Degrees, in `[0, 360)`.
    pub theta: f64,
    /// Distance from the grid origin, never negative.
    pub rho: f64,
    /// Accumulated votes.
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct HoughTransform {
    data_width: usize,
    data_height: usize,
    rmax: f64,
    hough_height: usize,
    dr: f64,
    dth: f64,
    /// Row major, `rho_bin * HOUGH_WIDTH + theta_bin`.
    counts: Vec<u64>,
    cos_table: Vec<f64>,
    sin_table: Vec<f64>,
}

impl HoughTransform {
    pub fn new(data_width: usize, data_height: usize) -> Self {
        let rmax = ((data_width * data_width + data_height * data_height) as f64).sqrt();
        let hough_height = ((2.0 * rmax).round() as usize).max(1);
        let dr = 2.0 * rmax / hough_height as f64;
        let dth = PI / HOUGH_WIDTH as f64;
        let (sin_table, cos_table) = (0..HOUGH_WIDTH)
            .map(|k| (dth * k as f64).sin_cos())
            .unzip();

        Self {
            data_width,
            data_height,
            rmax,
            hough_height,
            dr,
            dth,
            counts: vec![0; HOUGH_WIDTH * hough_height],
            cos_table,
            sin_table,
        }
    }

    pub fn rmax(&self) -> f64 {
        self.rmax
    }

    pub fn hough_height(&self) -> usize {
        self.hough_height
    }

    /// Radians per theta bin.
    pub fn dth(&self) -> f64 {
        self.dth
    }

    /// The accumulator bin a point votes into for theta bin `k`.
    pub fn rho_bin(&self, x: usize, y: usize, k: usize) -> usize {
        let rho = x as f64 * self.cos_table[k] + y as f64 * self.sin_table[k];
        let bin = (self.rmax + rho / self.dr).floor();
        (bin.max(0.0) as usize).min(self.hough_height - 1)
    }

    /// Votes every cell of `data` whose value exceeds `min_value`.
    ///
    /// `data` is row major with the dimensions given to [`HoughTransform::new`].
    /// With `weighted` each vote adds the cell value instead of one.
    pub fn accumulate(&mut self, data: &[u32], min_value: u32, weighted: bool) {
        for y in 0..self.data_height {
            for x in 0..self.data_width {
                let value = data[y * self.data_width + x];
                if value <= min_value {
                    continue;
                }
                let vote = if weighted { value as u64 } else { 1 };
                for k in 0..HOUGH_WIDTH {
                    let bin = self.rho_bin(x, y, k);
                    self.counts[bin * HOUGH_WIDTH + k] += vote;
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    /// Direct access to one accumulator bin.
    pub fn count(&self, rho_bin: usize, theta_bin: usize) -> u64 {
        self.counts[rho_bin * HOUGH_WIDTH + theta_bin]
    }

    pub fn set_count(&mut self, rho_bin: usize, theta_bin: usize, count: u64) {
        self.counts[rho_bin * HOUGH_WIDTH + theta_bin] = count;
    }

    fn is_local_max(&self, rho_bin: usize, theta_bin: usize) -> bool {
        let count = self.count(rho_bin, theta_bin);
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                if dy == 0 && dx == 0 {
                    continue;
                }
                let ny = rho_bin as i64 + dy;
                let nx = theta_bin as i64 + dx;
                if ny < 0 || nx < 0 || ny >= self.hough_height as i64 || nx >= HOUGH_WIDTH as i64 {
                    continue;
                }
                let neighbor = self.count(ny as usize, nx as usize);
                let scanned_before = dy < 0 || (dy == 0 && dx < 0);
                if scanned_before {
                    if count <= neighbor {
                        return false;
                    }
                } else if count < neighbor {
                    return false;
                }
            }
        }
        true
    }

    /// All local-maximum lines, strongest first.
    ///
    /// `max_lines` truncates the list and `min_count` drops weaker lines.
    pub fn lines(&self, max_lines: Option<usize>, min_count: u64) -> Vec<Line> {
        let mut lines = Vec::new();
        for rho_bin in 0..self.hough_height {
            for theta_bin in 0..HOUGH_WIDTH {
                let count = self.count(rho_bin, theta_bin);
                if count == 0 || count < min_count {
                    continue;
                }
                if !self.is_local_max(rho_bin, theta_bin) {
                    continue;
                }

                let mut theta = theta_bin as f64 / 2.0;
                let mut rho = rho_bin as f64 * self.dr - self.rmax;
                if rho < 0.0 {
                    rho = -rho;
                    theta = (theta + 180.0) % 360.0;
                }
                lines.push(Line { theta, rho, count });
            }
        }

        // stable, so equal counts stay in scan order
        lines.sort_by(|a, b| b.count.cmp(&a.count));
        if let Some(max_lines) = max_lines {
            lines.truncate(max_lines);
        }
        lines
    }
}

/// Convenience wrapper: one transform over `data`, returning the ranked lines.
pub fn lines_of(
    data: &[u32],
    width: usize,
    height: usize,
    min_value: u32,
    weighted: bool,
    max_lines: Option<usize>,
) -> Vec<Line> {
    let mut transform = HoughTransform::new(width, height);
    transform.accumulate(data, min_value, weighted);
    transform.lines(max_lines, 1)
}
