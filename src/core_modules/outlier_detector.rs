// THEORY:
// The `OutlierDetector` is the first analysis layer. It compares every pixel of
// a frame against the same coordinate in one or two temporally adjacent frames
// and flags the pixels that got noticeably brighter. An airplane crossing the
// sky lights up a thin line of pixels in exactly one frame, so a per-pixel
// temporal difference is a very cheap and very effective first filter.
//
// Key architectural principles:
// 1.  **Neighbor averaging**: The difference against each available neighbor is
//     computed with `Pixel::difference` and the results are averaged. At the
//     start or end of a sequence only one neighbor exists. With none at all the
//     comparison is meaningless and the run is aborted.
// 2.  **Dense arena**: Outliers are sparse, but lookups by coordinate are the hot
//     path of grouping. The map is therefore a flat `Vec<Option<OutlierPixel>>`
//     indexed by `y * width + x`. Adjacency is index arithmetic and the whole
//     structure is `Send` without any locking.
// 3.  **Row parallelism**: Rows are independent, so they are scanned on the
//     `rayon` pool. This is the dominant per-frame cost.
// 4.  **Determinism**: The same buffers and threshold always produce the same map.

use crate::core_modules::pixel_buffer::PixelBuffer;
use crate::error::{EraserError, Result};
use rayon::prelude::*;
use std::fmt;

/// Identifies an outlier group by the coordinate of the pixel that seeded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub x: u32,
    pub y: u32,
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Arena indices of the 4-connected neighbors that are themselves outliers.
/// Populated by the link pass of the group tagger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Neighbors {
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub top: Option<usize>,
    pub bottom: Option<usize>,
}

impl Neighbors {
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        [self.left, self.right, self.top, self.bottom]
            .into_iter()
            .flatten()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutlierPixel {
    pub x: u32,
    pub y: u32,
    /// Averaged brightness difference. Zero marks a padding pixel.
    pub amount: i32,
    pub tag: Option<Tag>,
    pub neighbors: Neighbors,
}

impl OutlierPixel {
    pub fn new(x: u32, y: u32, amount: i32) -> Self {
        Self {
            x,
            y,
            amount,
            tag: None,
            neighbors: Neighbors::default(),
        }
    }

    pub fn padding(x: u32, y: u32, tag: Tag) -> Self {
        Self {
            x,
            y,
            amount: 0,
            tag: Some(tag),
            neighbors: Neighbors::default(),
        }
    }

    pub fn is_padding(&self) -> bool {
        self.amount == 0
    }
}

/// Sparse outlier map stored densely.
#[derive(Debug, Clone)]
pub struct OutlierMap {
    width: u32,
    height: u32,
    cells: Vec<Option<OutlierPixel>>,
    count: usize,
}

impl OutlierMap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![None; width as usize * height as usize],
            count: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of occupied cells, padding included.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn key(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn get(&self, x: u32, y: u32) -> Option<&OutlierPixel> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.cells[self.key(x, y)].as_ref()
    }

    pub fn at(&self, key: usize) -> Option<&OutlierPixel> {
        self.cells.get(key).and_then(Option::as_ref)
    }

    pub fn at_mut(&mut self, key: usize) -> Option<&mut OutlierPixel> {
        self.cells.get_mut(key).and_then(Option::as_mut)
    }

    /// Places a pixel at its own coordinate, replacing whatever was there.
    pub fn insert(&mut self, pixel: OutlierPixel) {
        let key = self.key(pixel.x, pixel.y);
        if self.cells[key].is_none() {
            self.count += 1;
        }
        self.cells[key] = Some(pixel);
    }

    /// Occupied cells with their arena keys, in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &OutlierPixel)> {
        self.cells
            .iter()
            .enumerate()
            .filter_map(|(key, cell)| cell.as_ref().map(|pixel| (key, pixel)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut OutlierPixel> {
        self.cells.iter_mut().filter_map(Option::as_mut)
    }

    /// Arena keys of every occupied cell, in row-major order.
    pub fn keys(&self) -> Vec<usize> {
        self.iter().map(|(key, _)| key).collect()
    }
}

/// Flags pixels that are brighter than their temporal neighbors.
#[derive(Debug, Clone, Copy)]
pub struct OutlierDetector {
    /// Averaged difference a pixel must exceed, in 16-bit brightness units.
    pub max_pixel_distance: u16,
}

impl OutlierDetector {
    pub fn new(max_pixel_distance: u16) -> Self {
        Self { max_pixel_distance }
    }

    /// Builds the outlier map of `frame` against up to two `neighbors`.
    ///
    /// `index` only feeds the error report when `neighbors` is empty.
    pub fn detect(
        &self,
        index: usize,
        frame: &PixelBuffer,
        neighbors: &[&PixelBuffer],
    ) -> Result<OutlierMap> {
        if neighbors.is_empty() {
            return Err(EraserError::MissingNeighbor { index, len: 1 });
        }
        if let Some(other) = neighbors.iter().find(|n| !frame.same_dimensions(n)) {
            return Err(EraserError::Config(format!(
                "frame {index} is {}x{} but a neighbor is {}x{}",
                frame.width, frame.height, other.width, other.height
            )));
        }

        let width = frame.width;
        let threshold = self.max_pixel_distance as i32;
        let neighbor_count = neighbors.len() as i32;

        let rows: Vec<Vec<OutlierPixel>> = (0..frame.height)
            .into_par_iter()
            .map(|y| {
                let mut row = Vec::new();
                for x in 0..width {
                    let pixel = frame.pixel(x, y);
                    let total: i32 = neighbors
                        .iter()
                        .map(|other| pixel.difference(&other.pixel(x, y)))
                        .sum();
                    let amount = total / neighbor_count;
                    if amount > threshold {
                        row.push(OutlierPixel::new(x, y, amount));
                    }
                }
                row
            })
            .collect();

        let mut map = OutlierMap::new(frame.width, frame.height);
        for pixel in rows.into_iter().flatten() {
            map.insert(pixel);
        }
        Ok(map)
    }
}
