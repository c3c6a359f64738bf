// THEORY:
// The `GroupTagger` turns the detector's loose collection of outlier pixels into
// named, spatially coherent groups. It is the spatial grouping layer of the
// engine, a binary connected-component analysis over the outlier arena.
//
// Key architectural principles & algorithm steps:
// 1.  **Link pass**: Each outlier records the arena keys of whichever of its four
//     direct neighbors are outliers too. These are plain indices, not owning
//     references, so the arena stays a flat vector.
// 2.  **Label pass**: Outliers are visited in row-major order. An untagged one
//     seeds a breadth-first search that stamps its own coordinate as the tag
//     onto everything reachable through the links. Afterwards every outlier must
//     carry a tag. One that does not is an internal error.
// 3.  **Size aggregation**: A single pass counts members per tag.
// 4.  **Padding**: Optionally, empty positions close to a large group are pulled
//     into it as zero-amount pixels. This softens the ragged edge of a streak so
//     the repaint does not leave a faint halo. Eligibility is judged against the
//     sizes from step 3, so padding never feeds more padding, and the sizes are
//     recounted afterwards.

use crate::core_modules::outlier_detector::{OutlierMap, OutlierPixel, Tag};
use crate::error::{InternalError, Result};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Member count per group.
pub type GroupSizes = BTreeMap<Tag, usize>;

#[derive(Debug, Clone, Copy)]
pub struct GroupTagger {
    /// Search radius for padding. Zero disables padding.
    pub padding_radius: u32,
    /// A group must be strictly larger than this to receive padding.
    pub min_neighbors: usize,
}

impl GroupTagger {
    pub fn new(padding_radius: u32, min_neighbors: usize) -> Self {
        Self {
            padding_radius,
            min_neighbors,
        }
    }

    /// Runs link, label, size and (when enabled) padding over `map`.
    pub fn tag(&self, map: &mut OutlierMap) -> Result<GroupSizes> {
        link(map);
        label(map)?;
        let mut sizes = group_sizes(map);
        debug!(outliers = map.len(), groups = sizes.len(), "tagged outliers");

        if self.padding_radius > 0 {
            let added = self.pad(map, &sizes);
            if added > 0 {
                sizes = group_sizes(map);
            }
            debug!(added, radius = self.padding_radius, "padded outlier groups");
        }
        Ok(sizes)
    }

    /// Inserts padding pixels around groups larger than `min_neighbors`.
    /// Returns how many were inserted.
    pub fn pad(&self, map: &mut OutlierMap, sizes: &GroupSizes) -> usize {
        let mut padding = Vec::new();
        for y in 0..map.height() {
            for x in 0..map.width() {
                if map.get(x, y).is_some() {
                    continue;
                }
                if let Some(tag) = self.tag_within(map, sizes, x, y) {
                    padding.push(OutlierPixel::padding(x, y, tag));
                }
            }
        }
        let added = padding.len();
        for pixel in padding {
            map.insert(pixel);
        }
        added
    }

    /// First qualifying real outlier in row-major order within the radius of `(x, y)`.
    fn tag_within(&self, map: &OutlierMap, sizes: &GroupSizes, x: u32, y: u32) -> Option<Tag> {
        let radius = self.padding_radius;
        let radius_squared = radius as u64 * radius as u64;
        let x_start = x.saturating_sub(radius);
        let y_start = y.saturating_sub(radius);
        let x_end = (x + radius).min(map.width() - 1);
        let y_end = (y + radius).min(map.height() - 1);

        for search_y in y_start..=y_end {
            for search_x in x_start..=x_end {
                let Some(outlier) = map.get(search_x, search_y) else {
                    continue;
                };
                if outlier.is_padding() {
                    continue;
                }
                let dx = search_x.abs_diff(x) as u64;
                let dy = search_y.abs_diff(y) as u64;
                if dx * dx + dy * dy > radius_squared {
                    continue;
                }
                let Some(tag) = outlier.tag else { continue };
                if sizes.get(&tag).is_some_and(|&size| size > self.min_neighbors) {
                    return Some(tag);
                }
            }
        }
        None
    }
}

/// Records the arena keys of each outlier's 4-connected outlier neighbors.
pub fn link(map: &mut OutlierMap) {
    let width = map.width();
    let height = map.height();
    for key in map.keys() {
        let Some(pixel) = map.at(key) else { continue };
        let (x, y) = (pixel.x, pixel.y);

        let occupied = |nx: u32, ny: u32| map.get(nx, ny).map(|_| map.key(nx, ny));
        let left = if x > 0 { occupied(x - 1, y) } else { None };
        let right = if x + 1 < width { occupied(x + 1, y) } else { None };
        let top = if y > 0 { occupied(x, y - 1) } else { None };
        let bottom = if y + 1 < height { occupied(x, y + 1) } else { None };

        if let Some(pixel) = map.at_mut(key) {
            pixel.neighbors.left = left;
            pixel.neighbors.right = right;
            pixel.neighbors.top = top;
            pixel.neighbors.bottom = bottom;
        }
    }
}

/// Breadth-first labeling over the links built by [`link`].
pub fn label(map: &mut OutlierMap) -> Result<()> {
    let mut queue = VecDeque::new();
    for key in map.keys() {
        let Some(seed) = map.at_mut(key) else { continue };
        if seed.tag.is_some() {
            continue;
        }
        let tag = Tag {
            x: seed.x,
            y: seed.y,
        };
        seed.tag = Some(tag);
        queue.extend(seed.neighbors.iter());

        while let Some(next) = queue.pop_front() {
            let Some(pixel) = map.at_mut(next) else { continue };
            if pixel.tag.is_some() {
                continue;
            }
            pixel.tag = Some(tag);
            queue.extend(pixel.neighbors.iter());
        }
    }

    if let Some((_, untagged)) = map.iter().find(|(_, pixel)| pixel.tag.is_none()) {
        return Err(InternalError::UntaggedOutlier {
            x: untagged.x,
            y: untagged.y,
        }
        .into());
    }
    Ok(())
}

/// Counts members per tag.
pub fn group_sizes(map: &OutlierMap) -> GroupSizes {
    let mut sizes = GroupSizes::new();
    for (_, pixel) in map.iter() {
        if let Some(tag) = pixel.tag {
            *sizes.entry(tag).or_insert(0) += 1;
        }
    }
    sizes
}
