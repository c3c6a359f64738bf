// THEORY:
// A `BoundingBox` is the rectangle that encloses every pixel of an outlier
// group. Most of the geometric features and all of the cross-frame comparisons
// are phrased in terms of boxes: how far apart two groups are, whether their
// boxes overlap and by how much.
//
// Boxes are inclusive on both ends. A single pixel at (3, 4) has min == max ==
// (3, 4) and a width and height of one.

/// A simple struct to represent a 2D point or coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

impl BoundingBox {
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// The box around a single point.
    pub fn around(x: u32, y: u32) -> Self {
        let point = Point { x, y };
        Self {
            min: point,
            max: point,
        }
    }

    /// Grows the box to include `(x, y)`.
    pub fn include(&mut self, x: u32, y: u32) {
        self.min.x = self.min.x.min(x);
        self.min.y = self.min.y.min(y);
        self.max.x = self.max.x.max(x);
        self.max.y = self.max.y.max(y);
    }

    pub fn width(&self) -> u32 {
        self.max.x - self.min.x + 1
    }

    pub fn height(&self) -> u32 {
        self.max.y - self.min.y + 1
    }

    pub fn area(&self) -> u64 {
        self.width() as u64 * self.height() as u64
    }

    pub fn center(&self) -> (f64, f64) {
        (
            self.min.x as f64 + self.width() as f64 / 2.0,
            self.min.y as f64 + self.height() as f64 / 2.0,
        )
    }

    /// Length of the diagonal.
    pub fn hypotenuse(&self) -> f64 {
        let (w, h) = (self.width() as f64, self.height() as f64);
        (w * w + h * h).sqrt()
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.min.x && x <= self.max.x && y >= self.min.y && y <= self.max.y
    }

    pub fn center_distance(&self, other: &BoundingBox) -> f64 {
        let (x1, y1) = self.center();
        let (x2, y2) = other.center();
        ((x1 - x2).powi(2) + (y1 - y2).powi(2)).sqrt()
    }

    /// Angle in degrees `[0, 360)` of the line joining both centers.
    pub fn center_theta(&self, other: &BoundingBox) -> f64 {
        let (x1, y1) = self.center();
        let (x2, y2) = other.center();
        (y2 - y1).atan2(x2 - x1).to_degrees().rem_euclid(360.0)
    }

    /// The shared rectangle, if any.
    pub fn overlap(&self, other: &BoundingBox) -> Option<BoundingBox> {
        if self.min.x > other.max.x || other.min.x > self.max.x {
            return None;
        }
        if self.min.y > other.max.y || other.min.y > self.max.y {
            return None;
        }
        Some(BoundingBox {
            min: Point {
                x: self.min.x.max(other.min.x),
                y: self.min.y.max(other.min.y),
            },
            max: Point {
                x: self.max.x.min(other.max.x),
                y: self.max.y.min(other.max.y),
            },
        })
    }

    /// Overlap area relative to the average area of both boxes. Zero when disjoint.
    pub fn overlap_amount(&self, other: &BoundingBox) -> f64 {
        match self.overlap(other) {
            Some(shared) => {
                let average = (self.area() + other.area()) as f64 / 2.0;
                shared.area() as f64 / average
            }
            None => 0.0,
        }
    }
}
