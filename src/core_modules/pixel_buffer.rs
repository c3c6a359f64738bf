// THEORY:
// A `PixelBuffer` is a decoded frame: a width, a height and an interleaved
// plane of 16-bit RGB channel data. It is the unit that the frame cache shares
// between workers (behind an `Arc`) and the unit that the sink writes out.
// Coordinates are always `(x, y)` with the origin at the top-left corner.

use crate::core_modules::pixel::pixel::Pixel;

pub const CHANNELS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    /// Interleaved RGB, `CHANNELS` values per pixel, row major.
    pub data: Vec<u16>,
}

impl PixelBuffer {
    /// A black buffer of the given size.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * CHANNELS],
        }
    }

    /// Wraps raw channel data. Returns `None` when the length does not match the dimensions.
    pub fn from_raw(width: u32, height: u32, data: Vec<u16>) -> Option<Self> {
        if data.len() != width as usize * height as usize * CHANNELS {
            return None;
        }
        Some(Self { width, height, data })
    }

    /// Fills every pixel with one value.
    pub fn filled(width: u32, height: u32, pixel: Pixel) -> Self {
        let mut buffer = Self::new(width, height);
        for chunk in buffer.data.chunks_exact_mut(CHANNELS) {
            chunk.copy_from_slice(&<[u16; 3]>::from(pixel));
        }
        buffer
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Pixel {
        let offset = self.offset(x, y);
        Pixel::new(self.data[offset], self.data[offset + 1], self.data[offset + 2])
    }

    #[inline]
    pub fn set_pixel(&mut self, x: u32, y: u32, pixel: Pixel) {
        let offset = self.offset(x, y);
        self.data[offset..offset + CHANNELS].copy_from_slice(&<[u16; 3]>::from(pixel));
    }

    /// One row of channel data.
    pub fn row(&self, y: u32) -> &[u16] {
        let start = self.offset(0, y);
        &self.data[start..start + self.width as usize * CHANNELS]
    }

    pub fn same_dimensions(&self, other: &PixelBuffer) -> bool {
        self.width == other.width && self.height == other.height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read_back_a_pixel() {
        let mut buffer = PixelBuffer::new(4, 3);
        let pixel = Pixel::new(1, 2, 3);
        buffer.set_pixel(3, 2, pixel);
        assert_eq!(buffer.pixel(3, 2), pixel);
        assert_eq!(buffer.pixel(0, 0), Pixel::default());
        assert_eq!(&buffer.row(2)[9..12], &[1, 2, 3]);
    }

    #[test]
    fn from_raw_rejects_mismatched_lengths() {
        assert!(PixelBuffer::from_raw(2, 2, vec![0; 11]).is_none());
        assert!(PixelBuffer::from_raw(2, 2, vec![0; 12]).is_some());
    }
}
