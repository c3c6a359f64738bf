// THEORY:
// The `Pixel` module is the most fundamental unit of the engine. A pixel is a
// "dumb" container for three 16-bit channels packed into a single 64-bit word
// (red in bits 0-15, green in 16-31, blue in 32-47). Packing keeps whole frames
// compact and makes copying a pixel between buffers a single word move.
//
// Key architectural principles:
// 1.  **Single-pixel scope**: Everything here is computed from one or a handful
//     of pixels at the same coordinate. Spatial reasoning lives in the detector
//     and tagger.
// 2.  **Merging**: Several pixels can be blended into one by taking the
//     arithmetic mean of each channel.
// 3.  **Difference metric**: The brightness difference between two pixels is the
//     larger of the largest single-channel increase and the mixed sum
//     `Δr + Δg + Δb/3`. Only the blue term is divided. That asymmetry is kept
//     exactly as it is because detection sensitivity has been tuned against it.

pub mod pixel {
    pub type Channel = u16;
    pub type Packed = u64;

    const CHANNEL_MASK: Packed = 0xFFFF;
    const GREEN_SHIFT: u32 = 16;
    const BLUE_SHIFT: u32 = 32;

    /// A single 16-bit-per-channel RGB pixel packed into one word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Pixel {
        value: Packed,
    }

    impl Pixel {
        pub const fn new(red: Channel, green: Channel, blue: Channel) -> Self {
            Pixel {
                value: red as Packed
                    | (green as Packed) << GREEN_SHIFT
                    | (blue as Packed) << BLUE_SHIFT,
            }
        }

        pub const fn from_packed(value: Packed) -> Self {
            Pixel { value }
        }

        /// The raw packed representation.
        pub fn packed(&self) -> Packed {
            self.value
        }

        pub fn red(&self) -> Channel {
            (self.value & CHANNEL_MASK) as Channel
        }

        pub fn green(&self) -> Channel {
            ((self.value >> GREEN_SHIFT) & CHANNEL_MASK) as Channel
        }

        pub fn blue(&self) -> Channel {
            ((self.value >> BLUE_SHIFT) & CHANNEL_MASK) as Channel
        }

        /// Blends any number of pixels by averaging each channel.
        /// An empty slice yields black.
        pub fn merging(pixels: &[Pixel]) -> Self {
            if pixels.is_empty() {
                return Pixel::default();
            }
            let count = pixels.len() as u64;
            let (mut red, mut green, mut blue) = (0u64, 0u64, 0u64);
            for pixel in pixels {
                red += pixel.red() as u64;
                green += pixel.green() as u64;
                blue += pixel.blue() as u64;
            }
            Pixel::new(
                (red / count) as Channel,
                (green / count) as Channel,
                (blue / count) as Channel,
            )
        }

        /// How much brighter `self` is than `other`.
        ///
        /// `max(Δr, Δg, Δb, Δr + Δg + Δb/3)` on signed channel deltas. Note the
        /// divide applies to the blue delta alone, not to the whole sum.
        pub fn difference(&self, other: &Pixel) -> i32 {
            let red_diff = self.red() as i32 - other.red() as i32;
            let green_diff = self.green() as i32 - other.green() as i32;
            let blue_diff = self.blue() as i32 - other.blue() as i32;

            let mixed = red_diff + green_diff + blue_diff / 3;
            mixed.max(red_diff).max(green_diff).max(blue_diff)
        }
    }

    impl From<[Channel; 3]> for Pixel {
        fn from(channels: [Channel; 3]) -> Self {
            Pixel::new(channels[0], channels[1], channels[2])
        }
    }

    impl From<Pixel> for [Channel; 3] {
        fn from(pixel: Pixel) -> Self {
            [pixel.red(), pixel.green(), pixel.blue()]
        }
    }
}
