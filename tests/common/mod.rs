#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use streak_eraser::core_modules::image_sequence::{FrameSink, FrameSource};
use streak_eraser::core_modules::pixel::pixel::Pixel;
use streak_eraser::core_modules::pixel_buffer::PixelBuffer;
use streak_eraser::{EraserError, PipelineConfig, Result};

pub const WIDTH: u32 = 40;
pub const HEIGHT: u32 = 24;
pub const BACKGROUND: Pixel = Pixel::new(2000, 2000, 2000);
pub const SPIKE: Pixel = Pixel::new(40_000, 2000, 2000);
/// Bright enough to clear the default threshold, but only just.
pub const FAINT: Pixel = Pixel::new(9000, 2000, 2000);

/// A dark sky of `len` frames with a bright 3x3 blob in `spike_frame`.
pub fn sky_with_spike(len: usize, spike_frame: usize, at: (u32, u32)) -> Vec<PixelBuffer> {
    (0..len)
        .map(|index| {
            let mut frame = PixelBuffer::filled(WIDTH, HEIGHT, BACKGROUND);
            if index == spike_frame {
                for dy in 0..3 {
                    for dx in 0..3 {
                        frame.set_pixel(at.0 + dx, at.1 + dy, SPIKE);
                    }
                }
            }
            frame
        })
        .collect()
}

/// `len` empty frames of the given size.
pub fn blank_sky(len: usize, width: u32, height: u32) -> Vec<PixelBuffer> {
    (0..len)
        .map(|_| PixelBuffer::filled(width, height, BACKGROUND))
        .collect()
}

pub fn light(frame: &mut PixelBuffer, points: impl IntoIterator<Item = (u32, u32)>, pixel: Pixel) {
    for (x, y) in points {
        frame.set_pixel(x, y, pixel);
    }
}

/// Small groups are assumed airplanes, so no classifier takes part.
pub fn assume_everything(neighbor_radius: usize, max_concurrent: usize) -> PipelineConfig {
    PipelineConfig {
        min_group_size: 0,
        assume_airplane_size: 1,
        neighbor_radius,
        max_concurrent,
        ..PipelineConfig::default()
    }
}

pub struct MemorySource {
    frames: Vec<PixelBuffer>,
    pub loads: AtomicUsize,
    pub broken: Option<usize>,
}

impl MemorySource {
    pub fn new(frames: Vec<PixelBuffer>) -> Self {
        Self {
            frames,
            loads: AtomicUsize::new(0),
            broken: None,
        }
    }
}

impl FrameSource for MemorySource {
    fn len(&self) -> usize {
        self.frames.len()
    }

    fn name(&self, index: usize) -> String {
        format!("frame-{index:04}.tif")
    }

    fn load(&self, index: usize) -> Result<PixelBuffer> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.broken == Some(index) {
            return Err(EraserError::Config(format!("frame {index} is unreadable")));
        }
        self.frames
            .get(index)
            .cloned()
            .ok_or_else(|| EraserError::Config(format!("no frame {index}")))
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub outputs: Mutex<BTreeMap<usize, PixelBuffer>>,
    pub test_paint: Mutex<BTreeMap<usize, PixelBuffer>>,
    /// Outputs that exist before the run starts.
    pub existing: BTreeSet<usize>,
    /// Write attempts that fail before writes start to succeed.
    pub failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl MemorySink {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn output(&self, index: usize) -> Option<PixelBuffer> {
        self.outputs.lock().unwrap().get(&index).cloned()
    }
}

impl FrameSink for MemorySink {
    fn output_exists(&self, index: usize) -> bool {
        self.existing.contains(&index) || self.outputs.lock().unwrap().contains_key(&index)
    }

    fn write(&self, index: usize, buffer: &PixelBuffer) -> Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EraserError::Write {
                path: PathBuf::from(format!("frame-{index:04}.tif")),
                message: "disk full".into(),
            });
        }
        if self.output_exists(index) {
            return Ok(false);
        }
        self.outputs.lock().unwrap().insert(index, buffer.clone());
        Ok(true)
    }

    fn write_test_paint(&self, index: usize, buffer: &PixelBuffer) -> Result<bool> {
        self.test_paint.lock().unwrap().insert(index, buffer.clone());
        Ok(true)
    }
}
