// THEORY:
// The image sequence layer is the engine's only contact with storage. Frames
// come in through a `FrameSource`, finished frames go out through a
// `FrameSink`, and the `FrameCache` sits between the source and the workers.
//
// Key architectural principles:
// 1.  **Shared, not copied**: A decoded frame is handed out as an
//     `Arc<PixelBuffer>`. The cache only keeps a `Weak` to it, so a frame stays
//     resident exactly as long as some worker or the final-processing window
//     holds it, and is decoded again if it is needed after that.
// 2.  **One decode per frame at a time**: Each cache slot has its own async
//     mutex. Concurrent requests for the same frame queue on that slot and all
//     receive the single buffer the first request decoded.
// 3.  **Write once**: Sinks never overwrite an existing output. Together with
//     the resume plan this makes an interrupted run safe to start again.

use crate::core_modules::pixel_buffer::PixelBuffer;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::{EraserError, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info};

const FRAME_EXTENSIONS: [&str; 2] = ["tif", "tiff"];

pub trait FrameSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// File name of frame `index`, reused for its output.
    fn name(&self, index: usize) -> String;

    /// Decodes frame `index`. Blocking.
    fn load(&self, index: usize) -> Result<PixelBuffer>;
}

pub trait FrameSink: Send + Sync {
    fn output_exists(&self, index: usize) -> bool;

    /// Writes the repainted frame. Returns `false` when an output already existed.
    fn write(&self, index: usize, buffer: &PixelBuffer) -> Result<bool>;

    /// Writes the diagnostic test-paint frame.
    fn write_test_paint(&self, index: usize, buffer: &PixelBuffer) -> Result<bool>;
}

/// A directory of TIFF frames in file name order.
#[derive(Debug, Clone)]
pub struct TiffSequence {
    dir: PathBuf,
    names: Vec<String>,
}

impl TiffSequence {
    pub fn open(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|err| {
            EraserError::Config(format!("cannot read input directory {}: {err}", dir.display()))
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_frame = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| FRAME_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if !is_frame {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        if names.is_empty() {
            return Err(EraserError::Config(format!(
                "no .tif frames found in {}",
                dir.display()
            )));
        }
        info!(frames = names.len(), "found image sequence in {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            names,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl FrameSource for TiffSequence {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn name(&self, index: usize) -> String {
        self.names.get(index).cloned().unwrap_or_default()
    }

    fn load(&self, index: usize) -> Result<PixelBuffer> {
        let name = self.names.get(index).ok_or_else(|| {
            EraserError::Config(format!("frame {index} is outside the sequence"))
        })?;
        image_helper::load_rgb16(&self.dir.join(name))
    }
}

/// Writes each frame under its input file name.
#[derive(Debug, Clone)]
pub struct TiffSink {
    output_dir: PathBuf,
    test_paint_dir: PathBuf,
    names: Vec<String>,
}

impl TiffSink {
    pub fn new(output_dir: PathBuf, test_paint_dir: PathBuf, names: Vec<String>) -> Self {
        Self {
            output_dir,
            test_paint_dir,
            names,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn path_in(&self, dir: &Path, index: usize) -> Result<PathBuf> {
        let name = self.names.get(index).ok_or_else(|| {
            EraserError::Config(format!("frame {index} is outside the sequence"))
        })?;
        Ok(dir.join(name))
    }

    fn write_into(&self, dir: &Path, index: usize, buffer: &PixelBuffer) -> Result<bool> {
        std::fs::create_dir_all(dir).map_err(|err| EraserError::Write {
            path: dir.to_path_buf(),
            message: err.to_string(),
        })?;
        let path = self.path_in(dir, index)?;
        let written = image_helper::save_tiff_new(&path, buffer)?;
        if !written {
            debug!(frame = index, "{} already exists, left untouched", path.display());
        }
        Ok(written)
    }
}

impl FrameSink for TiffSink {
    fn output_exists(&self, index: usize) -> bool {
        self.path_in(&self.output_dir, index)
            .is_ok_and(|path| path.exists())
    }

    fn write(&self, index: usize, buffer: &PixelBuffer) -> Result<bool> {
        self.write_into(&self.output_dir, index, buffer)
    }

    fn write_test_paint(&self, index: usize, buffer: &PixelBuffer) -> Result<bool> {
        self.write_into(&self.test_paint_dir, index, buffer)
    }
}

/// Decoded frames shared by reference count.
pub struct FrameCache {
    source: Arc<dyn FrameSource>,
    slots: Vec<Mutex<Weak<PixelBuffer>>>,
}

impl FrameCache {
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        let slots = (0..source.len()).map(|_| Mutex::new(Weak::new())).collect();
        Self { source, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }

    /// Whether frame `index` is currently decoded and held by someone.
    pub async fn is_resident(&self, index: usize) -> bool {
        match self.slots.get(index) {
            Some(slot) => slot.lock().await.strong_count() > 0,
            None => false,
        }
    }

    /// Returns frame `index`, decoding it on a blocking thread when no live copy exists.
    pub async fn get(&self, index: usize) -> Result<Arc<PixelBuffer>> {
        let slot = self.slots.get(index).ok_or(EraserError::MissingNeighbor {
            index,
            len: self.slots.len(),
        })?;
        let mut cached = slot.lock().await;
        if let Some(buffer) = cached.upgrade() {
            return Ok(buffer);
        }

        let source = Arc::clone(&self.source);
        let buffer = tokio::task::spawn_blocking(move || source.load(index))
            .await
            .map_err(|err| EraserError::Io(std::io::Error::other(err)))??;
        let buffer = Arc::new(buffer);
        *cached = Arc::downgrade(&buffer);
        debug!(frame = index, "decoded frame");
        Ok(buffer)
    }
}

/// Which frames a run has to process, given which outputs already exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumePlan {
    process: Vec<bool>,
}

impl ResumePlan {
    /// Frame `i` is processed when any output within `radius` of `i` is missing.
    pub fn new(len: usize, radius: usize, output_exists: impl Fn(usize) -> bool) -> Self {
        let missing: Vec<bool> = (0..len).map(|index| !output_exists(index)).collect();
        let process = (0..len)
            .map(|index| {
                let start = index.saturating_sub(radius);
                let end = (index + radius).min(len.saturating_sub(1));
                (start..=end).any(|other| missing[other])
            })
            .collect();
        Self { process }
    }

    /// A plan that processes everything.
    pub fn all(len: usize) -> Self {
        Self {
            process: vec![true; len],
        }
    }

    pub fn len(&self) -> usize {
        self.process.len()
    }

    pub fn is_empty(&self) -> bool {
        self.process.is_empty()
    }

    pub fn should_process(&self, index: usize) -> bool {
        self.process.get(index).copied().unwrap_or(false)
    }

    pub fn scheduled(&self) -> impl Iterator<Item = usize> + '_ {
        self.process
            .iter()
            .enumerate()
            .filter(|(_, process)| **process)
            .map(|(index, _)| index)
    }

    pub fn skipped_count(&self) -> usize {
        self.process.iter().filter(|process| !**process).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::pixel::pixel::Pixel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingSource {
        loads: AtomicUsize,
    }

    impl FrameSource for CountingSource {
        fn len(&self) -> usize {
            3
        }

        fn name(&self, index: usize) -> String {
            format!("{index}.tif")
        }

        fn load(&self, index: usize) -> Result<PixelBuffer> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(PixelBuffer::filled(2, 2, Pixel::new(index as u16, 0, 0)))
        }
    }

    #[test]
    fn resume_reprocesses_the_neighborhood_of_missing_outputs() {
        let plan = ResumePlan::new(10, 2, |index| index != 5);
        let scheduled: Vec<usize> = plan.scheduled().collect();
        assert_eq!(scheduled, vec![3, 4, 5, 6, 7]);
        assert_eq!(plan.skipped_count(), 5);

        let nothing_done = ResumePlan::new(4, 1, |_| false);
        assert_eq!(nothing_done, ResumePlan::all(4));

        let everything_done = ResumePlan::new(4, 1, |_| true);
        assert_eq!(everything_done.scheduled().count(), 0);
    }

    #[tokio::test]
    async fn live_frames_are_shared_and_dropped_ones_reloaded() {
        let source = Arc::new(CountingSource::default());
        let cache = FrameCache::new(source.clone());

        let first = cache.get(1).await.unwrap();
        let second = cache.get(1).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert!(cache.is_resident(1).await);

        drop(first);
        drop(second);
        assert!(!cache.is_resident(1).await);
        let again = cache.get(1).await.unwrap();
        assert_eq!(again.pixel(0, 0).red(), 1);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_requests_decode_once() {
        let source = Arc::new(CountingSource::default());
        let cache = Arc::new(FrameCache::new(source.clone()));
        let requests = (0..4).map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get(2).await })
        });
        let buffers: Vec<Arc<PixelBuffer>> = futures::future::join_all(requests)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();
        assert!(buffers.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequences_list_tiff_frames_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let frame = PixelBuffer::filled(3, 2, Pixel::new(100, 200, 300));
        for name in ["b.tif", "a.TIFF", "c.tif"] {
            image_helper::save_tiff_new(&dir.path().join(name), &frame).unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let sequence = TiffSequence::open(dir.path()).unwrap();
        assert_eq!(sequence.names(), ["a.TIFF", "b.tif", "c.tif"]);
        assert_eq!(sequence.load(2).unwrap(), frame);
    }

    #[test]
    fn empty_directories_are_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            TiffSequence::open(dir.path()),
            Err(EraserError::Config(_))
        ));
    }

    #[test]
    fn sinks_create_directories_and_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out").join("nested");
        let sink = TiffSink::new(
            output.clone(),
            dir.path().join("test-paint"),
            vec!["0.tif".into(), "1.tif".into()],
        );
        let frame = PixelBuffer::filled(2, 2, Pixel::new(5, 5, 5));

        assert!(!sink.output_exists(0));
        assert!(sink.write(0, &frame).unwrap());
        assert!(sink.output_exists(0));
        assert!(!sink.write(0, &PixelBuffer::new(2, 2)).unwrap());
        assert_eq!(image_helper::load_rgb16(&output.join("0.tif")).unwrap(), frame);

        assert!(sink.write_test_paint(1, &frame).unwrap());
        assert!(!sink.output_exists(1));
    }
}
