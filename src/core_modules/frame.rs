// THEORY:
// A `ProcessedFrame` is everything the engine keeps about a frame between
// detection and output: its groups, their sizes and the provisional paint
// decisions. It deliberately holds no pixel data. Buffers are dropped when a
// worker hands the frame off and are reloaded only for painting, which keeps
// the resident set proportional to the window rather than the sequence.
//
// Key architectural principles:
// 1.  **Forward-only lifecycle**: A frame walks through `FrameState` in one
//     direction. Any attempt to move it backwards is an internal error, since
//     it can only mean two components disagree about where the frame is.
// 2.  **Provisional then committed**: Decisions live in a per-frame map while
//     the window is still reconciling them. They are committed into the
//     groups exactly once, when the frame is finalized.
// 3.  **Painting is a copy**: Repainting a group copies each of its members,
//     padding included, from a neighboring frame at the same coordinate. A
//     member is replaced outright however faintly it cleared the threshold.

use crate::core_modules::group_tagger::GroupSizes;
use crate::core_modules::outlier_detector::Tag;
use crate::core_modules::outlier_group::OutlierGroup;
use crate::core_modules::paint_policy::{PADDING_TEST_COLOR, PaintDecision, PaintReason};
use crate::core_modules::pixel_buffer::PixelBuffer;
use crate::error::{InternalError, Result};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FrameState {
    LoadingImages,
    DetectingOutliers,
    InterFrameProcessing,
    OutlierProcessingComplete,
    ReloadingImages,
    Painting,
    WritingOutputFile,
    Complete,
}

impl FrameState {
    /// Checks that `next` does not move backwards from `self`.
    pub fn advance(self, index: usize, next: FrameState) -> Result<FrameState> {
        if next < self {
            return Err(InternalError::BackwardTransition {
                index,
                from: self.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        Ok(next)
    }

    pub fn is_processing_complete(self) -> bool {
        self >= FrameState::OutlierProcessingComplete
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameState::LoadingImages => "loadingImages",
            FrameState::DetectingOutliers => "detectingOutliers",
            FrameState::InterFrameProcessing => "interFrameProcessing",
            FrameState::OutlierProcessingComplete => "outlierProcessingComplete",
            FrameState::ReloadingImages => "reloadingImages",
            FrameState::Painting => "painting",
            FrameState::WritingOutputFile => "writingOutputFile",
            FrameState::Complete => "complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    /// Outlier pixels found before grouping, padding excluded.
    pub outlier_count: usize,
    pub groups: Vec<OutlierGroup>,
    pub sizes: GroupSizes,
    decisions: BTreeMap<Tag, PaintDecision>,
    state: FrameState,
}

impl ProcessedFrame {
    pub fn new(
        index: usize,
        width: u32,
        height: u32,
        outlier_count: usize,
        groups: Vec<OutlierGroup>,
        sizes: GroupSizes,
    ) -> Self {
        Self {
            index,
            width,
            height,
            outlier_count,
            groups,
            sizes,
            decisions: BTreeMap::new(),
            state: FrameState::InterFrameProcessing,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn set_state(&mut self, next: FrameState) -> Result<()> {
        self.state = self.state.advance(self.index, next)?;
        Ok(())
    }

    pub fn group(&self, tag: &Tag) -> Option<&OutlierGroup> {
        self.groups.iter().find(|group| group.tag == *tag)
    }

    pub fn decision(&self, tag: &Tag) -> Option<&PaintDecision> {
        self.decisions.get(tag)
    }

    pub fn reason(&self, tag: &Tag) -> Option<PaintReason> {
        self.decisions.get(tag).map(|decision| decision.reason)
    }

    pub fn decisions(&self) -> impl Iterator<Item = (&Tag, &PaintDecision)> {
        self.decisions.iter()
    }

    /// Records or replaces a provisional decision.
    pub fn set_decision(&mut self, tag: Tag, decision: PaintDecision) {
        self.decisions.insert(tag, decision);
    }

    /// Moves a group to a cross-frame reason, keeping its classifier score.
    pub fn promote(&mut self, tag: Tag, reason: PaintReason) {
        let score = self.decisions.get(&tag).and_then(|decision| decision.score);
        self.decisions.insert(tag, PaintDecision::new(reason, score));
    }

    /// Freezes every provisional decision into its group.
    pub fn commit_decisions(&mut self) -> Result<()> {
        for group in &mut self.groups {
            if let Some(decision) = self.decisions.get(&group.tag) {
                group.commit_decision(*decision)?;
            }
        }
        Ok(())
    }

    pub fn painted_groups(&self) -> impl Iterator<Item = &OutlierGroup> {
        self.groups.iter().filter(|group| {
            self.decisions
                .get(&group.tag)
                .is_some_and(|decision| decision.will_paint())
        })
    }

    /// Replaces every member of every painted group, padding included, with
    /// the pixel of `source` at the same coordinate. Returns the number of
    /// pixels replaced.
    pub fn paint(&self, target: &mut PixelBuffer, source: &PixelBuffer) -> usize {
        let mut painted = 0;
        for group in self.painted_groups() {
            let members = group
                .members()
                .map(|(x, y, _)| (x, y))
                .chain(group.padding.iter().map(|point| (point.x, point.y)));
            for (x, y) in members {
                target.set_pixel(x, y, source.pixel(x, y));
                painted += 1;
            }
        }
        painted
    }

    /// Colors every group by its decision reason, padding in its own color.
    pub fn test_paint(&self, target: &mut PixelBuffer) {
        for group in &self.groups {
            let Some(reason) = self.reason(&group.tag) else {
                continue;
            };
            let color = reason.test_paint_color();
            for (x, y, _) in group.members() {
                target.set_pixel(x, y, color);
            }
            for point in &group.padding {
                target.set_pixel(point.x, point.y, PADDING_TEST_COLOR);
            }
        }
    }
}
