//! Time-windowed box retention

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::mp4::{BoxType, Mp4Box};

/// Number of leading boxes captured as the initialization segment.
pub(crate) const INIT_BOX_COUNT: usize = 2;

/// A retained box with its capture time
#[derive(Debug, Clone)]
pub struct BufferedBox {
    pub mp4_box: Mp4Box,
    pub captured_at: Instant,
}

/// Boxes handed to a new replay consumer
#[derive(Debug, Clone, Default)]
pub struct ReplaySnapshot {
    /// Initialization boxes, empty if not captured yet
    pub init: Vec<Mp4Box>,
    /// Retained boxes starting at a unit start
    pub boxes: Vec<Mp4Box>,
    /// True when no unit start was found, so live boxes must be skipped
    /// until the next `moof`
    pub need_unit_start: bool,
}

/// Whether an ingested box belonged to the initialization segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Init,
    Media,
}

/// Rolling window of recent boxes plus the captured initialization boxes
///
/// The first two boxes of a capture are kept as the initialization segment
/// and never evicted. Every later box is kept until it is older than the
/// retention window.
#[derive(Debug)]
pub struct RetainedBoxes {
    retention: Duration,
    init: Vec<Mp4Box>,
    boxes: VecDeque<BufferedBox>,
}

impl RetainedBoxes {
    /// Creates an empty window.
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            init: Vec::with_capacity(INIT_BOX_COUNT),
            boxes: VecDeque::new(),
        }
    }

    /// Starts a fresh capture: the next two boxes become the new
    /// initialization segment and retained media is discarded.
    pub fn begin_capture(&mut self) {
        self.init.clear();
        self.boxes.clear();
    }

    /// Records a box received at `now`.
    pub fn ingest(&mut self, mp4_box: Mp4Box, now: Instant) -> Ingested {
        if self.init.len() < INIT_BOX_COUNT {
            self.init.push(mp4_box);
            return Ingested::Init;
        }

        self.boxes.push_back(BufferedBox {
            mp4_box,
            captured_at: now,
        });
        self.evict(now);
        Ingested::Media
    }

    /// Drops boxes captured before `now - retention`.
    pub fn evict(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return;
        };
        while self
            .boxes
            .front()
            .is_some_and(|buffered| buffered.captured_at < cutoff)
        {
            self.boxes.pop_front();
        }
    }

    /// True once both initialization boxes have been captured.
    pub fn has_init(&self) -> bool {
        self.init.len() == INIT_BOX_COUNT
    }

    /// Captured initialization boxes.
    pub fn init_boxes(&self) -> &[Mp4Box] {
        &self.init
    }

    /// Number of retained media boxes.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// True when no media boxes are retained.
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Capture time of the oldest retained box.
    pub fn oldest(&self) -> Option<Instant> {
        self.boxes.front().map(|buffered| buffered.captured_at)
    }

    /// Copies what a consumer asking for `window` of history should receive.
    ///
    /// Media starts at the oldest `moof` captured within the window; leading
    /// boxes that would begin mid-unit are skipped. The window never reaches
    /// further back than the retention window, even if nothing was ingested
    /// since the last eviction.
    pub fn replay_from(&self, window: Duration, now: Instant) -> ReplaySnapshot {
        let cutoff = now.checked_sub(window.min(self.retention));
        let start = self.boxes.iter().position(|buffered| {
            cutoff.is_none_or(|cutoff| buffered.captured_at >= cutoff)
                && buffered.mp4_box.box_type == BoxType::MOOF
        });

        let boxes: Vec<Mp4Box> = match start {
            Some(start) => self
                .boxes
                .iter()
                .skip(start)
                .map(|buffered| buffered.mp4_box.clone())
                .collect(),
            None => Vec::new(),
        };

        ReplaySnapshot {
            init: self.init.clone(),
            need_unit_start: boxes.is_empty(),
            boxes,
        }
    }
}
