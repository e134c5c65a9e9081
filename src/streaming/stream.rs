//! Per-stream bookkeeping and feature sources.
//!
//! A stream owns its frame source, its ring buffer and its merged token
//! history. It finishes the first time its source yields nothing (or
//! fails); the step at which that happened is recorded once and marks
//! where real model output ends and padding begins.

use crate::error::{FrameBatchError, Result};
use crate::streaming::frame::{FeatureChunk, StreamId, TokenId};
use crate::streaming::model::OutputKind;
use crate::streaming::ring_buffer::{BufferGeometry, RingFeatureBuffer};
use ndarray::{Array2, s};
use tracing::{info, warn};

/// Source of frame-groups for one stream.
pub trait FeatureSource: Send {
    /// Returns the next frame-group, `None` once exhausted.
    ///
    /// An `Err` ends the stream early; the rest of the batch keeps running.
    fn next_frames(&mut self) -> Option<Result<FeatureChunk>>;
}

/// Adapts any iterator of frame-groups into a [`FeatureSource`].
pub struct FrameSource<I> {
    frames: I,
}

impl<I> FrameSource<I>
where
    I: Iterator<Item = FeatureChunk> + Send,
{
    pub fn new(frames: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            frames: frames.into_iter(),
        }
    }
}

impl<I> FeatureSource for FrameSource<I>
where
    I: Iterator<Item = FeatureChunk> + Send,
{
    fn next_frames(&mut self) -> Option<Result<FeatureChunk>> {
        self.frames.next().map(Ok)
    }
}

/// Slices a precomputed `[feature_count, T]` feature matrix into frame-groups.
///
/// Every group is exactly `frame_length` columns wide; the last one is
/// filled up with the pad value.
#[derive(Debug, Clone)]
pub struct FeatureIterator {
    features: Array2<f32>,
    frame_length: usize,
    pad_value: f32,
    cursor: usize,
}

impl FeatureIterator {
    pub fn new(features: Array2<f32>, frame_length: usize, pad_value: f32) -> Result<Self> {
        if frame_length == 0 {
            return Err(FrameBatchError::usage("frame_length must be positive"));
        }
        Ok(Self {
            features,
            frame_length,
            pad_value,
            cursor: 0,
        })
    }

    /// Appends `columns` pad columns after the real features.
    ///
    /// Used to push the last real frames through the delayed, trusted part
    /// of the window before the stream ends.
    pub fn with_trailing_padding(mut self, columns: usize) -> Self {
        if columns == 0 {
            return self;
        }
        let (rows, cols) = self.features.dim();
        let mut padded = Array2::from_elem((rows, cols + columns), self.pad_value);
        padded.slice_mut(s![.., ..cols]).assign(&self.features);
        self.features = padded;
        self
    }

    /// Number of frame-groups still to be produced.
    pub fn remaining(&self) -> usize {
        let cols = self.features.ncols().saturating_sub(self.cursor);
        cols.div_ceil(self.frame_length)
    }
}

impl Iterator for FeatureIterator {
    type Item = FeatureChunk;

    fn next(&mut self) -> Option<FeatureChunk> {
        let total = self.features.ncols();
        if self.cursor >= total {
            return None;
        }
        let end = (self.cursor + self.frame_length).min(total);
        let mut frame = Array2::from_elem((self.features.nrows(), self.frame_length), self.pad_value);
        frame
            .slice_mut(s![.., ..end - self.cursor])
            .assign(&self.features.slice(s![.., self.cursor..end]));
        self.cursor = end;
        Some(frame)
    }
}

impl FeatureSource for FeatureIterator {
    fn next_frames(&mut self) -> Option<Result<FeatureChunk>> {
        self.next().map(Ok)
    }
}

/// Bookkeeping for one registered audio stream.
pub struct StreamState {
    id: StreamId,
    source: Box<dyn FeatureSource>,
    buffer: RingFeatureBuffer,
    output: OutputKind,
    finished: bool,
    finish_step: Option<u32>,
    degraded: bool,
    merged_chunks: usize,
    unmerged_tokens: Vec<TokenId>,
}

impl StreamState {
    pub(crate) fn new(
        id: StreamId,
        source: Box<dyn FeatureSource>,
        geometry: BufferGeometry,
        output: OutputKind,
    ) -> Result<Self> {
        Ok(Self {
            id,
            source,
            buffer: RingFeatureBuffer::new(geometry)?,
            output,
            finished: false,
            finish_step: None,
            degraded: false,
            merged_chunks: 0,
            unmerged_tokens: Vec::new(),
        })
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// True if the source failed and the stream was ended early.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Step at which this stream first produced padding.
    pub fn finish_step(&self) -> Result<u32> {
        self.finish_step.ok_or_else(|| {
            FrameBatchError::inconsistency(format!(
                "finish step of stream {} requested before it finished",
                self.id
            ))
        })
    }

    /// True if the model output of `step` came from real frames.
    pub fn is_real_step(&self, step: u32) -> bool {
        self.finish_step.is_none_or(|finish| step < finish)
    }

    pub fn output_kind(&self) -> &OutputKind {
        &self.output
    }

    pub fn buffer(&self) -> &RingFeatureBuffer {
        &self.buffer
    }

    /// Merged token history, blanks included for frame-level decoders.
    pub fn unmerged_tokens(&self) -> &[TokenId] {
        &self.unmerged_tokens
    }

    /// Number of chunks merged into the history so far.
    pub fn merged_chunks(&self) -> usize {
        self.merged_chunks
    }

    pub(crate) fn tokens_mut(&mut self) -> &mut Vec<TokenId> {
        &mut self.unmerged_tokens
    }

    pub(crate) fn record_merge(&mut self) {
        self.merged_chunks += 1;
    }

    /// Pulls the next frame-group and feeds it into the ring buffer.
    ///
    /// Returns `true` when real frames were pushed, `false` when the window
    /// was zeroed because the stream is (now) finished.
    pub(crate) fn advance(&mut self, step: u32) -> Result<bool> {
        let frames = if self.finished {
            None
        } else {
            self.pull(step)
        };
        let has_frames = frames.is_some();
        self.buffer.push(frames.as_ref().map(|f| f.view()))?;
        Ok(has_frames)
    }

    fn pull(&mut self, step: u32) -> Option<FeatureChunk> {
        match self.source.next_frames() {
            Some(Ok(frames)) if frames.nrows() == self.buffer.feature_count() => Some(frames),
            Some(Ok(frames)) => {
                self.degrade(
                    step,
                    format!(
                        "frame-group has {} feature rows, expected {}",
                        frames.nrows(),
                        self.buffer.feature_count()
                    ),
                );
                None
            }
            Some(Err(e)) => {
                self.degrade(step, e.to_string());
                None
            }
            None => {
                self.mark_finished(step);
                None
            }
        }
    }

    fn degrade(&mut self, step: u32, message: String) {
        let error = FrameBatchError::FeatureSource {
            stream: self.id.index(),
            message,
        };
        warn!(stream = %self.id, step, error = %error, "Feature source failed, ending stream early");
        self.degraded = true;
        self.mark_finished(step);
    }

    fn mark_finished(&mut self, step: u32) {
        self.finished = true;
        if self.finish_step.is_none() {
            self.finish_step = Some(step);
            info!(stream = %self.id, step, "Stream finished");
        }
    }
}
