//! Frame types for the streaming engine.
//!
//! Defines the data structures that flow between the buffer, the
//! compositor, the inference collaborator and the stitcher.

use ndarray::{Array2, Array3};
use std::fmt;

/// Integer token id produced by the inference model.
pub type TokenId = u32;

/// A group of consecutive feature frames, shaped `[feature_count, width]`.
pub type FeatureChunk = Array2<f32>;

/// Stable identifier of a registered stream.
///
/// Assigned at registration in increasing order and never reused while
/// the engine lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub(crate) usize);

impl StreamId {
    /// Returns the registration index of this stream.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-timestep symbols emitted by the model for one window.
///
/// CTC models emit exactly one label per timestep; transducers emit up to
/// `max_steps_per_timestep` symbols, usually ending in a blank.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alignment {
    timesteps: Vec<Vec<TokenId>>,
}

impl Alignment {
    /// Creates an alignment from per-timestep symbol lists.
    pub fn new(timesteps: Vec<Vec<TokenId>>) -> Self {
        Self { timesteps }
    }

    /// Creates a frame-level alignment with one label per timestep.
    pub fn from_labels(labels: impl IntoIterator<Item = TokenId>) -> Self {
        Self {
            timesteps: labels.into_iter().map(|label| vec![label]).collect(),
        }
    }

    /// Number of timesteps.
    pub fn len(&self) -> usize {
        self.timesteps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timesteps.is_empty()
    }

    pub fn timesteps(&self) -> &[Vec<TokenId>] {
        &self.timesteps
    }

    /// Flattens timesteps `[start, end)` into a token sequence.
    ///
    /// Bounds are clamped to the alignment. When `drop_blank` is set, that
    /// symbol is removed from the output.
    pub fn flatten_range(&self, start: usize, end: usize, drop_blank: Option<TokenId>) -> Vec<TokenId> {
        let end = end.min(self.timesteps.len());
        let start = start.min(end);
        self.timesteps[start..end]
            .iter()
            .flatten()
            .copied()
            .filter(|&token| Some(token) != drop_blank)
            .collect()
    }

    /// Flattens every timestep.
    pub fn flatten(&self, drop_blank: Option<TokenId>) -> Vec<TokenId> {
        self.flatten_range(0, self.timesteps.len(), drop_blank)
    }
}

/// Normalized inputs for one inference call.
#[derive(Debug, Clone)]
pub struct StepBatch {
    /// Global step index (0-based).
    pub step: u32,
    /// Stream occupying each active position, in batch order.
    pub streams: Vec<StreamId>,
    /// Whether the slot only carries padding (its stream finished this step).
    pub padding: Vec<bool>,
    /// Normalized windows, shaped `[active, feature_count, window_length]`.
    pub features: Array3<f32>,
}

impl StepBatch {
    /// Number of active positions.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Returns the active position of a stream in this batch.
    pub fn position_of(&self, stream: StreamId) -> Option<usize> {
        self.streams.iter().position(|&s| s == stream)
    }
}
