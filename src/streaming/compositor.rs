//! Active sub-batch assembly.
//!
//! Every step the compositor derives the ordered list of streams that had
//! not finished when the step began, advances each of them by one
//! frame-group and stacks their normalized windows into a single batch.
//! Position `k` of that batch belongs to `batch.streams[k]` for this step
//! only; results must be mapped back through it before the next step.

use crate::error::{FrameBatchError, Result};
use crate::streaming::frame::{StepBatch, StreamId};
use crate::streaming::model::OutputKind;
use crate::streaming::ring_buffer::BufferGeometry;
use crate::streaming::stream::{FeatureSource, StreamState};
use ndarray::{Array3, s};
use std::collections::HashMap;
use tracing::{debug, info};

/// Result of one compositor step.
#[derive(Debug)]
pub enum StepStatus {
    /// Normalized inputs for the inference call of this step.
    Batch(StepBatch),
    /// Every stream has finished; no further steps are accepted.
    Exhausted,
}

/// Owns every registered stream and builds the per-step batch.
pub struct BatchCompositor {
    geometry: BufferGeometry,
    streams: Vec<StreamState>,
    step_index: u32,
    terminal: bool,
}

impl BatchCompositor {
    pub fn new(geometry: BufferGeometry) -> Self {
        Self {
            geometry,
            streams: Vec::new(),
            step_index: 0,
            terminal: false,
        }
    }

    pub fn geometry(&self) -> BufferGeometry {
        self.geometry
    }

    /// Registers a stream and returns its stable id.
    pub fn register(
        &mut self,
        source: Box<dyn FeatureSource>,
        output: OutputKind,
    ) -> Result<StreamId> {
        if self.terminal {
            return Err(FrameBatchError::usage(
                "cannot register a stream after all streams finished; reset first",
            ));
        }
        let id = StreamId(self.streams.len());
        self.streams
            .push(StreamState::new(id, source, self.geometry, output)?);
        debug!(stream = %id, "Registered stream");
        Ok(id)
    }

    /// Advances every active stream by one frame-group.
    pub fn step(&mut self) -> Result<StepStatus> {
        if self.terminal {
            return Err(FrameBatchError::usage(
                "step() called after all streams finished",
            ));
        }

        let step = self.step_index;
        let streams = self.active_streams();
        if streams.is_empty() {
            return Ok(self.exhaust(step));
        }

        let mut padding = Vec::with_capacity(streams.len());
        for &id in &streams {
            let has_frames = self.streams[id.index()].advance(step)?;
            padding.push(!has_frames);
        }
        self.step_index += 1;

        // Every slot finished this step: nothing real left to score.
        if padding.iter().all(|&p| p) {
            return Ok(self.exhaust(step));
        }

        let mut features = Array3::zeros((
            streams.len(),
            self.geometry.feature_count,
            self.geometry.window_length,
        ));
        for (position, &id) in streams.iter().enumerate() {
            self.streams[id.index()]
                .buffer()
                .normalize_into(features.slice_mut(s![position, .., ..]))?;
        }

        debug!(
            step,
            active = streams.len(),
            padding = padding.iter().filter(|&&p| p).count(),
            "Built step batch"
        );

        Ok(StepStatus::Batch(StepBatch {
            step,
            streams,
            padding,
            features,
        }))
    }

    fn exhaust(&mut self, step: u32) -> StepStatus {
        self.terminal = true;
        info!(step, streams = self.streams.len(), "All streams finished");
        StepStatus::Exhausted
    }

    /// Streams that have not finished yet, in id order.
    pub fn active_streams(&self) -> Vec<StreamId> {
        self.streams
            .iter()
            .filter(|stream| !stream.is_finished())
            .map(StreamState::id)
            .collect()
    }

    pub fn stream(&self, id: StreamId) -> Result<&StreamState> {
        self.streams
            .get(id.index())
            .ok_or_else(|| unknown_stream(id))
    }

    pub(crate) fn stream_mut(&mut self, id: StreamId) -> Result<&mut StreamState> {
        self.streams
            .get_mut(id.index())
            .ok_or_else(|| unknown_stream(id))
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamState> {
        self.streams.iter()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Index of the next step.
    pub fn step_index(&self) -> u32 {
        self.step_index
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Drops every stream and rewinds the step counter.
    pub fn reset(&mut self) {
        self.streams.clear();
        self.step_index = 0;
        self.terminal = false;
    }
}

fn unknown_stream(id: StreamId) -> FrameBatchError {
    FrameBatchError::usage(format!("stream {} is not registered", id))
}

/// Reorders per-position state from one step's active order to the next.
///
/// `previous[k]` belongs to `previous_order[k]`. Streams that dropped out are
/// discarded; streams without earlier state (newly registered) get `None`.
pub fn refilter<H>(
    previous_order: &[StreamId],
    previous: Vec<Option<H>>,
    next_order: &[StreamId],
) -> Result<Vec<Option<H>>> {
    if previous_order.len() != previous.len() {
        return Err(FrameBatchError::inconsistency(format!(
            "{} hypotheses for {} active streams",
            previous.len(),
            previous_order.len()
        )));
    }

    let mut by_stream: HashMap<StreamId, Option<H>> =
        previous_order.iter().copied().zip(previous).collect();
    Ok(next_order
        .iter()
        .map(|id| by_stream.remove(id).flatten())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::stream::FrameSource;
    use ndarray::{Array2, array};

    fn geometry() -> BufferGeometry {
        BufferGeometry {
            feature_count: 1,
            window_length: 4,
            pad_value: 0.0,
            epsilon: 1e-5,
        }
    }

    fn source(groups: usize) -> Box<dyn FeatureSource> {
        let frames: Vec<Array2<f32>> = (0..groups)
            .map(|g| array![[g as f32, g as f32 + 0.5]])
            .collect();
        Box::new(FrameSource::new(frames))
    }

    fn batch(status: StepStatus) -> StepBatch {
        match status {
            StepStatus::Batch(batch) => batch,
            StepStatus::Exhausted => panic!("expected a batch"),
        }
    }

    #[test]
    fn test_register_assigns_increasing_ids() {
        let mut compositor = BatchCompositor::new(geometry());
        let a = compositor.register(source(1), OutputKind::SingleOutput).unwrap();
        let b = compositor.register(source(1), OutputKind::SingleOutput).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(compositor.len(), 2);
    }

    #[test]
    fn test_finishing_stream_keeps_one_padding_slot() {
        let mut compositor = BatchCompositor::new(geometry());
        compositor.register(source(3), OutputKind::SingleOutput).unwrap();
        compositor.register(source(1), OutputKind::SingleOutput).unwrap();

        let step0 = batch(compositor.step().unwrap());
        assert_eq!(step0.streams, vec![StreamId(0), StreamId(1)]);
        assert_eq!(step0.padding, vec![false, false]);

        let step1 = batch(compositor.step().unwrap());
        assert_eq!(step1.streams, vec![StreamId(0), StreamId(1)]);
        assert_eq!(step1.padding, vec![false, true]);
        assert_eq!(compositor.stream(StreamId(1)).unwrap().finish_step().unwrap(), 1);

        let step2 = batch(compositor.step().unwrap());
        assert_eq!(step2.streams, vec![StreamId(0)]);
        assert_eq!(step2.features.dim(), (1, 1, 4));
    }

    #[test]
    fn test_padding_slot_is_zero_window() {
        let mut compositor = BatchCompositor::new(geometry());
        compositor.register(source(2), OutputKind::SingleOutput).unwrap();
        compositor.register(source(0), OutputKind::SingleOutput).unwrap();

        let step0 = batch(compositor.step().unwrap());
        assert_eq!(step0.padding, vec![false, true]);
        assert!(step0.features.slice(s![1, .., ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_batch_matches_buffer_normalization() {
        let mut compositor = BatchCompositor::new(geometry());
        let id = compositor.register(source(2), OutputKind::SingleOutput).unwrap();
        let step0 = batch(compositor.step().unwrap());
        let expected = compositor.stream(id).unwrap().buffer().normalized();
        assert_eq!(step0.features.slice(s![0, .., ..]), expected.view());
    }

    #[test]
    fn test_terminal_after_all_streams_finish() {
        let mut compositor = BatchCompositor::new(geometry());
        compositor.register(source(1), OutputKind::SingleOutput).unwrap();

        assert!(matches!(compositor.step().unwrap(), StepStatus::Batch(_)));
        assert!(matches!(compositor.step().unwrap(), StepStatus::Exhausted));
        assert!(compositor.is_terminal());

        let again = compositor.step();
        assert!(matches!(again, Err(FrameBatchError::Usage { .. })));
        let late = compositor.register(source(1), OutputKind::SingleOutput);
        assert!(matches!(late, Err(FrameBatchError::Usage { .. })));
    }

    #[test]
    fn test_empty_compositor_is_exhausted() {
        let mut compositor = BatchCompositor::new(geometry());
        assert!(matches!(compositor.step().unwrap(), StepStatus::Exhausted));
    }

    #[test]
    fn test_reset_allows_reuse() {
        let mut compositor = BatchCompositor::new(geometry());
        compositor.register(source(0), OutputKind::SingleOutput).unwrap();
        compositor.step().unwrap();
        assert!(compositor.is_terminal());

        compositor.reset();
        assert!(!compositor.is_terminal());
        assert!(compositor.is_empty());
        assert_eq!(compositor.step_index(), 0);
        let id = compositor.register(source(1), OutputKind::SingleOutput).unwrap();
        assert_eq!(id.index(), 0);
    }

    #[test]
    fn test_unknown_stream_is_usage_error() {
        let compositor = BatchCompositor::new(geometry());
        assert!(matches!(
            compositor.stream(StreamId(3)),
            Err(FrameBatchError::Usage { .. })
        ));
    }

    #[test]
    fn test_refilter_drops_finished_streams() {
        let previous_order = [StreamId(0), StreamId(1), StreamId(2)];
        let previous = vec![Some("h0"), Some("h1"), Some("h2")];
        let next = refilter(&previous_order, previous, &[StreamId(0), StreamId(2)]).unwrap();
        assert_eq!(next, vec![Some("h0"), Some("h2")]);
    }

    #[test]
    fn test_refilter_new_stream_gets_none() {
        let next = refilter(&[StreamId(0)], vec![Some(7)], &[StreamId(0), StreamId(1)]).unwrap();
        assert_eq!(next, vec![Some(7), None]);
    }

    #[test]
    fn test_refilter_length_mismatch() {
        let result = refilter(&[StreamId(0), StreamId(1)], vec![Some(1)], &[StreamId(0)]);
        assert!(matches!(
            result,
            Err(FrameBatchError::StateInconsistency { .. })
        ));
    }
}
