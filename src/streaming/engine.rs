//! Step-driven streaming transcription engine.
//!
//! Ties the compositor, the inference collaborator, the stitcher and the
//! transcript assembler together. One call to [`StreamingEngine::step`]
//! gathers frames for every active stream, runs one batched inference call
//! and merges each real output into its stream's history, in stream order.

use crate::defaults;
use crate::error::{FrameBatchError, Result};
use crate::streaming::compositor::{BatchCompositor, StepStatus, refilter};
use crate::streaming::frame::{FeatureChunk, StreamId, TokenId};
use crate::streaming::model::{DecodingKind, InferenceModel, ModelOutput, OutputKind};
use crate::streaming::ring_buffer::BufferGeometry;
use crate::streaming::stitcher::{AlignmentMerger, MergeOutcome, StitcherConfig};
use crate::streaming::stream::{FeatureIterator, FeatureSource};
use crate::streaming::transcript::{Tokenizer, TranscriptAssembler};
use tracing::{debug, info};

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub geometry: BufferGeometry,
    /// Columns per frame-group when registering raw feature matrices.
    pub frame_length: usize,
    /// Merge settings; `stitcher.blank_id` is also the assembler's blank.
    pub stitcher: StitcherConfig,
    pub decoding: DecodingKind,
    /// Carry decoder hypotheses across steps.
    pub stateful: bool,
    /// Output head read by streams registered without an explicit choice.
    pub output: OutputKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            geometry: BufferGeometry {
                feature_count: defaults::FEATURE_COUNT,
                window_length: defaults::WINDOW_LENGTH,
                pad_value: defaults::PAD_VALUE,
                epsilon: defaults::NORMALIZATION_EPSILON,
            },
            frame_length: defaults::FRAME_LENGTH,
            stitcher: StitcherConfig {
                blank_id: Some(defaults::BLANK_ID),
                ..StitcherConfig::default()
            },
            decoding: DecodingKind::default(),
            stateful: false,
            output: OutputKind::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.geometry.feature_count == 0 || self.geometry.window_length == 0 {
            return Err(FrameBatchError::usage(
                "feature_count and window_length must be positive",
            ));
        }
        if self.frame_length == 0 {
            return Err(FrameBatchError::usage("frame_length must be positive"));
        }
        if self.stitcher.max_steps_per_timestep == 0 {
            return Err(FrameBatchError::usage(
                "max_steps_per_timestep must be at least 1",
            ));
        }
        if self.stitcher.blank_id.is_none() {
            return Err(FrameBatchError::usage("blank_id must be set"));
        }
        AlignmentMerger::new(self.stitcher.clone()).validate()
    }

    /// Blank symbol removed while flattening alignments, if any.
    fn dropped_blank(&self) -> Option<TokenId> {
        match self.decoding {
            DecodingKind::Ctc => None,
            DecodingKind::Transducer => self.stitcher.blank_id,
        }
    }
}

/// What a single step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub step: u32,
    /// Active order used for this step's inference call.
    pub active: Vec<StreamId>,
    /// Streams whose history grew, with the merge details.
    pub merged: Vec<(StreamId, MergeOutcome)>,
    /// Streams that scored their padding slot this step.
    pub finished: Vec<StreamId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced(StepReport),
    /// Every stream has finished. Further calls to `step()` fail.
    Finished,
}

/// Transcript of one stream once processing is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalTranscript {
    pub stream: StreamId,
    pub text: String,
    /// Output token ids after collapse.
    pub tokens: Vec<TokenId>,
    /// The stream's feature source failed and it was ended early.
    pub degraded: bool,
}

type HypothesisSlots<H> = (Vec<StreamId>, Vec<Option<H>>);

/// Batched streaming transcription engine.
pub struct StreamingEngine<M: InferenceModel, T> {
    config: EngineConfig,
    compositor: BatchCompositor,
    merger: AlignmentMerger,
    assembler: TranscriptAssembler,
    model: M,
    tokenizer: T,
    hypotheses: Option<HypothesisSlots<M::Hypothesis>>,
}

impl<M, T> StreamingEngine<M, T>
where
    M: InferenceModel,
    T: Tokenizer,
{
    pub fn new(config: EngineConfig, model: M, tokenizer: T) -> Result<Self> {
        config.validate()?;
        let blank_id = config
            .stitcher
            .blank_id
            .ok_or_else(|| FrameBatchError::usage("blank_id must be set"))?;

        Ok(Self {
            compositor: BatchCompositor::new(config.geometry),
            merger: AlignmentMerger::new(config.stitcher.clone()),
            assembler: TranscriptAssembler::new(blank_id, config.decoding),
            config,
            model,
            tokenizer,
            hypotheses: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn compositor(&self) -> &BatchCompositor {
        &self.compositor
    }

    /// Registers a stream reading the engine's default output head.
    pub fn register_stream(&mut self, source: impl FeatureSource + 'static) -> Result<StreamId> {
        let output = self.config.output.clone();
        self.register_stream_with_output(source, output)
    }

    pub fn register_stream_with_output(
        &mut self,
        source: impl FeatureSource + 'static,
        output: OutputKind,
    ) -> Result<StreamId> {
        self.compositor.register(Box::new(source), output)
    }

    /// Registers a precomputed `[feature_count, T]` feature matrix.
    pub fn register_features(&mut self, features: FeatureChunk) -> Result<StreamId> {
        let source = FeatureIterator::new(
            features,
            self.config.frame_length,
            self.config.geometry.pad_value,
        )?;
        self.register_stream(source)
    }

    /// Runs one inference step over the active sub-batch.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let batch = match self.compositor.step()? {
            StepStatus::Batch(batch) => batch,
            StepStatus::Exhausted => {
                self.hypotheses = None;
                return Ok(StepOutcome::Finished);
            }
        };

        let previous = self.previous_hypotheses(&batch.streams)?;
        let outputs = self.model.infer(&batch, previous)?;
        if outputs.len() != batch.len() {
            return Err(FrameBatchError::inconsistency(format!(
                "model returned {} outputs for {} active streams at step {}",
                outputs.len(),
                batch.len(),
                batch.step
            )));
        }

        let drop_blank = self.config.dropped_blank();
        let mut hypotheses = Vec::with_capacity(batch.len());
        let mut merged = Vec::new();
        let mut finished = Vec::new();

        for ((&id, &padding), output) in batch.streams.iter().zip(&batch.padding).zip(outputs) {
            let ModelOutput {
                prediction,
                hypothesis,
            } = output;
            hypotheses.push(hypothesis);

            let stream = self.compositor.stream_mut(id)?;
            if padding || !stream.is_real_step(batch.step) {
                finished.push(id);
                continue;
            }

            let alignment = stream.output_kind().select(&prediction)?;
            let first_chunk = stream.merged_chunks() == 0;
            let outcome = self
                .merger
                .merge(stream.tokens_mut(), alignment, first_chunk, drop_blank)?;
            stream.record_merge();
            merged.push((id, outcome));
        }

        if self.config.stateful {
            self.hypotheses = Some((batch.streams.clone(), hypotheses));
        }

        debug!(
            step = batch.step,
            merged = merged.len(),
            finished = finished.len(),
            "Step complete"
        );

        Ok(StepOutcome::Advanced(StepReport {
            step: batch.step,
            active: batch.streams,
            merged,
            finished,
        }))
    }

    // Previous step's hypotheses, reordered to the new active order.
    fn previous_hypotheses(&mut self, order: &[StreamId]) -> Result<Vec<Option<M::Hypothesis>>> {
        match self.hypotheses.take() {
            Some((previous_order, previous)) if self.config.stateful => {
                refilter(&previous_order, previous, order)
            }
            _ => Ok(order.iter().map(|_| None).collect()),
        }
    }

    /// Steps until every stream has finished, then returns all transcripts.
    pub fn run_to_completion(&mut self) -> Result<Vec<FinalTranscript>> {
        while !self.compositor.is_terminal() {
            if self.step()? == StepOutcome::Finished {
                break;
            }
        }
        self.finalize()
    }

    /// Current text of a stream.
    pub fn transcript(&self, id: StreamId) -> Result<String> {
        let stream = self.compositor.stream(id)?;
        Ok(self
            .assembler
            .text(stream.unmerged_tokens(), &self.tokenizer))
    }

    /// Output token ids of a stream (collapsed, blanks removed).
    pub fn token_ids(&self, id: StreamId) -> Result<Vec<TokenId>> {
        let stream = self.compositor.stream(id)?;
        Ok(self.assembler.token_ids(stream.unmerged_tokens()))
    }

    /// Raw merged history of a stream.
    pub fn tokens(&self, id: StreamId) -> Result<&[TokenId]> {
        Ok(self.compositor.stream(id)?.unmerged_tokens())
    }

    pub fn is_finished(&self, id: StreamId) -> Result<bool> {
        Ok(self.compositor.stream(id)?.is_finished())
    }

    pub fn finish_step(&self, id: StreamId) -> Result<u32> {
        self.compositor.stream(id)?.finish_step()
    }

    pub fn is_terminal(&self) -> bool {
        self.compositor.is_terminal()
    }

    /// Transcripts of every stream, ordered by stream id.
    ///
    /// Only available once all streams have finished.
    pub fn finalize(&self) -> Result<Vec<FinalTranscript>> {
        if !self.compositor.is_terminal() {
            return Err(FrameBatchError::usage(
                "finalize() called before all streams finished",
            ));
        }

        let transcripts: Vec<FinalTranscript> = self
            .compositor
            .streams()
            .map(|stream| {
                let tokens = self.assembler.token_ids(stream.unmerged_tokens());
                FinalTranscript {
                    stream: stream.id(),
                    text: self.tokenizer.ids_to_text(&tokens),
                    tokens,
                    degraded: stream.is_degraded(),
                }
            })
            .collect();

        info!(
            streams = transcripts.len(),
            degraded = transcripts.iter().filter(|t| t.degraded).count(),
            "Finalized transcripts"
        );
        Ok(transcripts)
    }

    /// Drops every stream and decoder state; the engine can take a new batch.
    pub fn reset(&mut self) {
        self.compositor.reset();
        self.hypotheses = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::frame::{Alignment, StepBatch};
    use crate::streaming::model::{Prediction, ScriptedModel};
    use crate::streaming::stitcher::MergeMode;
    use crate::streaming::stream::FrameSource;
    use ndarray::Array2;

    fn join(ids: &[TokenId]) -> String {
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn config() -> EngineConfig {
        EngineConfig {
            geometry: BufferGeometry {
                feature_count: 1,
                window_length: 4,
                pad_value: 0.0,
                epsilon: 1e-5,
            },
            frame_length: 2,
            stitcher: StitcherConfig {
                mode: MergeMode::Middle,
                delay: 2,
                tokens_per_chunk: 2,
                lcs_delay: None,
                max_steps_per_timestep: 1,
                max_skips_per_row: 1,
                blank_id: Some(0),
            },
            decoding: DecodingKind::Ctc,
            stateful: false,
            output: OutputKind::SingleOutput,
        }
    }

    fn frames(groups: usize) -> FrameSource<std::vec::IntoIter<Array2<f32>>> {
        FrameSource::new(vec![Array2::ones((1, 2)); groups])
    }

    // Six timesteps per window; timesteps 3 and 4 are the trusted middle.
    fn middle_script(stream: StreamId, step: u32) -> Alignment {
        let label = 10 * (stream.index() as u32 + 1) + step;
        Alignment::from_labels([0, 0, 0, label, label, 0])
    }

    #[test]
    fn test_middle_token_transcript() {
        let model = ScriptedModel::new(middle_script);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        let id = engine.register_stream(frames(3)).unwrap();

        let finals = engine.run_to_completion().unwrap();
        assert_eq!(engine.tokens(id).unwrap(), &[10, 10, 11, 11, 12, 12]);
        assert_eq!(engine.transcript(id).unwrap(), "10,11,12");
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].tokens, vec![10, 11, 12]);
        assert!(!finals[0].degraded);
    }

    #[test]
    fn test_padding_outputs_are_not_merged() {
        let model = ScriptedModel::new(middle_script);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        let long = engine.register_stream(frames(3)).unwrap();
        let short = engine.register_stream(frames(1)).unwrap();

        engine.run_to_completion().unwrap();
        assert_eq!(engine.transcript(short).unwrap(), "20");
        assert_eq!(engine.transcript(long).unwrap(), "10,11,12");
        assert_eq!(engine.finish_step(short).unwrap(), 1);
        assert_eq!(engine.finish_step(long).unwrap(), 3);
    }

    #[test]
    fn test_step_report_lists_finishing_streams() {
        let model = ScriptedModel::new(middle_script);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        engine.register_stream(frames(2)).unwrap();
        engine.register_stream(frames(1)).unwrap();

        engine.step().unwrap();
        let StepOutcome::Advanced(report) = engine.step().unwrap() else {
            panic!("expected an advanced step");
        };
        assert_eq!(report.step, 1);
        assert_eq!(report.active, vec![StreamId(0), StreamId(1)]);
        assert_eq!(report.finished, vec![StreamId(1)]);
        assert_eq!(report.merged.len(), 1);
        assert_eq!(report.merged[0].0, StreamId(0));
    }

    #[test]
    fn test_step_after_terminal_is_usage_error() {
        let model = ScriptedModel::new(middle_script);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        engine.register_stream(frames(1)).unwrap();
        engine.run_to_completion().unwrap();

        assert!(engine.is_terminal());
        assert!(matches!(engine.step(), Err(FrameBatchError::Usage { .. })));
    }

    #[test]
    fn test_unknown_stream_is_usage_error() {
        let model = ScriptedModel::new(middle_script);
        let engine = StreamingEngine::new(config(), model, join).unwrap();
        assert!(matches!(
            engine.transcript(StreamId(5)),
            Err(FrameBatchError::Usage { .. })
        ));
        assert!(engine.is_finished(StreamId(5)).is_err());
    }

    #[test]
    fn test_finish_step_before_finish_is_inconsistency() {
        let model = ScriptedModel::new(middle_script);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        let id = engine.register_stream(frames(3)).unwrap();
        engine.step().unwrap();
        assert!(!engine.is_finished(id).unwrap());
        assert!(matches!(
            engine.finish_step(id),
            Err(FrameBatchError::StateInconsistency { .. })
        ));
    }

    #[test]
    fn test_finalize_before_terminal_is_usage_error() {
        let model = ScriptedModel::new(middle_script);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        engine.register_stream(frames(2)).unwrap();
        engine.step().unwrap();
        assert!(matches!(engine.finalize(), Err(FrameBatchError::Usage { .. })));
    }

    #[test]
    fn test_lcs_without_delay_is_rejected() {
        let mut config = config();
        config.stitcher.mode = MergeMode::Lcs;
        let result = StreamingEngine::new(config, ScriptedModel::new(middle_script), join);
        assert!(matches!(result, Err(FrameBatchError::Usage { .. })));
    }

    #[test]
    fn test_lcs_merge_across_steps() {
        let mut config = config();
        config.stitcher.mode = MergeMode::Lcs;
        config.stitcher.lcs_delay = Some(2);
        // Each window shifts by two timesteps.
        let model = ScriptedModel::new(|_, step| Alignment::from_labels((2 * step + 1)..=(2 * step + 6)));
        let mut engine = StreamingEngine::new(config, model, join).unwrap();
        let id = engine.register_stream(frames(3)).unwrap();

        engine.run_to_completion().unwrap();
        assert_eq!(engine.tokens(id).unwrap(), &[4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_transducer_drops_blanks_and_keeps_repeats() {
        let mut config = config();
        config.decoding = DecodingKind::Transducer;
        config.stitcher.delay = 1;
        config.stitcher.tokens_per_chunk = 1;
        let model = ScriptedModel::new(|_, step| {
            Alignment::new(vec![vec![0], vec![0], vec![7 + step, 7 + step, 0], vec![0]])
        });
        let mut engine = StreamingEngine::new(config, model, join).unwrap();
        let id = engine.register_stream(frames(2)).unwrap();

        engine.run_to_completion().unwrap();
        assert_eq!(engine.tokens(id).unwrap(), &[7, 7, 8, 8]);
        assert_eq!(engine.transcript(id).unwrap(), "7,7,8,8");
    }

    #[test]
    fn test_inference_failure_keeps_previous_merges() {
        let model = ScriptedModel::new(middle_script).with_failure_at(1);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        let id = engine.register_stream(frames(3)).unwrap();

        engine.step().unwrap();
        let error = engine.step().unwrap_err();
        assert!(matches!(error, FrameBatchError::Inference { .. }));
        assert!(error.is_fatal());
        assert_eq!(engine.transcript(id).unwrap(), "10");
    }

    struct ShortModel;

    impl InferenceModel for ShortModel {
        type Hypothesis = ();

        fn infer(
            &mut self,
            _batch: &StepBatch,
            _previous: Vec<Option<()>>,
        ) -> Result<Vec<ModelOutput<()>>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_wrong_output_count_is_inconsistency() {
        let mut engine = StreamingEngine::new(config(), ShortModel, join).unwrap();
        engine.register_stream(frames(2)).unwrap();
        assert!(matches!(
            engine.step(),
            Err(FrameBatchError::StateInconsistency { .. })
        ));
    }

    struct DualModel;

    impl InferenceModel for DualModel {
        type Hypothesis = ();

        fn infer(
            &mut self,
            batch: &StepBatch,
            _previous: Vec<Option<()>>,
        ) -> Result<Vec<ModelOutput<()>>> {
            Ok(batch
                .streams
                .iter()
                .map(|_| ModelOutput {
                    prediction: Prediction::Dual {
                        primary: Alignment::from_labels([0, 0, 0, 1, 1, 0]),
                        secondary_key: "ctc".to_string(),
                        secondary: Alignment::from_labels([0, 0, 0, 2, 2, 0]),
                    },
                    hypothesis: None,
                })
                .collect())
        }
    }

    #[test]
    fn test_output_kind_is_chosen_per_stream() {
        let mut engine = StreamingEngine::new(config(), DualModel, join).unwrap();
        let primary = engine.register_stream(frames(1)).unwrap();
        let secondary = engine
            .register_stream_with_output(
                frames(1),
                OutputKind::DualOutput {
                    secondary_key: "ctc".to_string(),
                },
            )
            .unwrap();

        engine.run_to_completion().unwrap();
        assert_eq!(engine.transcript(primary).unwrap(), "1");
        assert_eq!(engine.transcript(secondary).unwrap(), "2");
    }

    #[test]
    fn test_stateful_hypotheses_follow_their_stream() {
        let mut config = config();
        config.stateful = true;
        let mut engine =
            StreamingEngine::new(config, ScriptedModel::new(middle_script), join).unwrap();
        engine.register_stream(frames(4)).unwrap();
        engine.register_stream(frames(1)).unwrap();
        engine.register_stream(frames(4)).unwrap();

        engine.run_to_completion().unwrap();
        let model = engine.model();
        assert_eq!(model.calls()[2], vec![StreamId(0), StreamId(2)]);
        for (stream, previous) in model.received() {
            if let Some(hypothesis) = previous {
                assert_eq!(hypothesis.stream, *stream, "hypothesis handed to wrong stream");
            }
        }
        // Stream 2 sits at position 1 from step 2 on and still gets its own state.
        let last = model.received().last().unwrap();
        assert_eq!(last.0, StreamId(2));
        assert_eq!(last.1.unwrap().steps, 3);
    }

    #[test]
    fn test_stateless_decoding_passes_no_hypotheses() {
        let mut engine =
            StreamingEngine::new(config(), ScriptedModel::new(middle_script), join).unwrap();
        engine.register_stream(frames(3)).unwrap();
        engine.run_to_completion().unwrap();
        assert!(engine.model().received().iter().all(|(_, h)| h.is_none()));
    }

    #[test]
    fn test_register_features_slices_matrix() {
        let model = ScriptedModel::new(middle_script);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        let id = engine.register_features(Array2::ones((1, 5))).unwrap();
        engine.run_to_completion().unwrap();
        // Five columns in groups of two: three real steps.
        assert_eq!(engine.transcript(id).unwrap(), "10,11,12");
    }

    #[test]
    fn test_reset_starts_a_new_batch() {
        let model = ScriptedModel::new(middle_script);
        let mut engine = StreamingEngine::new(config(), model, join).unwrap();
        engine.register_stream(frames(1)).unwrap();
        engine.run_to_completion().unwrap();

        engine.reset();
        assert!(!engine.is_terminal());
        let id = engine.register_stream(frames(2)).unwrap();
        assert_eq!(id, StreamId(0));
        assert!(engine.tokens(id).unwrap().is_empty());
    }
}
