//! Inference collaborator interface.
//!
//! The engine never runs a model itself. It hands a normalized
//! [`StepBatch`] to an [`InferenceModel`] and reads one [`ModelOutput`]
//! back per active position.

use crate::error::{FrameBatchError, Result};
use crate::streaming::frame::{Alignment, StepBatch, StreamId};
use serde::{Deserialize, Serialize};

/// How alignment symbols turn into the token history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodingKind {
    /// One label per timestep, blanks kept; repeats collapse at assembly.
    #[default]
    Ctc,
    /// Several symbols per timestep; blanks dropped while flattening.
    Transducer,
}

/// Raw prediction of one active position.
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    Single(Alignment),
    /// Models with two heads (e.g. hybrid transducer/CTC).
    Dual {
        primary: Alignment,
        secondary_key: String,
        secondary: Alignment,
    },
}

/// Which head of a prediction a stream reads.
///
/// Resolved once when the stream is registered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    SingleOutput,
    DualOutput { secondary_key: String },
}

impl OutputKind {
    pub fn select<'a>(&self, prediction: &'a Prediction) -> Result<&'a Alignment> {
        match (self, prediction) {
            (OutputKind::SingleOutput, Prediction::Single(alignment)) => Ok(alignment),
            (OutputKind::SingleOutput, Prediction::Dual { primary, .. }) => Ok(primary),
            (
                OutputKind::DualOutput { secondary_key },
                Prediction::Dual {
                    secondary_key: key,
                    secondary,
                    ..
                },
            ) if key == secondary_key => Ok(secondary),
            (OutputKind::DualOutput { secondary_key }, Prediction::Dual { secondary_key: key, .. }) => {
                Err(FrameBatchError::inconsistency(format!(
                    "expected secondary output '{}', model produced '{}'",
                    secondary_key, key
                )))
            }
            (OutputKind::DualOutput { secondary_key }, Prediction::Single(_)) => {
                Err(FrameBatchError::inconsistency(format!(
                    "expected secondary output '{}', model produced a single output",
                    secondary_key
                )))
            }
        }
    }
}

/// Output of one active position.
#[derive(Debug, Clone)]
pub struct ModelOutput<H> {
    pub prediction: Prediction,
    /// Updated decoder state, kept only when decoding is stateful.
    pub hypothesis: Option<H>,
}

impl<H> ModelOutput<H> {
    pub fn single(alignment: Alignment) -> Self {
        Self {
            prediction: Prediction::Single(alignment),
            hypothesis: None,
        }
    }

    pub fn with_hypothesis(mut self, hypothesis: H) -> Self {
        self.hypothesis = Some(hypothesis);
        self
    }
}

/// Batched inference collaborator.
pub trait InferenceModel: Send {
    /// Opaque decoder state carried across steps.
    type Hypothesis: Send;

    /// Runs one batched call.
    ///
    /// `previous` is aligned with `batch.streams`: entry `k` is the state
    /// produced for the stream now at position `k`, or `None`.
    /// Must return exactly one output per active position, in order.
    fn infer(
        &mut self,
        batch: &StepBatch,
        previous: Vec<Option<Self::Hypothesis>>,
    ) -> Result<Vec<ModelOutput<Self::Hypothesis>>>;
}

/// Decoder state produced by [`ScriptedModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptedHypothesis {
    pub stream: StreamId,
    pub steps: u32,
}

/// Deterministic model for tests and benchmarks.
///
/// Produces the alignment returned by `script(stream, step)` for each active
/// position and threads a hypothesis that remembers which stream it
/// belongs to.
pub struct ScriptedModel<F> {
    script: F,
    calls: Vec<Vec<StreamId>>,
    received: Vec<(StreamId, Option<ScriptedHypothesis>)>,
    fail_at: Option<u32>,
}

impl<F> ScriptedModel<F>
where
    F: FnMut(StreamId, u32) -> Alignment + Send,
{
    pub fn new(script: F) -> Self {
        Self {
            script,
            calls: Vec::new(),
            received: Vec::new(),
            fail_at: None,
        }
    }

    /// Configure the model to fail on the given step.
    pub fn with_failure_at(mut self, step: u32) -> Self {
        self.fail_at = Some(step);
        self
    }

    /// Active stream order of every call so far.
    pub fn calls(&self) -> &[Vec<StreamId>] {
        &self.calls
    }

    /// Every (stream, previous hypothesis) pair handed to the model.
    pub fn received(&self) -> &[(StreamId, Option<ScriptedHypothesis>)] {
        &self.received
    }
}

impl<F> InferenceModel for ScriptedModel<F>
where
    F: FnMut(StreamId, u32) -> Alignment + Send,
{
    type Hypothesis = ScriptedHypothesis;

    fn infer(
        &mut self,
        batch: &StepBatch,
        previous: Vec<Option<ScriptedHypothesis>>,
    ) -> Result<Vec<ModelOutput<ScriptedHypothesis>>> {
        if self.fail_at == Some(batch.step) {
            return Err(FrameBatchError::Inference {
                message: format!("scripted failure at step {}", batch.step),
            });
        }
        self.calls.push(batch.streams.clone());

        let mut outputs = Vec::with_capacity(batch.len());
        for (&stream, prev) in batch.streams.iter().zip(previous) {
            self.received.push((stream, prev));
            let steps = prev.map_or(1, |h| h.steps + 1);
            let alignment = (self.script)(stream, batch.step);
            outputs.push(
                ModelOutput::single(alignment).with_hypothesis(ScriptedHypothesis { stream, steps }),
            );
        }
        Ok(outputs)
    }
}
