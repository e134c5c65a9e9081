//! Async engine station.
//!
//! Drives a [`StreamingEngine`] from async code without blocking the
//! runtime. Each step runs on tokio's blocking thread pool; transcript
//! updates are sent over a channel as streams grow and finish.

use crate::error::{FrameBatchError, Result};
use crate::streaming::engine::{StepOutcome, StreamingEngine};
use crate::streaming::frame::StreamId;
use crate::streaming::model::InferenceModel;
use crate::streaming::transcript::Tokenizer;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Text of a stream after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptUpdate {
    pub stream: StreamId,
    pub text: String,
    /// No further updates follow for this stream.
    pub is_final: bool,
}

/// Station that owns an engine and steps it on the blocking pool.
pub struct EngineStation<M: InferenceModel, T> {
    engine: StreamingEngine<M, T>,
}

impl<M, T> EngineStation<M, T>
where
    M: InferenceModel + 'static,
    M::Hypothesis: 'static,
    T: Tokenizer + 'static,
{
    pub fn new(engine: StreamingEngine<M, T>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &StreamingEngine<M, T> {
        &self.engine
    }

    pub fn into_inner(self) -> StreamingEngine<M, T> {
        self.engine
    }

    /// Runs one engine step using spawn_blocking.
    ///
    /// The outer error means the step task itself failed; the inner one is
    /// the engine's own result for the step.
    pub async fn step_async(self) -> Result<(Self, Result<StepOutcome>)> {
        let mut engine = self.engine;
        let (engine, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = engine.step();
            (engine, outcome)
        })
        .await
        .map_err(|e| FrameBatchError::Other(format!("Engine step task panicked: {}", e)))?;

        Ok((Self { engine }, outcome))
    }

    /// Runs the station until every stream has finished.
    ///
    /// Sends a partial update whenever a stream's history grows and one
    /// final update per stream. Stops early, without error, once the
    /// receiver is dropped. Returns the engine so callers can finalize it.
    pub async fn run(
        self,
        output: mpsc::Sender<TranscriptUpdate>,
    ) -> Result<StreamingEngine<M, T>> {
        let mut station = self;
        let mut reported = vec![false; station.engine.compositor().len()];

        loop {
            let (next, outcome) = station.step_async().await?;
            station = next;

            let updates = match outcome? {
                StepOutcome::Advanced(report) => {
                    let mut updates = Vec::new();
                    for (stream, _) in &report.merged {
                        updates.push(station.update(*stream, false)?);
                    }
                    for &stream in &report.finished {
                        updates.push(station.update(stream, true)?);
                    }
                    updates
                }
                StepOutcome::Finished => {
                    let mut updates = Vec::new();
                    for (index, done) in reported.iter().enumerate() {
                        if !done {
                            updates.push(station.update(StreamId(index), true)?);
                        }
                    }
                    info!(remaining = updates.len(), "Station finished");
                    station.send_all(&output, updates, &mut reported).await;
                    return Ok(station.engine);
                }
            };

            if !station.send_all(&output, updates, &mut reported).await {
                debug!("Update receiver dropped, stopping station");
                return Ok(station.engine);
            }
        }
    }

    fn update(&self, stream: StreamId, is_final: bool) -> Result<TranscriptUpdate> {
        Ok(TranscriptUpdate {
            stream,
            text: self.engine.transcript(stream)?,
            is_final,
        })
    }

    // Returns false once the receiver is gone.
    async fn send_all(
        &self,
        output: &mpsc::Sender<TranscriptUpdate>,
        updates: Vec<TranscriptUpdate>,
        reported: &mut [bool],
    ) -> bool {
        for update in updates {
            let index = update.stream.index();
            let is_final = update.is_final;
            if output.send(update).await.is_err() {
                return false;
            }
            if is_final && let Some(done) = reported.get_mut(index) {
                *done = true;
            }
        }
        true
    }
}
