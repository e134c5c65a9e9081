//! Buffered batch streaming engine.
//!
//! One step of the engine:
//! ```text
//!  stream 0 ─▶ ┌─────────────┐
//!  stream 1 ─▶ │ Ring Buffer │──┐
//!  stream 2 ─▶ │ (per stream)│  │   ┌────────────┐    ┌───────────┐
//!              └─────────────┘  └──▶│ Compositor │───▶│   Model   │
//!                                   │ (active    │    │ (batched, │
//!                                   │  sub-batch)│    │ external) │
//!                                   └────────────┘    └─────┬─────┘
//!                                                           │ per position
//!            text ◀── ┌────────────┐    ┌──────────┐        │
//!                     │ Transcript │◀───│ Stitcher │◀───────┘
//!                     │ Assembler  │    │(middle / │
//!                     └────────────┘    │   LCS)   │
//!                                       └──────────┘
//! ```
//! The compositor's `position -> stream` order is valid for one step only;
//! stateful decoder hypotheses are re-filtered to the next order before
//! every call.

pub mod compositor;
pub mod engine;
pub mod frame;
pub mod model;
pub mod ring_buffer;
pub mod station;
pub mod stitcher;
pub mod stream;
pub mod transcript;

pub use compositor::{BatchCompositor, StepStatus};
pub use engine::{EngineConfig, FinalTranscript, StepOutcome, StepReport, StreamingEngine};
pub use frame::{Alignment, FeatureChunk, StepBatch, StreamId, TokenId};
pub use model::{
    DecodingKind, InferenceModel, ModelOutput, OutputKind, Prediction, ScriptedHypothesis,
    ScriptedModel,
};
pub use ring_buffer::{BufferGeometry, RingFeatureBuffer};
pub use station::{EngineStation, TranscriptUpdate};
pub use stitcher::{AlignmentMerger, MergeMode, MergeOutcome, StitcherConfig};
pub use stream::{FeatureIterator, FeatureSource, FrameSource, StreamState};
pub use transcript::{Tokenizer, TranscriptAssembler, Vocabulary, greedy_collapse};
