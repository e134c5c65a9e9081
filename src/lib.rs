//! framebatch - Buffered, batched streaming transcription
//!
//! Feeds many feature streams through one batched inference call per step
//! and stitches the overlapping window outputs back into one token stream
//! per stream.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod streaming;

// Engine
pub use streaming::{
    EngineConfig, EngineStation, FeatureSource, FinalTranscript, InferenceModel, StepOutcome,
    StreamId, StreamingEngine, Tokenizer, TranscriptUpdate,
};

// Error handling
pub use error::{FrameBatchError, Result};

// Config
pub use config::Config;
