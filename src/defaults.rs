//! Default configuration constants for framebatch.
//!
//! Shared between the config layer and the engine so both agree on
//! geometry and merge thresholds.

/// Number of feature rows per frame (mel bins).
pub const FEATURE_COUNT: usize = 80;

/// Columns held by each stream's ring buffer (4.0s at a 10ms hop).
pub const WINDOW_LENGTH: usize = 400;

/// Columns pushed per inference step (1.6s at a 10ms hop).
pub const FRAME_LENGTH: usize = 160;

/// Initial value of every buffer cell before any frame arrives.
pub const PAD_VALUE: f32 = 0.0;

/// Additive constant in the standardization denominator.
///
/// Used by both the single-stream and the batched path.
pub const NORMALIZATION_EPSILON: f32 = 1e-5;

/// Trailing timesteps treated as unreliable future context.
pub const DELAY: usize = 120;

/// Trusted timesteps extracted per chunk in middle-token mode.
pub const TOKENS_PER_CHUNK: usize = 160;

/// Upper bound of symbols a transducer emits per encoder timestep.
pub const MAX_STEPS_PER_TIMESTEP: usize = 5;

/// Columns the diagonal may drift right per row during partial-mismatch expansion.
pub const MAX_SKIPS_PER_ROW: usize = 1;

/// Partial matches with this many non-blank tokens or fewer are not trusted.
pub const MIN_MERGE_SUBSEQUENCE_LEN: usize = 1;

/// Environment variable that overrides the configured log filter.
pub const LOG_ENV_VAR: &str = "FRAMEBATCH_LOG";

/// Blank symbol id (last entry of a 1024-piece vocabulary plus blank).
pub const BLANK_ID: u32 = 1024;
