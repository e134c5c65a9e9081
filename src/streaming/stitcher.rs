//! Token-stream stitching across overlapping windows.
//!
//! Consecutive windows overlap, so each new prediction repeats tokens that
//! were already emitted for the previous chunk. Two strategies remove the
//! duplication:
//! - Middle-token: keep a fixed slice of timesteps whose context is trusted.
//! - LCS: align the new tokens against the tail of the history with a
//!   longest-common-suffix table and cut the duplicated prefix, tolerating
//!   small mismatches between the two predictions.

use crate::defaults;
use crate::error::{FrameBatchError, Result};
use crate::streaming::frame::{Alignment, TokenId};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::trace;

/// Merge strategy for consecutive chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    #[default]
    Middle,
    Lcs,
}

/// Configuration for the stitcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StitcherConfig {
    pub mode: MergeMode,
    /// Trailing timesteps of each window that lack future context.
    pub delay: usize,
    /// Timesteps kept per chunk in middle-token mode.
    pub tokens_per_chunk: usize,
    /// Lookback delay for LCS merging; must be set before merging in LCS mode.
    pub lcs_delay: Option<usize>,
    pub max_steps_per_timestep: usize,
    pub max_skips_per_row: usize,
    /// Blank symbol; blank-only LCS matches are ignored.
    pub blank_id: Option<TokenId>,
}

impl Default for StitcherConfig {
    fn default() -> Self {
        Self {
            mode: MergeMode::Middle,
            delay: defaults::DELAY,
            tokens_per_chunk: defaults::TOKENS_PER_CHUNK,
            lcs_delay: None,
            max_steps_per_timestep: defaults::MAX_STEPS_PER_TIMESTEP,
            max_skips_per_row: defaults::MAX_SKIPS_PER_ROW,
            blank_id: None,
        }
    }
}

/// Timestep range kept by middle-token extraction.
///
/// Nominally `[len-1-delay, len-1-delay+tokens_per_chunk)`. When the delay
/// spans the whole window the offset of one is dropped; bounds are clamped
/// to the alignment.
pub fn middle_token_range(len: usize, delay: usize, tokens_per_chunk: usize) -> Range<usize> {
    let offset = if delay == len { 0 } else { 1 };
    let start = len.saturating_sub(offset + delay);
    let end = start.saturating_add(tokens_per_chunk).min(len);
    start..end
}

/// Longest-common-suffix table between a history tail `X` and new tokens `Y`.
///
/// `get(i, j)` is the length of the common suffix of `X[..i]` and `Y[..j]`.
/// Blanks extend a suffix like any other token, and `content(i, j)` counts
/// the non-blank tokens inside it.
#[derive(Debug, Clone)]
pub struct LcsTable {
    rows: usize,
    cols: usize,
    cells: Vec<u32>,
    content: Vec<u32>,
}

impl LcsTable {
    pub fn build(x: &[TokenId], y: &[TokenId], blank_id: Option<TokenId>) -> Self {
        let rows = x.len() + 1;
        let cols = y.len() + 1;
        let mut cells = vec![0u32; rows * cols];
        let mut content = vec![0u32; rows * cols];
        for i in 1..rows {
            for j in 1..cols {
                if x[i - 1] == y[j - 1] {
                    let diag = (i - 1) * cols + (j - 1);
                    let word = u32::from(Some(x[i - 1]) != blank_id);
                    cells[i * cols + j] = cells[diag] + 1;
                    content[i * cols + j] = content[diag] + word;
                }
            }
        }
        Self {
            rows,
            cols,
            cells,
            content,
        }
    }

    /// `m`, the length of `X`.
    pub fn history_len(&self) -> usize {
        self.rows - 1
    }

    /// `n`, the length of `Y`.
    pub fn data_len(&self) -> usize {
        self.cols - 1
    }

    pub fn get(&self, i: usize, j: usize) -> usize {
        self.cells[i * self.cols + j] as usize
    }

    /// Non-blank tokens in the suffix ending at `(i, j)`.
    pub fn content(&self, i: usize, j: usize) -> usize {
        self.content[i * self.cols + j] as usize
    }

    /// Suffix length, or 0 when the suffix is made only of blanks.
    pub fn score(&self, i: usize, j: usize) -> usize {
        if self.content(i, j) == 0 {
            0
        } else {
            self.get(i, j)
        }
    }
}

/// Which branch of the merge produced a cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePath {
    /// The match runs to the end of the lookback window.
    Complete,
    /// Leftmost partial match expanded along its diagonal.
    Partial,
    /// No trustworthy overlap; nothing is cut.
    NoOverlap,
}

/// Result of aligning new tokens against the history tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LcsMatch {
    /// Column in `Y` where the duplicated region starts.
    pub start: usize,
    /// Tokens of `Y` from `start` that duplicate the history.
    pub slice_len: usize,
    /// Length of the matched suffix that anchored the cut.
    pub length: usize,
    pub path: MergePath,
}

impl LcsMatch {
    /// Tokens of `Y` before this index are dropped.
    pub fn slice_idx(&self) -> usize {
        self.start + self.slice_len
    }
}

/// Aligns `y` against `x` and decides how much of `y` repeats `x`.
pub fn longest_common_subsequence_merge(
    x: &[TokenId],
    y: &[TokenId],
    blank_id: Option<TokenId>,
    max_skips_per_row: usize,
) -> LcsMatch {
    let table = LcsTable::build(x, y, blank_id);
    let m = table.history_len();
    let n = table.data_len();

    // Global maximum, later cells win ties.
    let (mut best, mut best_i, mut best_j) = (0, 0, 0);
    for i in 1..=m {
        for j in 1..=n {
            let len = table.score(i, j);
            if len > 0 && len >= best {
                (best, best_i, best_j) = (len, i, j);
            }
        }
    }

    if best > 0 && best_i == m {
        return complete_match(&table, best, best_i, best_j);
    }
    partial_match(&table, max_skips_per_row)
}

fn complete_match(table: &LcsTable, best: usize, mut i: usize, mut j: usize) -> LcsMatch {
    let mut count = 0;
    while count < best && i > 0 && j > 0 && table.get(i, j) > 0 {
        count += 1;
        i -= 1;
        j -= 1;
    }
    LcsMatch {
        start: j,
        slice_len: count,
        length: best,
        path: MergePath::Complete,
    }
}

fn partial_match(table: &LcsTable, max_skips_per_row: usize) -> LcsMatch {
    let m = table.history_len();
    let n = table.data_len();

    // Leftmost search: bottom row first, longest suffix with the smallest j.
    let (mut max_len, mut max_j) = (0, n);
    let (mut anchor_i, mut anchor_j) = (m, 0);
    for i in (0..=m).rev() {
        for j in 0..=n {
            let len = table.score(i, j);
            if len > max_len && j <= max_j {
                (max_len, max_j) = (len, j);
                (anchor_i, anchor_j) = (i, j);
            }
        }
    }

    // Blank runs pad any match, so only its words decide whether to trust it.
    if table.content(anchor_i, anchor_j) <= defaults::MIN_MERGE_SUBSEQUENCE_LEN {
        return LcsMatch {
            start: 0,
            slice_len: 0,
            length: max_len,
            path: MergePath::NoOverlap,
        };
    }

    // Expand the anchor towards the last history row, letting the diagonal
    // drift right by up to `max_skips_per_row` columns per row.
    let (mut row, mut col) = (anchor_i, anchor_j);
    for i in anchor_i + 1..=m {
        let next = col + 1;
        if next > n {
            break;
        }
        let last = (next + max_skips_per_row).min(n);
        col = (next..=last)
            .find(|&c| table.get(i, c) > 0)
            .unwrap_or(next);
        row = i;
    }

    // Walk back to the origin, counting matched cells and diagonal breaks.
    let (mut i, mut j) = (row, col);
    let (mut slice_count, mut skip_count) = (0, 0);
    while i > 0 && j > 0 {
        if table.get(i, j) > 0 {
            slice_count += 1;
        } else {
            skip_count += 1;
        }
        i -= 1;
        j -= 1;
    }

    LcsMatch {
        start: j,
        slice_len: slice_count + skip_count,
        length: max_len,
        path: MergePath::Partial,
    }
}

/// What a merge did to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Leading tokens of the new data discarded as duplicates.
    pub dropped: usize,
    /// Tokens appended to the history.
    pub appended: usize,
    pub path: Option<MergePath>,
}

/// LCS-merges `data` onto `buffer` using a bounded lookback window.
///
/// The lookback is the last `delay * max_steps_per_timestep` tokens of the
/// history. A zero delay or an empty history degenerates to concatenation.
pub fn lcs_merge_into(
    buffer: &mut Vec<TokenId>,
    data: &[TokenId],
    delay: usize,
    max_steps_per_timestep: usize,
    blank_id: Option<TokenId>,
    max_skips_per_row: usize,
) -> MergeOutcome {
    if delay == 0 || buffer.is_empty() {
        buffer.extend_from_slice(data);
        return MergeOutcome {
            dropped: 0,
            appended: data.len(),
            path: None,
        };
    }

    let search_size = delay.saturating_mul(max_steps_per_timestep).min(buffer.len());
    let lookback = &buffer[buffer.len() - search_size..];
    let matched = longest_common_subsequence_merge(lookback, data, blank_id, max_skips_per_row);
    let slice_idx = matched.slice_idx().min(data.len());

    trace!(
        lookback = search_size,
        data = data.len(),
        slice_idx,
        length = matched.length,
        path = ?matched.path,
        "LCS merge"
    );

    buffer.extend_from_slice(&data[slice_idx..]);
    MergeOutcome {
        dropped: slice_idx,
        appended: data.len() - slice_idx,
        path: Some(matched.path),
    }
}

/// Stitches each step's alignment into a stream's token history.
#[derive(Debug, Clone, Default)]
pub struct AlignmentMerger {
    config: StitcherConfig,
}

impl AlignmentMerger {
    pub fn new(config: StitcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StitcherConfig {
        &self.config
    }

    /// Fails when LCS merging is configured without a lookback delay.
    pub fn validate(&self) -> Result<()> {
        if self.config.mode == MergeMode::Lcs && self.config.lcs_delay.is_none() {
            return Err(FrameBatchError::usage(
                "LCS merge requires lcs_delay = (buffer - chunk) / model stride, in timesteps",
            ));
        }
        Ok(())
    }

    /// Appends the middle-token slice of `alignment` to `history`.
    pub fn merge_middle(
        &self,
        history: &mut Vec<TokenId>,
        alignment: &Alignment,
        drop_blank: Option<TokenId>,
    ) -> MergeOutcome {
        let range = middle_token_range(
            alignment.len(),
            self.config.delay,
            self.config.tokens_per_chunk,
        );
        let tokens = alignment.flatten_range(range.start, range.end, drop_blank);
        history.extend_from_slice(&tokens);
        MergeOutcome {
            dropped: 0,
            appended: tokens.len(),
            path: None,
        }
    }

    /// Merges one chunk's alignment into `history`.
    ///
    /// In LCS mode the first chunk keeps everything from the middle of the
    /// window onwards so the next chunk has a lookback to align against.
    pub fn merge(
        &self,
        history: &mut Vec<TokenId>,
        alignment: &Alignment,
        first_chunk: bool,
        drop_blank: Option<TokenId>,
    ) -> Result<MergeOutcome> {
        match self.config.mode {
            MergeMode::Middle => Ok(self.merge_middle(history, alignment, drop_blank)),
            MergeMode::Lcs => {
                let lcs_delay = self.config.lcs_delay.ok_or_else(|| {
                    FrameBatchError::usage("LCS merge requested without lcs_delay")
                })?;
                if first_chunk {
                    let start = middle_token_range(alignment.len(), self.config.delay, 0).start;
                    let tokens = alignment.flatten_range(start, alignment.len(), drop_blank);
                    history.extend_from_slice(&tokens);
                    return Ok(MergeOutcome {
                        dropped: 0,
                        appended: tokens.len(),
                        path: None,
                    });
                }
                let data = alignment.flatten(drop_blank);
                Ok(lcs_merge_into(
                    history,
                    &data,
                    lcs_delay,
                    self.config.max_steps_per_timestep,
                    self.config.blank_id,
                    self.config.max_skips_per_row,
                ))
            }
        }
    }
}
