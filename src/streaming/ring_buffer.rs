//! Fixed-capacity sliding window over a stream's feature frames.
//!
//! The buffer always holds exactly `window_length` columns. Pushing a
//! frame-group of width `w` shifts the window left by `w` and writes the
//! new frames into the trailing columns. Per-row mean and standard deviation
//! are recomputed over the whole window after every push, so two buffers fed
//! the same frames produce identical normalized output.

use crate::error::{FrameBatchError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut2, s};

/// Shape and fill parameters shared by every stream's buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferGeometry {
    pub feature_count: usize,
    pub window_length: usize,
    pub pad_value: f32,
    pub epsilon: f32,
}

/// Sliding feature window for a single stream.
#[derive(Debug, Clone)]
pub struct RingFeatureBuffer {
    buffer: Array2<f32>,
    mean: Array1<f32>,
    std: Array1<f32>,
    epsilon: f32,
}

impl RingFeatureBuffer {
    /// Creates a buffer pre-filled with the geometry's pad value.
    pub fn new(geometry: BufferGeometry) -> Result<Self> {
        if geometry.feature_count == 0 || geometry.window_length == 0 {
            return Err(FrameBatchError::usage(format!(
                "ring buffer needs a non-empty shape, got [{}, {}]",
                geometry.feature_count, geometry.window_length
            )));
        }

        let mut buffer = Self {
            buffer: Array2::from_elem(
                (geometry.feature_count, geometry.window_length),
                geometry.pad_value,
            ),
            mean: Array1::zeros(geometry.feature_count),
            std: Array1::zeros(geometry.feature_count),
            epsilon: geometry.epsilon,
        };
        buffer.recompute_stats();
        Ok(buffer)
    }

    pub fn feature_count(&self) -> usize {
        self.buffer.nrows()
    }

    pub fn window_length(&self) -> usize {
        self.buffer.ncols()
    }

    /// Raw (unnormalized) window contents.
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.buffer.view()
    }

    /// Pushes a frame-group, or zeroes the window when `frames` is `None`.
    ///
    /// `None` is used for streams that already finished but still occupy a
    /// batch slot this step.
    pub fn push(&mut self, frames: Option<ArrayView2<'_, f32>>) -> Result<()> {
        match frames {
            Some(frames) => self.shift_in(frames)?,
            None => self.buffer.fill(0.0),
        }
        self.recompute_stats();
        Ok(())
    }

    fn shift_in(&mut self, frames: ArrayView2<'_, f32>) -> Result<()> {
        if frames.nrows() != self.feature_count() {
            return Err(FrameBatchError::usage(format!(
                "frame-group has {} feature rows, buffer expects {}",
                frames.nrows(),
                self.feature_count()
            )));
        }

        let window = self.window_length();
        let width = frames.ncols();
        if width == 0 {
            return Ok(());
        }
        if width >= window {
            self.buffer.assign(&frames.slice(s![.., width - window..]));
            return Ok(());
        }

        let keep = window - width;
        for mut row in self.buffer.rows_mut() {
            match row.as_slice_mut() {
                Some(cells) => cells.copy_within(width.., 0),
                None => {
                    for col in 0..keep {
                        row[col] = row[col + width];
                    }
                }
            }
        }
        self.buffer.slice_mut(s![.., keep..]).assign(&frames);
        Ok(())
    }

    // Exact per-row statistics over the full window (population std).
    fn recompute_stats(&mut self) {
        let width = self.window_length() as f64;
        for (row_idx, row) in self.buffer.rows().into_iter().enumerate() {
            let sum: f64 = row.iter().map(|&v| v as f64).sum();
            let mean = sum / width;
            let var: f64 = row
                .iter()
                .map(|&v| {
                    let d = v as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / width;
            self.mean[row_idx] = mean as f32;
            self.std[row_idx] = var.sqrt() as f32;
        }
    }

    /// Per-row `(mean, std)` of the current window.
    pub fn normalization_stats(&self) -> (ArrayView1<'_, f32>, ArrayView1<'_, f32>) {
        (self.mean.view(), self.std.view())
    }

    /// Writes the standardized window into `out`.
    pub fn normalize_into(&self, out: ArrayViewMut2<'_, f32>) -> Result<()> {
        if out.dim() != self.buffer.dim() {
            return Err(FrameBatchError::inconsistency(format!(
                "normalization target has shape {:?}, buffer is {:?}",
                out.dim(),
                self.buffer.dim()
            )));
        }
        self.standardize(out);
        Ok(())
    }

    /// Returns a standardized copy of the window.
    pub fn normalized(&self) -> Array2<f32> {
        let mut out = Array2::zeros(self.buffer.dim());
        self.standardize(out.view_mut());
        out
    }

    // `out` must match the buffer's shape.
    fn standardize(&self, mut out: ArrayViewMut2<'_, f32>) {
        for (row_idx, (mut out_row, row)) in out
            .rows_mut()
            .into_iter()
            .zip(self.buffer.rows())
            .enumerate()
        {
            let mean = self.mean[row_idx];
            let denom = self.std[row_idx] + self.epsilon;
            out_row.zip_mut_with(&row, |dst, &src| *dst = (src - mean) / denom);
        }
    }
}
