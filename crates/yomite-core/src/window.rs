//! # CBOW Window Masks
//!
//! A window mask partitions a fixed-length token axis into contiguous windows
//! and averages the embeddings inside each one. Row `i` of the mask holds
//! `1 / window_size` on the columns of window `i` and zero elsewhere, so a
//! batched matmul of the mask against `[batch, tokens, dim]` embeddings
//! yields `[batch, windows, dim]` window averages.

use candle_core::{Device, Tensor};

use crate::config::RaggedWindowPolicy;
use crate::error::{Result, YomiteError};

/// Dense `[num_windows, token_axis_length]` averaging mask.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowMask {
    values: Vec<f32>,
    num_windows: usize,
    token_axis_length: usize,
    window_size: usize,
    policy: RaggedWindowPolicy,
}

impl WindowMask {
    /// Build the mask for a token axis of `token_axis_length` columns.
    ///
    /// # Arguments
    /// * `token_axis_length` - Number of token positions per sample
    /// * `window_size` - Tokens averaged into one window
    /// * `policy` - Treatment of columns past the last full window
    ///
    /// # Errors
    /// `InvalidWindow` when the window is empty or longer than the axis,
    /// `RaggedWindow` when the policy is `Reject` and the size does not
    /// divide the axis.
    pub fn build(
        token_axis_length: usize,
        window_size: usize,
        policy: RaggedWindowPolicy,
    ) -> Result<Self> {
        if window_size == 0 || window_size > token_axis_length {
            return Err(YomiteError::InvalidWindow {
                window_size,
                token_axis_length,
            });
        }

        let num_windows = token_axis_length / window_size;
        let remainder = token_axis_length % window_size;
        if remainder != 0 && policy == RaggedWindowPolicy::Reject {
            return Err(YomiteError::RaggedWindow {
                window_size,
                token_axis_length,
                remainder,
            });
        }

        let mut values = vec![0.0f32; num_windows * token_axis_length];
        for window in 0..num_windows {
            let start = window * window_size;
            let end = if policy == RaggedWindowPolicy::Merge && window + 1 == num_windows {
                token_axis_length
            } else {
                start + window_size
            };
            let weight = 1.0 / (end - start) as f32;
            let row = &mut values[window * token_axis_length..(window + 1) * token_axis_length];
            row[start..end].fill(weight);
        }

        Ok(Self {
            values,
            num_windows,
            token_axis_length,
            window_size,
            policy,
        })
    }

    /// Number of windows (mask rows).
    pub fn num_windows(&self) -> usize {
        self.num_windows
    }

    /// Length of the token axis (mask columns).
    pub fn token_axis_length(&self) -> usize {
        self.token_axis_length
    }

    /// Nominal window size.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Policy the mask was built with.
    pub fn policy(&self) -> RaggedWindowPolicy {
        self.policy
    }

    /// One mask row, or `None` past the last window.
    pub fn row(&self, window: usize) -> Option<&[f32]> {
        if window >= self.num_windows {
            return None;
        }
        let start = window * self.token_axis_length;
        Some(&self.values[start..start + self.token_axis_length])
    }

    /// Row-major mask values.
    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// The mask as a `[num_windows, token_axis_length]` f32 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.values,
            (self.num_windows, self.token_axis_length),
            device,
        )?)
    }

    /// Stack the mask `batch_size` times into a
    /// `[batch_size, num_windows, token_axis_length]` tensor.
    pub fn replicate_for_batch(&self, batch_size: usize, device: &Device) -> Result<Tensor> {
        if batch_size == 0 {
            return Err(YomiteError::InvalidConfig(
                "cannot replicate a window mask for an empty batch".into(),
            ));
        }
        let mask = self.to_tensor(device)?;
        Ok(mask
            .unsqueeze(0)?
            .broadcast_as((batch_size, self.num_windows, self.token_axis_length))?
            .contiguous()?)
    }
}

/// A window mask already replicated for a fixed batch size.
#[derive(Debug, Clone)]
pub struct BatchMask {
    tensor: Tensor,
    batch_size: usize,
    window_size: usize,
    token_axis_length: usize,
}

impl BatchMask {
    /// Replicate `mask` for batches of `batch_size` samples.
    pub fn new(mask: &WindowMask, batch_size: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            tensor: mask.replicate_for_batch(batch_size, device)?,
            batch_size,
            window_size: mask.window_size(),
            token_axis_length: mask.token_axis_length(),
        })
    }

    /// `[batch_size, num_windows, token_axis_length]` mask tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn token_axis_length(&self) -> usize {
        self.token_axis_length
    }
}
