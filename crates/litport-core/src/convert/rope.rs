//! Rotary-embedding coordinate layouts.
//!
//! The unified model rotates coordinate `j` with `j + n/2` ("rotate half").
//! Checkpoints in the Meta style rotate adjacent pairs `(2j, 2j + 1)` instead.
//! Moving q/k projections between the two is a fixed row permutation inside
//! every head; coordinates past the rotary span keep their position.

use candle_core::Tensor;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RopeLayout {
    /// `x[j]` pairs with `x[j + n/2]`.
    #[default]
    RotateHalf,
    /// `x[2j]` pairs with `x[2j + 1]`.
    Interleaved,
}

impl RopeLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            RopeLayout::RotateHalf => "rotate-half",
            RopeLayout::Interleaved => "interleaved",
        }
    }
}

impl fmt::Display for RopeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RopeLayout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "rotate-half" | "half" | "neox" => Ok(RopeLayout::RotateHalf),
            "interleaved" | "meta" | "gptj" => Ok(RopeLayout::Interleaved),
            other => Err(Error::InvalidInput(format!(
                "Unknown rotary layout '{other}' (expected rotate-half or interleaved)"
            ))),
        }
    }
}

/// Row gather indices applied within each head of a q/k projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotaryPermutation {
    head_size: usize,
    indices: Vec<u32>,
}

impl RotaryPermutation {
    /// Gather order taking rotate-half rows to interleaved rows.
    pub fn rotate_half_to_interleaved(head_size: usize, rope_n_elem: usize) -> Result<Self> {
        if rope_n_elem > head_size || rope_n_elem % 2 != 0 {
            return Err(Error::ConfigError(format!(
                "rotary span {rope_n_elem} must be even and at most head_size={head_size}"
            )));
        }
        let half = rope_n_elem / 2;
        let mut indices: Vec<u32> = (0..head_size as u32).collect();
        for j in 0..half {
            indices[2 * j] = j as u32;
            indices[2 * j + 1] = (j + half) as u32;
        }
        Ok(Self {
            head_size,
            indices,
        })
    }

    /// Permutation between two layouts, `None` when they coincide.
    pub fn between(
        from: RopeLayout,
        to: RopeLayout,
        head_size: usize,
        rope_n_elem: usize,
    ) -> Result<Option<Self>> {
        match (from, to) {
            (RopeLayout::RotateHalf, RopeLayout::Interleaved) => {
                Self::rotate_half_to_interleaved(head_size, rope_n_elem).map(Some)
            }
            (RopeLayout::Interleaved, RopeLayout::RotateHalf) => {
                Ok(Some(Self::rotate_half_to_interleaved(head_size, rope_n_elem)?.inverse()))
            }
            _ => Ok(None),
        }
    }

    pub fn head_size(&self) -> usize {
        self.head_size
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn inverse(&self) -> Self {
        let mut indices = vec![0u32; self.indices.len()];
        for (dst, &src) in self.indices.iter().enumerate() {
            indices[src as usize] = dst as u32;
        }
        Self {
            head_size: self.head_size,
            indices,
        }
    }

    /// Permute rows inside each of `n_heads` heads of a weight or bias.
    pub fn apply(&self, param: &Tensor, n_heads: usize) -> Result<Tensor> {
        let dims = param.dims().to_vec();
        let rows = dims.first().copied().unwrap_or(0);
        if rows != n_heads * self.head_size {
            return Err(Error::ShapeMismatch(format!(
                "rotary permutation expects {} x {} rows, found shape {:?}",
                n_heads, self.head_size, dims
            )));
        }

        let mut per_head = vec![n_heads, self.head_size];
        per_head.extend_from_slice(&dims[1..]);
        let index = Tensor::from_slice(self.indices.as_slice(), self.head_size, param.device())?;
        let permuted = param
            .reshape(per_head)?
            .index_select(&index, 1)?
            .reshape(dims)?;
        Ok(permuted)
    }
}
