//! Fused attention projection splitting and re-packing.
//!
//! The unified checkpoint stores query, key and value projections as one
//! tensor whose rows are packed per key/value group:
//!
//! ```text
//! [ q(g0,h0) .. q(g0,h{q_per_kv-1}) | k(g0) | v(g0) | q(g1,h0) .. | k(g1) | v(g1) | .. ]
//! ```
//!
//! Each block is `head_size` rows. Biases follow the same row order. Target
//! families either want the three projections separately or fused under a
//! different packing; the `pack_*` functions produce those packings from the
//! split projections.

use candle_core::Tensor;

use crate::config::Config;
use crate::error::{Error, Result};

/// Head/group arithmetic of one attention layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionLayout {
    pub n_head: usize,
    pub n_query_groups: usize,
    pub head_size: usize,
}

impl AttentionLayout {
    pub fn new(n_head: usize, n_query_groups: usize, head_size: usize) -> Result<Self> {
        if n_head == 0 || n_query_groups == 0 || head_size == 0 {
            return Err(Error::ConfigError(format!(
                "attention layout needs positive sizes (n_head={n_head}, n_query_groups={n_query_groups}, head_size={head_size})"
            )));
        }
        if n_head % n_query_groups != 0 {
            return Err(Error::ConfigError(format!(
                "n_head={n_head} is not divisible by n_query_groups={n_query_groups}"
            )));
        }
        Ok(Self {
            n_head,
            n_query_groups,
            head_size,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.n_head, config.n_query_groups(), config.head_size())
    }

    pub fn q_per_kv(&self) -> usize {
        self.n_head / self.n_query_groups
    }

    /// One key/value pair per query head.
    pub fn is_multi_head(&self) -> bool {
        self.n_query_groups == self.n_head
    }

    /// A single key/value pair shared by every query head.
    pub fn is_multi_query(&self) -> bool {
        self.n_query_groups == 1
    }

    pub fn fused_rows(&self) -> usize {
        (self.n_head + 2 * self.n_query_groups) * self.head_size
    }

    fn q_rows(&self) -> usize {
        self.n_head * self.head_size
    }

    fn kv_rows(&self) -> usize {
        self.n_query_groups * self.head_size
    }
}

fn leading_dim(tensor: &Tensor) -> Result<usize> {
    tensor
        .dims()
        .first()
        .copied()
        .ok_or_else(|| Error::ShapeMismatch("expected at least one dimension, got a scalar".to_string()))
}

fn expect_rows(tensor: &Tensor, rows: usize, what: &str) -> Result<()> {
    let found = leading_dim(tensor)?;
    if found != rows {
        return Err(Error::ShapeMismatch(format!(
            "{what}: expected {rows} rows, found {found} (shape {:?})",
            tensor.dims()
        )));
    }
    Ok(())
}

/// Split a fused projection (weight or bias) into `(q, k, v)`.
///
/// `q` holds `n_head * head_size` rows in head order; `k` and `v` hold
/// `n_query_groups * head_size` rows in group order.
pub fn qkv_split(param: &Tensor, layout: &AttentionLayout) -> Result<(Tensor, Tensor, Tensor)> {
    let rows = leading_dim(param)?;
    if rows % layout.head_size != 0 {
        return Err(Error::ShapeMismatch(format!(
            "fused projection has {rows} rows, not a multiple of head_size={}",
            layout.head_size
        )));
    }
    if (rows / layout.head_size) % layout.n_query_groups != 0 {
        return Err(Error::ShapeMismatch(format!(
            "fused projection has {} heads, not a multiple of n_query_groups={}",
            rows / layout.head_size,
            layout.n_query_groups
        )));
    }
    expect_rows(param, layout.fused_rows(), "fused projection")?;

    let hs = layout.head_size;
    let q_block = layout.q_per_kv() * hs;
    let group_rows = q_block + 2 * hs;

    let mut qs = Vec::with_capacity(layout.n_query_groups);
    let mut ks = Vec::with_capacity(layout.n_query_groups);
    let mut vs = Vec::with_capacity(layout.n_query_groups);
    for g in 0..layout.n_query_groups {
        let start = g * group_rows;
        qs.push(param.narrow(0, start, q_block)?);
        ks.push(param.narrow(0, start + q_block, hs)?);
        vs.push(param.narrow(0, start + q_block + hs, hs)?);
    }

    Ok((Tensor::cat(&qs, 0)?, Tensor::cat(&ks, 0)?, Tensor::cat(&vs, 0)?))
}

fn check_split(q: &Tensor, k: &Tensor, v: &Tensor, layout: &AttentionLayout) -> Result<()> {
    expect_rows(q, layout.q_rows(), "query projection")?;
    expect_rows(k, layout.kv_rows(), "key projection")?;
    expect_rows(v, layout.kv_rows(), "value projection")?;
    Ok(())
}

/// Re-pack per group: `[q heads of group g, k_g, v_g]` for each group.
///
/// This is the unified packing itself, and the fused layout of targets that
/// share it.
pub fn pack_grouped(q: &Tensor, k: &Tensor, v: &Tensor, layout: &AttentionLayout) -> Result<Tensor> {
    check_split(q, k, v, layout)?;
    let hs = layout.head_size;
    let q_block = layout.q_per_kv() * hs;

    let mut parts = Vec::with_capacity(3 * layout.n_query_groups);
    for g in 0..layout.n_query_groups {
        parts.push(q.narrow(0, g * q_block, q_block)?);
        parts.push(k.narrow(0, g * hs, hs)?);
        parts.push(v.narrow(0, g * hs, hs)?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}

/// Re-pack globally: all query heads, then all keys, then all values.
pub fn pack_global(q: &Tensor, k: &Tensor, v: &Tensor, layout: &AttentionLayout) -> Result<Tensor> {
    check_split(q, k, v, layout)?;
    Ok(Tensor::cat(&[q, k, v], 0)?)
}

/// Re-pack per head: `[q_h, k_h, v_h]` for each head.
///
/// Only defined when every head owns its key/value pair.
pub fn pack_per_head(q: &Tensor, k: &Tensor, v: &Tensor, layout: &AttentionLayout) -> Result<Tensor> {
    if !layout.is_multi_head() {
        return Err(Error::UnsupportedFamily(format!(
            "per-head packing needs one key/value pair per head (n_head={}, n_query_groups={})",
            layout.n_head, layout.n_query_groups
        )));
    }
    check_split(q, k, v, layout)?;
    let hs = layout.head_size;

    let mut parts = Vec::with_capacity(3 * layout.n_head);
    for h in 0..layout.n_head {
        parts.push(q.narrow(0, h * hs, hs)?);
        parts.push(k.narrow(0, h * hs, hs)?);
        parts.push(v.narrow(0, h * hs, hs)?);
    }
    Ok(Tensor::cat(&parts, 0)?)
}
