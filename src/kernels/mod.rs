//! Kernel contracts: the opaque compute operators the engine drives.
//!
//! GPU attention/RoPE/RMSNorm/SwiGLU/quantized-GEMM kernels are external
//! collaborators with fixed numerical contracts; this module models them as
//! one object-safe [`Kernels`] trait so the engine can run against any
//! backend. [`ReferenceKernels`] is the correct, unoptimized CPU
//! implementation used by tests and as the default.

use crate::error::CoreResult;

/// RoPE scaling strategy, selected per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeScaling {
    Base,
    Ntk,
    Yarn,
    Linear,
}

/// A dense `[rows, cols]` fp32 matrix, row-major. Used for the small
/// reference-kernel intermediate tensors (hidden states, Q/K/V
/// projections, logits) that aren't paged KV.
#[derive(Debug, Clone)]
pub struct Mat {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Mat {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }
}

/// One transformer layer's linear-projection weights, dense fp32 for the
/// reference kernels (the real GPU backend would instead hold quantized
/// weights consumed by `q_gemm_dequant`).
#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attn_norm: Vec<f32>,
    pub w_q: Mat,
    pub w_k: Mat,
    pub w_v: Mat,
    pub w_o: Mat,
    pub ffn_norm: Vec<f32>,
    pub w_gate: Mat,
    pub w_up: Mat,
    pub w_down: Mat,
}

/// A paged view over one layer's K (or V) blocks for a single sequence,
/// addressed the same way the arena addresses them: an ordered list of
/// block ids, each covering `block_size` token positions.
pub struct PagedKv<'a> {
    pub block_size: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub layer: usize,
    /// `(block_id, k_tensor, v_tensor)` in page-table order.
    pub blocks: Vec<(&'a crate::cache::block::KvTensor, &'a crate::cache::block::KvTensor)>,
    pub total_tokens: usize,
}

/// The six kernel contracts of §6, modeled as one object-safe trait.
pub trait Kernels: Send + Sync {
    /// `y = x · gamma / sqrt(mean(x^2) + eps)`, fp32 accumulation regardless
    /// of the input's native dtype.
    fn rmsnorm(&self, x: &[f32], gamma: &[f32], eps: f32) -> Vec<f32>;

    /// Causal masked attention over a contiguous segment of `q_len` new
    /// positions against `kv_len` cached+new positions (`kv_len >= q_len`).
    /// `q`, `k`, `v` are `[q_len|kv_len, num_heads|num_kv_heads, head_dim]`
    /// flattened row-major. GQA head mapping is handled internally.
    fn attention_prefill(
        &self,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        q_len: usize,
        kv_len: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> CoreResult<Vec<f32>>;

    /// One-query-per-sequence attention over a paged KV layout.
    fn attention_decode_paged(
        &self,
        q: &[f32],
        kv: &PagedKv<'_>,
        num_heads: usize,
    ) -> CoreResult<Vec<f32>>;

    /// Rotates paired dimensions of `x` (`[seq_len, num_heads, head_dim]`)
    /// at the given absolute `positions`.
    fn rope_apply(
        &self,
        x: &mut [f32],
        positions: &[usize],
        num_heads: usize,
        head_dim: usize,
        scaling: RopeScaling,
    ) -> CoreResult<()>;

    /// Fused dequant-and-matmul. The reference implementation treats `w` as
    /// already-dequantized fp32 (`scales`/`zeros` unused) so it can stand in
    /// for the real quantized backend without fabricating a quant format.
    fn q_gemm_dequant(&self, x: &Mat, w: &Mat) -> CoreResult<Mat>;

    /// `y = (swish(x·W_gate) ⊙ (x·W_up)) · W_down`.
    fn swiglu_mlp(&self, x: &Mat, gate: &Mat, up: &Mat, down: &Mat) -> CoreResult<Mat>;
}

/// Correct, unoptimized CPU math standing in for the GPU backend in tests
/// and as the library's default.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceKernels;

fn gqa_kv_head(h: usize, num_heads: usize, num_kv_heads: usize) -> usize {
    h * num_kv_heads / num_heads
}

fn softmax_two_pass(scores: &mut [f32]) {
    let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for s in scores.iter_mut() {
        *s = (*s - max).exp();
        sum += *s;
    }
    if sum > 0.0 {
        for s in scores.iter_mut() {
            *s /= sum;
        }
    }
}

impl Kernels for ReferenceKernels {
    fn rmsnorm(&self, x: &[f32], gamma: &[f32], eps: f32) -> Vec<f32> {
        let mean_sq: f32 = x.iter().map(|&v| v * v).sum::<f32>() / x.len().max(1) as f32;
        let denom = (mean_sq + eps).sqrt();
        if denom == 0.0 {
            return vec![0.0; x.len()];
        }
        x.iter()
            .zip(gamma)
            .map(|(&xi, &g)| xi / denom * g)
            .collect()
    }

    fn attention_prefill(
        &self,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        q_len: usize,
        kv_len: usize,
        num_heads: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> CoreResult<Vec<f32>> {
        if q.len() != q_len * num_heads * head_dim
            || k.len() != kv_len * num_kv_heads * head_dim
            || v.len() != kv_len * num_kv_heads * head_dim
        {
            return Err(crate::error::CoreError::ShapeMismatch(
                "attention_prefill: input length does not match declared shape".into(),
            ));
        }
        let scale = 1.0 / (head_dim as f32).sqrt();
        let causal_offset = kv_len - q_len; // query i attends to kv[0..=causal_offset+i]
        let mut out = vec![0.0f32; q_len * num_heads * head_dim];

        for qi in 0..q_len {
            let causal_end = causal_offset + qi + 1;
            for h in 0..num_heads {
                let kvh = gqa_kv_head(h, num_heads, num_kv_heads);
                let q_vec = &q[(qi * num_heads + h) * head_dim..(qi * num_heads + h + 1) * head_dim];

                let mut scores = vec![0.0f32; causal_end];
                for (ki, score) in scores.iter_mut().enumerate() {
                    let k_vec =
                        &k[(ki * num_kv_heads + kvh) * head_dim..(ki * num_kv_heads + kvh + 1) * head_dim];
                    let dot: f32 = q_vec.iter().zip(k_vec).map(|(a, b)| a * b).sum();
                    *score = dot * scale;
                }
                softmax_two_pass(&mut scores);

                let out_slice = &mut out[(qi * num_heads + h) * head_dim..(qi * num_heads + h + 1) * head_dim];
                for (ki, &weight) in scores.iter().enumerate() {
                    let v_vec =
                        &v[(ki * num_kv_heads + kvh) * head_dim..(ki * num_kv_heads + kvh + 1) * head_dim];
                    for (o, &vv) in out_slice.iter_mut().zip(v_vec) {
                        *o += weight * vv;
                    }
                }
            }
        }
        Ok(out)
    }

    fn attention_decode_paged(
        &self,
        q: &[f32],
        kv: &PagedKv<'_>,
        num_heads: usize,
    ) -> CoreResult<Vec<f32>> {
        let head_dim = kv.head_dim;
        let num_kv_heads = kv.num_kv_heads;
        if q.len() != num_heads * head_dim {
            return Err(crate::error::CoreError::ShapeMismatch(
                "attention_decode_paged: query length does not match num_heads * head_dim".into(),
            ));
        }
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut out = vec![0.0f32; num_heads * head_dim];

        // (block_index, token-within-block) for every cached position, in order.
        let positions: Vec<(usize, usize)> = (0..kv.total_tokens)
            .map(|pos| (pos / kv.block_size, pos % kv.block_size))
            .collect();

        for h in 0..num_heads {
            let kvh = gqa_kv_head(h, num_heads, num_kv_heads);
            let q_vec = &q[h * head_dim..(h + 1) * head_dim];

            let mut scores = Vec::with_capacity(kv.total_tokens);
            for &(block_idx, t) in &positions {
                let (k_tensor, _) = &kv.blocks[block_idx];
                let slot = k_tensor.slot(kv.layer, t, kvh);
                let dot: f32 = q_vec.iter().zip(slot).map(|(a, b)| a * b.to_f32()).sum();
                scores.push(dot * scale);
            }
            softmax_two_pass(&mut scores);

            let out_slice = &mut out[h * head_dim..(h + 1) * head_dim];
            for (&(block_idx, t), &weight) in positions.iter().zip(&scores) {
                let (_, v_tensor) = &kv.blocks[block_idx];
                let slot = v_tensor.slot(kv.layer, t, kvh);
                for (o, vv) in out_slice.iter_mut().zip(slot) {
                    *o += weight * vv.to_f32();
                }
            }
        }
        Ok(out)
    }

    fn rope_apply(
        &self,
        x: &mut [f32],
        positions: &[usize],
        num_heads: usize,
        head_dim: usize,
        _scaling: RopeScaling,
    ) -> CoreResult<()> {
        if x.len() != positions.len() * num_heads * head_dim {
            return Err(crate::error::CoreError::ShapeMismatch(
                "rope_apply: input length does not match seq_len * num_heads * head_dim".into(),
            ));
        }
        let half = head_dim / 2;
        for (s, &pos) in positions.iter().enumerate() {
            for h in 0..num_heads {
                let base = (s * num_heads + h) * head_dim;
                for i in 0..half {
                    let theta = pos as f32 / 10000f32.powf(2.0 * i as f32 / head_dim as f32);
                    let (sin, cos) = theta.sin_cos();
                    let a = x[base + i];
                    let b = x[base + half + i];
                    x[base + i] = a * cos - b * sin;
                    x[base + half + i] = a * sin + b * cos;
                }
            }
        }
        Ok(())
    }

    fn q_gemm_dequant(&self, x: &Mat, w: &Mat) -> CoreResult<Mat> {
        if x.cols != w.rows {
            return Err(crate::error::CoreError::ShapeMismatch(format!(
                "q_gemm_dequant: x.cols ({}) != w.rows ({})",
                x.cols, w.rows
            )));
        }
        let mut out = Mat::zeros(x.rows, w.cols);
        for r in 0..x.rows {
            let x_row = x.row(r);
            let out_row = out.row_mut(r);
            for (c, out_val) in out_row.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for k in 0..x.cols {
                    acc += x_row[k] * w.data[k * w.cols + c];
                }
                *out_val = acc;
            }
        }
        Ok(out)
    }

    fn swiglu_mlp(&self, x: &Mat, gate: &Mat, up: &Mat, down: &Mat) -> CoreResult<Mat> {
        let g = self.q_gemm_dequant(x, gate)?;
        let u = self.q_gemm_dequant(x, up)?;
        let mut h = Mat::zeros(g.rows, g.cols);
        for i in 0..h.data.len() {
            let gv = g.data[i];
            let swish = gv / (1.0 + (-gv).exp());
            h.data[i] = swish * u.data[i];
        }
        self.q_gemm_dequant(&h, down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmsnorm_zero_input_is_zero() {
        let k = ReferenceKernels;
        let out = k.rmsnorm(&[0.0; 8], &[1.0; 8], 1e-5);
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_softmax_two_pass_sums_to_one() {
        let mut scores = vec![1.0, 2.0, 3.0, f32::NEG_INFINITY];
        softmax_two_pass(&mut scores);
        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert_eq!(scores[3], 0.0);
    }

    #[test]
    fn test_attention_prefill_shapes() {
        let k = ReferenceKernels;
        let q_len = 2;
        let kv_len = 2;
        let num_heads = 2;
        let num_kv_heads = 1;
        let head_dim = 4;
        let q = vec![0.1; q_len * num_heads * head_dim];
        let kk = vec![0.1; kv_len * num_kv_heads * head_dim];
        let v = vec![0.2; kv_len * num_kv_heads * head_dim];
        let out = k
            .attention_prefill(&q, &kk, &v, q_len, kv_len, num_heads, num_kv_heads, head_dim)
            .unwrap();
        assert_eq!(out.len(), q_len * num_heads * head_dim);
    }

    #[test]
    fn test_rope_apply_preserves_norm() {
        let k = ReferenceKernels;
        let mut x = vec![1.0, 0.0, 1.0, 0.0];
        let norm_before: f32 = x.iter().map(|v| v * v).sum();
        k.rope_apply(&mut x, &[5], 1, 4, RopeScaling::Base).unwrap();
        let norm_after: f32 = x.iter().map(|v| v * v).sum();
        assert!((norm_before - norm_after).abs() < 1e-4);
    }

    #[test]
    fn test_q_gemm_dequant_shape_mismatch() {
        let k = ReferenceKernels;
        let x = Mat::zeros(2, 3);
        let w = Mat::zeros(4, 5);
        assert!(k.q_gemm_dequant(&x, &w).is_err());
    }
}
