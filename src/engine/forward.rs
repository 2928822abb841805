//! Single-sequence engine: prefill and decode forward passes.
//!
//! Reads and writes the paged KV cache through the [`Pager`] while driving
//! the [`Kernels`] contract layer by layer, matching §4.4's per-layer
//! sequence: project Q/K/V, RoPE, write KV, attention over all cached
//! positions, MLP, residual, norm.

use std::sync::Arc;

use tracing::trace;

use crate::cache::pager::{PageSlot, Pager};
use crate::engine::model::ModelHandle;
use crate::error::{CoreError, CoreResult};
use crate::kernels::{Kernels, Mat, PagedKv, RopeScaling};

/// Per-sequence engine-side view: how many tokens are already cached, so
/// the caller knows where the next chunk's absolute positions start.
#[derive(Debug, Clone, Copy)]
pub struct InferenceCache {
    pub seq_id: u64,
    pub cached_tokens: usize,
}

impl InferenceCache {
    pub fn new(seq_id: u64) -> Self {
        Self {
            seq_id,
            cached_tokens: 0,
        }
    }
}

/// Drives a loaded model through a [`Kernels`] backend.
pub struct Engine<K: Kernels> {
    kernels: K,
    model: Arc<dyn ModelHandle>,
}

impl<K: Kernels> Engine<K> {
    pub fn new(kernels: K, model: Arc<dyn ModelHandle>) -> Self {
        Self { kernels, model }
    }

    pub fn model(&self) -> &Arc<dyn ModelHandle> {
        &self.model
    }

    /// Process an entire prompt chunk. Precondition: the caller already
    /// called `pager.ensure_capacity(seq, cache.cached_tokens + tokens.len())`.
    /// Returns logits for the final position only.
    pub fn forward_prefill(
        &self,
        pager: &mut Pager,
        cache: &mut InferenceCache,
        tokens: &[u32],
    ) -> CoreResult<Vec<f32>> {
        if tokens.is_empty() {
            return Err(CoreError::ShapeMismatch(
                "forward_prefill: tokens must be non-empty".into(),
            ));
        }
        self.run(pager, cache, tokens)
    }

    /// Process exactly one new token at `cache.cached_tokens`.
    pub fn forward_decode(
        &self,
        pager: &mut Pager,
        cache: &mut InferenceCache,
        token: u32,
    ) -> CoreResult<Vec<f32>> {
        self.run(pager, cache, &[token])
    }

    fn run(
        &self,
        pager: &mut Pager,
        cache: &mut InferenceCache,
        tokens: &[u32],
    ) -> CoreResult<Vec<f32>> {
        let seq_id = cache.seq_id;
        let start_pos = cache.cached_tokens;
        let l = tokens.len();
        let hidden = self.model.hidden_size();
        let num_heads = self.model.num_query_heads();
        let num_kv_heads = self.model.num_kv_heads();
        let head_dim = self.model.head_dim();

        let mut hidden_states = Mat::zeros(l, hidden);
        for (i, &tok) in tokens.iter().enumerate() {
            hidden_states.row_mut(i).copy_from_slice(&self.model.embed(tok));
        }

        let positions: Vec<usize> = (start_pos..start_pos + l).collect();

        for layer_idx in 0..self.model.num_layers() {
            let weights = self.model.layer(layer_idx);

            let mut normed = hidden_states.clone();
            for r in 0..l {
                let row = self.kernels.rmsnorm(hidden_states.row(r), &weights.attn_norm, 1e-5);
                normed.row_mut(r).copy_from_slice(&row);
            }

            let mut q = self.kernels.q_gemm_dequant(&normed, &weights.w_q)?;
            let mut kk = self.kernels.q_gemm_dequant(&normed, &weights.w_k)?;
            let v = self.kernels.q_gemm_dequant(&normed, &weights.w_v)?;

            self.kernels
                .rope_apply(&mut q.data, &positions, num_heads, head_dim, RopeScaling::Base)?;
            self.kernels
                .rope_apply(&mut kk.data, &positions, num_kv_heads, head_dim, RopeScaling::Base)?;

            // Write this layer's new K/V into the paged cache before
            // attention reads it back, so prefill and decode share one
            // gather path.
            for (i, &pos) in positions.iter().enumerate() {
                let block_id = pager.prepare_write(seq_id, pos)?;
                let block_size = pager.sequence(seq_id)?.page_table.block_size;
                let token_in_block = pos % block_size;
                let block = pager.arena_mut().get_mut(block_id)?;
                for h in 0..num_kv_heads {
                    let k_row = &kk.row(i)[h * head_dim..(h + 1) * head_dim];
                    let v_row = &v.row(i)[h * head_dim..(h + 1) * head_dim];
                    block.k.write_slot(layer_idx, token_in_block, h, k_row);
                    block.v.write_slot(layer_idx, token_in_block, h, v_row);
                }
                block.dirty = true;
                block.touch();
            }

            let kv_len = start_pos + l;
            let attn_out = if l == 1 {
                let paged = self.build_paged_view(pager, seq_id, layer_idx, num_kv_heads, head_dim)?;
                self.kernels.attention_decode_paged(&q.data, &paged, num_heads)?
            } else {
                let (k_flat, v_flat) =
                    self.gather_kv(pager, seq_id, layer_idx, kv_len, num_kv_heads, head_dim)?;
                self.kernels.attention_prefill(
                    &q.data,
                    &k_flat,
                    &v_flat,
                    l,
                    kv_len,
                    num_heads,
                    num_kv_heads,
                    head_dim,
                )?
            };

            let attn_mat = Mat {
                rows: l,
                cols: hidden,
                data: attn_out,
            };
            let attn_proj = self.kernels.q_gemm_dequant(&attn_mat, &weights.w_o)?;
            for i in 0..hidden_states.data.len() {
                hidden_states.data[i] += attn_proj.data[i];
            }

            let mut ffn_normed = hidden_states.clone();
            for r in 0..l {
                let row = self.kernels.rmsnorm(hidden_states.row(r), &weights.ffn_norm, 1e-5);
                ffn_normed.row_mut(r).copy_from_slice(&row);
            }
            let mlp_out = self
                .kernels
                .swiglu_mlp(&ffn_normed, &weights.w_gate, &weights.w_up, &weights.w_down)?;
            for i in 0..hidden_states.data.len() {
                hidden_states.data[i] += mlp_out.data[i];
            }

            trace!(layer = layer_idx, seq_id, "layer forward complete");
        }

        cache.cached_tokens += l;

        let last_row = hidden_states.row(l - 1);
        let normed_final = self.kernels.rmsnorm(last_row, self.model.final_norm(), 1e-5);
        let final_mat = Mat {
            rows: 1,
            cols: hidden,
            data: normed_final,
        };
        let logits = self.kernels.q_gemm_dequant(&final_mat, self.model.lm_head())?;
        Ok(logits.data)
    }

    /// Read every cached position `[0, kv_len)` for one layer out of the
    /// paged blocks into flat `[kv_len, num_kv_heads, head_dim]` buffers.
    fn gather_kv(
        &self,
        pager: &Pager,
        seq_id: u64,
        layer: usize,
        kv_len: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> CoreResult<(Vec<f32>, Vec<f32>)> {
        let mut k_flat = vec![0.0f32; kv_len * num_kv_heads * head_dim];
        let mut v_flat = vec![0.0f32; kv_len * num_kv_heads * head_dim];
        let block_size = pager.sequence(seq_id)?.page_table.block_size;

        for pos in 0..kv_len {
            let slot = pager.block_for_token(seq_id, pos)?;
            let block_id = match slot {
                PageSlot::Present(id) => id,
                PageSlot::Evicted => {
                    return Err(CoreError::KvMiss {
                        seq_id,
                        token_pos: pos,
                    })
                }
            };
            let token_in_block = pos % block_size;
            let k_tensor = pager.arena().k_view(block_id)?;
            let v_tensor = pager.arena().v_view(block_id)?;
            for h in 0..num_kv_heads {
                let dst_k = &mut k_flat[(pos * num_kv_heads + h) * head_dim..(pos * num_kv_heads + h + 1) * head_dim];
                for (d, val) in dst_k.iter_mut().zip(k_tensor.slot(layer, token_in_block, h)) {
                    *d = val.to_f32();
                }
                let dst_v = &mut v_flat[(pos * num_kv_heads + h) * head_dim..(pos * num_kv_heads + h + 1) * head_dim];
                for (d, val) in dst_v.iter_mut().zip(v_tensor.slot(layer, token_in_block, h)) {
                    *d = val.to_f32();
                }
            }
        }
        Ok((k_flat, v_flat))
    }

    fn build_paged_view<'a>(
        &self,
        pager: &'a Pager,
        seq_id: u64,
        layer: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> CoreResult<PagedKv<'a>> {
        let seq = pager.sequence(seq_id)?;
        let block_size = seq.page_table.block_size;
        let total_tokens = seq.page_table.num_tokens;
        let mut blocks = Vec::with_capacity(seq.page_table.slots.len());
        for slot in &seq.page_table.slots {
            match slot {
                PageSlot::Present(id) => {
                    blocks.push((pager.arena().k_view(*id)?, pager.arena().v_view(*id)?));
                }
                PageSlot::Evicted => {
                    return Err(CoreError::KvMiss {
                        seq_id,
                        token_pos: 0,
                    })
                }
            }
        }
        Ok(PagedKv {
            block_size,
            num_kv_heads,
            head_dim,
            layer,
            blocks,
            total_tokens,
        })
    }
}
