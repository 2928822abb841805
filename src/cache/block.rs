//! KV block types.
//!
//! A block holds a fixed number of token KV pairs for all layers. Blocks are
//! the unit of allocation, reference counting, and tier movement.

use std::sync::atomic::{AtomicU64, Ordering};

use half::f16;
use serde::{Deserialize, Serialize};

/// Unique identifier for a KV block, stable for the block's lifetime.
pub type BlockId = u64;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a new unique block ID.
pub fn new_block_id() -> BlockId {
    NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Process-local monotonic tick, used for `last_access` instead of a
/// wall-clock timestamp so eviction ordering is deterministic in tests.
static NEXT_TICK: AtomicU64 = AtomicU64::new(0);

/// Advance and return the next tick. Called on every access that should
/// count toward recency (`touch`, allocation, read, write).
pub fn next_tick() -> u64 {
    NEXT_TICK.fetch_add(1, Ordering::Relaxed)
}

/// Which storage tier a block currently resides in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Fast tier: on-device (GPU) memory.
    Gpu,
    /// Overflow tier: host (CPU) memory.
    Cpu,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Gpu => write!(f, "GPU"),
            Tier::Cpu => write!(f, "CPU"),
        }
    }
}

/// A dense KV tensor for one block: `[num_layers, tokens_per_block,
/// num_kv_heads, head_dim]`, row-major with `num_layers` the slowest axis.
#[derive(Debug, Clone)]
pub struct KvTensor {
    pub num_layers: usize,
    pub tokens_per_block: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    data: Vec<f16>,
}

impl KvTensor {
    pub fn zeros(
        num_layers: usize,
        tokens_per_block: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> Self {
        let len = num_layers * tokens_per_block * num_kv_heads * head_dim;
        Self {
            num_layers,
            tokens_per_block,
            num_kv_heads,
            head_dim,
            data: vec![f16::ZERO; len],
        }
    }

    fn offset(&self, layer: usize, token: usize, head: usize) -> usize {
        debug_assert!(layer < self.num_layers);
        debug_assert!(token < self.tokens_per_block);
        debug_assert!(head < self.num_kv_heads);
        ((layer * self.tokens_per_block + token) * self.num_kv_heads + head) * self.head_dim
    }

    /// View of the `head_dim` vector at `(layer, token, head)`.
    pub fn slot(&self, layer: usize, token: usize, head: usize) -> &[f16] {
        let off = self.offset(layer, token, head);
        &self.data[off..off + self.head_dim]
    }

    /// Mutable view of the `head_dim` vector at `(layer, token, head)`.
    pub fn slot_mut(&mut self, layer: usize, token: usize, head: usize) -> &mut [f16] {
        let off = self.offset(layer, token, head);
        &mut self.data[off..off + self.head_dim]
    }

    /// Write one token's KV vector for `(layer, head)`, converting from fp32.
    pub fn write_slot(&mut self, layer: usize, token: usize, head: usize, values: &[f32]) {
        let slot = self.slot_mut(layer, token, head);
        for (dst, &src) in slot.iter_mut().zip(values) {
            *dst = f16::from_f32(src);
        }
    }

    pub fn raw(&self) -> &[f16] {
        &self.data
    }

    pub fn raw_mut(&mut self) -> &mut [f16] {
        &mut self.data
    }

    /// Bytes occupied by this tensor's backing storage.
    pub fn byte_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f16>()
    }

    pub fn copy_from(&mut self, other: &KvTensor) {
        self.data.copy_from_slice(&other.data);
    }
}

/// A single KV cache block: `block_size` tokens of K and V across all
/// layers, for one tier.
#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    /// Number of page-table slots currently pointing at this block. A block
    /// with `ref_count > 1` is shared (a COW fork) and must not be written
    /// in place.
    pub ref_count: u32,
    pub tier: Tier,
    /// Set once any token slot has been written since allocation or the
    /// last persistence write-back.
    pub dirty: bool,
    pub last_access: u64,
    pub k: KvTensor,
    pub v: KvTensor,
}

impl Block {
    pub fn new(id: BlockId, tier: Tier, k: KvTensor, v: KvTensor) -> Self {
        Self {
            id,
            ref_count: 1,
            tier,
            dirty: false,
            last_access: next_tick(),
            k,
            v,
        }
    }

    pub fn touch(&mut self) {
        self.last_access = next_tick();
    }

    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    /// Bytes occupied by this block's K and V tensors combined.
    pub fn byte_size(&self) -> usize {
        self.k.byte_size() + self.v.byte_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Gpu.to_string(), "GPU");
        assert_eq!(Tier::Cpu.to_string(), "CPU");
    }

    #[test]
    fn test_kv_tensor_slot_roundtrip() {
        let mut t = KvTensor::zeros(2, 4, 3, 8);
        t.write_slot(1, 2, 0, &[1.0; 8]);
        let slot = t.slot(1, 2, 0);
        assert!(slot.iter().all(|&v| (v.to_f32() - 1.0).abs() < 1e-3));
        // untouched slot stays zero
        assert!(t.slot(0, 0, 0).iter().all(|&v| v.to_f32() == 0.0));
    }

    #[test]
    fn test_block_touch_advances_tick() {
        let k = KvTensor::zeros(1, 1, 1, 1);
        let v = KvTensor::zeros(1, 1, 1, 1);
        let mut block = Block::new(new_block_id(), Tier::Gpu, k, v);
        let before = block.last_access;
        block.touch();
        assert!(block.last_access > before);
    }

    #[test]
    fn test_block_shared_flag() {
        let k = KvTensor::zeros(1, 1, 1, 1);
        let v = KvTensor::zeros(1, 1, 1, 1);
        let mut block = Block::new(new_block_id(), Tier::Gpu, k, v);
        assert!(!block.is_shared());
        block.ref_count = 2;
        assert!(block.is_shared());
    }
}
