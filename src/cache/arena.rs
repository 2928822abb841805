//! Block arena: tiered allocation, ref-counting, and tier movement.
//!
//! The arena owns every live [`Block`] and lazily creates new blocks up to
//! each tier's capacity. It knows nothing about sequences or page tables —
//! that bookkeeping lives one layer up, in [`crate::cache::pager`].

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::cache::block::{new_block_id, next_tick, Block, BlockId, KvTensor, Tier};
use crate::config::{ArenaConfig, ModelConfig};
use crate::error::{CoreError, CoreResult};

/// Point-in-time arena occupancy, read by the eviction manager to decide
/// whether a round of eviction is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaStats {
    pub gpu_blocks_in_use: usize,
    pub gpu_capacity: usize,
    pub cpu_blocks_in_use: usize,
    pub cpu_capacity: usize,
    pub cross_tier_moves: u64,
}

impl ArenaStats {
    pub fn gpu_usage_fraction(&self) -> f64 {
        if self.gpu_capacity == 0 {
            0.0
        } else {
            self.gpu_blocks_in_use as f64 / self.gpu_capacity as f64
        }
    }
}

/// Shape every block in this arena is allocated with.
#[derive(Debug, Clone, Copy)]
pub struct BlockShape {
    pub num_layers: usize,
    pub tokens_per_block: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl From<&ModelConfig> for BlockShape {
    fn from(m: &ModelConfig) -> Self {
        Self {
            num_layers: m.num_layers,
            tokens_per_block: m.block_size,
            num_kv_heads: m.num_kv_heads,
            head_dim: m.head_dim,
        }
    }
}

/// Free-list + lazy-creation allocator for one tier.
#[derive(Debug, Default)]
struct TierPool {
    free: VecDeque<BlockId>,
    created: usize,
    capacity: usize,
}

impl TierPool {
    fn has_room(&self) -> bool {
        !self.free.is_empty() || self.created < self.capacity
    }
}

/// Owns all live blocks across the Gpu and Cpu tiers.
pub struct Arena {
    shape: BlockShape,
    blocks: HashMap<BlockId, Block>,
    gpu: TierPool,
    cpu: TierPool,
    enable_cpu_overflow: bool,
    cross_tier_moves: u64,
}

impl Arena {
    pub fn new(model: &ModelConfig, config: &ArenaConfig) -> Self {
        Self {
            shape: BlockShape::from(model),
            blocks: HashMap::new(),
            gpu: TierPool {
                free: VecDeque::new(),
                created: 0,
                capacity: config.gpu_capacity_blocks,
            },
            cpu: TierPool {
                free: VecDeque::new(),
                created: 0,
                capacity: config.cpu_capacity_blocks,
            },
            enable_cpu_overflow: config.enable_cpu_overflow,
            cross_tier_moves: 0,
        }
    }

    fn pool_mut(&mut self, tier: Tier) -> &mut TierPool {
        match tier {
            Tier::Gpu => &mut self.gpu,
            Tier::Cpu => &mut self.cpu,
        }
    }

    fn new_tensors(&self) -> (KvTensor, KvTensor) {
        let k = KvTensor::zeros(
            self.shape.num_layers,
            self.shape.tokens_per_block,
            self.shape.num_kv_heads,
            self.shape.head_dim,
        );
        let v = KvTensor::zeros(
            self.shape.num_layers,
            self.shape.tokens_per_block,
            self.shape.num_kv_heads,
            self.shape.head_dim,
        );
        (k, v)
    }

    /// Allocate one fresh block, preferring the Gpu tier and falling back
    /// to Cpu when `enable_cpu_overflow` and Gpu is exhausted.
    pub fn allocate(&mut self) -> CoreResult<BlockId> {
        Ok(self.allocate_n(1)?.remove(0))
    }

    /// Allocate `n` blocks as a single all-or-nothing transaction: either
    /// all `n` succeed or none are created and no free-list state changes.
    pub fn allocate_n(&mut self, n: usize) -> CoreResult<Vec<BlockId>> {
        // Dry-run capacity check across both tiers before mutating anything.
        let mut gpu_room = self.gpu.free.len() + (self.gpu.capacity - self.gpu.created);
        let mut cpu_room = self.cpu.free.len() + (self.cpu.capacity - self.cpu.created);
        if !self.enable_cpu_overflow {
            cpu_room = 0;
        }
        if gpu_room + cpu_room < n {
            return Err(CoreError::OutOfCapacity);
        }

        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            let tier = if gpu_room > 0 {
                gpu_room -= 1;
                Tier::Gpu
            } else {
                cpu_room -= 1;
                Tier::Cpu
            };
            let id = self.allocate_in_tier(tier)?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn allocate_in_tier(&mut self, tier: Tier) -> CoreResult<BlockId> {
        let pool = self.pool_mut(tier);
        if let Some(id) = pool.free.pop_front() {
            let block = self.blocks.get_mut(&id).expect("freed id stays in map");
            block.ref_count = 1;
            block.dirty = false;
            block.touch();
            trace!(block_id = id, %tier, "reused freed block");
            return Ok(id);
        }
        if !pool.has_room() {
            return Err(CoreError::OutOfCapacity);
        }
        pool.created += 1;
        let id = new_block_id();
        let (k, v) = self.new_tensors();
        self.blocks.insert(id, Block::new(id, tier, k, v));
        debug!(block_id = id, %tier, "created new block");
        Ok(id)
    }

    pub fn get(&self, id: BlockId) -> CoreResult<&Block> {
        self.blocks.get(&id).ok_or(CoreError::UnknownBlock(id))
    }

    pub fn get_mut(&mut self, id: BlockId) -> CoreResult<&mut Block> {
        self.blocks.get_mut(&id).ok_or(CoreError::UnknownBlock(id))
    }

    pub fn tier_of(&self, id: BlockId) -> CoreResult<Tier> {
        Ok(self.get(id)?.tier)
    }

    pub fn ref_count(&self, id: BlockId) -> CoreResult<u32> {
        Ok(self.get(id)?.ref_count)
    }

    pub fn last_access(&self, id: BlockId) -> CoreResult<u64> {
        Ok(self.get(id)?.last_access)
    }

    /// Increment a block's reference count (used when a page table slot
    /// starts pointing at an already-live block, e.g. a COW fork).
    pub fn ref_block(&mut self, id: BlockId) -> CoreResult<()> {
        self.get_mut(id)?.ref_count += 1;
        Ok(())
    }

    /// Decrement a block's reference count. At zero, the block returns to
    /// its tier's free list rather than being deallocated — its tensors are
    /// reused by the next allocation in that tier.
    pub fn unref(&mut self, id: BlockId) -> CoreResult<()> {
        let block = self.get_mut(id)?;
        debug_assert!(block.ref_count > 0, "unref on a block with no refs");
        block.ref_count = block.ref_count.saturating_sub(1);
        if block.ref_count == 0 {
            let tier = block.tier;
            self.pool_mut(tier).free.push_back(id);
        }
        Ok(())
    }

    pub fn touch(&mut self, id: BlockId) -> CoreResult<()> {
        self.get_mut(id)?.touch();
        Ok(())
    }

    /// Move a block's tensors to a different tier in place, preserving its
    /// id and ref count. Fails with `OutOfCapacity` if the destination tier
    /// has no room; the caller (eviction manager) is responsible for making
    /// room first.
    pub fn move_tier(&mut self, id: BlockId, to: Tier) -> CoreResult<()> {
        let from = self.tier_of(id)?;
        if from == to {
            return Ok(());
        }
        {
            let pool = self.pool_mut(to);
            if !pool.has_room() {
                return Err(CoreError::OutOfCapacity);
            }
            if pool.free.pop_front().is_none() {
                pool.created += 1;
            }
        }
        self.get_mut(id)?.tier = to;
        self.cross_tier_moves += 1;
        debug!(block_id = id, %from, %to, "moved block across tiers");
        Ok(())
    }

    pub fn k_view(&self, id: BlockId) -> CoreResult<&KvTensor> {
        Ok(&self.get(id)?.k)
    }

    pub fn v_view(&self, id: BlockId) -> CoreResult<&KvTensor> {
        Ok(&self.get(id)?.v)
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            gpu_blocks_in_use: self.gpu.created - self.gpu.free.len(),
            gpu_capacity: self.gpu.capacity,
            cpu_blocks_in_use: self.cpu.created - self.cpu.free.len(),
            cpu_capacity: self.cpu.capacity,
            cross_tier_moves: self.cross_tier_moves,
        }
    }
}
