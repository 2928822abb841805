//! Pager: sequence-level page tables over the block [`Arena`].
//!
//! The pager knows about sequences and their token-to-block mapping; the
//! arena knows about tiers and raw blocks. Eviction and persistence act
//! through the pager so page-table slots stay consistent with arena
//! ref-counts.

use std::collections::HashMap;

use tracing::debug;

use crate::cache::arena::Arena;
use crate::cache::block::BlockId;
use crate::config::{ArenaConfig, ModelConfig};
use crate::error::{CoreError, CoreResult};

/// One page-table entry: either a live block or a hole left by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSlot {
    Present(BlockId),
    Evicted,
}

/// Token-to-block mapping for one sequence. Grows only by appending;
/// existing slots are replaced in place (COW-on-write, eviction) but never
/// removed, so `slots.len()` always equals the sequence's block count.
#[derive(Debug)]
pub struct PageTable {
    pub sequence_id: u64,
    pub slots: Vec<PageSlot>,
    pub num_tokens: usize,
    pub block_size: usize,
}

impl PageTable {
    pub fn new(sequence_id: u64, block_size: usize) -> Self {
        Self {
            sequence_id,
            slots: Vec::new(),
            num_tokens: 0,
            block_size,
        }
    }

    /// Number of blocks needed to hold `num_tokens` tokens at this table's
    /// block size.
    pub fn blocks_required(num_tokens: usize, block_size: usize) -> usize {
        if num_tokens == 0 {
            0
        } else {
            (num_tokens + block_size - 1) / block_size
        }
    }

    pub fn block_index_for_token(&self, token_pos: usize) -> Option<usize> {
        if token_pos >= self.num_tokens {
            return None;
        }
        Some(token_pos / self.block_size)
    }

    pub fn block_for_token(&self, token_pos: usize) -> Option<PageSlot> {
        self.block_index_for_token(token_pos)
            .and_then(|idx| self.slots.get(idx))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A logical sequence: a page table plus scheduling-adjacent metadata that
/// the pager itself needs (recency, fork lineage). Request-level state
/// (waiting/prefilling/decoding/...) lives in the scheduler, not here.
#[derive(Debug)]
pub struct Sequence {
    pub id: u64,
    pub parent_id: Option<u64>,
    pub page_table: PageTable,
    pub last_access: u64,
    pub active: bool,
    pub priority: u8,
}

/// Owns the arena and every sequence's page table.
pub struct Pager {
    arena: Arena,
    sequences: HashMap<u64, Sequence>,
    block_size: usize,
}

impl Pager {
    pub fn new(model: &ModelConfig, arena_config: &ArenaConfig) -> Self {
        Self {
            arena: Arena::new(model, arena_config),
            sequences: HashMap::new(),
            block_size: model.block_size,
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn sequence(&self, seq_id: u64) -> CoreResult<&Sequence> {
        self.sequences
            .get(&seq_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown sequence {seq_id}")))
    }

    fn sequence_mut(&mut self, seq_id: u64) -> CoreResult<&mut Sequence> {
        self.sequences
            .get_mut(&seq_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown sequence {seq_id}")))
    }

    /// Register a new, empty sequence. `parent_id` records fork lineage but
    /// copies no blocks — use [`Pager::fork`] to actually share a prefix.
    pub fn create(&mut self, seq_id: u64, parent_id: Option<u64>, priority: u8) -> CoreResult<()> {
        if self.sequences.contains_key(&seq_id) {
            return Err(CoreError::InvalidArgument(format!(
                "sequence {seq_id} already exists"
            )));
        }
        self.sequences.insert(
            seq_id,
            Sequence {
                id: seq_id,
                parent_id,
                page_table: PageTable::new(seq_id, self.block_size),
                last_access: crate::cache::block::next_tick(),
                active: true,
                priority,
            },
        );
        Ok(())
    }

    /// Fork `parent_id`'s page table into a new sequence `child_id`, sharing
    /// every present block via ref-count increment. Increments happen before
    /// the child sequence becomes visible to any other caller, so no
    /// intermediate state is ever observable with an under-counted block.
    pub fn fork(&mut self, parent_id: u64, child_id: u64, priority: u8) -> CoreResult<()> {
        if self.sequences.contains_key(&child_id) {
            return Err(CoreError::InvalidArgument(format!(
                "sequence {child_id} already exists"
            )));
        }
        let parent_slots = self.sequence(parent_id)?.page_table.slots.clone();
        for slot in &parent_slots {
            if let PageSlot::Present(block_id) = slot {
                self.arena.ref_block(*block_id)?;
            }
        }
        let num_tokens = self.sequence(parent_id)?.page_table.num_tokens;
        let mut page_table = PageTable::new(child_id, self.block_size);
        page_table.slots = parent_slots;
        page_table.num_tokens = num_tokens;
        self.sequences.insert(
            child_id,
            Sequence {
                id: child_id,
                parent_id: Some(parent_id),
                page_table,
                last_access: crate::cache::block::next_tick(),
                active: true,
                priority,
            },
        );
        debug!(parent_id, child_id, "forked sequence (COW)");
        Ok(())
    }

    /// Release every block the sequence still holds and drop it.
    pub fn delete(&mut self, seq_id: u64) -> CoreResult<()> {
        let seq = self
            .sequences
            .remove(&seq_id)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown sequence {seq_id}")))?;
        for slot in &seq.page_table.slots {
            if let PageSlot::Present(block_id) = slot {
                self.arena.unref(*block_id)?;
            }
        }
        Ok(())
    }

    /// Grow the page table so it has enough blocks for `num_tokens` total
    /// tokens, allocating fresh blocks from the arena as needed.
    pub fn ensure_capacity(&mut self, seq_id: u64, num_tokens: usize) -> CoreResult<()> {
        let block_size = self.block_size;
        let needed = PageTable::blocks_required(num_tokens, block_size);
        let seq = self.sequence_mut(seq_id)?;
        let have = seq.page_table.slots.len();
        if needed <= have {
            seq.page_table.num_tokens = num_tokens;
            return Ok(());
        }
        let to_allocate = needed - have;
        let new_ids = self.arena.allocate_n(to_allocate)?;
        let seq = self.sequence_mut(seq_id)?;
        seq.page_table
            .slots
            .extend(new_ids.into_iter().map(PageSlot::Present));
        seq.page_table.num_tokens = num_tokens;
        Ok(())
    }

    /// Look up the slot backing `token_pos`. Distinguishes two failure
    /// modes a caller must react to differently: `OutOfCapacity` if the
    /// table was never grown this far (the caller forgot to `ensure_capacity`
    /// first), `KvMiss` if the position was grown and then evicted.
    pub fn block_for_token(&self, seq_id: u64, token_pos: usize) -> CoreResult<PageSlot> {
        let table = &self.sequence(seq_id)?.page_table;
        if token_pos >= table.num_tokens {
            return Err(CoreError::OutOfCapacity);
        }
        table
            .block_for_token(token_pos)
            .ok_or(CoreError::KvMiss { seq_id, token_pos })
    }

    pub fn touch(&mut self, seq_id: u64) -> CoreResult<()> {
        let tick = crate::cache::block::next_tick();
        self.sequence_mut(seq_id)?.last_access = tick;
        Ok(())
    }

    /// Return the block id a caller may write token `token_pos` into,
    /// performing copy-on-write first if that block is shared (ref_count >
    /// 1, e.g. after a fork). The COW copy is a fresh block with the same
    /// tensors; the old block is unref'd and may return to its tier's free
    /// list if this was its last reference.
    pub fn prepare_write(&mut self, seq_id: u64, token_pos: usize) -> CoreResult<BlockId> {
        let block_size = self.block_size;
        if token_pos >= self.sequence(seq_id)?.page_table.num_tokens {
            return Err(CoreError::OutOfCapacity);
        }
        let idx = self
            .sequence(seq_id)?
            .page_table
            .block_index_for_token(token_pos)
            .ok_or(CoreError::KvMiss { seq_id, token_pos })?;
        let current = match self.sequence(seq_id)?.page_table.slots[idx] {
            PageSlot::Present(id) => id,
            PageSlot::Evicted => return Err(CoreError::KvMiss { seq_id, token_pos }),
        };
        if self.arena.ref_count(current)? <= 1 {
            return Ok(current);
        }
        let new_id = self.arena.allocate()?;
        {
            let (k_src, v_src) = {
                let k = self.arena.k_view(current)?.clone();
                let v = self.arena.v_view(current)?.clone();
                (k, v)
            };
            let new_block = self.arena.get_mut(new_id)?;
            new_block.k.copy_from(&k_src);
            new_block.v.copy_from(&v_src);
        }
        self.arena.unref(current)?;
        self.sequence_mut(seq_id)?.page_table.slots[idx] = PageSlot::Present(new_id);
        debug!(seq_id, block_index = idx, old = current, new = new_id, "copy-on-write split");
        let _ = block_size;
        Ok(new_id)
    }

    /// All `(seq_id, block_index, block_id)` triples currently present,
    /// for the eviction manager to rank.
    pub fn present_blocks(&self) -> Vec<(u64, usize, BlockId)> {
        let mut out = Vec::new();
        for seq in self.sequences.values() {
            for (idx, slot) in seq.page_table.slots.iter().enumerate() {
                if let PageSlot::Present(block_id) = slot {
                    out.push((seq.id, idx, *block_id));
                }
            }
        }
        out
    }

    /// Number of live (non-evicted) blocks a sequence holds.
    pub fn present_block_count(&self, seq_id: u64) -> CoreResult<usize> {
        Ok(self
            .sequence(seq_id)?
            .page_table
            .slots
            .iter()
            .filter(|s| matches!(s, PageSlot::Present(_)))
            .count())
    }

    /// Mark a sequence's block as evicted and release the arena's
    /// reference to it. The caller (eviction manager) must have already
    /// persisted the block's data if persistence is enabled.
    pub fn evict_slot(&mut self, seq_id: u64, block_index: usize) -> CoreResult<BlockId> {
        let seq = self.sequence_mut(seq_id)?;
        let block_id = match seq.page_table.slots.get(block_index) {
            Some(PageSlot::Present(id)) => *id,
            _ => {
                return Err(CoreError::InvalidArgument(format!(
                    "sequence {seq_id} has no present block at index {block_index}"
                )))
            }
        };
        seq.page_table.slots[block_index] = PageSlot::Evicted;
        self.arena.unref(block_id)?;
        Ok(block_id)
    }

    pub fn total_sequences(&self) -> usize {
        self.sequences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pager() -> Pager {
        let model = ModelConfig {
            num_layers: 1,
            num_query_heads: 2,
            num_kv_heads: 2,
            head_dim: 4,
            block_size: 4,
            vocab_size: 10,
            eos_token_id: None,
        };
        let arena_cfg = ArenaConfig {
            gpu_capacity_blocks: 16,
            cpu_capacity_blocks: 16,
            enable_cpu_overflow: true,
        };
        Pager::new(&model, &arena_cfg)
    }

    #[test]
    fn test_create_and_ensure_capacity() {
        let mut pager = test_pager();
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 10).unwrap();
        assert_eq!(pager.sequence(1).unwrap().page_table.len(), 3);
    }

    #[test]
    fn test_block_for_token_miss_past_end() {
        let mut pager = test_pager();
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 4).unwrap();
        assert!(pager.block_for_token(1, 10).is_err());
        assert!(pager.block_for_token(1, 0).is_ok());
    }

    #[test]
    fn test_fork_shares_blocks_then_cow_splits() {
        let mut pager = test_pager();
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 4).unwrap();
        let parent_block = match pager.block_for_token(1, 0).unwrap() {
            PageSlot::Present(id) => id,
            _ => panic!(),
        };
        pager.fork(1, 2, 0).unwrap();
        let child_block = match pager.block_for_token(2, 0).unwrap() {
            PageSlot::Present(id) => id,
            _ => panic!(),
        };
        assert_eq!(parent_block, child_block);
        assert_eq!(pager.arena().ref_count(parent_block).unwrap(), 2);

        let written = pager.prepare_write(2, 0).unwrap();
        assert_ne!(written, parent_block, "COW must allocate a fresh block");
        assert_eq!(pager.arena().ref_count(parent_block).unwrap(), 1);
    }

    #[test]
    fn test_delete_releases_blocks() {
        let mut pager = test_pager();
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 4).unwrap();
        let block_id = match pager.block_for_token(1, 0).unwrap() {
            PageSlot::Present(id) => id,
            _ => panic!(),
        };
        pager.delete(1).unwrap();
        assert_eq!(pager.arena().ref_count(block_id).unwrap(), 0);
    }

    #[test]
    fn test_evict_slot_then_kv_miss() {
        let mut pager = test_pager();
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 4).unwrap();
        pager.evict_slot(1, 0).unwrap();
        assert!(matches!(
            pager.block_for_token(1, 0),
            Err(CoreError::KvMiss { .. })
        ));
    }
}
