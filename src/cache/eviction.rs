//! Eviction policies and the manager that enforces capacity.
//!
//! A policy only ranks candidates; the manager owns the floor (never evict
//! a sequence below `min_blocks_per_sequence`) and the shared-block
//! exclusion (never evict a block with `ref_count > 1`), so every policy
//! gets those guarantees for free.

use tracing::{info, warn};

use crate::cache::arena::Arena;
use crate::cache::block::BlockId;
use crate::cache::pager::Pager;
use crate::cache::persistence;
use crate::config::{EvictionConfig, EvictionPolicyKind};
use crate::error::CoreResult;

/// A block eligible for eviction, with enough context for a policy to rank
/// it and for the manager to act on the ranking afterward.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub seq_id: u64,
    pub block_index: usize,
    pub block_id: BlockId,
    pub last_access: u64,
    pub sequence_active: bool,
    pub sequence_priority: u8,
}

/// Ranks eviction candidates worst-first (index 0 evicted first).
pub trait EvictionPolicy: Send + Sync {
    fn rank(&self, candidates: &mut Vec<Candidate>);
}

/// Evict the least-recently-accessed block first.
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn rank(&self, candidates: &mut Vec<Candidate>) {
        candidates.sort_by_key(|c| c.last_access);
    }
}

/// Prefer draining inactive sequences entirely before touching active ones;
/// within the same activity class, fall back to LRU, then lower priority
/// first.
pub struct WorkingSetPolicy;

impl EvictionPolicy for WorkingSetPolicy {
    fn rank(&self, candidates: &mut Vec<Candidate>) {
        candidates.sort_by(|a, b| {
            a.sequence_active
                .cmp(&b.sequence_active)
                .then(a.sequence_priority.cmp(&b.sequence_priority))
                .then(a.last_access.cmp(&b.last_access))
        });
    }
}

fn policy_for(kind: EvictionPolicyKind) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionPolicyKind::Lru => Box::new(LruPolicy),
        EvictionPolicyKind::WorkingSet => Box::new(WorkingSetPolicy),
    }
}

/// Drives eviction rounds against a [`Pager`] according to configured
/// thresholds and policy.
pub struct EvictionManager {
    config: EvictionConfig,
    policy: Box<dyn EvictionPolicy>,
}

impl EvictionManager {
    pub fn new(config: EvictionConfig) -> Self {
        let policy = policy_for(config.policy);
        Self { config, policy }
    }

    fn gpu_usage(arena: &Arena) -> f64 {
        arena.stats().gpu_usage_fraction()
    }

    /// If GPU usage is at or above `eviction_threshold`, evict blocks
    /// (respecting the floor and shared-block exclusion) until usage falls
    /// to `target_usage` or no eligible candidate remains. Returns the
    /// number of blocks evicted.
    pub fn maybe_evict(&self, pager: &mut Pager) -> CoreResult<usize> {
        if Self::gpu_usage(pager.arena()) < self.config.eviction_threshold {
            return Ok(0);
        }

        let mut evicted = 0usize;
        loop {
            if Self::gpu_usage(pager.arena()) <= self.config.target_usage {
                break;
            }
            let mut candidates = self.collect_candidates(pager)?;
            if candidates.is_empty() {
                warn!("eviction requested but no eligible candidates remain");
                break;
            }
            self.policy.rank(&mut candidates);
            let victim = candidates[0];

            if self.config.enable_persistence {
                let k = pager.arena().k_view(victim.block_id)?.clone();
                let v = pager.arena().v_view(victim.block_id)?.clone();
                persistence::write_block_atomic(
                    &self.config.persistence_dir,
                    victim.seq_id,
                    victim.block_index,
                    victim.block_id,
                    &k,
                    &v,
                )?;
            }
            pager.evict_slot(victim.seq_id, victim.block_index)?;
            evicted += 1;
        }

        if evicted > 0 {
            info!(evicted, "eviction round complete");
        }
        Ok(evicted)
    }

    /// Evict every block one sequence still holds on the GPU tier,
    /// ignoring the floor (unlike [`EvictionManager::maybe_evict`]) since
    /// this drives preemption: the sequence is being paused entirely, not
    /// opportunistically trimmed. Blocks still shared with another sequence
    /// (ref_count > 1, e.g. a forked child) are left alone. Returns the
    /// number of blocks evicted.
    pub fn evict_sequence(&self, pager: &mut Pager, seq_id: u64) -> CoreResult<usize> {
        let victims: Vec<(usize, BlockId)> = pager
            .present_blocks()
            .into_iter()
            .filter(|(sid, _, _)| *sid == seq_id)
            .map(|(_, idx, block_id)| (idx, block_id))
            .collect();

        let mut evicted = 0usize;
        for (block_index, block_id) in victims {
            if pager.arena().ref_count(block_id)? > 1 {
                continue;
            }
            if self.config.enable_persistence {
                let k = pager.arena().k_view(block_id)?.clone();
                let v = pager.arena().v_view(block_id)?.clone();
                persistence::write_block_atomic(
                    &self.config.persistence_dir,
                    seq_id,
                    block_index,
                    block_id,
                    &k,
                    &v,
                )?;
            }
            pager.evict_slot(seq_id, block_index)?;
            evicted += 1;
        }
        if evicted > 0 {
            info!(seq_id, evicted, "preempted sequence's blocks evicted");
        }
        Ok(evicted)
    }

    fn collect_candidates(&self, pager: &Pager) -> CoreResult<Vec<Candidate>> {
        let mut out = Vec::new();
        for (seq_id, block_index, block_id) in pager.present_blocks() {
            if pager.arena().tier_of(block_id)? != crate::cache::block::Tier::Gpu {
                continue;
            }
            if pager.arena().ref_count(block_id)? > 1 {
                continue; // shared blocks are never evicted
            }
            if pager.present_block_count(seq_id)? <= self.config.min_blocks_per_sequence {
                continue; // floor protection
            }
            let seq = pager.sequence(seq_id)?;
            out.push(Candidate {
                seq_id,
                block_index,
                block_id,
                last_access: pager.arena().last_access(block_id)?,
                sequence_active: seq.active,
                sequence_priority: seq.priority,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArenaConfig, ModelConfig};

    fn test_pager(gpu_capacity: usize) -> Pager {
        let model = ModelConfig {
            num_layers: 1,
            num_query_heads: 2,
            num_kv_heads: 2,
            head_dim: 4,
            block_size: 1,
            vocab_size: 10,
            eos_token_id: None,
        };
        let arena_cfg = ArenaConfig {
            gpu_capacity_blocks: gpu_capacity,
            cpu_capacity_blocks: 16,
            enable_cpu_overflow: true,
        };
        Pager::new(&model, &arena_cfg)
    }

    fn test_config() -> EvictionConfig {
        EvictionConfig {
            policy: EvictionPolicyKind::Lru,
            eviction_threshold: 0.75,
            target_usage: 0.5,
            min_blocks_per_sequence: 0,
            enable_persistence: false,
            persistence_dir: std::path::PathBuf::from("/tmp/mlxr-eviction-test"),
        }
    }

    #[test]
    fn test_no_eviction_below_threshold() {
        let mut pager = test_pager(10);
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 2).unwrap();
        let mgr = EvictionManager::new(test_config());
        assert_eq!(mgr.maybe_evict(&mut pager).unwrap(), 0);
    }

    #[test]
    fn test_evicts_lru_first() {
        let mut pager = test_pager(4);
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 4).unwrap(); // fills to 100% usage
        let first_block = match pager.block_for_token(1, 0).unwrap() {
            crate::cache::pager::PageSlot::Present(id) => id,
            _ => panic!(),
        };
        let mgr = EvictionManager::new(test_config());
        let n = mgr.maybe_evict(&mut pager).unwrap();
        assert!(n >= 1);
        assert!(matches!(
            pager.block_for_token(1, 0),
            Err(crate::error::CoreError::KvMiss { .. })
        ));
        let _ = first_block;
    }

    #[test]
    fn test_floor_protects_single_block_sequence() {
        let mut pager = test_pager(4);
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 4).unwrap();
        let mut config = test_config();
        config.min_blocks_per_sequence = 4; // protect every block
        let mgr = EvictionManager::new(config);
        assert_eq!(mgr.maybe_evict(&mut pager).unwrap(), 0);
    }

    #[test]
    fn test_shared_blocks_excluded() {
        let mut pager = test_pager(4);
        pager.create(1, None, 0).unwrap();
        pager.ensure_capacity(1, 4).unwrap();
        pager.fork(1, 2, 0).unwrap(); // every block now ref_count 2
        let mgr = EvictionManager::new(test_config());
        assert_eq!(mgr.maybe_evict(&mut pager).unwrap(), 0);
    }
}
