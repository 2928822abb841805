//! Runtime configuration for the serving core.
//!
//! Loading configuration from a file or CLI is the surrounding daemon's
//! job (§1 Non-goals); this module only defines the knobs the scheduler,
//! arena, and eviction manager read, with `Default` impls a caller can
//! start from and override field-by-field.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Shape parameters of the model the engine is driving.
///
/// These size blocks (arena) and drive GQA head mapping and RoPE (engine).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Number of query attention heads.
    pub num_query_heads: usize,
    /// Number of KV heads (GQA; equals `num_query_heads` for plain MHA).
    pub num_kv_heads: usize,
    /// Dimension per attention head.
    pub head_dim: usize,
    /// Tokens covered per KV block.
    pub block_size: usize,
    /// Vocabulary size (logits width).
    pub vocab_size: usize,
    /// The model's own end-of-sequence token, if it has one. Distinct from
    /// a request's caller-supplied `stop_tokens`: hitting this one surfaces
    /// `FinishReason::Eos` rather than `FinishReason::Stop`.
    pub eos_token_id: Option<u32>,
}

impl Default for ModelConfig {
    /// TinyLlama-shaped, matching the §8 S1 scenario.
    fn default() -> Self {
        Self {
            num_layers: 22,
            num_query_heads: 32,
            num_kv_heads: 4,
            head_dim: 64,
            block_size: 32,
            vocab_size: 32000,
            eos_token_id: Some(2),
        }
    }
}

impl ModelConfig {
    /// Number of query heads sharing each KV head (GQA group size).
    pub fn gqa_group_size(&self) -> usize {
        self.num_query_heads / self.num_kv_heads
    }

    /// Hidden size implied by heads × head_dim.
    pub fn hidden_size(&self) -> usize {
        self.num_query_heads * self.head_dim
    }
}

/// Arena sizing and tier-overflow behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Maximum number of GPU-tier blocks the arena will lazily create.
    pub gpu_capacity_blocks: usize,
    /// Maximum number of CPU-tier blocks, used when `enable_cpu_overflow`.
    pub cpu_capacity_blocks: usize,
    /// Whether the arena may spill to the CPU tier once GPU capacity is
    /// exhausted, rather than failing allocation immediately.
    pub enable_cpu_overflow: bool,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            gpu_capacity_blocks: 512,
            cpu_capacity_blocks: 2048,
            enable_cpu_overflow: true,
        }
    }
}

/// Which eviction policy the `EvictionManager` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicyKind {
    /// Ascending `last_access`, skipping shared and floor-protected blocks.
    Lru,
    /// Inactive sequences drained first, then priority-weighted ties.
    WorkingSet,
}

impl Default for EvictionPolicyKind {
    fn default() -> Self {
        EvictionPolicyKind::Lru
    }
}

/// Eviction thresholds, floor, and optional disk persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Policy to select victims with.
    pub policy: EvictionPolicyKind,
    /// Trigger eviction once `used / total >= eviction_threshold`.
    pub eviction_threshold: f64,
    /// Target `used / total` after a round of eviction.
    pub target_usage: f64,
    /// Floor: no sequence may be evicted below this many live blocks.
    pub min_blocks_per_sequence: usize,
    /// Whether evicted blocks are serialized to `persistence_dir`.
    pub enable_persistence: bool,
    /// Directory evicted blocks are written under, when enabled.
    pub persistence_dir: PathBuf,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            policy: EvictionPolicyKind::Lru,
            eviction_threshold: 0.90,
            target_usage: 0.75,
            min_blocks_per_sequence: 1,
            enable_persistence: false,
            persistence_dir: PathBuf::from("/tmp/mlxr-kv"),
        }
    }
}

/// Scheduler knobs (§6's "configuration recognized by the scheduler").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub max_batch_tokens: usize,
    pub max_batch_size: usize,
    pub max_prefill_chunk_size: usize,
    pub enable_chunked_prefill: bool,
    pub enable_priority_scheduling: bool,
    /// Weight applied when the decode set competes with prefill for the
    /// per-step token budget; higher favors decode latency over prefill
    /// throughput.
    pub decode_preference: f64,
    pub enable_preemption: bool,
    pub min_decode_steps_before_preempt: u32,
    pub target_latency_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_batch_tokens: 2048,
            max_batch_size: 32,
            max_prefill_chunk_size: 512,
            enable_chunked_prefill: true,
            enable_priority_scheduling: true,
            decode_preference: 0.7,
            enable_preemption: true,
            min_decode_steps_before_preempt: 10,
            target_latency_ms: 200,
        }
    }
}

/// Top-level configuration passed to [`crate::scheduler::Scheduler::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub arena: ArenaConfig,
    pub eviction: EvictionConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            arena: ArenaConfig::default(),
            eviction: EvictionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.model.block_size, 32);
        assert_eq!(cfg.model.gqa_group_size(), 8);
    }

    #[test]
    fn test_hidden_size() {
        let model = ModelConfig::default();
        assert_eq!(model.hidden_size(), 32 * 64);
    }
}
