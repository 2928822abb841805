//! Request and sequence state tracked by the scheduler.

use std::collections::HashSet;

use tokio::sync::mpsc;

use crate::engine::sampler::SamplingParams;
use crate::engine::InferenceCache;
use crate::error::FinishReason;

/// One token emitted to a request's streaming sink.
#[derive(Debug, Clone)]
pub struct TokenEvent {
    pub token_id: u32,
    pub finish_reason: Option<FinishReason>,
}

/// Which of the seven §4.5 states a request currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Waiting,
    Prefilling,
    Decoding,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Cancelled | RequestState::Failed
        )
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            RequestState::Prefilling | RequestState::Decoding
        )
    }
}

/// Caller-facing parameters for a new request, passed to
/// [`crate::scheduler::Scheduler::submit`].
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub prompt_tokens: Vec<u32>,
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
    pub stop_tokens: HashSet<u32>,
    pub priority: u8,
}

/// Caller-facing parameters for forking an in-flight request's KV prefix
/// into a new sibling that continues decoding independently from the fork
/// point, sharing blocks with the parent until either writes past it
/// (COW split).
#[derive(Debug, Clone)]
pub struct ForkSpec {
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
    pub stop_tokens: HashSet<u32>,
    pub priority: u8,
}

/// Opaque handle returned by `submit`, used by `cancel` and `poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Full scheduler-side bookkeeping for one request.
pub struct Request {
    pub id: u64,
    pub seq_id: u64,
    pub prompt_tokens: Vec<u32>,
    pub generated_tokens: Vec<u32>,
    pub sampling: SamplingParams,
    pub max_new_tokens: usize,
    pub stop_tokens: HashSet<u32>,
    pub priority: u8,
    pub state: RequestState,
    pub cache: InferenceCache,
    pub arrival_tick: u64,
    pub first_token_tick: Option<u64>,
    pub last_token_tick: Option<u64>,
    pub finish_reason: Option<FinishReason>,
    /// How many prompt tokens have been fed through `forward_prefill` so
    /// far; drives chunked prefill.
    pub prefill_cursor: usize,
    /// Consecutive steps this sequence has been in `Decoding` since it was
    /// last admitted, gating `min_decode_steps_before_preempt`.
    pub decode_steps_since_admit: u32,
    /// Set once a `KVMiss` has already triggered a re-prefill retry for
    /// this request; a second miss fails it.
    pub kv_miss_retried: bool,
    /// Set once the request's terminal `TokenEvent` (the one carrying
    /// `finish_reason`) has been sent, so a request that goes terminal
    /// without passing through the normal sample-and-send path (cancel,
    /// capacity failure, KV-miss failure) still gets exactly one final
    /// event instead of none.
    pub terminal_event_sent: bool,
    /// Set while resuming from `Paused`: the full prefix (prompt plus
    /// whatever had already been generated before preemption) that must be
    /// re-fed through prefill to rebuild the KV the preemption evicted.
    /// `None` outside of a resume.
    pub replay_tokens: Option<Vec<u32>>,
    pub sender: mpsc::Sender<TokenEvent>,
}

impl Request {
    pub fn total_target_tokens(&self) -> usize {
        self.prompt_tokens.len() + self.generated_tokens.len()
    }

    /// Length of whatever prefill is currently replaying: the resume replay
    /// buffer if one is in flight, otherwise the original prompt.
    pub fn prefill_source_len(&self) -> usize {
        self.replay_tokens
            .as_ref()
            .map(|t| t.len())
            .unwrap_or(self.prompt_tokens.len())
    }

    pub fn remaining_prefill_tokens(&self) -> usize {
        self.prefill_source_len() - self.prefill_cursor
    }

    pub fn is_prefill_complete(&self) -> bool {
        self.prefill_cursor >= self.prefill_source_len()
    }
}
