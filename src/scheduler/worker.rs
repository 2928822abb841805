//! Scheduler: request queues, continuous-batching step algorithm, worker
//! loop.
//!
//! Concurrency model (§5): `inner` (the queues and per-request state) sits
//! behind a coarse `tokio::sync::Mutex` so admission never blocks on engine
//! work; `pager` sits behind its own `parking_lot::Mutex` so a producer can
//! create a sequence while the worker is mid-step. The worker never holds
//! `inner`'s lock across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

use crate::cache::block::next_tick;
use crate::cache::eviction::EvictionManager;
use crate::cache::pager::Pager;
use crate::config::Config;
use crate::engine::model::ModelHandle;
use crate::engine::sampler::Sampler;
use crate::engine::{Engine, InferenceCache};
use crate::error::{CoreError, CoreResult, FinishReason};
use crate::kernels::Kernels;
use crate::scheduler::request::{
    ForkSpec, Request, RequestHandle, RequestSpec, RequestState, TokenEvent,
};

/// Point-in-time scheduler counters, returned by [`Scheduler::stats`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub num_waiting: usize,
    pub num_prefilling: usize,
    pub num_decoding: usize,
    pub num_paused: usize,
    pub num_completed: u64,
    pub num_cancelled: u64,
    pub num_failed: u64,
    pub total_submitted: u64,
    pub steps_run: u64,
}

struct Inner {
    requests: HashMap<u64, Request>,
    waiting: VecDeque<u64>,
    paused: VecDeque<u64>,
    pending_receivers: HashMap<u64, mpsc::Receiver<TokenEvent>>,
    stats: SchedulerStats,
}

impl Inner {
    fn ids_in_state(&self, state: RequestState) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .requests
            .values()
            .filter(|r| r.state == state)
            .map(|r| r.id)
            .collect();
        ids.sort_by_key(|id| {
            let r = &self.requests[id];
            (std::cmp::Reverse(r.priority), r.arrival_tick)
        });
        ids
    }
}

/// Multiplexes many requests onto one [`Engine`].
pub struct Scheduler<K: Kernels + 'static> {
    config: Config,
    pager: Arc<SyncMutex<Pager>>,
    eviction: EvictionManager,
    engine: Arc<Engine<K>>,
    inner: Arc<AsyncMutex<Inner>>,
    notify: Arc<Notify>,
    next_request_id: AtomicU64,
    next_seq_id: AtomicU64,
}

impl<K: Kernels + 'static> Scheduler<K> {
    pub fn new(config: Config, kernels: K, model: Arc<dyn ModelHandle>) -> Arc<Self> {
        let pager = Arc::new(SyncMutex::new(Pager::new(&config.model, &config.arena)));
        let eviction = EvictionManager::new(config.eviction.clone());
        let engine = Arc::new(Engine::new(kernels, model));
        let inner = Arc::new(AsyncMutex::new(Inner {
            requests: HashMap::new(),
            waiting: VecDeque::new(),
            paused: VecDeque::new(),
            pending_receivers: HashMap::new(),
            stats: SchedulerStats::default(),
        }));
        let scheduler = Arc::new(Self {
            config,
            pager,
            eviction,
            engine,
            inner,
            notify: Arc::new(Notify::new()),
            next_request_id: AtomicU64::new(0),
            next_seq_id: AtomicU64::new(0),
        });
        let worker = scheduler.clone();
        tokio::task::spawn(async move { worker.worker_loop().await });
        scheduler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Admit a new request. Returns immediately; the worker loop admits it
    /// from `Waiting` on its next step.
    pub async fn submit(&self, spec: RequestSpec) -> RequestHandle {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let seq_id = self.next_seq_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(32);

        let request = Request {
            id,
            seq_id,
            prompt_tokens: spec.prompt_tokens,
            generated_tokens: Vec::new(),
            sampling: spec.sampling,
            max_new_tokens: spec.max_new_tokens,
            stop_tokens: spec.stop_tokens,
            priority: spec.priority,
            state: RequestState::Waiting,
            cache: InferenceCache::new(seq_id),
            arrival_tick: next_tick(),
            first_token_tick: None,
            last_token_tick: None,
            finish_reason: None,
            prefill_cursor: 0,
            decode_steps_since_admit: 0,
            kv_miss_retried: false,
            terminal_event_sent: false,
            replay_tokens: None,
            sender: tx,
        };

        let mut inner = self.inner.lock().await;
        inner.waiting.push_back(id);
        inner.pending_receivers.insert(id, rx);
        inner.requests.insert(id, request);
        inner.stats.total_submitted += 1;
        drop(inner);
        self.notify.notify_one();
        RequestHandle(id)
    }

    /// Fork `parent`'s KV prefix (prompt plus whatever it has generated so
    /// far) into a new sibling request that decodes independently from the
    /// fork point, sharing blocks with the parent via copy-on-write until
    /// either side writes past the shared prefix (§8 S6).
    pub async fn fork(&self, parent: RequestHandle, spec: ForkSpec) -> CoreResult<RequestHandle> {
        let mut inner = self.inner.lock().await;
        let (parent_seq_id, parent_cached_tokens, mut prompt_tokens) = {
            let p = inner.requests.get(&parent.0).ok_or_else(|| {
                CoreError::InvalidArgument(format!("unknown request {}", parent.0))
            })?;
            (p.seq_id, p.cache.cached_tokens, p.prompt_tokens.clone())
        };
        prompt_tokens.extend(inner.requests[&parent.0].generated_tokens.iter().copied());

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let seq_id = self.next_seq_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut pager = self.pager.lock();
            pager.fork(parent_seq_id, seq_id, spec.priority)?;
        }

        let (tx, rx) = mpsc::channel(32);
        let prefill_cursor = prompt_tokens.len();
        let request = Request {
            id,
            seq_id,
            prompt_tokens,
            generated_tokens: Vec::new(),
            sampling: spec.sampling,
            max_new_tokens: spec.max_new_tokens,
            stop_tokens: spec.stop_tokens,
            priority: spec.priority,
            state: RequestState::Decoding,
            cache: InferenceCache {
                seq_id,
                cached_tokens: parent_cached_tokens,
            },
            arrival_tick: next_tick(),
            first_token_tick: None,
            last_token_tick: None,
            finish_reason: None,
            prefill_cursor,
            decode_steps_since_admit: 0,
            kv_miss_retried: false,
            terminal_event_sent: false,
            replay_tokens: None,
            sender: tx,
        };

        inner.pending_receivers.insert(id, rx);
        inner.requests.insert(id, request);
        inner.stats.total_submitted += 1;
        drop(inner);
        self.notify.notify_one();
        info!(parent = parent.0, child = id, "forked request (COW KV share)");
        Ok(RequestHandle(id))
    }

    /// Take the streaming receiver for a request. Returns `None` if it was
    /// already polled.
    pub async fn poll(&self, handle: RequestHandle) -> Option<mpsc::Receiver<TokenEvent>> {
        let mut inner = self.inner.lock().await;
        inner.pending_receivers.remove(&handle.0)
    }

    /// Mark a request cancelled. The worker observes this before its next
    /// engine call for that sequence and releases its blocks.
    pub async fn cancel(&self, handle: RequestHandle) -> CoreResult<()> {
        let mut inner = self.inner.lock().await;
        let req = inner
            .requests
            .get_mut(&handle.0)
            .ok_or_else(|| CoreError::InvalidArgument(format!("unknown request {}", handle.0)))?;
        if !req.state.is_terminal() {
            req.state = RequestState::Cancelled;
            req.finish_reason = Some(FinishReason::Cancelled);
        }
        // A cancelled request must never be silently resurrected by a later
        // `admit`/resume pass that still finds its id queued.
        inner.waiting.retain(|&id| id != handle.0);
        inner.paused.retain(|&id| id != handle.0);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.inner.lock().await.stats.clone()
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let has_work = {
                let inner = self.inner.lock().await;
                !inner.waiting.is_empty()
                    || !inner.paused.is_empty()
                    || inner
                        .requests
                        .values()
                        .any(|r| r.state.is_active())
            };
            if !has_work {
                self.notify.notified().await;
                continue;
            }
            self.step().await;
        }
    }

    async fn step(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.steps_run += 1;

        self.admit(&mut inner);
        self.resume_paused(&mut inner);

        let decode_ids = self.build_decode_set(&inner);
        let prefill_ids = self.build_prefill_set(&inner, &decode_ids);

        for &id in decode_ids.iter().chain(prefill_ids.iter()) {
            self.ensure_capacity_with_recovery(&mut inner, id, &decode_ids);
        }

        for &id in &prefill_ids {
            self.run_member(&mut inner, id, false);
        }
        for &id in &decode_ids {
            self.run_member(&mut inner, id, true);
        }

        self.emit_pending_terminal_events(&mut inner);
        self.release_terminal(&mut inner);
        self.refresh_state_counts(&mut inner);
    }

    /// Every request that went terminal this step without passing through
    /// `run_member`'s normal sample-and-send path (cancel, capacity
    /// failure, a second KV miss) still owes its caller exactly one final
    /// event carrying `finish_reason` — send it here before the request's
    /// blocks are released.
    fn emit_pending_terminal_events(&self, inner: &mut Inner) {
        let ids: Vec<u64> = inner
            .requests
            .values()
            .filter(|r| r.state.is_terminal() && !r.terminal_event_sent)
            .map(|r| r.id)
            .collect();
        for id in ids {
            let r = inner.requests.get_mut(&id).unwrap();
            let token_id = r
                .generated_tokens
                .last()
                .copied()
                .or_else(|| r.prompt_tokens.last().copied())
                .unwrap_or(0);
            let event = TokenEvent {
                token_id,
                finish_reason: r.finish_reason,
            };
            let _ = r.sender.try_send(event);
            r.terminal_event_sent = true;
        }
    }

    fn admit(&self, inner: &mut Inner) {
        let mut budget = self.config.scheduler.max_batch_tokens;
        let mut order: Vec<u64> = inner.waiting.iter().copied().collect();
        order.sort_by_key(|id| {
            let r = &inner.requests[id];
            (std::cmp::Reverse(r.priority), r.arrival_tick)
        });

        for id in order {
            if budget == 0 {
                break;
            }
            // A request can leave `Waiting` without being dequeued here
            // (cancel, or a stale entry left by an earlier partial step);
            // only ever admit it from that exact state.
            let still_waiting = inner
                .requests
                .get(&id)
                .map(|r| r.state == RequestState::Waiting)
                .unwrap_or(false);
            if !still_waiting {
                inner.waiting.retain(|&w| w != id);
                continue;
            }
            let chunk = {
                let r = &inner.requests[&id];
                r.prompt_tokens
                    .len()
                    .min(self.config.scheduler.max_prefill_chunk_size)
                    .min(budget)
            };
            if chunk == 0 {
                continue;
            }
            {
                let pager = self.pager.lock();
                if pager.arena().stats().gpu_usage_fraction() >= 1.0 {
                    continue;
                }
            }
            if let Some(r) = inner.requests.get_mut(&id) {
                r.state = RequestState::Prefilling;
            }
            inner.waiting.retain(|&w| w != id);
            budget = budget.saturating_sub(chunk);
        }
    }

    /// Bring one `Paused` sequence back once there is GPU headroom,
    /// rebuilding the KV a preemption evicted by re-prefilling the full
    /// prompt-plus-generated-so-far prefix from scratch — deterministic
    /// kernels mean this reproduces byte-identical KV (§8 S4).
    fn resume_paused(&self, inner: &mut Inner) {
        if inner.paused.is_empty() {
            return;
        }
        let has_headroom = {
            let pager = self.pager.lock();
            pager.arena().stats().gpu_usage_fraction() < 1.0
        };
        if !has_headroom {
            return;
        }
        let id = match inner.paused.pop_front() {
            Some(id) => id,
            None => return,
        };
        let still_paused = inner
            .requests
            .get(&id)
            .map(|r| r.state == RequestState::Paused)
            .unwrap_or(false);
        if !still_paused {
            return;
        }
        let (seq_id, priority) = {
            let r = &inner.requests[&id];
            (r.seq_id, r.priority)
        };
        {
            let mut pager = self.pager.lock();
            if pager.sequence(seq_id).is_ok() {
                let _ = pager.delete(seq_id);
            }
            let _ = pager.create(seq_id, None, priority);
        }
        let r = inner.requests.get_mut(&id).unwrap();
        let mut replay = r.prompt_tokens.clone();
        replay.extend(r.generated_tokens.iter().copied());
        r.replay_tokens = Some(replay);
        r.prefill_cursor = 0;
        r.cache = InferenceCache::new(seq_id);
        r.state = RequestState::Prefilling;
        info!(request_id = id, "resumed preempted sequence via re-prefill");
    }

    fn build_decode_set(&self, inner: &Inner) -> Vec<u64> {
        let mut ids = inner.ids_in_state(RequestState::Decoding);
        ids.truncate(self.config.scheduler.max_batch_size);
        ids
    }

    fn build_prefill_set(&self, inner: &Inner, decode_ids: &[u64]) -> Vec<u64> {
        let mut ids = inner.ids_in_state(RequestState::Prefilling);
        let cap = self
            .config
            .scheduler
            .max_batch_size
            .saturating_sub(decode_ids.len());
        ids.truncate(cap);
        ids
    }

    /// Ensure the pager has capacity for `id`'s next chunk, triggering
    /// eviction then preemption on repeated `OutOfCapacity`.
    fn ensure_capacity_with_recovery(&self, inner: &mut Inner, id: u64, batch: &[u64]) {
        let target_tokens = {
            let r = &inner.requests[&id];
            let next_chunk = if r.state == RequestState::Decoding {
                1
            } else {
                r.remaining_prefill_tokens()
                    .min(self.config.scheduler.max_prefill_chunk_size)
            };
            r.cache.cached_tokens + next_chunk
        };

        for attempt in 0..3 {
            let result = {
                let mut pager = self.pager.lock();
                pager.ensure_capacity(inner.requests[&id].seq_id, target_tokens)
            };
            match result {
                Ok(()) => return,
                Err(CoreError::OutOfCapacity) if attempt == 0 => {
                    let mut pager = self.pager.lock();
                    let _ = self.eviction.maybe_evict(&mut pager);
                }
                Err(CoreError::OutOfCapacity) if attempt == 1 && self.config.scheduler.enable_preemption => {
                    if !self.preempt_one(inner, id, batch) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        if let Some(r) = inner.requests.get_mut(&id) {
            if r.state != RequestState::Paused {
                warn!(request_id = id, "out of capacity after eviction and preemption");
                r.state = RequestState::Failed;
                r.finish_reason = Some(FinishReason::Error);
            }
        }
    }

    /// Pause the lowest-priority non-member decoding sequence that has run
    /// at least `min_decode_steps_before_preempt` steps, evicting its blocks
    /// so the requester's retried `ensure_capacity` actually has somewhere
    /// to allocate from. Returns whether a victim was found.
    fn preempt_one(&self, inner: &mut Inner, requester: u64, batch: &[u64]) -> bool {
        let mut victims: Vec<u64> = inner
            .requests
            .values()
            .filter(|r| {
                r.id != requester
                    && !batch.contains(&r.id)
                    && r.state == RequestState::Decoding
                    && r.decode_steps_since_admit >= self.config.scheduler.min_decode_steps_before_preempt
            })
            .map(|r| r.id)
            .collect();
        victims.sort_by_key(|id| inner.requests[id].priority);

        if let Some(&victim_id) = victims.first() {
            let seq_id = inner.requests[&victim_id].seq_id;
            {
                let mut pager = self.pager.lock();
                match self.eviction.evict_sequence(&mut pager, seq_id) {
                    Ok(n) => debug!(victim = victim_id, blocks_evicted = n, "preemption freed blocks"),
                    Err(e) => warn!(victim = victim_id, error = %e, "failed to evict preempted sequence"),
                }
            }
            if let Some(r) = inner.requests.get_mut(&victim_id) {
                r.state = RequestState::Paused;
                r.decode_steps_since_admit = 0;
            }
            inner.paused.push_back(victim_id);
            info!(victim = victim_id, requester, "preempted sequence to free capacity");
            true
        } else {
            false
        }
    }

    /// Run one engine step for `id` (prefill chunk or decode token),
    /// sample, stream, and evaluate stop conditions.
    fn run_member(&self, inner: &mut Inner, id: u64, is_decode: bool) {
        let already_terminal = inner
            .requests
            .get(&id)
            .map(|r| r.state.is_terminal())
            .unwrap_or(true);
        if already_terminal {
            return; // cancelled since admission; skip the engine call entirely
        }

        let seq_id = inner.requests[&id].seq_id;
        let forward_result = if is_decode {
            let next_token = *inner.requests[&id]
                .generated_tokens
                .last()
                .unwrap_or(&inner.requests[&id].prompt_tokens[inner.requests[&id].prompt_tokens.len() - 1]);
            let mut cache = inner.requests[&id].cache;
            let mut pager = self.pager.lock();
            let res = self.engine.forward_decode(&mut pager, &mut cache, next_token);
            drop(pager);
            inner.requests.get_mut(&id).unwrap().cache = cache;
            res
        } else {
            let chunk_end = {
                let r = &inner.requests[&id];
                (r.prefill_cursor + self.config.scheduler.max_prefill_chunk_size)
                    .min(r.prefill_source_len())
            };
            let chunk: Vec<u32> = {
                let r = &inner.requests[&id];
                r.replay_tokens
                    .as_deref()
                    .unwrap_or(r.prompt_tokens.as_slice())[r.prefill_cursor..chunk_end]
                    .to_vec()
            };
            let mut cache = inner.requests[&id].cache;
            let mut pager = self.pager.lock();
            let res = self.engine.forward_prefill(&mut pager, &mut cache, &chunk);
            drop(pager);
            let r = inner.requests.get_mut(&id).unwrap();
            r.cache = cache;
            r.prefill_cursor = chunk_end;
            res
        };

        let logits = match forward_result {
            Ok(l) => l,
            Err(CoreError::KvMiss { seq_id: sid, token_pos }) => {
                self.handle_kv_miss(inner, id, sid, token_pos);
                return;
            }
            Err(e) => {
                warn!(request_id = id, error = %e, "engine step failed");
                let r = inner.requests.get_mut(&id).unwrap();
                r.state = RequestState::Failed;
                r.finish_reason = Some(FinishReason::Error);
                return;
            }
        };

        let r = inner.requests.get_mut(&id).unwrap();
        if !is_decode && !r.is_prefill_complete() {
            // more prompt chunks remain; stay in Prefilling
            return;
        }
        // Once a resume replay reaches the end of its buffer, fall back to
        // the normal prompt-length accounting for the rest of the request's
        // life (a later KV miss replays from `prompt_tokens` again).
        r.replay_tokens = None;

        let was_prefilling = r.state == RequestState::Prefilling;
        let history = r.generated_tokens.clone();
        let mut sampler = Sampler::new(r.sampling.clone());
        let token = sampler.sample(&logits, &history);

        let tick = next_tick();
        if r.first_token_tick.is_none() {
            r.first_token_tick = Some(tick);
        }
        r.last_token_tick = Some(tick);
        r.generated_tokens.push(token);
        r.decode_steps_since_admit += 1;

        let hit_stop = r.stop_tokens.contains(&token);
        let hit_eos = self.config.model.eos_token_id == Some(token);
        let hit_length = r.generated_tokens.len() >= r.max_new_tokens;
        let finish_reason = if hit_stop {
            Some(FinishReason::Stop)
        } else if hit_eos {
            Some(FinishReason::Eos)
        } else if hit_length {
            Some(FinishReason::Length)
        } else {
            None
        };

        if was_prefilling {
            r.state = RequestState::Decoding;
        }
        if let Some(reason) = finish_reason {
            r.state = RequestState::Completed;
            r.finish_reason = Some(reason);
        }

        let event = TokenEvent {
            token_id: token,
            finish_reason: r.finish_reason,
        };
        match r.sender.try_send(event) {
            Ok(()) => {
                if r.state.is_terminal() {
                    r.terminal_event_sent = true;
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(request_id = id, "streaming channel full, pausing sequence");
                if !r.state.is_terminal() {
                    r.state = RequestState::Paused;
                    inner.paused.push_back(id);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                r.state = RequestState::Cancelled;
                r.finish_reason = Some(FinishReason::Cancelled);
            }
        }
        let _ = seq_id;
    }

    fn handle_kv_miss(&self, inner: &mut Inner, id: u64, seq_id: u64, token_pos: usize) {
        let r = inner.requests.get_mut(&id).unwrap();
        if r.kv_miss_retried {
            warn!(request_id = id, seq_id, token_pos, "second KVMiss, failing request");
            r.state = RequestState::Failed;
            r.finish_reason = Some(FinishReason::Error);
            return;
        }
        r.kv_miss_retried = true;
        // Recompute from the last known-good prefix: restart prefill at
        // the first evicted position. A resume replay in flight is no
        // longer meaningful once we're re-deriving the restart point from
        // the original prompt.
        r.replay_tokens = None;
        r.prefill_cursor = token_pos.min(r.prompt_tokens.len());
        r.cache = InferenceCache::new(seq_id);
        r.state = RequestState::Prefilling;
        warn!(request_id = id, seq_id, token_pos, "KVMiss, retrying via re-prefill");
    }

    /// Release a terminal request's KV blocks and drop its bookkeeping.
    /// Only requests whose terminal event has already been sent are
    /// dropped, so `inner.requests` never grows unbounded as requests
    /// complete over a long-running process.
    fn release_terminal(&self, inner: &mut Inner) {
        let terminal_ids: Vec<u64> = inner
            .requests
            .values()
            .filter(|r| r.state.is_terminal() && r.terminal_event_sent)
            .map(|r| r.id)
            .collect();
        for id in terminal_ids {
            let (seq_id, state) = {
                let r = &inner.requests[&id];
                (r.seq_id, r.state)
            };
            {
                let mut pager = self.pager.lock();
                if pager.sequence(seq_id).is_ok() {
                    let _ = pager.delete(seq_id);
                }
            }
            match state {
                RequestState::Completed => inner.stats.num_completed += 1,
                RequestState::Cancelled => inner.stats.num_cancelled += 1,
                RequestState::Failed => inner.stats.num_failed += 1,
                _ => {}
            }
            inner.requests.remove(&id);
        }
    }

    /// Recompute the live (non-terminal) state counts from `inner.requests`.
    /// Terminal counters are cumulative totals updated by
    /// [`Scheduler::release_terminal`] as requests are removed, since a
    /// completed request no longer has an entry to count here.
    fn refresh_state_counts(&self, inner: &mut Inner) {
        let mut waiting = 0usize;
        let mut prefilling = 0usize;
        let mut decoding = 0usize;
        let mut paused = 0usize;
        for r in inner.requests.values() {
            match r.state {
                RequestState::Waiting => waiting += 1,
                RequestState::Prefilling => prefilling += 1,
                RequestState::Decoding => decoding += 1,
                RequestState::Paused => paused += 1,
                RequestState::Completed | RequestState::Cancelled | RequestState::Failed => {}
            }
        }
        inner.stats.num_waiting = waiting;
        inner.stats.num_prefilling = prefilling;
        inner.stats.num_decoding = decoding;
        inner.stats.num_paused = paused;
    }
}
