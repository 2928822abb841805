//! End-to-end tests driving the scheduler against the reference engine: a
//! full generation, two concurrent sequences, and mid-decode cancellation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mlxr_core::config::{ArenaConfig, Config, EvictionConfig, ModelConfig, SchedulerConfig};
use mlxr_core::engine::{ModelHandle, SamplingParams, ToyModel};
use mlxr_core::kernels::ReferenceKernels;
use mlxr_core::scheduler::{ForkSpec, RequestSpec, Scheduler, TokenEvent};

fn small_config() -> Config {
    Config {
        model: ModelConfig {
            num_layers: 2,
            num_query_heads: 2,
            num_kv_heads: 1,
            head_dim: 4,
            block_size: 4,
            vocab_size: 50,
            eos_token_id: None,
        },
        arena: ArenaConfig {
            gpu_capacity_blocks: 64,
            cpu_capacity_blocks: 64,
            enable_cpu_overflow: true,
        },
        eviction: EvictionConfig::default(),
        scheduler: SchedulerConfig {
            max_batch_tokens: 4096,
            max_batch_size: 8,
            max_prefill_chunk_size: 64,
            enable_chunked_prefill: true,
            enable_priority_scheduling: true,
            decode_preference: 0.7,
            enable_preemption: true,
            min_decode_steps_before_preempt: 2,
            target_latency_ms: 200,
        },
    }
}

fn small_scheduler() -> Arc<Scheduler<ReferenceKernels>> {
    let config = small_config();
    let model: Arc<dyn ModelHandle> = Arc::new(ToyModel::new(
        config.model.num_layers,
        config.model.num_query_heads,
        config.model.num_kv_heads,
        config.model.head_dim,
        config.model.vocab_size,
    ));
    Scheduler::new(config, ReferenceKernels, model)
}

async fn drain_until_finished(mut rx: tokio::sync::mpsc::Receiver<TokenEvent>) -> Vec<TokenEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("generation stalled")
            .expect("stream closed before a terminal event");
        let finished = event.finish_reason.is_some();
        events.push(event);
        if finished {
            break;
        }
    }
    events
}

#[tokio::test]
async fn test_single_prompt_greedy_generation() {
    let scheduler = small_scheduler();
    let handle = scheduler
        .submit(RequestSpec {
            prompt_tokens: vec![1, 2, 3, 4, 5],
            max_new_tokens: 6,
            sampling: SamplingParams {
                temperature: 0.0,
                ..Default::default()
            },
            stop_tokens: HashSet::new(),
            priority: 0,
        })
        .await;
    let rx = scheduler.poll(handle).await.expect("receiver not yet taken");

    let events = drain_until_finished(rx).await;
    assert_eq!(events.len(), 6);
    assert_eq!(
        events.last().unwrap().finish_reason,
        Some(mlxr_core::error::FinishReason::Length)
    );
}

#[tokio::test]
async fn test_two_concurrent_prompts_both_complete() {
    let scheduler = small_scheduler();

    let h1 = scheduler
        .submit(RequestSpec {
            prompt_tokens: vec![1, 2],
            max_new_tokens: 3,
            sampling: SamplingParams::default(),
            stop_tokens: HashSet::new(),
            priority: 0,
        })
        .await;
    let h2 = scheduler
        .submit(RequestSpec {
            prompt_tokens: vec![10, 20, 30],
            max_new_tokens: 5,
            sampling: SamplingParams::default(),
            stop_tokens: HashSet::new(),
            priority: 0,
        })
        .await;

    let rx1 = scheduler.poll(h1).await.unwrap();
    let rx2 = scheduler.poll(h2).await.unwrap();

    let (events1, events2) = tokio::join!(drain_until_finished(rx1), drain_until_finished(rx2));
    assert_eq!(events1.len(), 3);
    assert_eq!(events2.len(), 5);
}

#[tokio::test]
async fn test_cancel_mid_decode_stops_generation() {
    let scheduler = small_scheduler();
    let handle = scheduler
        .submit(RequestSpec {
            prompt_tokens: vec![1, 2, 3],
            max_new_tokens: 1000,
            sampling: SamplingParams::default(),
            stop_tokens: HashSet::new(),
            priority: 0,
        })
        .await;
    let mut rx = scheduler.poll(handle).await.unwrap();

    // Wait for at least one token before cancelling.
    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("generation stalled")
        .expect("stream closed unexpectedly");
    assert!(first.finish_reason.is_none());

    scheduler.cancel(handle).await.unwrap();

    // The stream ends with exactly one terminal event carrying
    // finish_reason=cancelled, then nothing further.
    let terminal = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("cancellation did not surface a terminal event")
        .expect("stream closed before the terminal event");
    assert_eq!(
        terminal.finish_reason,
        Some(mlxr_core::error::FinishReason::Cancelled)
    );

    let after_terminal = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(
        after_terminal.is_err() || after_terminal.unwrap().is_none(),
        "no event should follow the terminal one"
    );
}

#[tokio::test]
async fn test_fork_shares_prefix_then_diverges() {
    let scheduler = small_scheduler();
    let handle = scheduler
        .submit(RequestSpec {
            prompt_tokens: vec![1, 2, 3],
            max_new_tokens: 2,
            sampling: SamplingParams {
                temperature: 0.0,
                ..Default::default()
            },
            stop_tokens: HashSet::new(),
            priority: 0,
        })
        .await;
    let mut rx = scheduler.poll(handle).await.unwrap();

    // Let the parent generate once before forking off its current prefix.
    let first = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("generation stalled")
        .expect("stream closed unexpectedly");
    assert!(first.finish_reason.is_none());

    let child = scheduler
        .fork(
            handle,
            ForkSpec {
                max_new_tokens: 2,
                sampling: SamplingParams {
                    temperature: 0.0,
                    ..Default::default()
                },
                stop_tokens: HashSet::new(),
                priority: 0,
            },
        )
        .await
        .expect("fork failed");
    let child_rx = scheduler.poll(child).await.unwrap();

    let (parent_rest, child_events) =
        tokio::join!(drain_until_finished(rx), drain_until_finished(child_rx));

    assert_eq!(parent_rest.len(), 1);
    assert_eq!(
        parent_rest.last().unwrap().finish_reason,
        Some(mlxr_core::error::FinishReason::Length)
    );
    assert_eq!(child_events.len(), 2);
    assert_eq!(
        child_events.last().unwrap().finish_reason,
        Some(mlxr_core::error::FinishReason::Length)
    );
}

#[tokio::test]
async fn test_scheduler_stats_track_completion() {
    let scheduler = small_scheduler();
    let handle = scheduler
        .submit(RequestSpec {
            prompt_tokens: vec![1, 2],
            max_new_tokens: 2,
            sampling: SamplingParams {
                temperature: 0.0,
                ..Default::default()
            },
            stop_tokens: HashSet::new(),
            priority: 0,
        })
        .await;
    let rx = scheduler.poll(handle).await.unwrap();
    drain_until_finished(rx).await;

    let stats = scheduler.stats().await;
    assert_eq!(stats.total_submitted, 1);
    assert_eq!(stats.num_completed, 1);
}
