//! Run Lifecycle scenarios: retry with backoff, log
//! round-trip), step density, and idempotent completion.

mod common;

use jobctl_core::model::{LogStream, QueueEntryState, RunState, RunStepStatus};

async fn queued_run(ctx: &common::TestContext, work_item_id: uuid::Uuid) -> uuid::Uuid {
    ctx.kernel
        .scheduler
        .enqueue(work_item_id, None, 0, 0, ctx.clock.as_ref())
        .await
        .unwrap();
    ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();
    ctx.kernel.run_lifecycle.list_runs(work_item_id).await.unwrap()[0].id
}

/// Retry with backoff: policy max_retries=2, B=1s, J=0. A failed run
/// reschedules at now+1s; it's not eligible at now+0.5s but is at now+1.1s.
/// A second failure reschedules at now+2s (B * 2^(attempt-1)).
#[tokio::test]
async fn retry_backoff_doubles_and_respects_delay() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-s4", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    ctx.set_work_item_policy(w, 2, 1.0, 0.0).await;

    let run_1 = queued_run(&ctx, w).await;
    ctx.kernel
        .lease_manager
        .claim(run_1, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
        .await
        .unwrap();
    ctx.kernel
        .run_lifecycle
        .complete(run_1, "agent-1", false, ctx.clock.as_ref())
        .await
        .unwrap();

    // Not yet eligible half a second in.
    ctx.clock.advance(chrono::Duration::milliseconds(500));
    let summary = ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();
    assert!(summary.promoted.is_empty());

    // Eligible once the 1s delay has passed.
    ctx.clock.advance(chrono::Duration::milliseconds(600));
    let summary = ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();
    assert_eq!(summary.promoted.len(), 1);

    let run_2 = ctx
        .kernel
        .run_lifecycle
        .list_runs(w)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.id != run_1)
        .unwrap();
    assert_eq!(run_2.attempt, 2); // retry requeue: second Run this work item has ever had

    ctx.kernel
        .lease_manager
        .claim(run_2.id, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
        .await
        .unwrap();

    let before_second_failure = ctx.clock.now();
    ctx.kernel
        .run_lifecycle
        .complete(run_2.id, "agent-1", false, ctx.clock.as_ref())
        .await
        .unwrap();

    let queue = ctx.kernel.scheduler.list_queue().await.unwrap();
    let new_entry = queue
        .iter()
        .filter(|e| e.work_item_id == w && e.state == QueueEntryState::Queued)
        .max_by_key(|e| e.enqueued_at)
        .unwrap();
    let delay = (new_entry.scheduled_for - before_second_failure).num_milliseconds() as f64 / 1000.0;
    assert!((1.9..2.2).contains(&delay), "expected ~2s delay, got {delay}");
}

/// Retry budget: with max_retries=1, after two failures
/// the work item's lifetime failed-run count (2) equals max_retries+1 and a
/// third Run is never created.
#[tokio::test]
async fn retry_budget_exhaustion_stops_requeue() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-budget", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    ctx.set_work_item_policy(w, 1, 0.01, 0.0).await;

    let run_1 = queued_run(&ctx, w).await;
    ctx.kernel
        .lease_manager
        .claim(run_1, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
        .await
        .unwrap();
    ctx.kernel
        .run_lifecycle
        .complete(run_1, "agent-1", false, ctx.clock.as_ref())
        .await
        .unwrap();

    ctx.clock.advance(chrono::Duration::milliseconds(50));
    ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();
    let run_2 = ctx
        .kernel
        .run_lifecycle
        .list_runs(w)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.id != run_1)
        .unwrap();

    ctx.kernel
        .lease_manager
        .claim(run_2.id, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
        .await
        .unwrap();
    ctx.kernel
        .run_lifecycle
        .complete(run_2.id, "agent-1", false, ctx.clock.as_ref())
        .await
        .unwrap();

    ctx.clock.advance(chrono::Duration::seconds(10));
    ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();

    let runs = ctx.kernel.run_lifecycle.list_runs(w).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.state == RunState::Failed));
}

/// Log round-trip: 1000 entries with alternating streams come back in
/// strict seq order with no gaps.
#[tokio::test]
async fn log_round_trip_preserves_order_and_has_no_gaps() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-s6", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    for i in 0..1000 {
        let stream = if i % 2 == 0 { LogStream::Stdout } else { LogStream::Stderr };
        ctx.kernel
            .run_lifecycle
            .append_log(run_id, stream, format!("line {i}"), ctx.clock.as_ref())
            .await
            .unwrap();
    }

    let logs = ctx.kernel.run_lifecycle.list_logs(run_id, 10_000, 0).await.unwrap();
    assert_eq!(logs.len(), 1000);
    for (i, entry) in logs.iter().enumerate() {
        assert_eq!(entry.seq, (i + 1) as i64);
    }
}

/// A subscriber attached mid-stream only sees events published after it
/// subscribed (Log Bus has no replay).
#[tokio::test]
async fn late_subscriber_receives_only_subsequent_events() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-s6-ws", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    for i in 0..500 {
        ctx.kernel
            .run_lifecycle
            .append_log(run_id, LogStream::Stdout, format!("line {i}"), ctx.clock.as_ref())
            .await
            .unwrap();
    }

    let mut rx = ctx.kernel.bus.subscribe(run_id);

    for i in 500..600 {
        ctx.kernel
            .run_lifecycle
            .append_log(run_id, LogStream::Stdout, format!("line {i}"), ctx.clock.as_ref())
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let jobctl_core::log_bus::LogBusEvent::Log(entry) = event {
            received.push(entry.seq);
        }
    }
    assert_eq!(received.len(), 100);
    assert_eq!(received[0], 501);
    assert_eq!(*received.last().unwrap(), 600);
}

/// Step density: idx must be a dense 0..n prefix; a gap is
/// rejected.
#[tokio::test]
async fn step_idx_must_be_dense() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-steps", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    ctx.kernel
        .run_lifecycle
        .create_step(run_id, 0, "plan".to_string())
        .await
        .unwrap();
    ctx.kernel
        .run_lifecycle
        .create_step(run_id, 1, "execute".to_string())
        .await
        .unwrap();

    let err = ctx
        .kernel
        .run_lifecycle
        .create_step(run_id, 3, "skip-ahead".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, jobctl_core::error::AppError::Conflict(_)));

    let steps = ctx.kernel.run_lifecycle.list_steps(run_id).await.unwrap();
    assert_eq!(steps.len(), 2);
    let idxs: Vec<i32> = steps.iter().map(|s| s.idx).collect();
    assert_eq!(idxs, vec![0, 1]);
}

#[tokio::test]
async fn update_step_sets_status_and_duration() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-step-update", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    let step = ctx
        .kernel
        .run_lifecycle
        .create_step(run_id, 0, "plan".to_string())
        .await
        .unwrap();

    let start = ctx.clock.now();
    let finish = start + chrono::Duration::seconds(5);
    let updated = ctx
        .kernel
        .run_lifecycle
        .update_step(step.id, RunStepStatus::Succeeded, Some(start), Some(finish), None)
        .await
        .unwrap();

    assert_eq!(updated.status, RunStepStatus::Succeeded);
    assert_eq!(updated.duration_seconds, Some(5.0));
}

/// Idempotent completion: a second `complete` on a
/// terminal run fails with conflict and does not mutate state.
#[tokio::test]
async fn second_complete_on_terminal_run_is_conflict() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-idempotent", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    ctx.kernel
        .lease_manager
        .claim(run_id, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
        .await
        .unwrap();
    ctx.kernel
        .run_lifecycle
        .complete(run_id, "agent-1", true, ctx.clock.as_ref())
        .await
        .unwrap();

    let run_before = ctx.kernel.run_lifecycle.get_run(run_id).await.unwrap();

    let err = ctx
        .kernel
        .run_lifecycle
        .complete(run_id, "agent-1", true, ctx.clock.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, jobctl_core::error::AppError::Conflict(_)));

    let run_after = ctx.kernel.run_lifecycle.get_run(run_id).await.unwrap();
    assert_eq!(run_before.finished_at, run_after.finished_at);
    assert_eq!(run_after.state, RunState::Succeeded);
}

/// Cancel forces a terminal state regardless of current state and never
/// schedules a retry.
#[tokio::test]
async fn cancel_is_terminal_and_does_not_retry() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-cancel", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    ctx.set_work_item_policy(w, 5, 1.0, 0.0).await;
    let run_id = queued_run(&ctx, w).await;

    ctx.kernel
        .lease_manager
        .claim(run_id, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
        .await
        .unwrap();

    let cancelled = ctx.kernel.run_lifecycle.cancel(run_id, ctx.clock.as_ref()).await.unwrap();
    assert_eq!(cancelled.state, RunState::Cancelled);

    ctx.clock.advance(chrono::Duration::seconds(10));
    ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();

    let runs = ctx.kernel.run_lifecycle.list_runs(w).await.unwrap();
    assert_eq!(runs.len(), 1, "cancellation must not trigger a retry requeue");
}

/// Cancelling an already-terminal run is a conflict.
#[tokio::test]
async fn cancel_twice_is_conflict() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-cancel-twice", 3600, 100).await;
    let w = ctx.create_work_item(project, "W").await;
    let run_id = queued_run(&ctx, w).await;

    ctx.kernel.run_lifecycle.cancel(run_id, ctx.clock.as_ref()).await.unwrap();
    let err = ctx
        .kernel
        .run_lifecycle
        .cancel(run_id, ctx.clock.as_ref())
        .await
        .unwrap_err();
    assert!(matches!(err, jobctl_core::error::AppError::Conflict(_)));
}
