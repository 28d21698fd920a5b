//! Quota Meter scenarios: at most `max_runs` Run
//! starts per rolling window, with capacity restored once the window slides
//! past the earliest recorded start.

mod common;

use jobctl_core::lease::RunOutcome;

async fn queued_run(ctx: &common::TestContext, work_item_id: uuid::Uuid) -> uuid::Uuid {
    ctx.kernel
        .scheduler
        .enqueue(work_item_id, None, 0, 0, ctx.clock.as_ref())
        .await
        .unwrap();
    ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();
    ctx.kernel.run_lifecycle.list_runs(work_item_id).await.unwrap()[0].id
}

#[tokio::test]
async fn admits_under_max_runs_and_blocks_at_cap() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-quota", 60, 2).await;
    let w = ctx.create_work_item(project, "W").await;
    let quota = jobctl_core::model::Quota {
        window_seconds: 60,
        max_runs: 2,
    };

    assert!(ctx
        .kernel
        .quota_meter
        .admits(project, &quota, ctx.clock.as_ref(), ctx.kernel.store.pool())
        .await
        .unwrap());

    // Claiming (starting) two runs uses up the window's capacity.
    for _ in 0..2 {
        let run_id = queued_run(&ctx, w).await;
        ctx.kernel
            .lease_manager
            .claim(run_id, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
            .await
            .unwrap();
        ctx.kernel
            .lease_manager
            .release(run_id, "agent-1", RunOutcome::Succeeded, ctx.clock.as_ref())
            .await
            .unwrap();
    }

    assert!(!ctx
        .kernel
        .quota_meter
        .admits(project, &quota, ctx.clock.as_ref(), ctx.kernel.store.pool())
        .await
        .unwrap());
}

#[tokio::test]
async fn capacity_restores_once_window_slides_past_earliest_start() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-quota-slide", 10, 1).await;
    let w = ctx.create_work_item(project, "W").await;
    let quota = jobctl_core::model::Quota {
        window_seconds: 10,
        max_runs: 1,
    };

    let run_id = queued_run(&ctx, w).await;
    ctx.kernel
        .lease_manager
        .claim(run_id, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
        .await
        .unwrap();

    assert!(!ctx
        .kernel
        .quota_meter
        .admits(project, &quota, ctx.clock.as_ref(), ctx.kernel.store.pool())
        .await
        .unwrap());

    ctx.clock.advance(chrono::Duration::seconds(11));

    assert!(ctx
        .kernel
        .quota_meter
        .admits(project, &quota, ctx.clock.as_ref(), ctx.kernel.store.pool())
        .await
        .unwrap());
}

/// The Scheduler consults the Quota Meter at promotion time: an over-quota
/// work item's entry stays queued with no penalty re-enqueue.
#[tokio::test]
async fn over_quota_entry_stays_queued_without_penalty() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-quota-sched", 3600, 1).await;
    let a = ctx.create_work_item(project, "A").await;
    let b = ctx.create_work_item(project, "B").await;

    let run_a = queued_run(&ctx, a).await;
    ctx.kernel
        .lease_manager
        .claim(run_a, "agent-1", chrono::Duration::seconds(300), ctx.clock.as_ref())
        .await
        .unwrap();

    ctx.kernel
        .scheduler
        .enqueue(b, None, 0, 0, ctx.clock.as_ref())
        .await
        .unwrap();
    let summary = ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();
    assert!(summary.promoted.is_empty());

    let queue = ctx.kernel.scheduler.list_queue().await.unwrap();
    let b_entry = queue.iter().find(|e| e.work_item_id == b).unwrap();
    assert_eq!(b_entry.state, jobctl_core::model::QueueEntryState::Queued);
}

/// Two entries for a max_runs=1 project enqueued together, with neither run
/// claimed before the tick: the fixpoint pass must not promote both just
/// because the first one's run hasn't set `started_at` yet.
#[tokio::test]
async fn burst_enqueue_promotes_at_most_max_runs_in_one_tick() {
    let ctx = common::context().await;
    let project = ctx.create_project("p-quota-burst", 3600, 1).await;
    let a = ctx.create_work_item(project, "A").await;
    let b = ctx.create_work_item(project, "B").await;

    ctx.kernel
        .scheduler
        .enqueue(a, None, 0, 0, ctx.clock.as_ref())
        .await
        .unwrap();
    ctx.kernel
        .scheduler
        .enqueue(b, None, 0, 0, ctx.clock.as_ref())
        .await
        .unwrap();

    let summary = ctx.kernel.scheduler.tick(ctx.clock.as_ref()).await.unwrap();
    assert_eq!(summary.promoted.len(), 1);

    let queue = ctx.kernel.scheduler.list_queue().await.unwrap();
    let still_queued = queue
        .iter()
        .filter(|e| e.state == jobctl_core::model::QueueEntryState::Queued)
        .count();
    assert_eq!(still_queued, 1);
}
