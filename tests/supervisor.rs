mod common;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{harness, FakeSpawner, Harness};
use labour_queue::errors::QueueError;
use labour_queue::job_scheduling::{
    AddOptions, AdvisoryLock, JobQueueRunner, ProcessSpawner, EXIT_OUTCOME_NOT_RECORDED,
};
use labour_queue::models::{Labour, LabourStatus};
use labour_queue::repositories::LockRepository;

const CONFIG: &str = r#"
[server]
threads = 2

[workers.slow]
timeout = "30s"
reschedule = "1s"

[workers.doomed]
attempts = 0
timeout = "30s"

[workers.eager]
reschedule = "0s"
"#;

const CODES: &[&str] = &["slow", "doomed", "eager"];

fn runner(h: &Harness, spawner: &Arc<FakeSpawner>) -> JobQueueRunner {
    let lock = AdvisoryLock::new(
        LockRepository::new(h.database.pool()),
        &h.config.server.lock_name,
        h.config.server.lock_ttl,
    );
    JobQueueRunner::new(
        Arc::clone(&h.queue),
        Arc::clone(&h.executor),
        Arc::clone(&h.scheduler),
        Arc::clone(spawner) as Arc<dyn ProcessSpawner>,
        lock,
        &h.config.server,
    )
}

async fn enqueue(h: &Harness, worker: &str, count: usize, now: DateTime<Utc>) -> Vec<Labour> {
    let mut labours = Vec::new();
    for n in 0..count {
        let labour = h
            .queue
            .add_at(worker, json!({ "n": n }), AddOptions::new(), now)
            .await
            .unwrap()
            .unwrap();
        labours.push(labour);
    }
    labours
}

#[tokio::test]
async fn test_tick_dispatches_up_to_thread_ceiling() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    let mut runner = runner(&h, &spawner);
    let now = Utc::now();
    let labours = enqueue(&h, "slow", 3, now).await;

    runner.start(now).await.unwrap();
    let report = runner.tick(now).await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(runner.running_count(), 2);
    assert_eq!(spawner.spawned(), vec![labours[0].id, labours[1].id]);

    let dispatched = h.labours.get(labours[0].id).await.unwrap();
    assert_eq!(dispatched.status, LabourStatus::Deployed);
    assert!(dispatched.pid.is_some());

    // No capacity left
    let report = runner.tick(now).await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(
        h.labours.get(labours[2].id).await.unwrap().status,
        LabourStatus::Pending
    );
}

#[tokio::test]
async fn test_reaped_slot_is_reused() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    let mut runner = runner(&h, &spawner);
    let now = Utc::now();
    let labours = enqueue(&h, "slow", 3, now).await;

    runner.start(now).await.unwrap();
    runner.tick(now).await.unwrap();

    // The worker process records its own outcome before exiting cleanly
    h.executor.start(labours[0].id, None, now).await.unwrap();
    h.executor.finish(labours[0].id, now).await.unwrap();
    spawner.exit(labours[0].id, Some(0));

    let report = runner.tick(now).await.unwrap();
    assert_eq!(report.reaped, 1);
    assert_eq!(report.rescheduled, 0);
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        h.labours.get(labours[0].id).await.unwrap().status,
        LabourStatus::Finished
    );
    assert_eq!(
        h.labours.get(labours[2].id).await.unwrap().status,
        LabourStatus::Deployed
    );
}

#[tokio::test]
async fn test_unreported_exit_reschedules_from_supervisor() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    let mut runner = runner(&h, &spawner);
    let now = Utc::now();
    let labours = enqueue(&h, "slow", 1, now).await;

    runner.start(now).await.unwrap();
    runner.tick(now).await.unwrap();
    spawner.exit(labours[0].id, Some(EXIT_OUTCOME_NOT_RECORDED));

    let report = runner.tick(now).await.unwrap();
    assert_eq!(report.reaped, 1);
    assert_eq!(report.rescheduled, 1);

    let labour = h.labours.get(labours[0].id).await.unwrap();
    assert_eq!(labour.status, LabourStatus::Pending);
    assert_eq!(labour.attempts, 1);
    assert_eq!(labour.pid, None);
    assert!(labour.execute_at > now);
}

#[tokio::test]
async fn test_timeout_kills_and_reschedules() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    let mut runner = runner(&h, &spawner);
    let now = Utc::now();
    let labours = enqueue(&h, "slow", 1, now).await;

    runner.start(now).await.unwrap();
    runner.tick(now).await.unwrap();
    h.executor.start(labours[0].id, None, now).await.unwrap();

    let report = runner.tick(now + Duration::seconds(29)).await.unwrap();
    assert_eq!(report.timed_out, 0);
    assert_eq!(runner.running_count(), 1);

    let later = now + Duration::seconds(31);
    let report = runner.tick(later).await.unwrap();
    assert_eq!(report.timed_out, 1);
    assert_eq!(report.rescheduled, 1);
    assert_eq!(spawner.killed(), vec![labours[0].id]);

    let labour = h.labours.get(labours[0].id).await.unwrap();
    assert_eq!(labour.status, LabourStatus::Pending);
    assert_eq!(labour.attempts, 1);
    assert!(labour.last_error.unwrap().contains("timeout"));
}

#[tokio::test]
async fn test_timeout_past_ceiling_fails() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    let mut runner = runner(&h, &spawner);
    let now = Utc::now();
    let labours = enqueue(&h, "doomed", 1, now).await;

    runner.start(now).await.unwrap();
    runner.tick(now).await.unwrap();
    h.executor.start(labours[0].id, None, now).await.unwrap();

    let report = runner.tick(now + Duration::seconds(31)).await.unwrap();
    assert_eq!(report.timed_out, 1);

    let labour = h.labours.get(labours[0].id).await.unwrap();
    assert_eq!(labour.status, LabourStatus::Failed);
}

#[tokio::test]
async fn test_spawn_failure_reschedules() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    spawner.fail.store(true, Ordering::SeqCst);
    let mut runner = runner(&h, &spawner);
    let now = Utc::now();
    let labours = enqueue(&h, "slow", 1, now).await;

    runner.start(now).await.unwrap();
    let report = runner.tick(now).await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(runner.running_count(), 0);

    let labour = h.labours.get(labours[0].id).await.unwrap();
    assert_eq!(labour.status, LabourStatus::Pending);
    assert_eq!(labour.attempts, 1);
    assert!(labour.last_error.unwrap().contains("worker binary missing"));
}

#[tokio::test]
async fn test_second_supervisor_is_locked_out() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    let mut first = runner(&h, &spawner);
    let mut second = runner(&h, &spawner);
    let now = Utc::now();

    first.start(now).await.unwrap();
    assert!(matches!(
        second.start(now).await,
        Err(QueueError::LockContention { .. })
    ));

    // A supervisor that stopped heartbeating loses the lock
    let stale = now + Duration::seconds(h.config.server.lock_ttl.as_secs() as i64 + 1);
    second.start(stale).await.unwrap();
    assert!(matches!(
        first.tick(stale).await,
        Err(QueueError::LockContention { .. })
    ));
    second.tick(stale).await.unwrap();
}

#[tokio::test]
async fn test_start_marks_orphans_unknown() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    let now = Utc::now();
    let labours = enqueue(&h, "slow", 3, now).await;

    // Left behind by a previous supervisor
    let received = h.queue.receive_at(3, now).await.unwrap().unwrap();
    assert_eq!(received.len(), 3);
    h.executor.assign_pid(labours[0].id, 4242, now).await.unwrap();
    h.executor.start(labours[1].id, Some(4343), now).await.unwrap();
    spawner.alive.lock().unwrap().insert(4343);

    let mut runner = runner(&h, &spawner);
    runner.start(now).await.unwrap();

    assert_eq!(
        h.labours.get(labours[0].id).await.unwrap().status,
        LabourStatus::Unknown
    );
    assert_eq!(
        h.labours.get(labours[1].id).await.unwrap().status,
        LabourStatus::Running
    );
    assert_eq!(
        h.labours.get(labours[2].id).await.unwrap().status,
        LabourStatus::Unknown
    );
}

#[tokio::test]
async fn test_late_exit_of_previous_process_is_ignored() {
    let h = harness(CONFIG, CODES).await;
    let spawner = FakeSpawner::new();
    let mut runner = runner(&h, &spawner);
    let now = Utc::now();
    let labours = enqueue(&h, "eager", 1, now).await;
    let id = labours[0].id;

    runner.start(now).await.unwrap();
    runner.tick(now).await.unwrap();
    let first_pid = spawner.pids(id)[0];

    // The worker asks for an immediate retry but its process lingers
    h.executor.start(id, Some(first_pid), now).await.unwrap();
    h.executor.reschedule(id, Some("busy"), false, now).await.unwrap();
    let report = runner.tick(now).await.unwrap();
    assert_eq!(report.reaped, 0);
    assert_eq!(report.dispatched, 1);
    let pids = spawner.pids(id);
    assert_eq!(pids.len(), 2);

    spawner.exit_pid(first_pid, Some(0));
    let report = runner.tick(now).await.unwrap();
    assert_eq!(report.reaped, 1);
    assert_eq!(report.rescheduled, 0);
    assert_eq!(runner.running_count(), 1);

    let labour = h.labours.get(id).await.unwrap();
    assert_eq!(labour.status, LabourStatus::Deployed);
    assert_eq!(labour.pid, Some(pids[1]));
    assert_eq!(labour.attempts, 1);

    // The current process exiting unreported is still recovered
    spawner.exit(id, Some(EXIT_OUTCOME_NOT_RECORDED));
    let report = runner.tick(now).await.unwrap();
    assert_eq!(report.rescheduled, 1);
    assert_eq!(h.labours.get(id).await.unwrap().attempts, 2);
}
