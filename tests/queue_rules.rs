mod common;

use chrono::{Duration, Utc};
use serde_json::json;

use common::harness;
use labour_queue::job_scheduling::AddOptions;
use labour_queue::models::{LabourStatus, Rule};

const WORKERS: &str = r#"
[workers.ignorer]
rule = "ignore"

[workers.replacer]
rule = "replace"

[workers.batcher]
rule = "batch"

[workers.waiter]
rule = "wait"
limit = 1

[workers.plain]
attempts = 2
reschedule = "1s"
"#;

const CODES: &[&str] = &["ignorer", "replacer", "batcher", "waiter", "plain"];

#[tokio::test]
async fn test_ignore_suppresses_duplicate_pending() {
    let h = harness(WORKERS, CODES).await;
    let options = || AddOptions::new().identity("report-7");

    let first = h.queue.add("ignorer", json!({ "n": 1 }), options()).await.unwrap();
    assert!(first.is_some());
    let second = h.queue.add("ignorer", json!({ "n": 2 }), options()).await.unwrap();
    assert!(second.is_none());

    let other = h
        .queue
        .add("ignorer", json!({}), AddOptions::new().identity("report-8"))
        .await
        .unwrap();
    assert!(other.is_some());

    let rows = h.labours.find_by_identity("ignorer", "report-7").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload, json!({ "n": 1 }));
}

#[tokio::test]
async fn test_ignore_allows_new_labour_once_first_is_in_flight() {
    let h = harness(WORKERS, CODES).await;
    let options = || AddOptions::new().identity("x");

    h.queue.add("ignorer", json!({}), options()).await.unwrap();
    h.queue.receive(1).await.unwrap().unwrap();

    assert!(h.queue.add("ignorer", json!({}), options()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_replace_marks_prior_pending() {
    let h = harness(WORKERS, CODES).await;
    let options = || AddOptions::new().identity("sync");

    let first = h
        .queue
        .add("replacer", json!({ "v": 1 }), options())
        .await
        .unwrap()
        .unwrap();
    let second = h
        .queue
        .add("replacer", json!({ "v": 2 }), options())
        .await
        .unwrap()
        .unwrap();

    let first = h.labours.get(first.id).await.unwrap();
    assert_eq!(first.status, LabourStatus::Replaced);

    let pending: Vec<_> = h
        .labours
        .find_by_identity("replacer", "sync")
        .await
        .unwrap()
        .into_iter()
        .filter(|l| l.status == LabourStatus::Pending)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, second.id);
    assert_eq!(pending[0].payload, json!({ "v": 2 }));
}

#[tokio::test]
async fn test_rule_override_per_add() {
    let h = harness(WORKERS, CODES).await;
    let options = || AddOptions::new().identity("x").rule(Rule::Ignore);

    assert!(h.queue.add("plain", json!({}), options()).await.unwrap().is_some());
    assert!(h.queue.add("plain", json!({}), options()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_receive_order_size_and_eligibility() {
    let h = harness(WORKERS, CODES).await;
    let now = Utc::now();

    let mut ids = Vec::new();
    for priority in [5, 1, 3] {
        let labour = h
            .queue
            .add_at("plain", json!({}), AddOptions::new().priority(priority), now)
            .await
            .unwrap()
            .unwrap();
        ids.push(labour.id);
    }
    let future = h
        .queue
        .add_at(
            "plain",
            json!({}),
            AddOptions::new().priority(0).delay(3600),
            now,
        )
        .await
        .unwrap()
        .unwrap();

    let received = h.queue.receive_at(2, now).await.unwrap().unwrap();
    assert_eq!(
        received.iter().map(|l| l.id).collect::<Vec<_>>(),
        vec![ids[1], ids[2]]
    );
    assert!(received.iter().all(|l| l.execute_at <= now));
    assert!(received.iter().all(|l| l.status == LabourStatus::Deployed));

    let received = h.queue.receive_at(5, now).await.unwrap().unwrap();
    assert_eq!(received.iter().map(|l| l.id).collect::<Vec<_>>(), vec![ids[0]]);

    assert!(h.queue.receive_at(5, now).await.unwrap().is_none());
    let later = h
        .queue
        .receive_at(5, now + Duration::seconds(3600))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(later[0].id, future.id);
}

#[tokio::test]
async fn test_receive_never_returns_same_labour_twice() {
    let h = harness(WORKERS, CODES).await;
    let now = Utc::now();
    for n in 0..3 {
        h.queue
            .add_at("plain", json!({ "n": n }), AddOptions::new(), now)
            .await
            .unwrap();
    }

    let first = h.queue.receive_at(2, now).await.unwrap().unwrap();
    let second = h.queue.receive_at(2, now).await.unwrap().unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 1);
    assert!(second.iter().all(|l| first.iter().all(|f| f.id != l.id)));
}

#[tokio::test]
async fn test_batch_bundles_pending_siblings() {
    let h = harness(WORKERS, CODES).await;
    let now = Utc::now();

    let mut x_ids = Vec::new();
    for n in 0..3 {
        let labour = h
            .queue
            .add_at("batcher", json!({ "n": n }), AddOptions::new().identity("x"), now)
            .await
            .unwrap()
            .unwrap();
        x_ids.push(labour.id);
    }
    let y = h
        .queue
        .add_at("batcher", json!({}), AddOptions::new().identity("y"), now)
        .await
        .unwrap()
        .unwrap();

    let received = h.queue.receive_at(10, now).await.unwrap().unwrap();
    assert_eq!(
        received.iter().map(|l| l.id).collect::<Vec<_>>(),
        vec![x_ids[0], y.id]
    );

    for id in &x_ids[1..] {
        let member = h.labours.get(*id).await.unwrap();
        assert_eq!(member.status, LabourStatus::Deployed);
        assert_eq!(member.parent_id, Some(x_ids[0]));
    }

    let bundle = h.labours.find_bundle(x_ids[0]).await.unwrap().unwrap();
    assert_eq!(bundle.member_ids(), x_ids[1..].to_vec());
    assert_eq!(bundle.payloads().len(), 3);

    // A new sibling arriving while the bundle is in flight waits its turn
    h.queue
        .add_at("batcher", json!({ "n": 3 }), AddOptions::new().identity("x"), now)
        .await
        .unwrap();
    assert!(h.queue.receive_at(10, now).await.unwrap().is_none());

    h.executor.start(x_ids[0], None, now).await.unwrap();
    let finished = h.executor.finish(x_ids[0], now).await.unwrap();
    assert_eq!(finished.members.len(), 2);
    for id in &x_ids {
        assert_eq!(
            h.labours.get(*id).await.unwrap().status,
            LabourStatus::Finished
        );
    }

    let next = h.queue.receive_at(10, now).await.unwrap().unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].identity, "x");
}

#[tokio::test]
async fn test_wait_with_limit_one() {
    let h = harness(WORKERS, CODES).await;
    let now = Utc::now();
    for n in 0..2 {
        h.queue
            .add_at("waiter", json!({ "n": n }), AddOptions::new().identity("x"), now)
            .await
            .unwrap();
    }

    let first = h.queue.receive_at(2, now).await.unwrap().unwrap();
    assert_eq!(first.len(), 1);
    assert!(h.queue.receive_at(2, now).await.unwrap().is_none());

    h.executor.start(first[0].id, None, now).await.unwrap();
    h.executor.finish(first[0].id, now).await.unwrap();

    let second = h.queue.receive_at(2, now).await.unwrap().unwrap();
    assert_eq!(second.len(), 1);
    assert_ne!(second[0].id, first[0].id);
}

#[tokio::test]
async fn test_limit_applies_across_identities() {
    let h = harness(WORKERS, CODES).await;
    let now = Utc::now();
    for identity in ["a", "b"] {
        h.queue
            .add_at("waiter", json!({}), AddOptions::new().identity(identity), now)
            .await
            .unwrap();
    }

    let received = h.queue.receive_at(2, now).await.unwrap().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].identity, "a");
}

#[tokio::test]
async fn test_retry_ceiling_fails_after_last_attempt() {
    let h = harness(WORKERS, CODES).await;
    let mut now = Utc::now();
    let labour = h
        .queue
        .add_at("plain", json!({}), AddOptions::new(), now)
        .await
        .unwrap()
        .unwrap();

    // Ceiling is 2: two reschedules go back to pending, the third fails
    for attempt in 1..=3u32 {
        let received = h.queue.receive_at(1, now).await.unwrap().unwrap();
        assert_eq!(received[0].id, labour.id);
        h.executor.start(labour.id, None, now).await.unwrap();

        let after = h
            .executor
            .reschedule(labour.id, Some("flaky"), false, now)
            .await
            .unwrap();
        assert_eq!(after.attempts, attempt);
        if attempt <= 2 {
            assert_eq!(after.status, LabourStatus::Pending);
        } else {
            assert_eq!(after.status, LabourStatus::Failed);
            assert!(after.last_error.unwrap().contains("flaky"));
        }
        now += Duration::seconds(10);
    }

    assert!(h.queue.receive_at(1, now).await.unwrap().is_none());
}

async fn deploy_batch(h: &common::Harness, identity: &str, count: usize) -> Vec<i64> {
    let now = Utc::now();
    let mut ids = Vec::new();
    for n in 0..count {
        let labour = h
            .queue
            .add_at(
                "batcher",
                json!({ "n": n }),
                AddOptions::new().identity(identity),
                now,
            )
            .await
            .unwrap()
            .unwrap();
        ids.push(labour.id);
    }
    let received = h.queue.receive_at(10, now).await.unwrap().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, ids[0]);
    ids
}

#[tokio::test]
async fn test_fail_propagates_to_bundle_members() {
    let h = harness(WORKERS, CODES).await;
    let ids = deploy_batch(&h, "x", 3).await;
    let now = Utc::now();

    h.executor.start(ids[0], None, now).await.unwrap();
    let failed = h.executor.fail(ids[0], "smtp down", now).await.unwrap();
    assert_eq!(failed.member_ids(), ids[1..].to_vec());

    for id in &ids {
        let labour = h.labours.get(*id).await.unwrap();
        assert_eq!(labour.status, LabourStatus::Failed);
        assert_eq!(labour.last_error.as_deref(), Some("smtp down"));
        assert!(labour.finished_at.is_some());
    }
    for id in &ids[1..] {
        assert_eq!(h.labours.get(*id).await.unwrap().parent_id, Some(ids[0]));
    }
    assert_eq!(h.labours.get(ids[0]).await.unwrap().parent_id, None);
}

#[tokio::test]
async fn test_reschedule_dissolves_bundle() {
    let h = harness(WORKERS, CODES).await;
    let ids = deploy_batch(&h, "x", 3).await;
    let now = Utc::now();

    h.executor.start(ids[0], None, now).await.unwrap();
    h.executor
        .reschedule(ids[0], Some("throttled"), false, now)
        .await
        .unwrap();

    for id in &ids {
        let labour = h.labours.get(*id).await.unwrap();
        assert_eq!(labour.status, LabourStatus::Pending);
        assert_eq!(labour.parent_id, Some(*id));
        assert_eq!(labour.pid, None);
        assert_eq!(labour.attempts, 1);
        assert_eq!(labour.finished_at, None);
        assert!(labour.execute_at > now);
    }

    // A row pointing at itself is never its own bundle member
    for id in &ids {
        let bundle = h.labours.find_bundle(*id).await.unwrap().unwrap();
        assert!(bundle.members.is_empty());
    }

    // Once due again the representative gathers a fresh bundle
    let later = now + Duration::hours(1);
    let received = h.queue.receive_at(10, later).await.unwrap().unwrap();
    assert_eq!(received.len(), 1);
    let bundle = h.labours.find_bundle(received[0].id).await.unwrap().unwrap();
    assert_eq!(bundle.members.len(), 2);
}

#[tokio::test]
async fn test_abandon_counts_attempt_for_whole_bundle() {
    let h = harness(WORKERS, CODES).await;
    let ids = deploy_batch(&h, "x", 2).await;

    let retried = h
        .executor
        .abandon(ids[0], None, "spawn failed", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.attempts, 1);

    for id in &ids {
        let labour = h.labours.get(*id).await.unwrap();
        assert_eq!(labour.status, LabourStatus::Pending);
        assert_eq!(labour.attempts, 1);
        assert_eq!(labour.parent_id, Some(*id));
    }
}
