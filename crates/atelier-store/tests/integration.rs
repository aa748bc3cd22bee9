//! Integration tests for the atelier-store crate.
//!
//! These exercise the scheduling contracts against a real SQLite
//! database on disk (via tempfile): atomic claim disjointness under
//! concurrency, priority ordering, conditional completion, orphan
//! recovery, and worker counter consistency.

use std::collections::HashSet;
use std::time::Duration;

use atelier_store::{
    Database, NotificationKind, NotificationStore, TaskContent, TaskOutcome, TaskStatus,
    TaskStore, WorkerProfile, WorkerStore, WorkerStatus,
};

async fn open_stores(dir: &tempfile::TempDir) -> (Database, TaskStore, WorkerStore) {
    let db = Database::open_and_migrate(dir.path().join("test.db"))
        .await
        .unwrap();
    (db.clone(), TaskStore::new(db.clone()), WorkerStore::new(db))
}

fn content(prompt: &str) -> TaskContent {
    TaskContent {
        task_type: "general".into(),
        prompt: prompt.into(),
        files: vec![],
        output_file: None,
        options: Default::default(),
        preferred_worker: None,
    }
}

/// Age a worker's heartbeat by `secs` without sleeping.
async fn age_heartbeat(db: &Database, worker_id: &str, secs: i64) {
    let worker_id = worker_id.to_string();
    db.execute(move |conn| {
        conn.execute(
            "UPDATE workers SET last_heartbeat = last_heartbeat - ?1 WHERE worker_id = ?2",
            rusqlite::params![secs, worker_id],
        )?;
        Ok(())
    })
    .await
    .unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Unique assignment under concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_acquire_returns_disjoint_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, tasks, workers) = open_stores(&dir).await;

    const TASK_COUNT: usize = 6;
    const WORKER_COUNT: usize = 10;

    for i in 0..TASK_COUNT {
        tasks
            .create(&format!("t{i}"), &content("x"), 5, "tests")
            .await
            .unwrap();
    }
    for i in 0..WORKER_COUNT {
        workers
            .register(&format!("w{i}"), &WorkerProfile::default())
            .await
            .unwrap();
    }

    // Fire all claims at once; more claimers than tasks.
    let handles: Vec<_> = (0..WORKER_COUNT)
        .map(|i| {
            let tasks = tasks.clone();
            tokio::spawn(async move { tasks.acquire_next(&format!("w{i}")).await.unwrap() })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        if let Some(task) = handle.await.unwrap() {
            claimed.push(task);
        }
    }

    // Exactly min(N, K) claims, all distinct.
    assert_eq!(claimed.len(), TASK_COUNT.min(WORKER_COUNT));
    let ids: HashSet<_> = claimed.iter().map(|t| t.task_id.clone()).collect();
    assert_eq!(ids.len(), claimed.len());

    // Every claimed task is recorded as assigned to exactly its claimer.
    let owners: HashSet<_> = claimed
        .iter()
        .map(|t| t.assigned_to.clone().unwrap())
        .collect();
    assert_eq!(owners.len(), claimed.len());
    for task in &claimed {
        let stored = tasks.get(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::InProgress);
        assert_eq!(stored.assigned_to, task.assigned_to);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Priority ordering
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn pending_tasks_sorted_by_priority_then_insertion() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, tasks, _workers) = open_stores(&dir).await;

    // Deliberately shuffled insertion order; equal timestamps are likely
    // because everything is inserted inside the same second.
    let inserts = [
        ("a", 3),
        ("b", 7),
        ("c", 7),
        ("d", 1),
        ("e", 10),
        ("f", 7),
    ];
    for (id, priority) in inserts {
        tasks.create(id, &content(id), priority, "tests").await.unwrap();
    }

    let pending = tasks.get_pending(10).await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|t| t.task_id.as_str()).collect();
    // Highest priority first, insertion order inside each priority band.
    assert_eq!(ids, vec!["e", "b", "c", "f", "a", "d"]);
}

// ═══════════════════════════════════════════════════════════════════════
//  Conditional completion and counters
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn completion_requires_matching_assignment() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, tasks, workers) = open_stores(&dir).await;

    workers.register("w1", &WorkerProfile::default()).await.unwrap();
    workers.register("w2", &WorkerProfile::default()).await.unwrap();
    tasks.create("t1", &content("x"), 5, "tests").await.unwrap();
    tasks.assign_to_worker("t1", "w1").await.unwrap();

    // Wrong worker: rejected, no counter movement anywhere.
    assert!(!tasks
        .complete_with_stats("t1", "w2", &TaskOutcome::ok("nope"))
        .await
        .unwrap());
    let w2 = workers.get("w2").await.unwrap().unwrap();
    assert_eq!(w2.tasks_completed + w2.tasks_failed, 0);

    // Right worker: accepted once.
    assert!(tasks
        .complete_with_stats("t1", "w1", &TaskOutcome::ok("done"))
        .await
        .unwrap());
    assert!(!tasks
        .complete_with_stats("t1", "w1", &TaskOutcome::ok("again"))
        .await
        .unwrap());

    let w1 = workers.get("w1").await.unwrap().unwrap();
    assert_eq!(w1.tasks_completed, 1);
    assert_eq!(w1.tasks_failed, 0);
    assert_eq!(w1.status, WorkerStatus::Idle);
    assert_eq!(w1.current_task, None);
}

#[tokio::test]
async fn worker_counters_match_terminal_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, tasks, workers) = open_stores(&dir).await;

    workers.register("w1", &WorkerProfile::default()).await.unwrap();

    let outcomes = [true, false, true, true, false];
    for (i, success) in outcomes.iter().enumerate() {
        let id = format!("t{i}");
        tasks.create(&id, &content("x"), 5, "tests").await.unwrap();
        let claimed = tasks.acquire_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.task_id, id);

        let outcome = if *success {
            TaskOutcome::ok("fine")
        } else {
            TaskOutcome::err("broke")
        };
        assert!(tasks.complete_with_stats(&id, "w1", &outcome).await.unwrap());
    }

    let worker = workers.get("w1").await.unwrap().unwrap();
    assert_eq!(worker.tasks_completed, 3);
    assert_eq!(worker.tasks_failed, 2);
    assert_eq!(
        worker.tasks_completed + worker.tasks_failed,
        outcomes.len() as i64
    );
}

/// Scenario: one worker drains T1(prio 9), T2(prio 5), T3(prio 9) in
/// claim order T1, T3, T2 and finishes with three completions.
#[tokio::test]
async fn single_worker_drains_queue_in_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, tasks, workers) = open_stores(&dir).await;

    workers.register("w", &WorkerProfile::default()).await.unwrap();
    tasks.create("t1", &content("a"), 9, "tests").await.unwrap();
    tasks.create("t2", &content("b"), 5, "tests").await.unwrap();
    tasks.create("t3", &content("c"), 9, "tests").await.unwrap();

    let mut order = Vec::new();
    while let Some(task) = tasks.acquire_next("w").await.unwrap() {
        order.push(task.task_id.clone());
        tasks
            .complete_with_stats(&task.task_id, "w", &TaskOutcome::ok("ok"))
            .await
            .unwrap();
    }

    assert_eq!(order, vec!["t1", "t3", "t2"]);
    let worker = workers.get("w").await.unwrap().unwrap();
    assert_eq!(worker.tasks_completed, 3);
}

// ═══════════════════════════════════════════════════════════════════════
//  Orphan recovery
// ═══════════════════════════════════════════════════════════════════════

/// Scenario: a worker dies holding a task; cleanup releases the task and
/// removes the row, and doing it again changes nothing.
#[tokio::test]
async fn cleanup_dead_workers_releases_orphans_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let (db, tasks, workers) = open_stores(&dir).await;

    workers.register("w", &WorkerProfile::default()).await.unwrap();
    tasks.create("t1", &content("x"), 5, "tests").await.unwrap();
    let claimed = tasks.acquire_next("w").await.unwrap().unwrap();
    assert_eq!(claimed.task_id, "t1");

    // Simulate the worker going silent past the liveness deadline.
    age_heartbeat(&db, "w", 120).await;

    let reaped = workers.cleanup_dead(Duration::from_secs(60)).await.unwrap();
    assert_eq!(reaped, 1);

    let task = tasks.get("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assigned_to, None);
    assert!(workers.get("w").await.unwrap().is_none());

    // Idempotence: a second pass finds nothing to do.
    let reaped_again = workers.cleanup_dead(Duration::from_secs(60)).await.unwrap();
    assert_eq!(reaped_again, 0);
    let task = tasks.get("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}

/// The scheduling tick's health pass: workers are marked offline and
/// reaped with the same deadline, so a task held by an offline worker is
/// released in that very pass — never a pass later.
#[tokio::test]
async fn offline_worker_task_is_released_in_the_same_pass() {
    let dir = tempfile::tempdir().unwrap();
    let (db, tasks, workers) = open_stores(&dir).await;

    workers.register("w", &WorkerProfile::default()).await.unwrap();
    tasks.create("t1", &content("x"), 5, "tests").await.unwrap();
    tasks.acquire_next("w").await.unwrap().unwrap();

    age_heartbeat(&db, "w", 120).await;

    let dead_after = Duration::from_secs(60);
    assert_eq!(workers.mark_stale_offline(dead_after).await.unwrap(), 1);
    assert_eq!(workers.cleanup_dead(dead_after).await.unwrap(), 1);

    // No window where an offline worker still holds the assignment.
    let task = tasks.get("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.assigned_to, None);
    assert!(workers.get("w").await.unwrap().is_none());
}

#[tokio::test]
async fn cleanup_spares_live_workers_and_their_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let (db, tasks, workers) = open_stores(&dir).await;

    workers.register("dead", &WorkerProfile::default()).await.unwrap();
    workers.register("alive", &WorkerProfile::default()).await.unwrap();
    tasks.create("t_dead", &content("x"), 9, "tests").await.unwrap();
    tasks.create("t_alive", &content("y"), 5, "tests").await.unwrap();
    assert_eq!(
        tasks.acquire_next("dead").await.unwrap().unwrap().task_id,
        "t_dead"
    );
    assert_eq!(
        tasks.acquire_next("alive").await.unwrap().unwrap().task_id,
        "t_alive"
    );

    age_heartbeat(&db, "dead", 120).await;

    assert_eq!(workers.cleanup_dead(Duration::from_secs(60)).await.unwrap(), 1);

    // The live worker's claim is untouched.
    let alive_task = tasks.get("t_alive").await.unwrap().unwrap();
    assert_eq!(alive_task.status, TaskStatus::InProgress);
    assert_eq!(alive_task.assigned_to.as_deref(), Some("alive"));

    let released = tasks.get("t_dead").await.unwrap().unwrap();
    assert_eq!(released.status, TaskStatus::Pending);
    assert_eq!(released.assigned_to, None);
}

// ═══════════════════════════════════════════════════════════════════════
//  Claim + notification flow
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn assignment_notification_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (db, tasks, workers) = open_stores(&dir).await;
    let notifications = NotificationStore::new(db);

    workers.register("w", &WorkerProfile::default()).await.unwrap();
    tasks.create("t1", &content("x"), 5, "tests").await.unwrap();

    // Pool-manager side: conditional assignment plus durable notification.
    assert!(tasks.assign_to_worker("t1", "w").await.unwrap());
    workers
        .update_status("w", WorkerStatus::Busy, Some("t1"))
        .await
        .unwrap();
    notifications
        .enqueue("w", NotificationKind::TaskAssigned, Some("t1"), None)
        .await
        .unwrap();

    // Worker side: claim the notification, then fetch the named task.
    let claimed = notifications.claim("w").await.unwrap();
    assert_eq!(claimed.len(), 1);
    let task_id = claimed[0].task_id.clone().unwrap();
    let task = tasks.get_assigned(&task_id, "w").await.unwrap().unwrap();
    assert_eq!(task.task_id, "t1");

    // A task assigned to someone else is not retrievable this way.
    assert!(tasks.get_assigned(&task_id, "other").await.unwrap().is_none());
}

#[tokio::test]
async fn worker_current_task_tracks_single_claim() {
    let dir = tempfile::tempdir().unwrap();
    let (_db, tasks, workers) = open_stores(&dir).await;

    workers.register("w", &WorkerProfile::default()).await.unwrap();
    tasks.create("t1", &content("a"), 5, "tests").await.unwrap();
    tasks.create("t2", &content("b"), 5, "tests").await.unwrap();

    let first = tasks.acquire_next("w").await.unwrap().unwrap();
    let worker = workers.get("w").await.unwrap().unwrap();
    assert_eq!(worker.current_task.as_deref(), Some(first.task_id.as_str()));
    assert_eq!(worker.status, WorkerStatus::Busy);

    // Completing releases the binding before any further claim.
    tasks
        .complete_with_stats(&first.task_id, "w", &TaskOutcome::ok("ok"))
        .await
        .unwrap();
    let worker = workers.get("w").await.unwrap().unwrap();
    assert_eq!(worker.current_task, None);

    let second = tasks.acquire_next("w").await.unwrap().unwrap();
    let worker = workers.get("w").await.unwrap().unwrap();
    assert_eq!(worker.current_task.as_deref(), Some(second.task_id.as_str()));
}
