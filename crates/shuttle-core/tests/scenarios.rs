//! End-to-end scenarios through the public `Coordinator` facade.

use std::sync::{Arc, Mutex};

use shuttle_core::dispatch::{EventHandler, HandlerError, handler_fn};
use shuttle_core::domain::{
    BoardName, Event, EventType, FailureReason, Message, MessageType, NewTask, Outcome, TaskId,
    TaskStatus, WorkerId,
};
use shuttle_core::impls::MemoryBoardStore;
use shuttle_core::store::RepairOutcome;
use shuttle_core::{BoardRef, ClaimFilter, CoordError, Coordinator, CoordinatorBuilder, EngineConfig};

fn worker(s: &str) -> WorkerId {
    WorkerId::parse(s).unwrap()
}

fn task_id(s: &str) -> TaskId {
    TaskId::parse(s).unwrap()
}

async fn memory_coordinator(store: Arc<MemoryBoardStore>, config: EngineConfig) -> Coordinator {
    CoordinatorBuilder::new()
        .config(config)
        .in_memory(store)
        .build()
        .await
        .unwrap()
}

async fn file_coordinator(dir: &std::path::Path, checkpoint_interval: usize) -> Coordinator {
    let mut config = EngineConfig::default();
    config.data_dir = dir.to_path_buf();
    config.checkpoint_interval = checkpoint_interval;
    CoordinatorBuilder::new().config(config).build().await.unwrap()
}

fn recorder(seen: Arc<Mutex<Vec<Event>>>) -> Arc<dyn EventHandler> {
    handler_fn(move |event: Event| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().unwrap().push(event);
            Ok::<(), HandlerError>(())
        }
    })
}

async fn submit_ready(coord: &Coordinator, id: &str, priority: i32) -> TaskId {
    let task = coord
        .submit_task(NewTask::new(format!("task {id}")).with_id(id).with_priority(priority))
        .await
        .unwrap();
    coord.promote(&task.id).await.unwrap();
    task.id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claim_next_has_exactly_one_winner() {
    let coord = Arc::new(memory_coordinator(Arc::new(MemoryBoardStore::new()), EngineConfig::default()).await);
    submit_ready(&coord, "T1", 1).await;

    let handles: Vec<_> = ["w1", "w2"]
        .into_iter()
        .map(|name| {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.claim_next(&worker(name), &ClaimFilter::any()).await })
        })
        .collect();

    let mut winners = Vec::new();
    let mut losers = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(task) => winners.push(task),
            Err(CoordError::NoClaimableTask { .. }) => losers += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(losers, 1);
    assert_eq!(winners[0].id, task_id("T1"));
    assert_eq!(winners[0].status, TaskStatus::Claimed);
    assert_eq!(coord.list(BoardName::Working).await.unwrap().len(), 1);
    assert!(coord.list(BoardName::Ready).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn claims_from_two_processes_sharing_a_directory_are_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let first = Arc::new(file_coordinator(dir.path(), 8).await);
    let second = Arc::new(file_coordinator(dir.path(), 8).await);
    submit_ready(&first, "T1", 1).await;

    let a = {
        let coord = Arc::clone(&first);
        tokio::spawn(async move { coord.claim_next(&worker("w1"), &ClaimFilter::any()).await })
    };
    let b = {
        let coord = Arc::clone(&second);
        tokio::spawn(async move { coord.claim_next(&worker("w2"), &ClaimFilter::any()).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(CoordError::NoClaimableTask { .. })))
    );
    assert_eq!(second.list(BoardName::Working).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dependent_task_waits_for_its_dependency() {
    let coord = memory_coordinator(Arc::new(MemoryBoardStore::new()), EngineConfig::default()).await;
    submit_ready(&coord, "T1", 1).await;
    coord
        .submit_task(NewTask::new("follow-up").with_id("T2").depends_on("T1"))
        .await
        .unwrap();

    match coord.promote(&task_id("T2")).await {
        Err(CoordError::DependencyUnresolved { pending, .. }) => {
            assert_eq!(pending, vec![task_id("T1")]);
        }
        other => panic!("expected DependencyUnresolved, got {other:?}"),
    }

    let w = worker("w1");
    coord.claim_next(&w, &ClaimFilter::any()).await.unwrap();
    coord
        .report_progress(&task_id("T1"), TaskStatus::InProgress, Some("started"))
        .await
        .unwrap();
    coord.finish(&task_id("T1"), Outcome::Completed, "done").await.unwrap();

    let promoted = coord.promote(&task_id("T2")).await.unwrap();
    assert_eq!(promoted.status, TaskStatus::Pending);
    assert_eq!(coord.claim_next(&w, &ClaimFilter::any()).await.unwrap().id, task_id("T2"));
}

#[tokio::test]
async fn corrupt_ready_board_blocks_claims_but_not_other_boards() {
    let store = Arc::new(MemoryBoardStore::new());
    let coord = memory_coordinator(Arc::clone(&store), EngineConfig::default()).await;
    submit_ready(&coord, "T0", 1).await;
    coord.claim_next(&worker("w1"), &ClaimFilter::any()).await.unwrap();
    submit_ready(&coord, "T1", 1).await;

    store.corrupt("ready");

    assert!(matches!(
        coord.claim_next(&worker("w2"), &ClaimFilter::any()).await,
        Err(CoordError::BoardCorruption { .. })
    ));
    assert_eq!(coord.list(BoardName::Working).await.unwrap().len(), 1);
    let done = coord.finish(&task_id("T0"), Outcome::Completed, "ok").await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(coord.list(BoardName::Completed).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_lose_no_updates() {
    let coord = Arc::new(memory_coordinator(Arc::new(MemoryBoardStore::new()), EngineConfig::default()).await);

    let submits: Vec<_> = (0..16)
        .map(|n| {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                coord
                    .submit_task(NewTask::new("parallel").with_id(format!("P{n}")))
                    .await
            })
        })
        .collect();
    for handle in submits {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(coord.counts().await.unwrap().backlog, 16);

    coord.promote(&task_id("P0")).await.unwrap();
    coord.claim_next(&worker("w1"), &ClaimFilter::any()).await.unwrap();
    let before = coord.task(&task_id("P0")).await.unwrap().notes.len();

    let notes: Vec<_> = (0..10)
        .map(|n| {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move { coord.annotate(&task_id("P0"), &format!("note {n}")).await })
        })
        .collect();
    for handle in notes {
        handle.await.unwrap().unwrap();
    }
    let after = coord.task(&task_id("P0")).await.unwrap().notes.len();
    assert_eq!(after - before, 10);
}

#[tokio::test]
async fn progress_notes_survive_to_completion_in_order() {
    let coord = memory_coordinator(Arc::new(MemoryBoardStore::new()), EngineConfig::default()).await;
    let id = submit_ready(&coord, "T1", 1).await;
    coord.claim_next(&worker("w1"), &ClaimFilter::any()).await.unwrap();

    coord
        .report_progress(&id, TaskStatus::InProgress, Some("started"))
        .await
        .unwrap();
    coord
        .report_progress(&id, TaskStatus::Blocked, Some("waiting on schema"))
        .await
        .unwrap();
    let done = coord.finish(&id, Outcome::Completed, "shipped").await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    let texts: Vec<&str> = done.notes.iter().map(|n| n.text.as_str()).collect();
    assert_eq!(texts, vec!["started", "waiting on schema", "shipped"]);
    assert_eq!(coord.task(&id).await.unwrap(), done);
    assert_eq!(coord.list(BoardName::Completed).await.unwrap().len(), 1);
    assert!(coord.list(BoardName::Working).await.unwrap().is_empty());
}

#[tokio::test]
async fn terminal_state_is_final() {
    let coord = memory_coordinator(Arc::new(MemoryBoardStore::new()), EngineConfig::default()).await;
    submit_ready(&coord, "T1", 1).await;
    coord.claim_next(&worker("w1"), &ClaimFilter::any()).await.unwrap();
    let done = coord.finish(&task_id("T1"), Outcome::Completed, "first").await.unwrap();

    for outcome in [Outcome::Completed, Outcome::Failed] {
        assert!(matches!(
            coord.finish(&task_id("T1"), outcome, "again").await,
            Err(CoordError::TaskAlreadyTerminal(_))
        ));
    }
    assert!(matches!(
        coord.report_progress(&task_id("T1"), TaskStatus::InProgress, None).await,
        Err(CoordError::TaskAlreadyTerminal(_))
    ));
    assert_eq!(coord.task(&task_id("T1")).await.unwrap(), done);
}

#[tokio::test]
async fn queued_events_are_delivered_by_priority() {
    let coord = CoordinatorBuilder::new()
        .in_memory(Arc::new(MemoryBoardStore::new()))
        .paused_events()
        .build()
        .await
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    coord.subscribe_all(recorder(Arc::clone(&seen)));

    submit_ready(&coord, "T1", 1).await;
    coord.claim_next(&worker("w1"), &ClaimFilter::any()).await.unwrap();
    coord.finish(&task_id("T1"), Outcome::Failed, "broke").await.unwrap();

    coord.start_events();
    coord.wait_idle().await;

    let order: Vec<EventType> = seen.lock().unwrap().iter().map(|e| e.event_type).collect();
    assert_eq!(
        order,
        vec![
            EventType::TaskFailed,
            EventType::TaskClaimed,
            EventType::TaskPromoted,
            EventType::TaskSubmitted,
        ]
    );
    coord.shutdown().await;
}

#[tokio::test]
async fn handler_failure_becomes_a_system_error() {
    let coord = memory_coordinator(Arc::new(MemoryBoardStore::new()), EngineConfig::default()).await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    coord.subscribe(EventType::SystemError, recorder(Arc::clone(&errors)));
    coord.subscribe(
        EventType::TaskSubmitted,
        handler_fn(|_event: Event| async { Err::<(), HandlerError>("webhook down".into()) }),
    );

    coord.submit_task(NewTask::new("t").with_id("T1")).await.unwrap();
    coord.wait_idle().await;

    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].payload["failed_event_type"], "TASK_SUBMITTED");
    assert_eq!(errors[0].payload["source_id"], "T1");
}

#[tokio::test]
async fn unacked_messages_survive_a_restart() {
    let store = Arc::new(MemoryBoardStore::new());
    let first = memory_coordinator(Arc::clone(&store), EngineConfig::default()).await;
    let msg = Message::new(worker("lead"), worker("w1"), MessageType::Directive, "rebuild index", "");
    let id = first.send_message(msg).await.unwrap();
    assert_eq!(first.poll_mailbox(&worker("w1")).await.unwrap().len(), 1);
    first.shutdown().await;
    drop(first);

    let second = memory_coordinator(Arc::clone(&store), EngineConfig::default()).await;
    let again = second.poll_mailbox(&worker("w1")).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, id);
    assert_eq!(again[0].deliveries, 2);

    second.ack_message(&worker("w1"), id).await.unwrap();
    assert!(second.poll_mailbox(&worker("w1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn release_past_the_ceiling_fails_the_task() {
    let mut config = EngineConfig::default();
    config.max_reclaims = 1;
    let coord = memory_coordinator(Arc::new(MemoryBoardStore::new()), config).await;
    submit_ready(&coord, "T1", 1).await;
    let w = worker("w1");

    coord.claim_next(&w, &ClaimFilter::any()).await.unwrap();
    let back = coord.release(&task_id("T1"), "worker restarted").await.unwrap();
    assert_eq!(back.status, TaskStatus::Pending);
    assert_eq!(back.reclaim_count, 1);

    coord.claim_next(&w, &ClaimFilter::any()).await.unwrap();
    let failed = coord.release(&task_id("T1"), "worker restarted").await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::MaxReclaimsExceeded));
    assert_eq!(coord.list(BoardName::Failed).await.unwrap().len(), 1);
}

#[tokio::test]
async fn file_boards_are_repaired_or_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let coord = file_coordinator(dir.path(), 2).await;
    for id in ["T1", "T2", "T3"] {
        coord.submit_task(NewTask::new("work").with_id(id)).await.unwrap();
    }

    // T1+T2 are in the backup, T3 only in the journal.
    std::fs::write(dir.path().join("backlog.json"), b"{ torn").unwrap();
    let outcome = coord.repair(&BoardRef::Tasks(BoardName::Backlog)).await.unwrap();
    assert_eq!(outcome, RepairOutcome::Rebuilt { records: 3, replayed: 1 });
    assert_eq!(coord.list(BoardName::Backlog).await.unwrap().len(), 3);

    std::fs::write(dir.path().join("backlog.json"), b"{ torn").unwrap();
    std::fs::write(dir.path().join("backlog.json.bak"), b"also torn").unwrap();
    let outcome = coord.repair(&BoardRef::Tasks(BoardName::Backlog)).await.unwrap();
    assert!(matches!(outcome, RepairOutcome::Quarantined { .. }));
    assert!(matches!(
        coord.submit_task(NewTask::new("blocked").with_id("T4")).await,
        Err(CoordError::BoardQuarantined { .. })
    ));

    std::fs::write(dir.path().join("backlog.json"), b"[]").unwrap();
    coord.clear_quarantine(&BoardRef::Tasks(BoardName::Backlog)).await.unwrap();
    coord.submit_task(NewTask::new("after").with_id("T4")).await.unwrap();
    assert!(coord.status().await.unwrap().healthy);
}
