// End-to-end engine behaviour over the in-memory backend: concurrency
// cap, conflict decisions, retry of transient failures, pause/resume
// byte integrity, and the cancel partial-result policy.

use skiff_core::EngineConfig;
use skiff_sftp::MemoryRemoteClient;
use skiff_transfer::{
    AutoResolver, ChannelResolver, ConflictChoice, ConflictReply, TaskKind, TaskState,
    TransferQueue, TransferTask,
};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.chunk_size = 4;
    config.retry_delay_ms = 1;
    config
}

async fn wait_terminal(queue: &TransferQueue, id: &str) -> TransferTask {
    for _ in 0..1000 {
        let task = queue.task(id).unwrap();
        if task.state.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("task {} never reached a terminal state", id);
}

async fn wait_state(queue: &TransferQueue, id: &str, state: TaskState) {
    for _ in 0..1000 {
        if queue.task(id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("task {} never reached {:?}", id, state);
}

// Three uploads against a two-slot pool: at most two run at once, the
// third waits for a slot.
#[tokio::test]
async fn concurrency_cap_holds_third_task_queued() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    for name in ["a", "b", "c"] {
        local.put_file(&format!("/src/{}", name), b"payload!");
        remote.put_file(&format!("/dst/{}", name), b"old"); // forces a prompt
    }
    let (resolver, mut prompts) = ChannelResolver::new();
    let mut config = test_config();
    config.max_concurrent = 2;
    let queue = TransferQueue::new(local, remote, config, Arc::new(resolver));

    let ids = queue.enqueue_batch(
        TaskKind::Upload,
        vec![
            ("/src/a".into(), "/dst/a".into()),
            ("/src/b".into(), "/dst/b".into()),
            ("/src/c".into(), "/dst/c".into()),
        ],
        "batch-cap",
    );

    // Both slots are parked inside the conflict wait.
    let first = prompts.recv().await.unwrap();
    let second = prompts.recv().await.unwrap();

    let states: Vec<TaskState> = queue.snapshot().iter().map(|t| t.state).collect();
    assert_eq!(
        states.iter().filter(|s| **s == TaskState::Running).count(),
        2
    );
    assert_eq!(
        states.iter().filter(|s| **s == TaskState::Queued).count(),
        1
    );

    let _ = first.1.send(ConflictReply::once(ConflictChoice::Overwrite));
    let _ = second.1.send(ConflictReply::once(ConflictChoice::Overwrite));
    let third = prompts.recv().await.unwrap();
    let _ = third.1.send(ConflictReply::once(ConflictChoice::Overwrite));

    for id in &ids {
        assert_eq!(wait_terminal(&queue, id).await.state, TaskState::Completed);
    }
}

// Skip leaves the destination byte-for-byte untouched and moves nothing.
#[tokio::test]
async fn skip_conflict_touches_nothing() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/f", b"new content");
    remote.put_file("/dst/f", b"precious");
    let queue = TransferQueue::new(
        local,
        remote.clone(),
        test_config(),
        Arc::new(AutoResolver(ConflictChoice::Skip)),
    );

    let writes_before = remote.write_ops();
    let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
    let task = wait_terminal(&queue, &id).await;

    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.note.as_deref(), Some("skipped"));
    assert_eq!(task.transferred, 0);
    assert_eq!(remote.file_contents("/dst/f").unwrap(), b"precious");
    assert_eq!(remote.write_ops(), writes_before);
}

// An apply-to-all answer is consumed for the rest of the batch without
// prompting again.
#[tokio::test]
async fn apply_to_all_prompts_once_per_batch() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    for name in ["a", "b", "c"] {
        local.put_file(&format!("/src/{}", name), b"fresh");
        remote.put_file(&format!("/dst/{}", name), b"stale");
    }
    let (resolver, mut prompts) = ChannelResolver::new();
    let mut config = test_config();
    config.max_concurrent = 1; // serialise so the sticky choice is set first
    let queue = TransferQueue::new(local, remote.clone(), config, Arc::new(resolver));

    let ids = queue.enqueue_batch(
        TaskKind::Upload,
        vec![
            ("/src/a".into(), "/dst/a".into()),
            ("/src/b".into(), "/dst/b".into()),
            ("/src/c".into(), "/dst/c".into()),
        ],
        "batch-sticky",
    );

    let (_, reply_tx) = prompts.recv().await.unwrap();
    let _ = reply_tx.send(ConflictReply {
        choice: ConflictChoice::Overwrite,
        apply_to_all: true,
    });

    for id in &ids {
        assert_eq!(wait_terminal(&queue, id).await.state, TaskState::Completed);
    }
    assert!(prompts.try_recv().is_err(), "a second prompt was raised");
    for name in ["a", "b", "c"] {
        assert_eq!(
            remote.file_contents(&format!("/dst/{}", name)).unwrap(),
            b"fresh"
        );
    }
}

// Two transient failures, success on the third and final attempt.
#[tokio::test]
async fn transient_failures_retry_until_success() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/f", b"eventually");
    local.fail_transient("/src/f", 2);
    let queue = TransferQueue::new(
        local,
        remote.clone(),
        test_config(),
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );

    let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
    let task = wait_terminal(&queue, &id).await;

    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 3);
    assert_eq!(remote.file_contents("/dst/f").unwrap(), b"eventually");
}

// Exhausting max_attempts on a transient error lands in Error, and an
// explicit retry starts a fresh attempt budget.
#[tokio::test]
async fn attempt_exhaustion_then_manual_retry() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/f", b"stubborn");
    local.fail_transient("/src/f", 10);
    let queue = TransferQueue::new(
        local.clone(),
        remote.clone(),
        test_config(),
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );

    let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
    let task = wait_terminal(&queue, &id).await;
    assert_eq!(task.state, TaskState::Error);
    assert_eq!(task.attempts, task.max_attempts);
    assert!(task.last_error.is_some());

    // 10 injected failures, 3 consumed; clear the rest and retry.
    local.fail_transient("/src/f", 0);
    queue.retry(&id).unwrap();
    let task = wait_terminal(&queue, &id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(remote.file_contents("/dst/f").unwrap(), b"stubborn");
}

// A Resume decision continues from the destination's length; the final
// file matches the source exactly, no duplicated or missing range.
#[tokio::test]
async fn resume_conflict_continues_without_byte_loss() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/f", b"0123456789");
    remote.put_file("/dst/f", b"0123"); // earlier partial
    let queue = TransferQueue::new(
        local,
        remote.clone(),
        test_config(),
        Arc::new(AutoResolver(ConflictChoice::Resume)),
    );

    let writes_before = remote.write_ops();
    let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
    let task = wait_terminal(&queue, &id).await;

    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.resume_offset, 4);
    assert_eq!(remote.file_contents("/dst/f").unwrap(), b"0123456789");
    // 6 remaining bytes at chunk size 4: two writes, not three.
    assert_eq!(remote.write_ops() - writes_before, 2);
}

// Resume against a backend without offset support coerces to Overwrite.
#[tokio::test]
async fn resume_without_offset_support_overwrites() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new().without_resume());
    local.put_file("/src/f", b"whole file");
    remote.put_file("/dst/f", b"wh");
    let queue = TransferQueue::new(
        local,
        remote.clone(),
        test_config(),
        Arc::new(AutoResolver(ConflictChoice::Resume)),
    );

    let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
    let task = wait_terminal(&queue, &id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.resume_offset, 0);
    assert_eq!(remote.file_contents("/dst/f").unwrap(), b"whole file");
}

// Pause parks the task with its progress checkpointed; resume finishes
// the copy and the destination matches the source.
#[tokio::test]
async fn pause_resume_preserves_every_byte() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(32 * 1024).collect();
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/big", &payload);
    let mut config = test_config();
    config.chunk_size = 64;
    let queue = TransferQueue::new(
        local,
        remote.clone(),
        config,
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );

    let id = queue.enqueue(TaskKind::Upload, "/src/big", "/dst/big");
    tokio::time::sleep(Duration::from_millis(1)).await;
    queue.pause(&id).unwrap();

    // The worker may already have finished the small tree; both paths
    // must leave the bytes intact.
    for _ in 0..1000 {
        let task = queue.task(&id).unwrap();
        if task.state == TaskState::Paused || task.state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let parked = queue.task(&id).unwrap();
    if parked.state == TaskState::Paused {
        assert!(parked.transferred <= payload.len() as u64);
        queue.resume(&id).unwrap();
    }

    let task = wait_terminal(&queue, &id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.transferred, payload.len() as u64);
    assert_eq!(remote.file_contents("/dst/big").unwrap(), payload);
}

// A pause that lands mid-copy parks the task with its partial bytes;
// it must not masquerade as a finished transfer.
#[tokio::test]
async fn pause_mid_copy_parks_with_partial_bytes() {
    let payload = vec![3u8; 8 * 1024];
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/big", &payload);
    let mut config = test_config();
    config.chunk_size = 1024;
    config.global_rate_limit_kbps = 1; // 1 KB burst, then ~1 s per chunk
    let queue = TransferQueue::new(
        local,
        remote.clone(),
        config,
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );

    let id = queue.enqueue(TaskKind::Upload, "/src/big", "/dst/big");
    // Let the burst land, then pause while the limiter sleeps.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.task(&id).unwrap().transferred > 0);
    queue.pause(&id).unwrap();

    wait_state(&queue, &id, TaskState::Paused).await;
    let parked = queue.task(&id).unwrap();
    assert!(
        parked.transferred < payload.len() as u64,
        "pause observed only after the whole file moved"
    );

    queue.set_global_rate_limit(0);
    queue.resume(&id).unwrap();
    let task = wait_terminal(&queue, &id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.transferred, payload.len() as u64);
    assert_eq!(remote.file_contents("/dst/big").unwrap(), payload);
}

// Pausing and resuming is free: it never counts against the retry
// budget, which stays available for a real transient failure later.
#[tokio::test]
async fn pause_resume_cycles_keep_the_attempt_budget() {
    let payload = vec![5u8; 16 * 1024];
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/big", &payload);
    let mut config = test_config();
    config.chunk_size = 1024;
    config.global_rate_limit_kbps = 1;
    let queue = TransferQueue::new(
        local.clone(),
        remote.clone(),
        config,
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );

    let id = queue.enqueue(TaskKind::Upload, "/src/big", "/dst/big");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.task(&id).unwrap().transferred > 0);

    // More cycles than max_attempts; the count must not move.
    for cycle in 0..3 {
        wait_state(&queue, &id, TaskState::Running).await;
        queue.pause(&id).unwrap();
        wait_state(&queue, &id, TaskState::Paused).await;
        assert_eq!(queue.task(&id).unwrap().attempts, 1);
        if cycle == 2 {
            // The budget is still intact for an actual failure.
            local.fail_transient("/src/big", 1);
            queue.set_global_rate_limit(0);
        }
        queue.resume(&id).unwrap();
    }

    let task = wait_terminal(&queue, &id).await;
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.attempts, 2);
    assert_eq!(remote.file_contents("/dst/big").unwrap(), payload);
}

// Cancelling a non-resumable transfer deletes the partial destination;
// a resumable one keeps it.
#[tokio::test]
async fn cancel_applies_partial_result_policy() {
    let payload = vec![7u8; 8 * 1024];
    let remote = Arc::new(MemoryRemoteClient::new());
    remote.put_file("/src/big", &payload);
    let local: Arc<MemoryRemoteClient> = Arc::new(MemoryRemoteClient::new().without_resume());
    let mut config = test_config();
    config.chunk_size = 1024;
    config.global_rate_limit_kbps = 1; // 1 KB burst, then ~1 s per chunk
    let queue = TransferQueue::new(
        local.clone(),
        remote,
        config,
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );

    let id = queue.enqueue(TaskKind::Download, "/src/big", "/dst/big");
    // Let the burst chunk land, then cancel while the limiter sleeps.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.task(&id).unwrap().transferred > 0);
    queue.cancel(&id).unwrap();

    let task = wait_terminal(&queue, &id).await;
    assert_eq!(task.state, TaskState::Canceled);
    // Cleanup runs async right after the transition.
    for _ in 0..500 {
        if !local.contains("/dst/big") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(!local.contains("/dst/big"), "partial survived cancel");
}

#[tokio::test]
async fn cancel_keeps_partial_for_resumable_transfers() {
    let payload = vec![9u8; 8 * 1024];
    let remote = Arc::new(MemoryRemoteClient::new());
    remote.put_file("/src/big", &payload);
    let local = Arc::new(MemoryRemoteClient::new());
    let mut config = test_config();
    config.chunk_size = 1024;
    config.global_rate_limit_kbps = 1;
    let queue = TransferQueue::new(
        local.clone(),
        remote,
        config,
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );

    let id = queue.enqueue(TaskKind::Download, "/src/big", "/dst/big");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(queue.task(&id).unwrap().transferred > 0);
    queue.cancel(&id).unwrap();

    let task = wait_terminal(&queue, &id).await;
    assert_eq!(task.state, TaskState::Canceled);
    tokio::time::sleep(Duration::from_millis(20)).await;
    let partial = local.file_contents("/dst/big").unwrap();
    assert_eq!(partial.len() as u64, task.transferred);
    assert!(partial.iter().all(|b| *b == 9));
}

// Terminal states are sinks: commands against a Completed task change
// nothing.
#[tokio::test]
async fn terminal_states_ignore_queue_commands() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/f", b"done");
    let queue = TransferQueue::new(
        local,
        remote,
        test_config(),
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );

    let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
    wait_terminal(&queue, &id).await;

    queue.pause(&id).unwrap();
    queue.cancel(&id).unwrap();
    let _ = queue.resume(&id);
    assert_eq!(queue.task(&id).unwrap().state, TaskState::Completed);
    assert!(queue.retry(&id).is_err());
}

// Events mirror the state transitions in order for a simple lifecycle.
#[tokio::test]
async fn events_follow_the_lifecycle() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/f", b"evented");
    let queue = TransferQueue::new(
        local,
        remote,
        test_config(),
        Arc::new(AutoResolver(ConflictChoice::Overwrite)),
    );
    let mut events = queue.subscribe();

    let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
    wait_terminal(&queue, &id).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.task_id == id {
            seen.push(event.state);
        }
    }
    assert_eq!(seen.first(), Some(&TaskState::Running));
    assert_eq!(seen.last(), Some(&TaskState::Completed));
}

// Clearing terminal tasks also forgets their batch's sticky conflict
// choice; a later task reusing the batch id prompts afresh.
#[tokio::test]
async fn clear_terminal_drops_sticky_batch_choices() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    local.put_file("/src/a", b"one");
    local.put_file("/src/b", b"two");
    remote.put_file("/dst/a", b"x");
    remote.put_file("/dst/b", b"x");
    let (resolver, mut prompts) = ChannelResolver::new();
    let queue = TransferQueue::new(local, remote, test_config(), Arc::new(resolver));

    let first = queue.enqueue_batch(
        TaskKind::Upload,
        vec![("/src/a".into(), "/dst/a".into())],
        "batch-reused",
    );
    let (_, reply_tx) = prompts.recv().await.unwrap();
    let _ = reply_tx.send(ConflictReply {
        choice: ConflictChoice::Overwrite,
        apply_to_all: true,
    });
    wait_terminal(&queue, &first[0]).await;
    assert_eq!(queue.clear_terminal(), 1);

    let second = queue.enqueue_batch(
        TaskKind::Upload,
        vec![("/src/b".into(), "/dst/b".into())],
        "batch-reused",
    );
    let prompted = loop {
        match prompts.try_recv() {
            Ok((_, reply_tx)) => {
                let _ = reply_tx.send(ConflictReply::once(ConflictChoice::Overwrite));
                break true;
            }
            Err(_) if queue.task(&second[0]).unwrap().state.is_terminal() => break false,
            Err(_) => tokio::time::sleep(Duration::from_millis(2)).await,
        }
    };
    assert!(prompted, "the cleared batch's choice was reused");
    assert_eq!(
        wait_terminal(&queue, &second[0]).await.state,
        TaskState::Completed
    );
}

#[tokio::test]
async fn pause_all_then_resume_all_drains_the_queue() {
    let local = Arc::new(MemoryRemoteClient::new());
    let remote = Arc::new(MemoryRemoteClient::new());
    for i in 0..4 {
        local.put_file(&format!("/src/{}", i), b"bulk");
        remote.put_file(&format!("/dst/{}", i), b"x");
    }
    let (resolver, mut prompts) = ChannelResolver::new();
    let mut config = test_config();
    config.max_concurrent = 1;
    let queue = TransferQueue::new(local, remote, config, Arc::new(resolver));

    let ids = queue.enqueue_batch(
        TaskKind::Upload,
        (0..4)
            .map(|i| (format!("/src/{}", i), format!("/dst/{}", i)))
            .collect(),
        "batch-bulk",
    );

    // One worker is prompt-gated; the other three are pausable now.
    let gate = prompts.recv().await.unwrap();
    queue.pause_all();
    for id in &ids[1..] {
        assert_eq!(queue.task(id).unwrap().state, TaskState::Paused);
    }
    let _ = gate.1.send(ConflictReply {
        choice: ConflictChoice::Overwrite,
        apply_to_all: true,
    });
    // The gated task had a pause pending too; it parks at its next
    // chunk boundary.
    wait_state(&queue, &ids[0], TaskState::Paused).await;

    queue.resume_all();
    for id in &ids {
        assert_eq!(wait_terminal(&queue, id).await.state, TaskState::Completed);
    }
}
