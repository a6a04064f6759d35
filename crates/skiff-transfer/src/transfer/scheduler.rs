// ── TransferQueue – FIFO dispatch to a bounded worker pool ──────────────────
//
// Locking rule: all task state lives under one std Mutex. Workers and
// command handlers take it for short, synchronous sections only; every
// suspension point (token wait, conflict wait, chunk IO, backoff sleep)
// runs with the lock released.

use crate::transfer::conflict::{ConflictChoice, ConflictInfo, ConflictResolver};
use crate::transfer::limiter::RateLimiter;
use crate::transfer::task::{TaskKind, TaskState, TransferTask};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use skiff_core::{EngineConfig, EngineError, EngineResult, ErrorKind};
use skiff_sftp::RemoteClient;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Emitted on every task state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferEvent {
    pub task_id: String,
    pub state: TaskState,
    pub transferred: u64,
    pub last_error: Option<String>,
}

type EvictionHook = dyn Fn(&EngineError) + Send + Sync;

struct QueueState {
    tasks: HashMap<String, TransferTask>,
    /// Insertion order, for snapshots.
    order: Vec<String>,
    /// Dispatch order of Queued task ids.
    fifo: VecDeque<String>,
    pause_requested: HashSet<String>,
    cancel_requested: HashSet<String>,
    /// Tasks paused mid-attempt; their next dispatch continues the
    /// same attempt instead of counting a new one.
    continued: HashSet<String>,
    /// Sticky conflict choices, keyed by batch id.
    sticky: HashMap<String, ConflictChoice>,
    task_limiters: HashMap<String, Arc<RateLimiter>>,
    running: usize,
    max_concurrent: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    config: EngineConfig,
    local: Arc<dyn RemoteClient>,
    remote: Arc<dyn RemoteClient>,
    global_limiter: RateLimiter,
    resolver: Arc<dyn ConflictResolver>,
    events: broadcast::Sender<TransferEvent>,
    eviction_hook: Option<Box<EvictionHook>>,
}

/// The transfer queue. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct TransferQueue {
    shared: Arc<Shared>,
}

impl TransferQueue {
    pub fn new(
        local: Arc<dyn RemoteClient>,
        remote: Arc<dyn RemoteClient>,
        config: EngineConfig,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Self {
        Self::with_eviction_hook(local, remote, config, resolver, None)
    }

    /// Like `new`, with a hook the workers call on fatal protocol or
    /// connection errors so the owner can evict the pooled session.
    pub fn with_eviction_hook(
        local: Arc<dyn RemoteClient>,
        remote: Arc<dyn RemoteClient>,
        config: EngineConfig,
        resolver: Arc<dyn ConflictResolver>,
        eviction_hook: Option<Box<EvictionHook>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        TransferQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    tasks: HashMap::new(),
                    order: Vec::new(),
                    fifo: VecDeque::new(),
                    pause_requested: HashSet::new(),
                    cancel_requested: HashSet::new(),
                    continued: HashSet::new(),
                    sticky: HashMap::new(),
                    task_limiters: HashMap::new(),
                    running: 0,
                    max_concurrent: config.max_concurrent.max(1),
                }),
                global_limiter: RateLimiter::new(config.global_rate_limit_kbps),
                config,
                local,
                remote,
                resolver,
                events,
                eviction_hook,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }

    // ── Enqueue ──────────────────────────────────────────────────────────────

    pub fn enqueue(
        &self,
        kind: TaskKind,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> String {
        let batch = Uuid::new_v4().to_string();
        let ids = self.enqueue_batch(kind, vec![(source.into(), destination.into())], &batch);
        ids.into_iter().next().unwrap_or_default()
    }

    /// Enqueue several transfers under one batch id, the scope for
    /// "apply to all" conflict decisions.
    pub fn enqueue_batch(
        &self,
        kind: TaskKind,
        pairs: Vec<(String, String)>,
        batch_id: &str,
    ) -> Vec<String> {
        let mut ids = Vec::with_capacity(pairs.len());
        {
            let mut st = lock(&self.shared.state);
            for (source, destination) in pairs {
                let task = TransferTask::new(
                    kind,
                    source,
                    destination,
                    self.shared.config.max_attempts,
                    batch_id,
                );
                debug!("enqueue {:?} {} -> {}", kind, task.source, task.destination);
                ids.push(task.id.clone());
                st.order.push(task.id.clone());
                st.fifo.push_back(task.id.clone());
                st.tasks.insert(task.id.clone(), task);
            }
        }
        dispatch(&self.shared);
        ids
    }

    // ── Pause / resume ───────────────────────────────────────────────────────

    pub fn pause(&self, id: &str) -> EngineResult<()> {
        let mut st = lock(&self.shared.state);
        let task = get_task(&mut st, id)?;
        match task.state {
            TaskState::Queued => {
                transition(&mut st, &self.shared, id, TaskState::Paused);
                st.fifo.retain(|q| q != id);
            }
            TaskState::Running => {
                st.pause_requested.insert(id.to_string());
            }
            _ => {}
        }
        Ok(())
    }

    pub fn pause_all(&self) {
        let ids: Vec<String> = {
            let st = lock(&self.shared.state);
            st.order.clone()
        };
        for id in ids {
            let _ = self.pause(&id);
        }
    }

    pub fn resume(&self, id: &str) -> EngineResult<()> {
        {
            let mut st = lock(&self.shared.state);
            let task = get_task(&mut st, id)?;
            if task.state != TaskState::Paused {
                return Ok(());
            }
            transition(&mut st, &self.shared, id, TaskState::Queued);
            if self.shared.config.resume_in_place {
                st.fifo.push_front(id.to_string());
            } else {
                st.fifo.push_back(id.to_string());
            }
        }
        dispatch(&self.shared);
        Ok(())
    }

    pub fn resume_all(&self) {
        let ids: Vec<String> = {
            let st = lock(&self.shared.state);
            st.order.clone()
        };
        for id in ids {
            let _ = self.resume(&id);
        }
    }

    // ── Cancel ───────────────────────────────────────────────────────────────

    pub fn cancel(&self, id: &str) -> EngineResult<()> {
        let cleanup = {
            let mut st = lock(&self.shared.state);
            let task = get_task(&mut st, id)?;
            match task.state {
                TaskState::Running => {
                    st.cancel_requested.insert(id.to_string());
                    None
                }
                TaskState::Queued | TaskState::Paused => {
                    let cleanup = partial_cleanup_target(&self.shared, task);
                    st.fifo.retain(|q| q != id);
                    transition(&mut st, &self.shared, id, TaskState::Canceled);
                    cleanup
                }
                _ => None,
            }
        };
        if let Some((client, path)) = cleanup {
            spawn_partial_cleanup(client, path);
        }
        Ok(())
    }

    pub fn cancel_selected(&self, ids: &[String]) {
        for id in ids {
            let _ = self.cancel(id);
        }
    }

    pub fn cancel_all(&self) {
        let ids: Vec<String> = {
            let st = lock(&self.shared.state);
            st.order.clone()
        };
        self.cancel_selected(&ids);
    }

    // ── Retry ────────────────────────────────────────────────────────────────

    pub fn retry(&self, id: &str) -> EngineResult<()> {
        {
            let mut st = lock(&self.shared.state);
            let task = get_task(&mut st, id)?;
            if task.state != TaskState::Error {
                return Err(EngineError::new(
                    ErrorKind::Conflict,
                    format!("Task {} is not in the Error state", id),
                ));
            }
            task.reset_for_retry();
            emit(&self.shared, task);
            st.fifo.push_back(id.to_string());
        }
        dispatch(&self.shared);
        Ok(())
    }

    pub fn retry_failed(&self) -> usize {
        let failed: Vec<String> = {
            let st = lock(&self.shared.state);
            st.order
                .iter()
                .filter(|id| {
                    st.tasks
                        .get(*id)
                        .map(|t| t.state == TaskState::Error)
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        let mut retried = 0;
        for id in &failed {
            if self.retry(id).is_ok() {
                retried += 1;
            }
        }
        retried
    }

    /// Drop Completed/Error/Canceled tasks from the queue view.
    pub fn clear_terminal(&self) -> usize {
        let mut st = lock(&self.shared.state);
        let (keep, terminal): (Vec<String>, Vec<String>) =
            st.order.iter().cloned().partition(|id| {
                st.tasks
                    .get(id)
                    .map(|t| !t.state.is_terminal())
                    .unwrap_or(false)
            });
        for id in &terminal {
            st.tasks.remove(id);
            st.task_limiters.remove(id);
            st.pause_requested.remove(id);
            st.cancel_requested.remove(id);
            st.continued.remove(id);
        }
        st.order = keep;
        // Sticky conflict choices die with their batch.
        let live_batches: HashSet<String> =
            st.tasks.values().map(|t| t.batch_id.clone()).collect();
        st.sticky.retain(|batch, _| live_batches.contains(batch));
        terminal.len()
    }

    // ── Live configuration ───────────────────────────────────────────────────

    /// Applies to new dispatches; running workers finish their task.
    pub fn set_concurrency(&self, n: usize) {
        {
            let mut st = lock(&self.shared.state);
            st.max_concurrent = n.max(1);
        }
        dispatch(&self.shared);
    }

    pub fn set_global_rate_limit(&self, kbps: u64) {
        info!("global rate limit set to {} KB/s", kbps);
        self.shared.global_limiter.set_rate(kbps);
    }

    pub fn set_task_rate_limit(&self, id: &str, kbps: u64) -> EngineResult<()> {
        let mut st = lock(&self.shared.state);
        let task = get_task(&mut st, id)?;
        task.rate_limit_kbps = kbps;
        match st.task_limiters.get(id) {
            Some(limiter) => limiter.set_rate(kbps),
            None => {
                st.task_limiters
                    .insert(id.to_string(), Arc::new(RateLimiter::new(kbps)));
            }
        }
        Ok(())
    }

    // ── Observation ──────────────────────────────────────────────────────────

    /// Immutable clones in enqueue order.
    pub fn snapshot(&self) -> Vec<TransferTask> {
        let st = lock(&self.shared.state);
        st.order
            .iter()
            .filter_map(|id| st.tasks.get(id).cloned())
            .collect()
    }

    pub fn task(&self, id: &str) -> EngineResult<TransferTask> {
        let st = lock(&self.shared.state);
        st.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::new(ErrorKind::NotFound, format!("No task {}", id)))
    }
}

// ── Lock helpers ─────────────────────────────────────────────────────────────

fn lock(m: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn get_task<'a>(st: &'a mut QueueState, id: &str) -> EngineResult<&'a mut TransferTask> {
    st.tasks
        .get_mut(id)
        .ok_or_else(|| EngineError::new(ErrorKind::NotFound, format!("No task {}", id)))
}

fn emit(shared: &Shared, task: &TransferTask) {
    let _ = shared.events.send(TransferEvent {
        task_id: task.id.clone(),
        state: task.state,
        transferred: task.transferred,
        last_error: task.last_error.clone(),
    });
}

fn transition(st: &mut QueueState, shared: &Shared, id: &str, new_state: TaskState) {
    if let Some(task) = st.tasks.get_mut(id) {
        task.state = new_state;
        emit(shared, task);
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

fn dispatch(shared: &Arc<Shared>) {
    let mut st = lock(&shared.state);
    while st.running < st.max_concurrent {
        let id = loop {
            match st.fifo.pop_front() {
                Some(candidate) => {
                    if st
                        .tasks
                        .get(&candidate)
                        .map(|t| t.state == TaskState::Queued)
                        .unwrap_or(false)
                    {
                        break Some(candidate);
                    }
                    // Stale entry (cancelled or paused while queued).
                }
                None => break None,
            }
        };
        let Some(id) = id else { return };
        let continuation = st.continued.remove(&id);
        if let Some(task) = st.tasks.get_mut(&id) {
            task.state = TaskState::Running;
            if !continuation {
                task.attempts += 1;
            }
            emit(shared, task);
        }
        st.running += 1;
        let shared = shared.clone();
        tokio::spawn(async move {
            run_worker(shared, id).await;
        });
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

/// Which ends the bytes move between for a task kind.
fn endpoints(shared: &Shared, kind: TaskKind) -> (Arc<dyn RemoteClient>, Arc<dyn RemoteClient>) {
    match kind {
        TaskKind::Upload => (shared.local.clone(), shared.remote.clone()),
        TaskKind::Download => (shared.remote.clone(), shared.local.clone()),
        TaskKind::Move => (shared.remote.clone(), shared.remote.clone()),
    }
}

async fn run_worker(shared: Arc<Shared>, id: String) {
    let result = run_task(&shared, &id).await;
    if let Err(e) = result {
        handle_failure(&shared, &id, e).await;
    }
    // Release the slot and let the next queued task in.
    {
        let mut st = lock(&shared.state);
        st.running = st.running.saturating_sub(1);
        st.pause_requested.remove(&id);
        st.cancel_requested.remove(&id);
    }
    dispatch(&shared);
}

enum FlagCheck {
    Continue,
    Stop,
}

/// Observe pause/cancel flags at a chunk boundary. Performs the state
/// transition and returns Stop when the worker must exit.
fn check_flags(shared: &Arc<Shared>, id: &str) -> FlagCheck {
    let cleanup = {
        let mut st = lock(&shared.state);
        if st.cancel_requested.remove(id) {
            let cleanup = st
                .tasks
                .get(id)
                .and_then(|t| partial_cleanup_target(shared, t));
            transition(&mut st, shared, id, TaskState::Canceled);
            cleanup
        } else if st.pause_requested.remove(id) {
            // transferred is already checkpointed; just step aside.
            // Resuming picks the same attempt back up.
            st.continued.insert(id.to_string());
            transition(&mut st, shared, id, TaskState::Paused);
            return FlagCheck::Stop;
        } else {
            return FlagCheck::Continue;
        }
    };
    if let Some((client, path)) = cleanup {
        spawn_partial_cleanup(client, path);
    }
    FlagCheck::Stop
}

/// Partial destination to delete on cancel, per the partial-result
/// policy: resumable transfers keep their partials, the rest are
/// deleted.
fn partial_cleanup_target(
    shared: &Shared,
    task: &TransferTask,
) -> Option<(Arc<dyn RemoteClient>, String)> {
    if task.transferred == 0 {
        return None;
    }
    let (_, dst) = endpoints(shared, task.kind);
    if task.kind.is_resumable() && dst.supports_resume() {
        return None;
    }
    Some((dst, task.destination.clone()))
}

fn spawn_partial_cleanup(client: Arc<dyn RemoteClient>, path: String) {
    tokio::spawn(async move {
        if let Err(e) = client.remove_file(&path).await {
            warn!("could not remove partial {}: {}", path, e);
        }
    });
}

async fn run_task(shared: &Arc<Shared>, id: &str) -> EngineResult<()> {
    let (kind, source, destination, batch_id, transferred) = {
        let st = lock(&shared.state);
        let task = st
            .tasks
            .get(id)
            .ok_or_else(|| EngineError::new(ErrorKind::NotFound, format!("No task {}", id)))?;
        (
            task.kind,
            task.source.clone(),
            task.destination.clone(),
            task.batch_id.clone(),
            task.transferred,
        )
    };
    let (src, dst) = endpoints(shared, kind);

    if matches!(check_flags(shared, id), FlagCheck::Stop) {
        return Ok(());
    }

    if kind == TaskKind::Move {
        return run_move(shared, id, &src, &source, &destination, &batch_id).await;
    }

    // Source size drives progress reporting and the resumable check.
    let src_stat = src.stat(&source).await?;
    {
        let mut st = lock(&shared.state);
        if let Some(task) = st.tasks.get_mut(id) {
            task.size = src_stat.size;
        }
    }

    // Conflict applies only to fresh starts; a transfer continuing
    // after pause or transient retry keeps its established offset.
    let mut offset = transferred;
    if offset == 0 {
        match decide_conflict(shared, id, kind, &src, &dst, &source, &destination, &batch_id)
            .await?
        {
            ConflictOutcome::Proceed(start) => offset = start,
            ConflictOutcome::Finished => return Ok(()),
        }
        let mut st = lock(&shared.state);
        if let Some(task) = st.tasks.get_mut(id) {
            task.transferred = offset;
            task.resume_offset = offset;
        }
    }

    match run_copy(shared, id, &src, &dst, &source, &destination, offset, src_stat.size).await? {
        // check_flags already moved the task to Paused/Canceled.
        CopyOutcome::Stopped => return Ok(()),
        CopyOutcome::Finished => {}
    }

    let mut st = lock(&shared.state);
    transition(&mut st, shared, id, TaskState::Completed);
    info!("transfer {} completed ({} -> {})", id, source, destination);
    Ok(())
}

async fn run_move(
    shared: &Arc<Shared>,
    id: &str,
    client: &Arc<dyn RemoteClient>,
    source: &str,
    destination: &str,
    batch_id: &str,
) -> EngineResult<()> {
    let mut overwrite = false;
    if client.exists(destination).await? {
        let src_stat = client.stat(source).await?;
        let dst_stat = client.stat(destination).await?;
        let choice = sticky_or_resolve(
            shared,
            id,
            batch_id,
            ConflictInfo {
                task_id: id.to_string(),
                name: display_name(destination),
                source_size: src_stat.size,
                source_modified: src_stat.modified,
                dest_size: dst_stat.size,
                dest_modified: dst_stat.modified,
                resumable: false,
            },
        )
        .await;
        match choice {
            // Moves cannot continue from an offset.
            ConflictChoice::Resume | ConflictChoice::Overwrite => overwrite = true,
            ConflictChoice::Skip => {
                finish_skipped(shared, id);
                return Ok(());
            }
            ConflictChoice::Cancel => {
                let mut st = lock(&shared.state);
                transition(&mut st, shared, id, TaskState::Canceled);
                return Ok(());
            }
        }
    }
    client.rename(source, destination, overwrite).await?;
    let mut st = lock(&shared.state);
    transition(&mut st, shared, id, TaskState::Completed);
    Ok(())
}

enum ConflictOutcome {
    /// Carry on, starting at this byte offset.
    Proceed(u64),
    /// The decision ended the task (skip or cancel).
    Finished,
}

#[allow(clippy::too_many_arguments)]
async fn decide_conflict(
    shared: &Arc<Shared>,
    id: &str,
    kind: TaskKind,
    src: &Arc<dyn RemoteClient>,
    dst: &Arc<dyn RemoteClient>,
    source: &str,
    destination: &str,
    batch_id: &str,
) -> EngineResult<ConflictOutcome> {
    if !dst.exists(destination).await? {
        return Ok(ConflictOutcome::Proceed(0));
    }
    let src_stat = src.stat(source).await?;
    let dst_stat = dst.stat(destination).await?;
    let resumable = kind.is_resumable()
        && dst.supports_resume()
        && match (dst_stat.size, src_stat.size) {
            (Some(d), Some(s)) => d < s,
            _ => false,
        };
    let dest_len = dst_stat.size.unwrap_or(0);
    let choice = sticky_or_resolve(
        shared,
        id,
        batch_id,
        ConflictInfo {
            task_id: id.to_string(),
            name: display_name(destination),
            source_size: src_stat.size,
            source_modified: src_stat.modified,
            dest_size: dst_stat.size,
            dest_modified: dst_stat.modified,
            resumable,
        },
    )
    .await;
    match choice {
        ConflictChoice::Resume if resumable => Ok(ConflictOutcome::Proceed(dest_len)),
        // Resume against a non-resumable conflict coerces to Overwrite.
        ConflictChoice::Resume | ConflictChoice::Overwrite => {
            match dst.remove_file(destination).await {
                Ok(()) | Err(EngineError { kind: ErrorKind::NotFound, .. }) => {}
                Err(e) => return Err(e),
            }
            Ok(ConflictOutcome::Proceed(0))
        }
        ConflictChoice::Skip => {
            finish_skipped(shared, id);
            Ok(ConflictOutcome::Finished)
        }
        ConflictChoice::Cancel => {
            let mut st = lock(&shared.state);
            transition(&mut st, shared, id, TaskState::Canceled);
            Ok(ConflictOutcome::Finished)
        }
    }
}

/// Look up a sticky batch choice, or ask the resolver with the queue
/// lock released. An apply-to-all answer becomes the batch's sticky
/// choice.
async fn sticky_or_resolve(
    shared: &Arc<Shared>,
    id: &str,
    batch_id: &str,
    info: ConflictInfo,
) -> ConflictChoice {
    {
        let st = lock(&shared.state);
        if let Some(choice) = st.sticky.get(batch_id) {
            debug!("conflict on {}: sticky {:?}", id, choice);
            return *choice;
        }
    }
    let reply = shared.resolver.resolve(info).await;
    if reply.apply_to_all {
        let mut st = lock(&shared.state);
        st.sticky.insert(batch_id.to_string(), reply.choice);
    }
    reply.choice
}

fn finish_skipped(shared: &Arc<Shared>, id: &str) {
    let mut st = lock(&shared.state);
    if let Some(task) = st.tasks.get_mut(id) {
        task.note = Some("skipped".to_string());
        task.state = TaskState::Completed;
        emit(shared, task);
    }
}

enum CopyOutcome {
    /// All bytes landed.
    Finished,
    /// A pause/cancel flag ended the copy early.
    Stopped,
}

#[allow(clippy::too_many_arguments)]
async fn run_copy(
    shared: &Arc<Shared>,
    id: &str,
    src: &Arc<dyn RemoteClient>,
    dst: &Arc<dyn RemoteClient>,
    source: &str,
    destination: &str,
    mut offset: u64,
    size: Option<u64>,
) -> EngineResult<CopyOutcome> {
    let chunk_size = shared.config.chunk_size.max(1);
    loop {
        if matches!(check_flags(shared, id), FlagCheck::Stop) {
            return Ok(CopyOutcome::Stopped);
        }
        let want = match size {
            Some(total) if offset >= total => break,
            Some(total) => chunk_size.min((total - offset) as usize),
            None => chunk_size,
        };
        let data = src.read_chunk(source, offset, want).await?;
        if data.is_empty() {
            break;
        }
        let n = data.len() as u64;

        // Per-task bucket first, then the shared global one.
        let task_limiter = {
            let st = lock(&shared.state);
            st.task_limiters.get(id).cloned()
        };
        if let Some(limiter) = task_limiter {
            limiter.acquire(n).await;
        }
        shared.global_limiter.acquire(n).await;

        dst.write_chunk(destination, offset, &data).await?;
        offset += n;
        let mut st = lock(&shared.state);
        if let Some(task) = st.tasks.get_mut(id) {
            task.advance(n);
        }
    }
    Ok(CopyOutcome::Finished)
}

// ── Failure handling ─────────────────────────────────────────────────────────

async fn handle_failure(shared: &Arc<Shared>, id: &str, error: EngineError) {
    if matches!(
        error.kind,
        ErrorKind::ProtocolError | ErrorKind::Disconnected
    ) {
        if let Some(hook) = &shared.eviction_hook {
            hook(&error);
        }
    }

    let requeue_after = {
        let mut st = lock(&shared.state);
        let Some(task) = st.tasks.get_mut(id) else { return };
        task.last_error = Some(error.to_string());
        if error.is_transient() && task.attempts < task.max_attempts {
            let delay = shared.config.retry_backoff(task.attempts);
            warn!(
                "transfer {} attempt {}/{} failed ({}); retrying in {:?}",
                id, task.attempts, task.max_attempts, error, delay
            );
            task.state = TaskState::Queued;
            emit(shared, task);
            Some(delay)
        } else {
            warn!("transfer {} failed: {}", id, error);
            transition(&mut st, shared, id, TaskState::Error);
            None
        }
    };

    if let Some(delay) = requeue_after {
        let shared = shared.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut st = lock(&shared.state);
                // The task may have been paused or cancelled while the
                // backoff timer ran; only a still-Queued task goes back
                // on the wire.
                let still_queued = st
                    .tasks
                    .get(&id)
                    .map(|t| t.state == TaskState::Queued)
                    .unwrap_or(false);
                if !still_queued || st.fifo.contains(&id) {
                    return;
                }
                st.fifo.push_back(id.clone());
            }
            dispatch(&shared);
        });
    }
}

fn display_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::conflict::AutoResolver;
    use skiff_sftp::MemoryRemoteClient;

    fn queue_with(
        local: Arc<MemoryRemoteClient>,
        remote: Arc<MemoryRemoteClient>,
        config: EngineConfig,
    ) -> TransferQueue {
        TransferQueue::new(
            local,
            remote,
            config,
            Arc::new(AutoResolver(ConflictChoice::Overwrite)),
        )
    }

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.chunk_size = 4;
        config.retry_delay_ms = 1;
        config
    }

    async fn wait_terminal(queue: &TransferQueue, id: &str) -> TransferTask {
        for _ in 0..500 {
            let task = queue.task(id).unwrap();
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        panic!("task {} never reached a terminal state", id);
    }

    #[tokio::test]
    async fn upload_copies_bytes_in_order() {
        let local = Arc::new(MemoryRemoteClient::new());
        let remote = Arc::new(MemoryRemoteClient::new());
        local.put_file("/src/big.bin", b"abcdefghijklmnop");
        let queue = queue_with(local, remote.clone(), test_config());

        let id = queue.enqueue(TaskKind::Upload, "/src/big.bin", "/dst/big.bin");
        let task = wait_terminal(&queue, &id).await;
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.transferred, 16);
        assert_eq!(remote.file_contents("/dst/big.bin").unwrap(), b"abcdefghijklmnop");
    }

    #[tokio::test]
    async fn unknown_size_download_reads_to_eof() {
        let local = Arc::new(MemoryRemoteClient::new());
        let remote = Arc::new(MemoryRemoteClient::new());
        remote.put_file("/r/f.txt", b"stream me");
        remote.mark_unsized("/r/f.txt");
        let queue = queue_with(local.clone(), remote, test_config());

        let id = queue.enqueue(TaskKind::Download, "/r/f.txt", "/l/f.txt");
        let task = wait_terminal(&queue, &id).await;
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.size.is_none());
        assert_eq!(local.file_contents("/l/f.txt").unwrap(), b"stream me");
    }

    #[tokio::test]
    async fn move_renames_on_the_remote() {
        let local = Arc::new(MemoryRemoteClient::new());
        let remote = Arc::new(MemoryRemoteClient::new());
        remote.put_file("/a/doc.txt", b"doc");
        let queue = queue_with(local, remote.clone(), test_config());

        let id = queue.enqueue(TaskKind::Move, "/a/doc.txt", "/b/doc.txt");
        let task = wait_terminal(&queue, &id).await;
        assert_eq!(task.state, TaskState::Completed);
        assert!(remote.contains("/b/doc.txt"));
        assert!(!remote.contains("/a/doc.txt"));
    }

    #[tokio::test]
    async fn permanent_failure_goes_to_error_without_retries() {
        let local = Arc::new(MemoryRemoteClient::new());
        let remote = Arc::new(MemoryRemoteClient::new());
        local.put_file("/src/f", b"data");
        local.fail_always("/src/f", ErrorKind::PermissionDenied);
        let queue = queue_with(local, remote, test_config());

        let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
        let task = wait_terminal(&queue, &id).await;
        assert_eq!(task.state, TaskState::Error);
        assert_eq!(task.attempts, 1);
        assert!(task.last_error.is_some());
    }

    #[tokio::test]
    async fn retry_out_of_error_requires_error_state() {
        let local = Arc::new(MemoryRemoteClient::new());
        let remote = Arc::new(MemoryRemoteClient::new());
        local.put_file("/src/f", b"data");
        let queue = queue_with(local, remote, test_config());

        let id = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
        let task = wait_terminal(&queue, &id).await;
        assert_eq!(task.state, TaskState::Completed);
        assert!(queue.retry(&id).is_err());
    }

    #[tokio::test]
    async fn clear_terminal_keeps_live_tasks() {
        use crate::transfer::conflict::{ChannelResolver, ConflictReply};

        let local = Arc::new(MemoryRemoteClient::new());
        let remote = Arc::new(MemoryRemoteClient::new());
        local.put_file("/src/f", b"data");
        local.put_file("/src/g", b"data");
        remote.put_file("/dst/f", b"old"); // forces a conflict prompt
        let (resolver, mut prompts) = ChannelResolver::new();
        let mut config = test_config();
        config.max_concurrent = 1;
        let queue = TransferQueue::new(local, remote, config, Arc::new(resolver));

        // First task parks in the conflict wait and holds the only slot;
        // the second stays Queued, so pausing it lands immediately.
        let blocked = queue.enqueue(TaskKind::Upload, "/src/f", "/dst/f");
        let parked = queue.enqueue(TaskKind::Upload, "/src/g", "/dst/g");
        let (_, reply_tx) = prompts.recv().await.unwrap();
        queue.pause(&parked).unwrap();
        assert_eq!(queue.task(&parked).unwrap().state, TaskState::Paused);

        let _ = reply_tx.send(ConflictReply::once(ConflictChoice::Overwrite));
        let done = wait_terminal(&queue, &blocked).await;
        assert_eq!(done.state, TaskState::Completed);

        assert_eq!(queue.clear_terminal(), 1);
        assert!(queue.task(&blocked).is_err());
        assert!(queue.task(&parked).is_ok());
    }
}
