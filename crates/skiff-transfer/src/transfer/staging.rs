// ── StagingPreparer: recursive remote-to-local staging ──────────────────────

use log::{info, warn};
use serde::{Deserialize, Serialize};
use skiff_core::{EngineConfig, EngineError, EngineResult, ErrorKind};
use skiff_sftp::sftp::types::EntryType;
use skiff_sftp::RemoteClient;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingReport {
    pub job_id: String,
    pub root: PathBuf,
    /// Files considered by the walk, staged or not.
    pub total_files: usize,
    pub staged: usize,
    pub failed: usize,
    /// Bytes of every file whose size was known up front.
    pub estimated_bytes: u64,
    /// Some entries reported no size; the estimate is a floor.
    pub sizes_unknown: bool,
    pub canceled: bool,
}

impl StagingReport {
    pub fn estimate_label(&self) -> String {
        if self.sizes_unknown {
            format!("~{} bytes, some sizes unknown", self.estimated_bytes)
        } else {
            format!("{} bytes", self.estimated_bytes)
        }
    }

    pub fn summary(&self) -> String {
        if self.failed == 0 {
            format!("{} files staged at {}", self.staged, self.root.display())
        } else {
            format!(
                "{} of {} files failed; staging kept at {}",
                self.failed,
                self.total_files,
                self.root.display()
            )
        }
    }
}

struct JobEntry {
    root: PathBuf,
    cancel: Arc<AtomicBool>,
    report: Option<StagingReport>,
}

/// Handed back by `begin`; lets the caller cancel without going through
/// the preparer.
#[derive(Clone)]
pub struct StagingJob {
    pub id: String,
    pub root: PathBuf,
    cancel: Arc<AtomicBool>,
}

impl StagingJob {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

struct PreparerInner {
    remote: Arc<dyn RemoteClient>,
    staging_dir: PathBuf,
    max_depth: u32,
    chunk_size: usize,
    auto_clean: bool,
    jobs: Mutex<HashMap<String, JobEntry>>,
}

/// Copies a remote selection into a per-job local directory so external
/// consumers (editors, drag-out targets) see plain files. Walks
/// recursively through the `RemoteClient` seam, bounded in depth so
/// symlink loops and pathological trees terminate.
#[derive(Clone)]
pub struct StagingPreparer {
    inner: Arc<PreparerInner>,
}

impl StagingPreparer {
    pub fn new(remote: Arc<dyn RemoteClient>, config: &EngineConfig) -> Self {
        Self::with_auto_clean(remote, config, true)
    }

    pub fn with_auto_clean(
        remote: Arc<dyn RemoteClient>,
        config: &EngineConfig,
        auto_clean: bool,
    ) -> Self {
        StagingPreparer {
            inner: Arc::new(PreparerInner {
                remote,
                staging_dir: config.staging_dir.clone(),
                max_depth: config.max_recursion_depth.max(1),
                chunk_size: config.chunk_size.max(1),
                auto_clean,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Start staging a selection. The walk runs in the background; poll
    /// `report` or await the job completing through it.
    pub fn begin(&self, remote_paths: Vec<String>) -> EngineResult<StagingJob> {
        let id = Uuid::new_v4().to_string();
        let root = self.inner.staging_dir.join(&id);
        std::fs::create_dir_all(&root)
            .map_err(|e| EngineError::from(e).with_path(root.to_string_lossy()))?;
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut jobs = lock(&self.inner.jobs);
            jobs.insert(
                id.clone(),
                JobEntry {
                    root: root.clone(),
                    cancel: cancel.clone(),
                    report: None,
                },
            );
        }
        info!("staging job {} started ({} selections)", id, remote_paths.len());

        let inner = self.inner.clone();
        let job_id = id.clone();
        let job_root = root.clone();
        let job_cancel = cancel.clone();
        tokio::spawn(async move {
            let report = run_walk(&inner, &job_id, &job_root, remote_paths, job_cancel).await;
            info!("staging job {}: {}", job_id, report.summary());
            let mut jobs = lock(&inner.jobs);
            if let Some(entry) = jobs.get_mut(&job_id) {
                entry.report = Some(report);
            }
        });

        Ok(StagingJob { id, root, cancel })
    }

    /// Cooperative cancel; the walk stops at the next file boundary and
    /// keeps what it already staged.
    pub fn cancel(&self, job_id: &str) {
        let jobs = lock(&self.inner.jobs);
        if let Some(entry) = jobs.get(job_id) {
            entry.cancel.store(true, Ordering::Relaxed);
        }
    }

    /// The final report, or `None` while the walk is still running.
    pub fn report(&self, job_id: &str) -> Option<StagingReport> {
        lock(&self.inner.jobs)
            .get(job_id)
            .and_then(|e| e.report.clone())
    }

    /// Drop the job. With auto-clean (or `cleanup`) the staging
    /// directory is removed; a failed removal is logged and swallowed.
    pub fn release(&self, job_id: &str, cleanup: bool) {
        let entry = lock(&self.inner.jobs).remove(job_id);
        if let Some(entry) = entry {
            entry.cancel.store(true, Ordering::Relaxed);
            if cleanup || self.inner.auto_clean {
                if let Err(e) = std::fs::remove_dir_all(&entry.root) {
                    warn!(
                        "staging cleanup of {} failed: {}",
                        entry.root.display(),
                        e
                    );
                }
            }
        }
    }
}

fn lock(m: &Mutex<HashMap<String, JobEntry>>) -> std::sync::MutexGuard<'_, HashMap<String, JobEntry>> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── The walk itself ──────────────────────────────────────────────────────────

struct WalkStats {
    total_files: usize,
    staged: usize,
    failed: usize,
    estimated_bytes: u64,
    sizes_unknown: bool,
    canceled: bool,
}

async fn run_walk(
    inner: &Arc<PreparerInner>,
    job_id: &str,
    root: &Path,
    remote_paths: Vec<String>,
    cancel: Arc<AtomicBool>,
) -> StagingReport {
    let mut stats = WalkStats {
        total_files: 0,
        staged: 0,
        failed: 0,
        estimated_bytes: 0,
        sizes_unknown: false,
        canceled: false,
    };
    for remote_path in remote_paths {
        if cancel.load(Ordering::Relaxed) {
            stats.canceled = true;
            break;
        }
        let name = display_name(&remote_path);
        stage_entry(inner, &remote_path, &root.join(name), 1, &cancel, &mut stats).await;
    }
    stats.canceled |= cancel.load(Ordering::Relaxed);
    StagingReport {
        job_id: job_id.to_string(),
        root: root.to_path_buf(),
        total_files: stats.total_files,
        staged: stats.staged,
        failed: stats.failed,
        estimated_bytes: stats.estimated_bytes,
        sizes_unknown: stats.sizes_unknown,
        canceled: stats.canceled,
    }
}

/// Stage one entry, recursing into directories. Failures are tallied
/// and the walk moves on; only cancellation stops it.
async fn stage_entry(
    inner: &Arc<PreparerInner>,
    remote_path: &str,
    local_path: &Path,
    depth: u32,
    cancel: &Arc<AtomicBool>,
    stats: &mut WalkStats,
) {
    if cancel.load(Ordering::Relaxed) {
        stats.canceled = true;
        return;
    }
    if depth > inner.max_depth {
        // Symlink loop or pathological nesting; prune the subtree.
        warn!(
            "staging: pruning {} at depth {} (recursion bound)",
            remote_path, depth
        );
        stats.total_files += 1;
        stats.failed += 1;
        return;
    }

    let stat = match inner.remote.stat(remote_path).await {
        Ok(s) => s,
        Err(e) => {
            warn!("staging: stat {} failed: {}", remote_path, e);
            stats.total_files += 1;
            stats.failed += 1;
            return;
        }
    };

    // Walk through symlinks at their target; loops are caught by the
    // depth bound.
    let mut walk_path = remote_path.to_string();
    let entry_type = if stat.entry_type == EntryType::Symlink {
        match link_target(inner, remote_path).await {
            Some((target, t)) => {
                walk_path = target;
                t
            }
            None => {
                stats.total_files += 1;
                stats.failed += 1;
                return;
            }
        }
    } else {
        stat.entry_type
    };

    match entry_type {
        EntryType::Directory => {
            if let Err(e) = std::fs::create_dir_all(local_path) {
                warn!("staging: mkdir {} failed: {}", local_path.display(), e);
                stats.failed += 1;
                return;
            }
            let children = match inner.remote.list_dir(&walk_path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("staging: list {} failed: {}", remote_path, e);
                    stats.failed += 1;
                    return;
                }
            };
            for child in children {
                Box::pin(stage_entry(
                    inner,
                    &child.path,
                    &local_path.join(&child.name),
                    depth + 1,
                    cancel,
                    stats,
                ))
                .await;
                if stats.canceled {
                    return;
                }
            }
        }
        _ => {
            stats.total_files += 1;
            match stat.size {
                Some(s) => stats.estimated_bytes += s,
                None => stats.sizes_unknown = true,
            }
            match stage_file(inner, &walk_path, local_path, stat.size).await {
                Ok(()) => stats.staged += 1,
                Err(e) => {
                    warn!("staging: {} failed: {}", remote_path, e);
                    stats.failed += 1;
                }
            }
        }
    }
}

/// Resolve what a symlink points at; `None` for broken links.
async fn link_target(inner: &Arc<PreparerInner>, path: &str) -> Option<(String, EntryType)> {
    let target = inner.remote.read_link(path).await.ok().flatten()?;
    let stat = inner.remote.stat(&target).await.ok()?;
    Some((target, stat.entry_type))
}

async fn stage_file(
    inner: &Arc<PreparerInner>,
    remote_path: &str,
    local_path: &Path,
    size: Option<u64>,
) -> EngineResult<()> {
    use std::io::Write;
    if let Some(parent) = local_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::from(e).with_path(parent.to_string_lossy()))?;
    }
    let mut file = std::fs::File::create(local_path)
        .map_err(|e| EngineError::from(e).with_path(local_path.to_string_lossy()))?;
    let mut offset = 0u64;
    loop {
        if let Some(total) = size {
            if offset >= total {
                break;
            }
        }
        let data = inner
            .remote
            .read_chunk(remote_path, offset, inner.chunk_size)
            .await?;
        if data.is_empty() {
            break;
        }
        file.write_all(&data)
            .map_err(|e| EngineError::from(e).with_path(local_path.to_string_lossy()))?;
        offset += data.len() as u64;
    }
    file.flush()
        .map_err(|e| EngineError::new(ErrorKind::LocalIo, e.to_string()))?;
    Ok(())
}

fn display_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("root")
        .to_string()
}
