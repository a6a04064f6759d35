// ── MemoryRemoteClient – in-memory RemoteClient for tests ───────────────────

use crate::sftp::client::{join_remote, parent_remote, RemoteClient};
use crate::sftp::file_ops::format_permissions;
use crate::sftp::types::{DirEntry, EntryType, FileStat};
use async_trait::async_trait;
use skiff_core::{EngineError, EngineResult, ErrorKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, perm: u32 },
    Dir { perm: u32 },
    Symlink { target: String },
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    /// Paths whose size should be reported as unknown.
    unsized_paths: Vec<String>,
    /// Remaining transient failures per path; decremented on each access.
    transient_failures: HashMap<String, u32>,
    /// Paths that always fail with the given kind.
    permanent_failures: HashMap<String, ErrorKind>,
    read_ops: u64,
    write_ops: u64,
}

/// An in-memory remote filesystem. Paths are absolute, slash-separated.
/// Failure injection lets tests script transient errors (fail N times,
/// then succeed) and permanent ones.
pub struct MemoryRemoteClient {
    inner: Mutex<Inner>,
    resume_supported: bool,
}

impl Default for MemoryRemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteClient {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.nodes.insert("/".to_string(), Node::Dir { perm: 0o755 });
        MemoryRemoteClient {
            inner: Mutex::new(inner),
            resume_supported: true,
        }
    }

    pub fn without_resume(mut self) -> Self {
        self.resume_supported = false;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Seed a file, creating parent directories.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let mut inner = self.lock();
        ensure_parents(&mut inner.nodes, path);
        inner.nodes.insert(
            path.to_string(),
            Node::File {
                data: data.to_vec(),
                perm: 0o644,
            },
        );
    }

    /// Seed a directory, creating parents.
    pub fn put_dir(&self, path: &str) {
        let mut inner = self.lock();
        ensure_parents(&mut inner.nodes, path);
        inner
            .nodes
            .insert(path.to_string(), Node::Dir { perm: 0o755 });
    }

    /// Seed a symlink. The target may be absolute or relative to the
    /// link's parent directory.
    pub fn put_symlink(&self, path: &str, target: &str) {
        let mut inner = self.lock();
        ensure_parents(&mut inner.nodes, path);
        inner.nodes.insert(
            path.to_string(),
            Node::Symlink {
                target: target.to_string(),
            },
        );
    }

    /// Report this file's size as unknown in `stat` and listings.
    pub fn mark_unsized(&self, path: &str) {
        self.lock().unsized_paths.push(path.to_string());
    }

    /// Fail the next `count` accesses to `path` with a transient error.
    pub fn fail_transient(&self, path: &str, count: u32) {
        self.lock()
            .transient_failures
            .insert(path.to_string(), count);
    }

    /// Fail every access to `path` with the given error kind.
    pub fn fail_always(&self, path: &str, kind: ErrorKind) {
        self.lock()
            .permanent_failures
            .insert(path.to_string(), kind);
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().nodes.get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    pub fn read_ops(&self) -> u64 {
        self.lock().read_ops
    }

    pub fn write_ops(&self) -> u64 {
        self.lock().write_ops
    }

    fn check_failures(&self, inner: &mut Inner, path: &str) -> EngineResult<()> {
        if let Some(kind) = inner.permanent_failures.get(path) {
            return Err(EngineError::new(*kind, format!("injected failure: {}", path))
                .with_path(path));
        }
        if let Some(remaining) = inner.transient_failures.get_mut(path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EngineError::disconnected(format!(
                    "injected transient failure: {}",
                    path
                ))
                .with_path(path));
            }
        }
        Ok(())
    }
}

fn ensure_parents(nodes: &mut BTreeMap<String, Node>, path: &str) {
    let mut current = parent_remote(path);
    let mut missing = Vec::new();
    while let Some(dir) = current {
        if nodes.contains_key(&dir) {
            break;
        }
        current = parent_remote(&dir);
        missing.push(dir);
    }
    for dir in missing.into_iter().rev() {
        nodes.insert(dir, Node::Dir { perm: 0o755 });
    }
}

fn resolve_target(link_path: &str, target: &str) -> String {
    if target.starts_with('/') {
        target.to_string()
    } else {
        let parent = parent_remote(link_path).unwrap_or_else(|| "/".to_string());
        join_remote(&parent, target)
    }
}

fn node_stat(path: &str, node: &Node, unsized_: bool) -> FileStat {
    match node {
        Node::File { data, perm } => FileStat {
            path: path.to_string(),
            size: if unsized_ { None } else { Some(data.len() as u64) },
            permissions: *perm,
            permissions_string: format_permissions(*perm, EntryType::File),
            modified: None,
            entry_type: EntryType::File,
            link_target: None,
        },
        Node::Dir { perm } => FileStat {
            path: path.to_string(),
            size: None,
            permissions: *perm,
            permissions_string: format_permissions(*perm, EntryType::Directory),
            modified: None,
            entry_type: EntryType::Directory,
            link_target: None,
        },
        Node::Symlink { target } => FileStat {
            path: path.to_string(),
            size: None,
            permissions: 0o777,
            permissions_string: format_permissions(0o777, EntryType::Symlink),
            modified: None,
            entry_type: EntryType::Symlink,
            link_target: Some(target.clone()),
        },
    }
}

#[async_trait]
impl RemoteClient for MemoryRemoteClient {
    async fn stat(&self, path: &str) -> EngineResult<FileStat> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, path)?;
        let node = inner
            .nodes
            .get(path)
            .ok_or_else(|| EngineError::not_found(path).with_path(path))?;
        let unsized_ = inner.unsized_paths.iter().any(|p| p == path);
        Ok(node_stat(path, node, unsized_))
    }

    async fn exists(&self, path: &str) -> EngineResult<bool> {
        Ok(self.lock().nodes.contains_key(path))
    }

    async fn list_dir(&self, path: &str) -> EngineResult<Vec<DirEntry>> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, path)?;
        match inner.nodes.get(path) {
            Some(Node::Dir { .. }) => {}
            Some(_) => {
                return Err(EngineError::protocol(format!("Not a directory: {}", path))
                    .with_path(path))
            }
            None => return Err(EngineError::not_found(path).with_path(path)),
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path.trim_end_matches('/'))
        };
        let mut entries = Vec::new();
        for (child, node) in inner.nodes.range(prefix.clone()..) {
            if !child.starts_with(&prefix) {
                break;
            }
            let rest = &child[prefix.len()..];
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            let unsized_ = inner.unsized_paths.iter().any(|p| p == child);
            let st = node_stat(child, node, unsized_);
            entries.push(DirEntry {
                name: rest.to_string(),
                path: child.clone(),
                entry_type: st.entry_type,
                size: st.size,
                permissions: st.permissions,
                permissions_string: st.permissions_string,
                modified: st.modified,
                is_hidden: rest.starts_with('.'),
                link_target: st.link_target,
            });
        }
        Ok(entries)
    }

    async fn mkdir(&self, path: &str) -> EngineResult<()> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, path)?;
        if inner.nodes.contains_key(path) {
            return Err(EngineError::conflict(format!("Already exists: {}", path))
                .with_path(path));
        }
        ensure_parents(&mut inner.nodes, path);
        inner
            .nodes
            .insert(path.to_string(), Node::Dir { perm: 0o755 });
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> EngineResult<()> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, path)?;
        match inner.nodes.get(path) {
            Some(Node::Dir { .. }) => Err(EngineError::protocol(format!(
                "Is a directory: {}",
                path
            ))
            .with_path(path)),
            Some(_) => {
                inner.nodes.remove(path);
                Ok(())
            }
            None => Err(EngineError::not_found(path).with_path(path)),
        }
    }

    async fn remove_dir(&self, path: &str) -> EngineResult<()> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, path)?;
        match inner.nodes.get(path) {
            Some(Node::Dir { .. }) => {
                let prefix = format!("{}/", path.trim_end_matches('/'));
                if inner.nodes.keys().any(|k| k.starts_with(&prefix)) {
                    return Err(EngineError::protocol(format!(
                        "Directory not empty: {}",
                        path
                    ))
                    .with_path(path));
                }
                inner.nodes.remove(path);
                Ok(())
            }
            Some(_) => Err(EngineError::protocol(format!("Not a directory: {}", path))
                .with_path(path)),
            None => Err(EngineError::not_found(path).with_path(path)),
        }
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> EngineResult<()> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, from)?;
        if !overwrite && inner.nodes.contains_key(to) {
            return Err(EngineError::conflict(format!("Target exists: {}", to)).with_path(to));
        }
        let node = inner
            .nodes
            .remove(from)
            .ok_or_else(|| EngineError::not_found(from).with_path(from))?;
        // Move children along with a directory.
        let prefix = format!("{}/", from.trim_end_matches('/'));
        let children: Vec<String> = inner
            .nodes
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        for child in children {
            if let Some(n) = inner.nodes.remove(&child) {
                let new_key = format!("{}/{}", to.trim_end_matches('/'), &child[prefix.len()..]);
                inner.nodes.insert(new_key, n);
            }
        }
        ensure_parents(&mut inner.nodes, to);
        inner.nodes.insert(to.to_string(), node);
        Ok(())
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> EngineResult<()> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, path)?;
        match inner.nodes.get_mut(path) {
            Some(Node::File { perm, .. }) | Some(Node::Dir { perm }) => {
                *perm = mode & 0o7777;
                Ok(())
            }
            Some(Node::Symlink { .. }) => Ok(()),
            None => Err(EngineError::not_found(path).with_path(path)),
        }
    }

    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, path)?;
        inner.read_ops += 1;
        // Follow one level of symlink, like an SFTP open would.
        let resolved = match inner.nodes.get(path) {
            Some(Node::Symlink { target }) => resolve_target(path, target),
            _ => path.to_string(),
        };
        match inner.nodes.get(&resolved) {
            Some(Node::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let end = (start + len).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(_) => Err(EngineError::protocol(format!("Not a file: {}", path))
                .with_path(path)),
            None => Err(EngineError::not_found(path).with_path(path)),
        }
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> EngineResult<()> {
        let mut inner = self.lock();
        self.check_failures(&mut inner, path)?;
        inner.write_ops += 1;
        ensure_parents(&mut inner.nodes, path);
        let entry = inner
            .nodes
            .entry(path.to_string())
            .or_insert_with(|| Node::File {
                data: Vec::new(),
                perm: 0o644,
            });
        match entry {
            Node::File { data: existing, .. } => {
                let end = offset as usize + data.len();
                if existing.len() < end {
                    existing.resize(end, 0);
                }
                existing[offset as usize..end].copy_from_slice(data);
                Ok(())
            }
            _ => Err(EngineError::protocol(format!("Not a file: {}", path)).with_path(path)),
        }
    }

    async fn read_link(&self, path: &str) -> EngineResult<Option<String>> {
        Ok(match self.lock().nodes.get(path) {
            Some(Node::Symlink { target }) => Some(resolve_target(path, target)),
            _ => None,
        })
    }

    fn supports_resume(&self) -> bool {
        self.resume_supported
    }
}
