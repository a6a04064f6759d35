// ── RemoteClient – the seam between the engine and a concrete SFTP backend ──

use crate::sftp::file_ops::{entry_type_from_stat, format_permissions};
use crate::sftp::types::{DirEntry, EntryType, FileStat};
use async_trait::async_trait;
use skiff_core::{EngineError, EngineResult};
use ssh2::{OpenFlags, OpenType, Session};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Everything the transfer engine and bulk operations need from a remote
/// filesystem. Implemented by [`Ssh2RemoteClient`] for real sessions and by
/// a memory-backed client for tests.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn stat(&self, path: &str) -> EngineResult<FileStat>;
    async fn exists(&self, path: &str) -> EngineResult<bool>;
    async fn list_dir(&self, path: &str) -> EngineResult<Vec<DirEntry>>;
    async fn mkdir(&self, path: &str) -> EngineResult<()>;
    async fn remove_file(&self, path: &str) -> EngineResult<()>;
    async fn remove_dir(&self, path: &str) -> EngineResult<()>;
    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> EngineResult<()>;
    async fn set_permissions(&self, path: &str, mode: u32) -> EngineResult<()>;

    /// Read up to `len` bytes starting at `offset`. A short (or empty) read
    /// at end of file is not an error.
    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> EngineResult<Vec<u8>>;

    /// Write `data` at `offset`, creating the file if needed.
    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> EngineResult<()>;

    /// Resolve a symlink target, if the backend supports it.
    async fn read_link(&self, path: &str) -> EngineResult<Option<String>>;

    /// Whether offset reads/writes are supported; when false, transfers
    /// always restart from byte zero.
    fn supports_resume(&self) -> bool {
        true
    }
}

// ── ssh2-backed implementation ───────────────────────────────────────────────

/// A [`RemoteClient`] over one ssh2 session. ssh2 sessions are not `Sync`,
/// so each client owns its session and all calls go through a blocking
/// mutex; callers hand the client to exactly one worker at a time.
pub struct Ssh2RemoteClient {
    session: std::sync::Mutex<Session>,
}

impl Ssh2RemoteClient {
    pub fn new(session: Session) -> Self {
        Ssh2RemoteClient {
            session: std::sync::Mutex::new(session),
        }
    }

    fn with_sftp<T>(
        &self,
        op: impl FnOnce(&ssh2::Sftp) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let session = self
            .session
            .lock()
            .map_err(|_| EngineError::protocol("Session lock poisoned"))?;
        let sftp = session.sftp().map_err(EngineError::from)?;
        op(&sftp)
    }
}

fn stat_to_entry(path: &str, name: String, st: &ssh2::FileStat) -> DirEntry {
    let perms = st.perm.unwrap_or(0);
    let entry_type = entry_type_from_stat(st);
    DirEntry {
        is_hidden: name.starts_with('.'),
        name,
        path: path.to_string(),
        entry_type,
        size: st.size,
        permissions: perms & 0o7777,
        permissions_string: format_permissions(perms, entry_type),
        modified: st.mtime,
        link_target: None,
    }
}

#[async_trait]
impl RemoteClient for Ssh2RemoteClient {
    async fn stat(&self, path: &str) -> EngineResult<FileStat> {
        self.with_sftp(|sftp| {
            let st = sftp
                .lstat(Path::new(path))
                .map_err(|e| EngineError::from(e).with_path(path))?;
            let entry_type = entry_type_from_stat(&st);
            let link_target = if entry_type == EntryType::Symlink {
                sftp.readlink(Path::new(path))
                    .ok()
                    .map(|p| p.to_string_lossy().to_string())
            } else {
                None
            };
            let perms = st.perm.unwrap_or(0);
            Ok(FileStat {
                path: path.to_string(),
                size: st.size,
                permissions: perms & 0o7777,
                permissions_string: format_permissions(perms, entry_type),
                modified: st.mtime,
                entry_type,
                link_target,
            })
        })
    }

    async fn exists(&self, path: &str) -> EngineResult<bool> {
        self.with_sftp(|sftp| Ok(sftp.lstat(Path::new(path)).is_ok()))
    }

    async fn list_dir(&self, path: &str) -> EngineResult<Vec<DirEntry>> {
        self.with_sftp(|sftp| {
            let raw = sftp
                .readdir(Path::new(path))
                .map_err(|e| EngineError::from(e).with_path(path))?;
            let mut entries = Vec::with_capacity(raw.len());
            for (entry_path, st) in raw {
                let name = entry_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if name.is_empty() || name == "." || name == ".." {
                    continue;
                }
                let full = join_remote(path, &name);
                let mut entry = stat_to_entry(&full, name, &st);
                if entry.entry_type == EntryType::Symlink {
                    entry.link_target = sftp
                        .readlink(&entry_path)
                        .ok()
                        .map(|p| p.to_string_lossy().to_string());
                }
                entries.push(entry);
            }
            Ok(entries)
        })
    }

    async fn mkdir(&self, path: &str) -> EngineResult<()> {
        self.with_sftp(|sftp| {
            sftp.mkdir(Path::new(path), 0o755)
                .map_err(|e| EngineError::from(e).with_path(path))
        })
    }

    async fn remove_file(&self, path: &str) -> EngineResult<()> {
        self.with_sftp(|sftp| {
            sftp.unlink(Path::new(path))
                .map_err(|e| EngineError::from(e).with_path(path))
        })
    }

    async fn remove_dir(&self, path: &str) -> EngineResult<()> {
        self.with_sftp(|sftp| {
            sftp.rmdir(Path::new(path))
                .map_err(|e| EngineError::from(e).with_path(path))
        })
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> EngineResult<()> {
        self.with_sftp(|sftp| {
            if !overwrite && sftp.lstat(Path::new(to)).is_ok() {
                return Err(
                    EngineError::conflict(format!("Target exists: {}", to)).with_path(to)
                );
            }
            let flags = if overwrite {
                Some(ssh2::RenameFlags::OVERWRITE | ssh2::RenameFlags::ATOMIC)
            } else {
                None
            };
            sftp.rename(Path::new(from), Path::new(to), flags)
                .map_err(|e| EngineError::from(e).with_path(from))
        })
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> EngineResult<()> {
        self.with_sftp(|sftp| {
            let st = ssh2::FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode & 0o7777),
                atime: None,
                mtime: None,
            };
            sftp.setstat(Path::new(path), st)
                .map_err(|e| EngineError::from(e).with_path(path))
        })
    }

    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
        self.with_sftp(|sftp| {
            let mut file = sftp
                .open(Path::new(path))
                .map_err(|e| EngineError::from(e).with_path(path))?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| EngineError::protocol(e.to_string()).with_path(path))?;
            let mut buf = vec![0u8; len];
            let mut filled = 0;
            while filled < len {
                let n = file
                    .read(&mut buf[filled..])
                    .map_err(|e| EngineError::protocol(e.to_string()).with_path(path))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buf.truncate(filled);
            Ok(buf)
        })
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> EngineResult<()> {
        self.with_sftp(|sftp| {
            let mut file = sftp
                .open_mode(
                    Path::new(path),
                    OpenFlags::WRITE | OpenFlags::CREATE,
                    0o644,
                    OpenType::File,
                )
                .map_err(|e| EngineError::from(e).with_path(path))?;
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| EngineError::protocol(e.to_string()).with_path(path))?;
            file.write_all(data)
                .map_err(|e| EngineError::protocol(e.to_string()).with_path(path))
        })
    }

    async fn read_link(&self, path: &str) -> EngineResult<Option<String>> {
        self.with_sftp(|sftp| {
            Ok(sftp
                .readlink(Path::new(path))
                .ok()
                .map(|p| p.to_string_lossy().to_string()))
        })
    }
}

/// Join a remote directory and a child name with forward slashes,
/// regardless of the local platform.
pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Parent of a remote path, `None` for the root.
pub fn parent_remote(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(trimmed[..idx].to_string()),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_remote_handles_root_and_trailing_slash() {
        assert_eq!(join_remote("/", "etc"), "/etc");
        assert_eq!(join_remote("/home/", "user"), "/home/user");
        assert_eq!(join_remote("/home/user", "docs"), "/home/user/docs");
    }

    #[test]
    fn parent_remote_walks_up() {
        assert_eq!(parent_remote("/a/b/c").as_deref(), Some("/a/b"));
        assert_eq!(parent_remote("/a").as_deref(), Some("/"));
        assert_eq!(parent_remote("/"), None);
        assert_eq!(parent_remote("rel"), None);
    }
}
