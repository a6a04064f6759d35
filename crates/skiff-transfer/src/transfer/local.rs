// ── LocalFsClient – the local pane behind the RemoteClient seam ─────────────

use async_trait::async_trait;
use skiff_core::{EngineError, EngineResult};
use skiff_sftp::sftp::file_ops::format_permissions;
use skiff_sftp::sftp::types::{DirEntry, EntryType, FileStat};
use skiff_sftp::RemoteClient;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Presents the local filesystem through the same interface the engine
/// drives remotes with, so uploads and downloads are one code path with
/// the ends swapped.
pub struct LocalFsClient {
    /// All paths are interpreted relative to this root; pass `/` (or a
    /// drive root) for whole-filesystem access.
    root: PathBuf,
}

impl LocalFsClient {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFsClient { root: root.into() }
    }

    fn real(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn entry_type_of(meta: &fs::Metadata) -> EntryType {
    let ft = meta.file_type();
    if ft.is_dir() {
        EntryType::Directory
    } else if ft.is_symlink() {
        EntryType::Symlink
    } else if ft.is_file() {
        EntryType::File
    } else {
        EntryType::Unknown
    }
}

fn mode_of(meta: &fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() {
            0o444
        } else {
            0o644
        }
    }
}

fn mtime_of(meta: &fs::Metadata) -> Option<u64> {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
}

fn stat_path(path: &str, real: &Path) -> EngineResult<FileStat> {
    let meta = fs::symlink_metadata(real)
        .map_err(|e| EngineError::from(e).with_path(path))?;
    let entry_type = entry_type_of(&meta);
    let link_target = if entry_type == EntryType::Symlink {
        fs::read_link(real)
            .ok()
            .map(|p| p.to_string_lossy().to_string())
    } else {
        None
    };
    Ok(FileStat {
        path: path.to_string(),
        size: if entry_type == EntryType::File {
            Some(meta.len())
        } else {
            None
        },
        permissions: mode_of(&meta),
        permissions_string: format_permissions(mode_of(&meta), entry_type),
        modified: mtime_of(&meta),
        entry_type,
        link_target,
    })
}

#[async_trait]
impl RemoteClient for LocalFsClient {
    async fn stat(&self, path: &str) -> EngineResult<FileStat> {
        stat_path(path, &self.real(path))
    }

    async fn exists(&self, path: &str) -> EngineResult<bool> {
        Ok(self.real(path).symlink_metadata().is_ok())
    }

    async fn list_dir(&self, path: &str) -> EngineResult<Vec<DirEntry>> {
        let real = self.real(path);
        let read = fs::read_dir(&real).map_err(|e| EngineError::from(e).with_path(path))?;
        let mut entries = Vec::new();
        for item in read {
            let item = item.map_err(|e| EngineError::from(e).with_path(path))?;
            let name = item.file_name().to_string_lossy().to_string();
            let child = format!("{}/{}", path.trim_end_matches('/'), name);
            let st = stat_path(&child, &item.path())?;
            entries.push(DirEntry {
                is_hidden: name.starts_with('.'),
                name,
                path: child,
                entry_type: st.entry_type,
                size: st.size,
                permissions: st.permissions,
                permissions_string: st.permissions_string,
                modified: st.modified,
                link_target: st.link_target,
            });
        }
        Ok(entries)
    }

    async fn mkdir(&self, path: &str) -> EngineResult<()> {
        fs::create_dir(self.real(path)).map_err(|e| EngineError::from(e).with_path(path))
    }

    async fn remove_file(&self, path: &str) -> EngineResult<()> {
        fs::remove_file(self.real(path)).map_err(|e| EngineError::from(e).with_path(path))
    }

    async fn remove_dir(&self, path: &str) -> EngineResult<()> {
        fs::remove_dir(self.real(path)).map_err(|e| EngineError::from(e).with_path(path))
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> EngineResult<()> {
        let target = self.real(to);
        if !overwrite && target.symlink_metadata().is_ok() {
            return Err(EngineError::conflict(format!("Target exists: {}", to)).with_path(to));
        }
        fs::rename(self.real(from), target).map_err(|e| EngineError::from(e).with_path(from))
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> EngineResult<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(self.real(path), fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| EngineError::from(e).with_path(path))
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            Ok(())
        }
    }

    async fn read_chunk(&self, path: &str, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
        let mut file =
            fs::File::open(self.real(path)).map_err(|e| EngineError::from(e).with_path(path))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| EngineError::from(e).with_path(path))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file
                .read(&mut buf[filled..])
                .map_err(|e| EngineError::from(e).with_path(path))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write_chunk(&self, path: &str, offset: u64, data: &[u8]) -> EngineResult<()> {
        let real = self.real(path);
        if let Some(parent) = real.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::from(e).with_path(path))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&real)
            .map_err(|e| EngineError::from(e).with_path(path))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| EngineError::from(e).with_path(path))?;
        file.write_all(data)
            .map_err(|e| EngineError::from(e).with_path(path))
    }

    async fn read_link(&self, path: &str) -> EngineResult<Option<String>> {
        Ok(fs::read_link(self.real(path))
            .ok()
            .map(|p| p.to_string_lossy().to_string()))
    }
}
