// ── File-level operations and bulk actions over a RemoteClient ──────────────

use crate::sftp::client::{join_remote, parent_remote, RemoteClient};
use crate::sftp::types::{BulkOutcome, EntryType};
use log::warn;
use skiff_core::{validate_entry_name, EngineError, EngineResult};

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFBLK: u32 = 0o060000;
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;

pub fn entry_type_from_mode(mode: u32) -> EntryType {
    match mode & S_IFMT {
        S_IFDIR => EntryType::Directory,
        S_IFREG => EntryType::File,
        S_IFLNK => EntryType::Symlink,
        S_IFBLK => EntryType::BlockDevice,
        S_IFCHR => EntryType::CharDevice,
        S_IFIFO => EntryType::NamedPipe,
        S_IFSOCK => EntryType::Socket,
        _ => EntryType::Unknown,
    }
}

pub fn entry_type_from_stat(st: &ssh2::FileStat) -> EntryType {
    if st.is_dir() {
        EntryType::Directory
    } else {
        match st.perm {
            Some(perm) => entry_type_from_mode(perm),
            None if st.is_file() => EntryType::File,
            None => EntryType::Unknown,
        }
    }
}

/// `ls -l` style mode string, e.g. `drwxr-xr-x`.
pub fn format_permissions(mode: u32, entry_type: EntryType) -> String {
    let type_char = match entry_type {
        EntryType::Directory => 'd',
        EntryType::Symlink => 'l',
        EntryType::BlockDevice => 'b',
        EntryType::CharDevice => 'c',
        EntryType::NamedPipe => 'p',
        EntryType::Socket => 's',
        EntryType::File | EntryType::Unknown => '-',
    };
    let mut out = String::with_capacity(10);
    out.push(type_char);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Rename an entry within its directory. The new name is validated so one
/// cannot escape the parent with separators or dot segments.
pub async fn rename_entry(
    client: &dyn RemoteClient,
    path: &str,
    new_name: &str,
    overwrite: bool,
) -> EngineResult<String> {
    validate_entry_name(new_name)?;
    let parent = parent_remote(path)
        .ok_or_else(|| EngineError::invalid_name(format!("Cannot rename root: {}", path)))?;
    let target = join_remote(&parent, new_name);
    client.rename(path, &target, overwrite).await?;
    Ok(target)
}

/// Delete several entries, recursing into directories bottom-up. Failures
/// are tallied, not fatal; the sweep continues past them.
pub async fn delete_entries(client: &dyn RemoteClient, paths: &[String]) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();
    for path in paths {
        delete_one(client, path, &mut outcome).await;
    }
    outcome
}

async fn delete_one(client: &dyn RemoteClient, path: &str, outcome: &mut BulkOutcome) {
    let stat = match client.stat(path).await {
        Ok(s) => s,
        Err(e) => {
            warn!("delete: stat {} failed: {}", path, e);
            outcome.record_err(e);
            return;
        }
    };
    if stat.entry_type == EntryType::Directory {
        match client.list_dir(path).await {
            Ok(children) => {
                for child in children {
                    Box::pin(delete_one(client, &child.path, outcome)).await;
                }
            }
            Err(e) => {
                warn!("delete: list {} failed: {}", path, e);
                outcome.record_err(e);
                return;
            }
        }
        match client.remove_dir(path).await {
            Ok(()) => outcome.record_ok(),
            Err(e) => {
                warn!("delete: rmdir {} failed: {}", path, e);
                outcome.record_err(e);
            }
        }
    } else {
        match client.remove_file(path).await {
            Ok(()) => outcome.record_ok(),
            Err(e) => {
                warn!("delete: unlink {} failed: {}", path, e);
                outcome.record_err(e);
            }
        }
    }
}

/// Move entries into `dest_dir`, skipping ones whose target already exists.
pub async fn move_entries(
    client: &dyn RemoteClient,
    paths: &[String],
    dest_dir: &str,
) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();
    for path in paths {
        let name = match path.trim_end_matches('/').rsplit('/').next() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                outcome.record_err(EngineError::invalid_name(format!("Bad source: {}", path)));
                continue;
            }
        };
        let target = join_remote(dest_dir, &name);
        match client.exists(&target).await {
            Ok(true) => {
                outcome.record_skip();
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                outcome.record_err(e);
                continue;
            }
        }
        match client.rename(path, &target, false).await {
            Ok(()) => outcome.record_ok(),
            Err(e) => {
                warn!("move: {} -> {} failed: {}", path, target, e);
                outcome.record_err(e);
            }
        }
    }
    outcome
}

/// Apply a mode to entries, optionally recursing into directories.
pub async fn change_permissions(
    client: &dyn RemoteClient,
    paths: &[String],
    mode: u32,
    recursive: bool,
) -> BulkOutcome {
    let mut outcome = BulkOutcome::default();
    for path in paths {
        chmod_one(client, path, mode, recursive, &mut outcome).await;
    }
    outcome
}

async fn chmod_one(
    client: &dyn RemoteClient,
    path: &str,
    mode: u32,
    recursive: bool,
    outcome: &mut BulkOutcome,
) {
    match client.set_permissions(path, mode).await {
        Ok(()) => outcome.record_ok(),
        Err(e) => {
            warn!("chmod: {} failed: {}", path, e);
            outcome.record_err(e);
            return;
        }
    }
    if recursive {
        if let Ok(stat) = client.stat(path).await {
            if stat.entry_type == EntryType::Directory {
                if let Ok(children) = client.list_dir(path).await {
                    for child in children {
                        Box::pin(chmod_one(client, &child.path, mode, recursive, outcome)).await;
                    }
                }
            }
        }
    }
}
