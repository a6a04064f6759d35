// ── Directory listing and creation helpers ──────────────────────────────────

use crate::sftp::client::{join_remote, RemoteClient};
use crate::sftp::types::{DirEntry, EntryType, ListOptions, SortField};
use skiff_core::{EngineError, EngineResult};
use std::cmp::Ordering;

/// List a remote directory with the usual pane semantics: hidden-file
/// filter, optional glob on names, directories grouped first.
pub async fn list_remote(
    client: &dyn RemoteClient,
    path: &str,
    options: &ListOptions,
) -> EngineResult<Vec<DirEntry>> {
    let mut entries = client.list_dir(path).await?;

    if !options.include_hidden {
        entries.retain(|e| !e.is_hidden);
    }
    if let Some(pattern) = &options.filter_glob {
        let matcher = glob::Pattern::new(pattern)
            .map_err(|e| EngineError::invalid_config(format!("Bad glob '{}': {}", pattern, e)))?;
        entries.retain(|e| matcher.matches(&e.name));
    }

    sort_entries(&mut entries, options.sort_by, options.ascending);
    Ok(entries)
}

/// Sort in place: directories before everything else, then by the
/// requested field, name as tiebreaker.
pub fn sort_entries(entries: &mut [DirEntry], field: SortField, ascending: bool) {
    entries.sort_by(|a, b| {
        let a_dir = a.entry_type == EntryType::Directory;
        let b_dir = b.entry_type == EntryType::Directory;
        if a_dir != b_dir {
            return if a_dir { Ordering::Less } else { Ordering::Greater };
        }
        let ord = match field {
            SortField::Name => compare_names(&a.name, &b.name),
            SortField::Size => a.size.unwrap_or(0).cmp(&b.size.unwrap_or(0)),
            SortField::Modified => a.modified.unwrap_or(0).cmp(&b.modified.unwrap_or(0)),
            SortField::Permissions => a.permissions.cmp(&b.permissions),
        }
        .then_with(|| compare_names(&a.name, &b.name));
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
}

fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b))
}

/// Create a directory and any missing ancestors, `mkdir -p` style.
/// Existing directories along the way are not an error.
pub async fn mkdir_p(client: &dyn RemoteClient, path: &str) -> EngineResult<()> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(());
    }
    let mut current = String::new();
    for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
        current = if current.is_empty() && trimmed.starts_with('/') {
            format!("/{}", segment)
        } else if current.is_empty() {
            segment.to_string()
        } else {
            join_remote(&current, segment)
        };
        if client.exists(&current).await? {
            continue;
        }
        match client.mkdir(&current).await {
            Ok(()) => {}
            // A concurrent creator beat us to it.
            Err(e) if e.kind == skiff_core::ErrorKind::Conflict => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
