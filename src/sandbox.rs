//! Path confinement for every file-touching action.
//!
//! `safe_path` is purely lexical and never touches the filesystem, so a
//! traversal attempt is rejected before any syscall. `resolve` adds a second
//! pass that follows symlinks on the existing part of the path.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::{AgentError, AgentResult};

/// Lexically normalise `path`, collapsing `.` and `..` segments.
pub fn normalise(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `/..` stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Join `rel` onto `base` and reject anything that normalises outside it.
///
/// An absolute `rel` is treated as relative to `base`.
pub fn safe_path(base: &str, rel: &str) -> AgentResult<PathBuf> {
    if base.is_empty() {
        return Err(AgentError::NotConfigured);
    }
    let clean_base = normalise(Path::new(base));
    let joined = normalise(&Path::new(base).join(rel.trim_start_matches('/')));
    if !is_sub_path(&clean_base, &joined) {
        return Err(AgentError::OutOfSandbox);
    }
    Ok(joined)
}

fn is_sub_path(base: &Path, target: &Path) -> bool {
    match target.strip_prefix(base) {
        Ok(rest) => !matches!(rest.components().next(), Some(Component::ParentDir)),
        Err(_) => false,
    }
}

/// `safe_path` followed by a symlink check on the deepest existing ancestor.
///
/// A link inside `base` that points outside it is rejected, as is a dangling
/// link, whose eventual target cannot be checked.
pub fn resolve(base: &str, rel: &str) -> AgentResult<PathBuf> {
    let abs = safe_path(base, rel)?;
    confine(Path::new(base), &abs)?;
    Ok(abs)
}

/// Confinement for operations that act on a link rather than its target.
///
/// Only the parent directory is resolved, so an escaping symlink inside `base`
/// can still be removed or renamed. The base itself is never a valid target.
pub fn resolve_link(base: &str, rel: &str) -> AgentResult<PathBuf> {
    let abs = safe_path(base, rel)?;
    if abs == normalise(Path::new(base)) {
        return Err(AgentError::OutOfSandbox);
    }
    let parent = abs.parent().ok_or(AgentError::OutOfSandbox)?;
    confine(Path::new(base), parent)?;
    Ok(abs)
}

/// Symlink check for an absolute path already known to sit lexically under
/// `base`.
pub fn confine(base: &Path, abs: &Path) -> AgentResult<()> {
    let Ok(canonical_base) = std::fs::canonicalize(base) else {
        // nothing on disk yet; the operation itself will fail
        return Ok(());
    };

    let mut current_path = Some(abs);
    while let Some(current) = current_path {
        match std::fs::canonicalize(current) {
            Ok(real) => {
                return if real.starts_with(&canonical_base) {
                    Ok(())
                } else {
                    Err(AgentError::OutOfSandbox)
                };
            }
            Err(_) => {
                let dangling = current
                    .symlink_metadata()
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false);
                if dangling {
                    return Err(AgentError::OutOfSandbox);
                }
                current_path = current.parent();
            }
        }
    }
    Ok(())
}

/// Pick the filesystem base for a server.
///
/// `volumeMap` wins over `containerMap`; both are relative to `file_root`.
/// A mapped base that does not exist on disk falls back to `file_root`.
pub fn resolve_base(
    file_root: &str,
    volume_map: &HashMap<String, String>,
    container_map: &HashMap<String, String>,
    server_id: &str,
) -> String {
    if file_root.is_empty() {
        return String::new();
    }

    let mapped = volume_map
        .get(server_id)
        .filter(|dir| !dir.is_empty())
        .or_else(|| container_map.get(server_id).filter(|dir| !dir.is_empty()));

    let Some(dir) = mapped else {
        return file_root.to_string();
    };

    let base = normalise(&Path::new(file_root).join(dir));
    if base.exists() {
        base.to_string_lossy().to_string()
    } else {
        file_root.to_string()
    }
}
