use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::archive::{self, ArchiveKind};
use crate::protocol::now_ts;
use crate::sandbox;
use crate::{AgentError, AgentResult};

const EDITABLE_LIMIT: u64 = 10 * 1024 * 1024; // 10MB

/// Filesystem actions over a server's base directory. Every path argument is
/// relative to the base and goes through the sandbox before any syscall.
pub struct FileManager {
    file_root: String,
    volume_map: HashMap<String, String>,
    container_map: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub mode: String,
    pub size: u64,
    pub is_file: bool,
    pub is_symlink: bool,
    pub is_editable: bool,
    pub mimetype: String,
    pub created_at: String,
    pub modified_at: String,
}

impl FileManager {
    pub fn new(
        file_root: String,
        volume_map: HashMap<String, String>,
        container_map: HashMap<String, String>,
    ) -> Self {
        Self {
            file_root,
            volume_map,
            container_map,
        }
    }

    pub fn file_root(&self) -> &str {
        &self.file_root
    }

    /// Base directory for `server_id`.
    pub fn base_for(&self, server_id: &str) -> String {
        sandbox::resolve_base(
            &self.file_root,
            &self.volume_map,
            &self.container_map,
            server_id,
        )
    }

    pub async fn list_dir(&self, base: &str, path: &str) -> AgentResult<Vec<FileEntry>> {
        let full_path = sandbox::resolve(base, path)?;

        debug!("Listing directory: {:?}", full_path);

        let mut dir = fs::read_dir(&full_path)
            .await
            .map_err(|e| AgentError::FileSystemError(format!("Failed to read dir: {}", e)))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| AgentError::FileSystemError(format!("Error reading dir entry: {}", e)))?
        {
            // Entries that vanish between readdir and stat are skipped.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };

            let is_file = !metadata.is_dir();
            let size = metadata.len();
            let modified_at = metadata
                .modified()
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();

            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                mode: octal_mode(metadata.permissions().mode()),
                size,
                is_file,
                is_symlink: metadata.file_type().is_symlink(),
                is_editable: is_file && size < EDITABLE_LIMIT,
                mimetype: String::new(),
                created_at: modified_at.clone(),
                modified_at,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        info!(
            "Directory listed: {:?} ({} entries)",
            full_path,
            entries.len()
        );

        Ok(entries)
    }

    pub async fn read_file(&self, base: &str, path: &str) -> AgentResult<String> {
        let full_path = sandbox::resolve(base, path)?;

        debug!("Reading file: {:?}", full_path);

        let content = fs::read(&full_path)
            .await
            .map_err(|e| AgentError::FileSystemError(format!("Failed to read file: {}", e)))?;

        info!(
            "File read successfully: {:?} ({} bytes)",
            full_path,
            content.len()
        );

        Ok(String::from_utf8_lossy(&content).into_owned())
    }

    /// Create or truncate; the parent directory must already exist.
    pub async fn write_file(&self, base: &str, path: &str, content: &str) -> AgentResult<()> {
        let full_path = sandbox::resolve(base, path)?;

        debug!("Writing file: {:?}", full_path);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&full_path)
            .await
            .map_err(|e| AgentError::FileSystemError(format!("Failed to write file: {}", e)))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| AgentError::FileSystemError(format!("Failed to write file: {}", e)))?;
        file.flush().await?;

        info!("File written successfully: {:?}", full_path);

        Ok(())
    }

    pub async fn set_permissions(&self, base: &str, path: &str, mode: &str) -> AgentResult<()> {
        let full_path = sandbox::resolve(base, path)?;
        let mode = parse_mode(mode)?;

        debug!("Setting permissions on {:?} to {:o}", full_path, mode);

        fs::set_permissions(&full_path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| AgentError::FileSystemError(format!("Failed to chmod: {}", e)))?;

        info!("Permissions set: {:?} -> {:o}", full_path, mode);
        Ok(())
    }

    pub async fn create_dir(&self, base: &str, root: &str, name: &str) -> AgentResult<()> {
        let full_path = sandbox::resolve(base, &join_rel(root, name))?;

        debug!("Creating directory: {:?}", full_path);

        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&full_path)
            .await
            .map_err(|e| AgentError::FileSystemError(format!("Failed to create dir: {}", e)))?;

        info!("Directory created: {:?}", full_path);
        Ok(())
    }

    /// Remove each entry recursively, stopping at the first failure. Missing
    /// entries are not an error. A symlink is removed, never its target.
    pub async fn delete_files(&self, base: &str, root: &str, files: &[String]) -> AgentResult<()> {
        for name in files {
            let full_path = sandbox::resolve_link(base, &join_rel(root, name))?;

            debug!("Deleting: {:?}", full_path);

            let metadata = match fs::symlink_metadata(&full_path).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(AgentError::FileSystemError(format!(
                        "Failed to delete: {}",
                        e
                    )))
                }
            };

            let result = if metadata.is_dir() {
                fs::remove_dir_all(&full_path).await
            } else {
                fs::remove_file(&full_path).await
            };
            result.map_err(|e| AgentError::FileSystemError(format!("Failed to delete: {}", e)))?;

            info!("Deleted successfully: {:?}", full_path);
        }
        Ok(())
    }

    pub async fn rename_file(&self, base: &str, root: &str, from: &str, to: &str) -> AgentResult<()> {
        let from_path = sandbox::resolve_link(base, &join_rel(root, from))?;
        let to_path = sandbox::resolve(base, &join_rel(root, to))?;

        debug!("Renaming {:?} -> {:?}", from_path, to_path);

        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| AgentError::FileSystemError(format!("Failed to rename: {}", e)))?;

        info!("Renamed successfully: {:?} -> {:?}", from_path, to_path);

        Ok(())
    }

    /// Copy `location` to a sibling named `<stem>-copy<ext>`.
    pub async fn copy_entry(&self, base: &str, location: &str) -> AgentResult<PathBuf> {
        let src = sandbox::resolve(base, location)?;
        let rel = src
            .strip_prefix(sandbox::normalise(Path::new(base)))
            .map(Path::to_path_buf)
            .map_err(|_| AgentError::OutOfSandbox)?;
        let file_name = rel
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| AgentError::FileSystemError("Cannot copy the base directory".to_string()))?;
        let parent = rel
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let dst = sandbox::resolve(base, &join_rel(&parent, &copy_name(&file_name)))?;

        debug!("Copying {:?} -> {:?}", src, dst);

        let (from, to) = (src.clone(), dst.clone());
        tokio::task::spawn_blocking(move || copy_tree(&from, &to)).await??;

        info!("Copied successfully: {:?} -> {:?}", src, dst);
        Ok(dst)
    }

    /// Zip `files` (relative to `root`) into `root/archive-<ts>.zip` and
    /// return the archive name.
    pub async fn compress_files(&self, base: &str, root: &str, files: &[String]) -> AgentResult<String> {
        if files.is_empty() {
            return Err(AgentError::NoFiles);
        }

        let archive_name = format!("archive-{}.zip", now_ts());
        let archive_path = sandbox::resolve(base, &join_rel(root, &archive_name))?;
        let entry_root = sandbox::safe_path(base, root)?;
        let sources = files
            .iter()
            .map(|name| sandbox::resolve(base, &join_rel(root, name)))
            .collect::<AgentResult<Vec<_>>>()?;

        debug!("Compressing {} paths to {:?}", sources.len(), archive_path);

        let target = archive_path.clone();
        tokio::task::spawn_blocking(move || {
            let entries = archive::collect_entries(&entry_root, &sources)?;
            archive::write_zip(&target, &entries)
        })
        .await??;

        info!("Archive created: {:?}", archive_path);
        Ok(archive_name)
    }

    /// Expand `root/file` next to itself.
    pub async fn decompress_file(&self, base: &str, root: &str, file: &str) -> AgentResult<()> {
        let archive_path = sandbox::resolve(base, &join_rel(root, file))?;
        if ArchiveKind::from_name(file).is_none() {
            return Err(AgentError::UnsupportedArchive);
        }
        let dest = archive_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(AgentError::OutOfSandbox)?;

        debug!("Decompressing {:?} into {:?}", archive_path, dest);

        let (source, target) = (archive_path.clone(), dest.clone());
        let confine_to = PathBuf::from(base);
        tokio::task::spawn_blocking(move || archive::extract(&source, &target, &confine_to))
            .await??;

        info!("Archive decompressed: {:?} -> {:?}", archive_path, dest);
        Ok(())
    }
}

fn join_rel(root: &str, name: &str) -> String {
    Path::new(root)
        .join(name.trim_start_matches('/'))
        .to_string_lossy()
        .to_string()
}

fn octal_mode(mode: u32) -> String {
    let perm = mode & 0o777;
    if perm == 0 {
        "0".to_string()
    } else {
        format!("0{:o}", perm)
    }
}

/// Octal permission bits, with or without a leading zero.
fn parse_mode(mode: &str) -> AgentResult<u32> {
    let trimmed = mode.trim();
    let digits = match trimmed.strip_prefix('0') {
        Some("") => "0",
        Some(rest) => rest,
        None => trimmed,
    };
    let parsed = u32::from_str_radix(digits, 8)
        .map_err(|_| AgentError::InvalidMode(mode.to_string()))?;
    if parsed > 0o7777 {
        return Err(AgentError::InvalidMode(mode.to_string()));
    }
    Ok(parsed)
}

/// `server.jar` -> `server-copy.jar`; the extension starts at the last dot.
fn copy_name(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) => format!("{}-copy{}", &name[..idx], &name[idx..]),
        None => format!("{}-copy", name),
    }
}

/// Recursive copy that never dereferences a symlink: links are recreated
/// with their original target.
fn copy_tree(src: &Path, dst: &Path) -> AgentResult<()> {
    let file_type = std::fs::symlink_metadata(src)?.file_type();
    if file_type.is_symlink() {
        return copy_link(src, dst);
    }
    if !file_type.is_dir() {
        return copy_file(src, dst);
    }

    std::fs::create_dir_all(dst)?;
    for item in WalkDir::new(src).min_depth(1).follow_links(false) {
        let item = item?;
        let rel = item
            .path()
            .strip_prefix(src)
            .map_err(|e| AgentError::FileSystemError(e.to_string()))?;
        let target = dst.join(rel);
        if item.file_type().is_symlink() {
            copy_link(item.path(), &target)?;
        } else if item.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            copy_file(item.path(), &target)?;
        }
    }
    Ok(())
}

fn copy_link(src: &Path, dst: &Path) -> AgentResult<()> {
    let target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)?;
    Ok(())
}

fn copy_file(src: &Path, dst: &Path) -> AgentResult<()> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst)?;
    Ok(())
}
