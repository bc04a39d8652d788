//! Zip writer and zip / tar / tar.gz extractors. All functions block.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::sandbox;
use crate::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveKind {
    pub fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveKind::Tar)
        } else {
            None
        }
    }
}

/// Every regular file under each source, paired with its entry name relative
/// to `entry_root`. Directories are not listed on their own and symlinks are
/// skipped so an archive never pulls in content from outside the tree.
pub fn collect_entries(entry_root: &Path, sources: &[PathBuf]) -> AgentResult<Vec<(PathBuf, String)>> {
    let mut entries = Vec::new();
    for source in sources {
        for item in WalkDir::new(source).follow_links(false) {
            let item = item?;
            if item.file_type().is_dir() || item.file_type().is_symlink() {
                continue;
            }
            let name = match item.path().strip_prefix(entry_root) {
                Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().to_string(),
                _ => item.file_name().to_string_lossy().to_string(),
            };
            entries.push((item.path().to_path_buf(), name));
        }
    }
    Ok(entries)
}

pub fn write_zip(archive_path: &Path, entries: &[(PathBuf, String)]) -> AgentResult<()> {
    let out = File::create(archive_path)?;
    let mut writer = ZipWriter::new(BufWriter::new(out));

    for (path, name) in entries {
        let meta = fs::metadata(path)?;
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(meta.permissions().mode() & 0o777)
            .large_file(meta.len() >= u32::MAX as u64);
        writer.start_file(name.as_str(), options)?;
        let mut input = File::open(path)?;
        io::copy(&mut input, &mut writer)?;
    }

    writer.finish()?;
    debug!("Wrote {} entries to {:?}", entries.len(), archive_path);
    Ok(())
}

/// Expand `archive_path` into `dest` according to its suffix. Every entry
/// must land under `base` once symlinks already on disk are followed.
pub fn extract(archive_path: &Path, dest: &Path, base: &Path) -> AgentResult<()> {
    let name = archive_path.to_string_lossy();
    let target = Extractor { dest, base };
    match ArchiveKind::from_name(&name) {
        Some(ArchiveKind::Zip) => target.unzip(archive_path),
        Some(ArchiveKind::TarGz) => {
            let file = File::open(archive_path)?;
            target.untar(GzDecoder::new(BufReader::new(file)))
        }
        Some(ArchiveKind::Tar) => target.untar(BufReader::new(File::open(archive_path)?)),
        None => Err(AgentError::UnsupportedArchive),
    }
}

struct Extractor<'a> {
    dest: &'a Path,
    base: &'a Path,
}

impl Extractor<'_> {
    fn unzip(&self, archive_path: &Path) -> AgentResult<()> {
        let mut archive = ZipArchive::new(BufReader::new(File::open(archive_path)?))?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_string();
            if entry.is_dir() {
                fs::create_dir_all(self.dir_target(&name)?)?;
                continue;
            }
            write_entry(&self.file_target(&name)?, &mut entry)?;
        }
        Ok(())
    }

    fn untar<R: Read>(&self, reader: R) -> AgentResult<()> {
        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_type = entry.header().entry_type();
            let name = entry.path()?.to_string_lossy().to_string();
            if entry_type.is_dir() {
                fs::create_dir_all(self.dir_target(&name)?)?;
            } else if entry_type.is_file() {
                write_entry(&self.file_target(&name)?, &mut entry)?;
            } else {
                debug!("Skipping tar entry {} ({:?})", name, entry_type);
            }
        }
        Ok(())
    }

    fn dir_target(&self, name: &str) -> AgentResult<PathBuf> {
        let target = sandbox::safe_path(&self.dest.to_string_lossy(), name)?;
        sandbox::confine(self.base, &target)?;
        Ok(target)
    }

    /// A symlink already sitting at the leaf is replaced, not written through.
    fn file_target(&self, name: &str) -> AgentResult<PathBuf> {
        let target = sandbox::safe_path(&self.dest.to_string_lossy(), name)?;
        let parent = target.parent().ok_or(AgentError::OutOfSandbox)?;
        sandbox::confine(self.base, parent)?;
        let is_link = fs::symlink_metadata(&target)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            fs::remove_file(&target)?;
        }
        Ok(target)
    }
}

fn write_entry(target: &Path, reader: &mut impl Read) -> AgentResult<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(target)?);
    io::copy(reader, &mut out)?;
    Ok(())
}
