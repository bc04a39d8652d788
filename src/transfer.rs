//! Chunked upload and download sessions.
//!
//! Both tables are owned by a single connection's dispatcher and die with it.
//! Uploads must arrive in strict index order starting at 0; downloads are
//! random access in fixed-size chunks.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{AgentError, AgentResult};

pub const DOWNLOAD_CHUNK_SIZE: u64 = 256 * 1024;

pub struct UploadSession {
    temp_path: PathBuf,
    file: fs::File,
    target: PathBuf,
    expected_size: u64,
    next_index: u64,
    written: u64,
}

impl UploadSession {
    /// Create the target's parent directory and an empty temp file in `temp_dir`.
    pub async fn create(temp_dir: &Path, target: PathBuf, expected_size: u64) -> AgentResult<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = temp_dir.join(format!("agent-upload-{}", Uuid::new_v4()));
        let file = fs::File::create(&temp_path).await?;

        debug!("Upload staged at {:?} for {:?}", temp_path, target);

        Ok(Self {
            temp_path,
            file,
            target,
            expected_size,
            next_index: 0,
            written: 0,
        })
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Append `data` if `index` is the next expected one. A wrong index leaves
    /// the session untouched.
    pub async fn write_chunk(&mut self, index: u64, data: &[u8]) -> AgentResult<()> {
        if index != self.next_index {
            return Err(AgentError::UnexpectedChunkIndex {
                expected: self.next_index,
                got: index,
            });
        }
        self.file.write_all(data).await?;
        self.next_index += 1;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Move the temp file onto the target. The temp file is removed on failure.
    pub async fn commit(mut self) -> AgentResult<PathBuf> {
        if self.written != self.expected_size {
            warn!(
                "Upload size mismatch for {:?}: declared {} bytes, received {}",
                self.target, self.expected_size, self.written
            );
        }

        let result = self.finish_file().await;
        if let Err(err) = result {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }

        info!(
            "Upload committed: {:?} ({} bytes, {} chunks)",
            self.target, self.written, self.next_index
        );
        Ok(self.target)
    }

    async fn finish_file(&mut self) -> AgentResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        match fs::rename(&self.temp_path, &self.target).await {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32) => {
                debug!(
                    "Cross-device upload commit, copying {:?} -> {:?}",
                    self.temp_path, self.target
                );
                fs::copy(&self.temp_path, &self.target).await?;
                fs::remove_file(&self.temp_path).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drop the session and its temp file.
    pub async fn abort(self) {
        let UploadSession {
            temp_path, file, ..
        } = self;
        drop(file);
        if let Err(err) = fs::remove_file(&temp_path).await {
            debug!("Failed to remove upload temp {:?}: {}", temp_path, err);
        }
    }
}

pub struct DownloadSession {
    file: fs::File,
    size: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct DownloadChunk {
    pub data: Vec<u8>,
    pub done: bool,
}

/// Per-connection transfer state.
pub struct Transfers {
    temp_dir: PathBuf,
    uploads: HashMap<String, UploadSession>,
    downloads: HashMap<String, DownloadSession>,
}

impl Transfers {
    pub fn new(temp_dir: PathBuf) -> Self {
        Self {
            temp_dir,
            uploads: HashMap::new(),
            downloads: HashMap::new(),
        }
    }

    pub async fn start_upload(&mut self, target: PathBuf, expected_size: u64) -> AgentResult<String> {
        let session = UploadSession::create(&self.temp_dir, target, expected_size).await?;
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.insert(upload_id.clone(), session);
        Ok(upload_id)
    }

    pub async fn upload_chunk(&mut self, upload_id: &str, index: u64, data: &[u8]) -> AgentResult<()> {
        let session = self
            .uploads
            .get_mut(upload_id)
            .ok_or(AgentError::UploadNotFound)?;
        session.write_chunk(index, data).await
    }

    pub async fn finish_upload(&mut self, upload_id: &str) -> AgentResult<PathBuf> {
        let session = self
            .uploads
            .remove(upload_id)
            .ok_or(AgentError::UploadNotFound)?;
        session.commit().await
    }

    pub fn upload_next_index(&self, upload_id: &str) -> Option<u64> {
        self.uploads.get(upload_id).map(UploadSession::next_index)
    }

    pub async fn start_download(&mut self, path: &Path) -> AgentResult<String> {
        let file = fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let download_id = random_id();
        self.downloads
            .insert(download_id.clone(), DownloadSession { file, size });
        debug!("Download {} opened for {:?} ({} bytes)", download_id, path, size);
        Ok(download_id)
    }

    /// Read chunk `index`. The session is removed once a read reaches the end
    /// of the file or fails.
    pub async fn download_chunk(&mut self, download_id: &str, index: u64) -> AgentResult<DownloadChunk> {
        let session = self
            .downloads
            .get_mut(download_id)
            .ok_or(AgentError::DownloadNotFound)?;

        let offset = index.checked_mul(DOWNLOAD_CHUNK_SIZE).unwrap_or(u64::MAX);
        if offset >= session.size {
            self.downloads.remove(download_id);
            return Ok(DownloadChunk {
                data: Vec::new(),
                done: true,
            });
        }

        let data = match read_at(&mut session.file, offset).await {
            Ok(data) => data,
            Err(err) => {
                self.downloads.remove(download_id);
                return Err(err.into());
            }
        };
        let done = offset + data.len() as u64 >= session.size;
        if done {
            self.downloads.remove(download_id);
        }
        Ok(DownloadChunk { data, done })
    }

    #[cfg(test)]
    pub fn has_download(&self, download_id: &str) -> bool {
        self.downloads.contains_key(download_id)
    }

    /// Tear down every session; open uploads lose their temp files.
    pub async fn close_all(&mut self) {
        let uploads: Vec<_> = self.uploads.drain().collect();
        if !uploads.is_empty() {
            info!("Discarding {} unfinished uploads", uploads.len());
        }
        for (_, session) in uploads {
            session.abort().await;
        }
        self.downloads.clear();
    }
}

async fn read_at(file: &mut fs::File, offset: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_SIZE as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

fn random_id() -> String {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ordered_chunks_commit_to_target() {
        let base = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut transfers = Transfers::new(staging.path().to_path_buf());
        let target = base.path().join("a/b.txt");

        let id = transfers.start_upload(target.clone(), 11).await.unwrap();
        transfers.upload_chunk(&id, 0, b"hel").await.unwrap();
        transfers.upload_chunk(&id, 1, b"lo ").await.unwrap();
        transfers.upload_chunk(&id, 2, b"world").await.unwrap();
        transfers.finish_upload(&id).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
        assert!(matches!(
            transfers.finish_upload(&id).await,
            Err(AgentError::UploadNotFound)
        ));
    }

    #[tokio::test]
    async fn out_of_order_chunk_keeps_session_state() {
        let base = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut transfers = Transfers::new(staging.path().to_path_buf());
        let target = base.path().join("plugin.jar");

        let id = transfers.start_upload(target.clone(), 4).await.unwrap();
        transfers.upload_chunk(&id, 0, b"ab").await.unwrap();

        for wrong in [0, 2, 7] {
            let err = transfers.upload_chunk(&id, wrong, b"zz").await.unwrap_err();
            assert!(matches!(
                err,
                AgentError::UnexpectedChunkIndex { expected: 1, got } if got == wrong
            ));
            assert_eq!(transfers.upload_next_index(&id), Some(1));
        }

        transfers.upload_chunk(&id, 1, b"cd").await.unwrap();
        assert_eq!(transfers.upload_next_index(&id), Some(2));
        transfers.finish_upload(&id).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn unknown_upload_is_reported() {
        let staging = tempfile::tempdir().unwrap();
        let mut transfers = Transfers::new(staging.path().to_path_buf());
        assert!(matches!(
            transfers.upload_chunk("nope", 0, b"x").await,
            Err(AgentError::UploadNotFound)
        ));
    }

    #[tokio::test]
    async fn close_all_removes_temp_files() {
        let base = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut transfers = Transfers::new(staging.path().to_path_buf());

        let id = transfers
            .start_upload(base.path().join("x.bin"), 10)
            .await
            .unwrap();
        transfers.upload_chunk(&id, 0, b"partial").await.unwrap();
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 1);

        transfers.close_all().await;
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
        assert!(!base.path().join("x.bin").exists());
        assert_eq!(transfers.upload_next_index(&id), None);
    }

    #[tokio::test]
    async fn download_reads_300_kib_in_two_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.dat");
        let content: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let mut transfers = Transfers::new(dir.path().to_path_buf());
        let id = transfers.start_download(&path).await.unwrap();
        assert_eq!(id.len(), 24);

        let first = transfers.download_chunk(&id, 0).await.unwrap();
        assert_eq!(first.data.len(), 262_144);
        assert!(!first.done);

        let second = transfers.download_chunk(&id, 1).await.unwrap();
        assert_eq!(second.data.len(), 45_056);
        assert!(second.done);
        assert!(!transfers.has_download(&id));

        let mut joined = first.data;
        joined.extend(second.data);
        assert_eq!(joined, content);

        assert!(matches!(
            transfers.download_chunk(&id, 2).await,
            Err(AgentError::DownloadNotFound)
        ));
    }

    #[tokio::test]
    async fn download_past_end_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        std::fs::write(&path, vec![7u8; 1024]).unwrap();

        let mut transfers = Transfers::new(dir.path().to_path_buf());
        let id = transfers.start_download(&path).await.unwrap();

        let chunk = transfers.download_chunk(&id, 2).await.unwrap();
        assert_eq!(chunk, DownloadChunk { data: Vec::new(), done: true });
        assert!(!transfers.has_download(&id));
    }

    #[tokio::test]
    async fn empty_file_download_is_done_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.log");
        std::fs::write(&path, b"").unwrap();

        let mut transfers = Transfers::new(dir.path().to_path_buf());
        let id = transfers.start_download(&path).await.unwrap();
        let chunk = transfers.download_chunk(&id, 0).await.unwrap();
        assert!(chunk.data.is_empty());
        assert!(chunk.done);
        assert!(!transfers.has_download(&id));
    }

    #[tokio::test]
    async fn download_chunks_may_be_requested_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.mca");
        let content: Vec<u8> = (0..600 * 1024).map(|i| (i % 13) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let mut transfers = Transfers::new(dir.path().to_path_buf());
        let id = transfers.start_download(&path).await.unwrap();

        let middle = transfers.download_chunk(&id, 1).await.unwrap();
        let first = transfers.download_chunk(&id, 0).await.unwrap();
        assert!(!middle.done && !first.done);
        assert_eq!(first.data, content[..262_144]);
        assert_eq!(middle.data, content[262_144..524_288]);

        let last = transfers.download_chunk(&id, 2).await.unwrap();
        assert!(last.done);
        assert_eq!(last.data, content[524_288..]);
    }
}
