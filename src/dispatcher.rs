//! Request dispatcher: turns one `REQ` frame into one `RES` frame.
//!
//! A dispatcher belongs to a single connection. It owns that connection's
//! upload and download sessions, which are released by [`Dispatcher::close`].

use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::errors::{AgentError, AgentResult};
use crate::file_manager::FileManager;
use crate::policy::Policy;
use crate::protocol::{now_ts, Action, Message, ResponsePayload};
use crate::runtime_manager::ContainerDriver;
use crate::transfer::Transfers;
use crate::{rcon, sandbox, stats};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ServerPayload {
    server_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CommandPayload {
    server_id: String,
    command: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LogsPayload {
    server_id: String,
    tail: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProcessesPayload {
    limit: usize,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PathPayload {
    server_id: String,
    path: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WritePayload {
    server_id: String,
    path: String,
    content: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ChmodPayload {
    server_id: String,
    path: String,
    mode: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct MkdirPayload {
    server_id: String,
    root: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FilesPayload {
    server_id: String,
    root: String,
    files: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RenamePayload {
    server_id: String,
    root: String,
    from: String,
    to: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CopyPayload {
    server_id: String,
    location: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DecompressPayload {
    server_id: String,
    root: String,
    file: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UploadInitPayload {
    server_id: String,
    path: String,
    size: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UploadChunkPayload {
    upload_id: String,
    index: u64,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct UploadFinishPayload {
    upload_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct DownloadChunkPayload {
    download_id: String,
    index: u64,
}

pub struct Dispatcher {
    config: Arc<AgentConfig>,
    policy: Policy,
    files: FileManager,
    driver: Arc<dyn ContainerDriver>,
    transfers: Transfers,
}

impl Dispatcher {
    pub fn new(config: Arc<AgentConfig>, driver: Arc<dyn ContainerDriver>) -> Self {
        Self::with_temp_dir(config, driver, std::env::temp_dir())
    }

    /// Upload temp files are staged in `temp_dir`.
    pub fn with_temp_dir(
        config: Arc<AgentConfig>,
        driver: Arc<dyn ContainerDriver>,
        temp_dir: PathBuf,
    ) -> Self {
        let files = FileManager::new(
            config.file_root.clone(),
            config.volume_map.clone(),
            config.container_map.clone(),
        );
        Self {
            policy: Policy::new(&config.security),
            files,
            driver,
            transfers: Transfers::new(temp_dir),
            config,
        }
    }

    /// Handle one request and build its response frame.
    pub async fn handle(&mut self, request: &Message) -> Message {
        let started = std::time::Instant::now();
        let payload = match self.dispatch(&request.action, request.payload.as_ref()).await {
            Ok(payload) => payload,
            Err(err) => {
                debug!(
                    request_id = %request.id,
                    action = %request.action,
                    "Request failed: {}",
                    err
                );
                ResponsePayload::failure(err.to_string())
            }
        };

        info!(
            request_id = %request.id,
            action = %request.action,
            success = payload.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Handled request"
        );

        Message::response(&request.id, payload, now_ts())
    }

    /// Drop every transfer session owned by this connection.
    pub async fn close(&mut self) {
        self.transfers.close_all().await;
    }

    async fn dispatch(&mut self, verb: &str, payload: Option<&Value>) -> AgentResult<ResponsePayload> {
        if !self.policy.is_action_allowed(verb) {
            return Err(AgentError::ActionNotAllowed);
        }
        let action = Action::parse(verb).ok_or(AgentError::UnknownAction)?;

        // console output travels in `message`, data stays null
        if action == Action::Command {
            let output = self.run_command(decode(payload)?).await?;
            return Ok(ResponsePayload::with_message(output));
        }

        self.run_action(action, payload).await.map(ResponsePayload::ok)
    }

    async fn run_action(&mut self, action: Action, payload: Option<&Value>) -> AgentResult<Value> {
        if let Some(op) = action.power_op() {
            let p: ServerPayload = decode(payload)?;
            let container = self.resolve_container(&p.server_id).await?;
            self.driver.power(op, &container).await?;
            return Ok(Value::Null);
        }

        match action {
            Action::Stats => {
                let p: ServerPayload = decode(payload)?;
                let container = self.resolve_container(&p.server_id).await?;
                let snapshot = stats::container_stats(self.driver.as_ref(), &container).await?;
                Ok(serde_json::to_value(snapshot)?)
            }
            Action::HostStats => {
                let snapshot = stats::host_stats(self.files.file_root()).await?;
                Ok(serde_json::to_value(snapshot)?)
            }
            Action::Processes => {
                let p: ProcessesPayload = decode_or_default(payload)?;
                Ok(serde_json::to_value(stats::processes(p.limit).await?)?)
            }
            Action::Logs => {
                let p: LogsPayload = decode(payload)?;
                let container = self.resolve_container(&p.server_id).await?;
                let logs = self.driver.logs(&container, p.tail).await?;
                Ok(json!({ "logs": logs }))
            }
            Action::List => {
                let p: PathPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                Ok(serde_json::to_value(self.files.list_dir(&base, &p.path).await?)?)
            }
            Action::Read => {
                let p: PathPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                let content = self.files.read_file(&base, &p.path).await?;
                Ok(json!({ "content": content }))
            }
            Action::Write => {
                let p: WritePayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                self.files.write_file(&base, &p.path, &p.content).await?;
                Ok(Value::Null)
            }
            Action::Chmod => {
                let p: ChmodPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                self.files.set_permissions(&base, &p.path, &p.mode).await?;
                Ok(Value::Null)
            }
            Action::Mkdir => {
                let p: MkdirPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                self.files.create_dir(&base, &p.root, &p.name).await?;
                Ok(Value::Null)
            }
            Action::Delete => {
                let p: FilesPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                self.files.delete_files(&base, &p.root, &p.files).await?;
                Ok(Value::Null)
            }
            Action::Rename => {
                let p: RenamePayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                self.files.rename_file(&base, &p.root, &p.from, &p.to).await?;
                Ok(Value::Null)
            }
            Action::Copy => {
                let p: CopyPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                self.files.copy_entry(&base, &p.location).await?;
                Ok(Value::Null)
            }
            Action::Compress => {
                let p: FilesPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                let archive = self.files.compress_files(&base, &p.root, &p.files).await?;
                Ok(json!({ "archive": archive }))
            }
            Action::Decompress => {
                let p: DecompressPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                self.files.decompress_file(&base, &p.root, &p.file).await?;
                Ok(Value::Null)
            }
            Action::UploadInit => {
                let p: UploadInitPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                let target = sandbox::resolve(&base, &p.path)?;
                let upload_id = self.transfers.start_upload(target, p.size).await?;
                info!("Upload {} started for {} ({} bytes)", upload_id, p.path, p.size);
                Ok(json!({ "uploadId": upload_id }))
            }
            Action::UploadChunk => {
                let p: UploadChunkPayload = decode(payload)?;
                if self.transfers.upload_next_index(&p.upload_id).is_none() {
                    return Err(AgentError::UploadNotFound);
                }
                let data = STANDARD
                    .decode(p.data.as_bytes())
                    .map_err(|_| AgentError::InvalidBase64)?;
                self.transfers.upload_chunk(&p.upload_id, p.index, &data).await?;
                Ok(Value::Null)
            }
            Action::UploadFinish => {
                let p: UploadFinishPayload = decode(payload)?;
                self.transfers.finish_upload(&p.upload_id).await?;
                Ok(Value::Null)
            }
            Action::DownloadInit => {
                let p: PathPayload = decode(payload)?;
                let base = self.files.base_for(&p.server_id);
                let path = sandbox::resolve(&base, &p.path)?;
                let download_id = self.transfers.start_download(&path).await?;
                Ok(json!({ "downloadId": download_id }))
            }
            Action::DownloadChunk => {
                let p: DownloadChunkPayload = decode(payload)?;
                let chunk = self.transfers.download_chunk(&p.download_id, p.index).await?;
                Ok(json!({ "data": STANDARD.encode(&chunk.data), "done": chunk.done }))
            }
            Action::Start | Action::Stop | Action::Restart | Action::Kill | Action::Command => {
                Err(AgentError::UnknownAction)
            }
        }
    }

    /// RCON first when enabled, then `sh -lc` inside the container.
    async fn run_command(&self, p: CommandPayload) -> AgentResult<String> {
        if !self.policy.is_command_allowed(&p.command) {
            return Err(AgentError::CommandNotAllowed);
        }

        if self.config.rcon.enabled {
            match rcon::exec(&self.config.rcon, &p.command).await {
                Ok(output) => return Ok(output),
                Err(err) => warn!(
                    server_id = %p.server_id,
                    "RCON command failed, falling back to container exec: {}",
                    err
                ),
            }
        }

        let container = self.resolve_container(&p.server_id).await?;
        self.driver.exec(&container, &p.command).await
    }

    /// `containerMap` first, then label discovery when a label key is set.
    async fn resolve_container(&self, server_id: &str) -> AgentResult<String> {
        if let Some(container) = self
            .config
            .container_map
            .get(server_id)
            .filter(|c| !c.is_empty())
        {
            return Ok(container.clone());
        }

        if !self.config.container_label_key.is_empty() {
            let found = self
                .driver
                .find_by_label(&self.config.container_label_key, server_id)
                .await;
            if !found.is_empty() {
                debug!("Resolved server {} to container {} by label", server_id, found);
                return Ok(found);
            }
        }

        Err(AgentError::ContainerNotFound)
    }
}

/// A missing payload or one of the wrong shape is a bad payload.
fn decode<T: DeserializeOwned>(payload: Option<&Value>) -> AgentResult<T> {
    let value = payload.ok_or(AgentError::BadPayload)?;
    T::deserialize(value).map_err(|_| AgentError::BadPayload)
}

fn decode_or_default<T: DeserializeOwned + Default>(payload: Option<&Value>) -> AgentResult<T> {
    match payload {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => T::deserialize(value).map_err(|_| AgentError::BadPayload),
    }
}
