use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Frame kinds on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "AUTH")]
    Auth,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "REQ")]
    Req,
    #[serde(rename = "RES")]
    Res,
}

/// One JSON text frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub ts: i64,
}

impl Message {
    pub fn ping(ts: i64) -> Self {
        Self::bare(MessageType::Ping, ts)
    }

    pub fn pong(ts: i64) -> Self {
        Self::bare(MessageType::Pong, ts)
    }

    pub fn auth(payload: AuthPayload, ts: i64) -> Self {
        Self {
            kind: MessageType::Auth,
            id: String::new(),
            action: String::new(),
            payload: serde_json::to_value(payload).ok(),
            ts,
        }
    }

    pub fn response(id: &str, payload: ResponsePayload, ts: i64) -> Self {
        Self {
            kind: MessageType::Res,
            id: id.to_string(),
            action: String::new(),
            payload: serde_json::to_value(payload).ok(),
            ts,
        }
    }

    fn bare(kind: MessageType, ts: i64) -> Self {
        Self {
            kind,
            id: String::new(),
            action: String::new(),
            payload: None,
            ts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub agent_id: String,
    pub nonce: String,
    pub ts: i64,
    pub sig: String,
}

/// Uniform body of every `RES` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl ResponsePayload {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            message: "ok".to_string(),
            data,
        }
    }

    /// Success whose result is carried in `message`.
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Value::Null,
        }
    }
}

/// Request verbs understood by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Start,
    Stop,
    Restart,
    Kill,
    Command,
    Stats,
    HostStats,
    Processes,
    Logs,
    List,
    Read,
    Write,
    Chmod,
    Mkdir,
    Delete,
    Rename,
    Copy,
    Compress,
    Decompress,
    UploadInit,
    UploadChunk,
    UploadFinish,
    DownloadInit,
    DownloadChunk,
}

impl Action {
    pub const ALL: [Action; 24] = [
        Action::Start,
        Action::Stop,
        Action::Restart,
        Action::Kill,
        Action::Command,
        Action::Stats,
        Action::HostStats,
        Action::Processes,
        Action::Logs,
        Action::List,
        Action::Read,
        Action::Write,
        Action::Chmod,
        Action::Mkdir,
        Action::Delete,
        Action::Rename,
        Action::Copy,
        Action::Compress,
        Action::Decompress,
        Action::UploadInit,
        Action::UploadChunk,
        Action::UploadFinish,
        Action::DownloadInit,
        Action::DownloadChunk,
    ];

    pub fn parse(verb: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|action| action.as_str() == verb)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "START",
            Action::Stop => "STOP",
            Action::Restart => "RESTART",
            Action::Kill => "KILL",
            Action::Command => "COMMAND",
            Action::Stats => "STATS",
            Action::HostStats => "HOST_STATS",
            Action::Processes => "PROCESSES",
            Action::Logs => "LOGS",
            Action::List => "LIST",
            Action::Read => "READ",
            Action::Write => "WRITE",
            Action::Chmod => "CHMOD",
            Action::Mkdir => "MKDIR",
            Action::Delete => "DELETE",
            Action::Rename => "RENAME",
            Action::Copy => "COPY",
            Action::Compress => "COMPRESS",
            Action::Decompress => "DECOMPRESS",
            Action::UploadInit => "UPLOAD_INIT",
            Action::UploadChunk => "UPLOAD_CHUNK",
            Action::UploadFinish => "UPLOAD_FINISH",
            Action::DownloadInit => "DOWNLOAD_INIT",
            Action::DownloadChunk => "DOWNLOAD_CHUNK",
        }
    }

    /// Container power verb passed to the driver, if this is one.
    pub fn power_op(&self) -> Option<&'static str> {
        match self {
            Action::Start => Some("start"),
            Action::Stop => Some("stop"),
            Action::Restart => Some("restart"),
            Action::Kill => Some("kill"),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
