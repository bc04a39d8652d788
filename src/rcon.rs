//! Minimal Source RCON client, as spoken by Minecraft servers.
//!
//! Packet layout (little endian): `size:i32 id:i32 type:i32 body 0x00 0x00`,
//! where `size` counts everything after itself.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::RconConfig;
use crate::errors::{AgentError, AgentResult};

pub const RCON_TIMEOUT: Duration = Duration::from_secs(8);

const TYPE_AUTH: i32 = 3;
const TYPE_AUTH_RESPONSE: i32 = 2;
const TYPE_EXEC: i32 = 2;
const TYPE_RESPONSE_VALUE: i32 = 0;

const MIN_PACKET: usize = 10;
const MAX_PACKET: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub kind: i32,
    pub body: String,
}

impl Packet {
    pub fn encode(&self) -> BytesMut {
        let body = self.body.as_bytes();
        let mut buf = BytesMut::with_capacity(body.len() + 14);
        buf.put_i32_le((body.len() + MIN_PACKET) as i32);
        buf.put_i32_le(self.id);
        buf.put_i32_le(self.kind);
        buf.put_slice(body);
        buf.put_u8(0);
        buf.put_u8(0);
        buf
    }

    /// Decode the part after the size prefix.
    fn decode(mut raw: &[u8]) -> AgentResult<Self> {
        if raw.len() < MIN_PACKET {
            return Err(AgentError::RconError("short packet".to_string()));
        }
        let id = raw.get_i32_le();
        let kind = raw.get_i32_le();
        let body = &raw[..raw.len() - 2];
        Ok(Self {
            id,
            kind,
            body: String::from_utf8_lossy(body).to_string(),
        })
    }
}

pub struct RconClient {
    stream: TcpStream,
    next_id: i32,
}

impl RconClient {
    pub async fn connect(host: &str, port: u16, password: &str) -> AgentResult<Self> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| AgentError::RconError(e.to_string()))?;
        let mut client = Self { stream, next_id: 0 };
        client.authenticate(password).await?;
        Ok(client)
    }

    async fn authenticate(&mut self, password: &str) -> AgentResult<()> {
        let id = self.send(TYPE_AUTH, password).await?;
        loop {
            let packet = self.recv().await?;
            // Some servers send an empty value packet before the auth response.
            if packet.kind != TYPE_AUTH_RESPONSE {
                continue;
            }
            if packet.id == -1 || packet.id != id {
                return Err(AgentError::RconError("authentication failed".to_string()));
            }
            debug!("RCON authenticated");
            return Ok(());
        }
    }

    pub async fn execute(&mut self, command: &str) -> AgentResult<String> {
        let id = self.send(TYPE_EXEC, command).await?;
        loop {
            let packet = self.recv().await?;
            if packet.kind == TYPE_RESPONSE_VALUE && packet.id == id {
                return Ok(packet.body);
            }
        }
    }

    async fn send(&mut self, kind: i32, body: &str) -> AgentResult<i32> {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let packet = Packet {
            id: self.next_id,
            kind,
            body: body.to_string(),
        };
        self.stream
            .write_all(&packet.encode())
            .await
            .map_err(|e| AgentError::RconError(e.to_string()))?;
        Ok(self.next_id)
    }

    async fn recv(&mut self) -> AgentResult<Packet> {
        let size = self
            .stream
            .read_i32_le()
            .await
            .map_err(|e| AgentError::RconError(e.to_string()))?;
        let size = usize::try_from(size).unwrap_or(0);
        if !(MIN_PACKET..=MAX_PACKET).contains(&size) {
            return Err(AgentError::RconError(format!("invalid packet size {}", size)));
        }
        let mut raw = vec![0u8; size];
        self.stream
            .read_exact(&mut raw)
            .await
            .map_err(|e| AgentError::RconError(e.to_string()))?;
        Packet::decode(&raw)
    }
}

/// Connect, authenticate and run one command within [`RCON_TIMEOUT`].
pub async fn exec(cfg: &RconConfig, command: &str) -> AgentResult<String> {
    let round_trip = async {
        let mut client = RconClient::connect(&cfg.host, cfg.port, &cfg.password).await?;
        client.execute(command).await
    };
    match tokio::time::timeout(RCON_TIMEOUT, round_trip).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::RconError("timed out".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn read_packet(stream: &mut TcpStream) -> Packet {
        let size = stream.read_i32_le().await.unwrap() as usize;
        let mut raw = vec![0u8; size];
        stream.read_exact(&mut raw).await.unwrap();
        Packet::decode(&raw).unwrap()
    }

    async fn write_packet(stream: &mut TcpStream, id: i32, kind: i32, body: &str) {
        let packet = Packet {
            id,
            kind,
            body: body.to_string(),
        };
        stream.write_all(&packet.encode()).await.unwrap();
    }

    /// One-connection server accepting `password`; replies to commands with
    /// `echo:<command>`.
    async fn spawn_server(password: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let auth = read_packet(&mut stream).await;
            assert_eq!(auth.kind, TYPE_AUTH);
            write_packet(&mut stream, auth.id, TYPE_RESPONSE_VALUE, "").await;
            if auth.body != password {
                write_packet(&mut stream, -1, TYPE_AUTH_RESPONSE, "").await;
                return;
            }
            write_packet(&mut stream, auth.id, TYPE_AUTH_RESPONSE, "").await;
            let cmd = read_packet(&mut stream).await;
            assert_eq!(cmd.kind, TYPE_EXEC);
            write_packet(&mut stream, cmd.id, TYPE_RESPONSE_VALUE, &format!("echo:{}", cmd.body))
                .await;
        });
        port
    }

    fn config(port: u16, password: &str) -> RconConfig {
        RconConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port,
            password: password.to_string(),
        }
    }

    #[test]
    fn packet_layout() {
        let encoded = Packet {
            id: 7,
            kind: TYPE_EXEC,
            body: "list".to_string(),
        }
        .encode();
        assert_eq!(
            encoded.as_ref(),
            &[14, 0, 0, 0, 7, 0, 0, 0, 2, 0, 0, 0, b'l', b'i', b's', b't', 0, 0]
        );
        let decoded = Packet::decode(&encoded[4..]).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.body, "list");
    }

    #[tokio::test]
    async fn exec_round_trip() {
        let port = spawn_server("hunter2").await;
        let out = exec(&config(port, "hunter2"), "say hi").await.unwrap();
        assert_eq!(out, "echo:say hi");
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let port = spawn_server("hunter2").await;
        let err = exec(&config(port, "nope"), "list").await.unwrap_err();
        assert_eq!(err.to_string(), "rcon: authentication failed");
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(matches!(
            exec(&config(port, "x"), "list").await,
            Err(AgentError::RconError(_))
        ));
    }
}
