//! QAP1 client for live Rserve servers.
//!
//! This is the production [`Connector`]: it dials the endpoint, consumes
//! the 32-byte server ID string, and exposes the contract operations over
//! the framing in [`codec`](super::codec). The client covers exactly the
//! operations the pool and the script executor need; it is not a general
//! purpose Rserve binding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::endpoint::ServerEndpoint;
use crate::engine::codec::{
    self, CMD_ASSIGN_SEXP, CMD_EVAL, CMD_LOGIN, CMD_SHUTDOWN, CMD_VOID_EVAL, HEADER_SIZE,
};
use crate::engine::{Connector, EngineConnection, RValue};
use crate::error::{Error, Result};

/// Default TCP connect timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum response body this client will buffer (64 MB).
///
/// Prevents memory exhaustion if a script materializes an enormous result.
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Connects to Rserve servers over TCP.
#[derive(Debug, Clone)]
pub struct QapConnector {
    connect_timeout: Duration,
}

impl QapConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Override the TCP connect timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for QapConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for QapConnector {
    async fn connect(&self, endpoint: &ServerEndpoint) -> Result<Arc<dyn EngineConnection>> {
        let addr = (endpoint.host().to_string(), endpoint.port());
        let mut stream = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::Connect(format!("{}: {}", endpoint, e)));
            }
            Err(_) => {
                return Err(Error::Connect(format!("{}: connect timed out", endpoint)));
            }
        };
        let _ = stream.set_nodelay(true);

        // The server opens the conversation with a 32-byte ID string:
        // "Rsrv" + protocol version + "QAP1" + attribute chunks.
        let mut id = [0u8; 32];
        stream
            .read_exact(&mut id)
            .await
            .map_err(|e| Error::Connect(format!("{}: reading ID string: {}", endpoint, e)))?;

        if &id[0..4] != b"Rsrv" {
            return Err(Error::Connect(format!(
                "{}: not an Rserve server (ID {:?})",
                endpoint,
                String::from_utf8_lossy(&id[0..4])
            )));
        }
        if &id[8..12] != b"QAP1" {
            return Err(Error::Connect(format!(
                "{}: unsupported transport protocol {:?}",
                endpoint,
                String::from_utf8_lossy(&id[8..12])
            )));
        }

        // Attribute chunks are 4 bytes each; any "AR" chunk means the
        // server demands authentication before other commands.
        let needs_login = id[12..].chunks(4).any(|chunk| chunk.starts_with(b"AR"));

        tracing::debug!(
            endpoint = %endpoint,
            version = %String::from_utf8_lossy(&id[4..8]),
            needs_login,
            "Connected to Rserve"
        );

        Ok(Arc::new(QapConnection {
            stream: Mutex::new(stream),
            connected: AtomicBool::new(true),
            needs_login: AtomicBool::new(needs_login),
        }))
    }
}

/// One live QAP1 connection.
pub struct QapConnection {
    stream: Mutex<TcpStream>,
    connected: AtomicBool,
    needs_login: AtomicBool,
}

impl QapConnection {
    /// Send one command and read its response frame.
    ///
    /// Any transport failure marks the connection dead before the error
    /// propagates, so the pool can see it through `is_connected`.
    async fn request(&self, cmd: u32, body: &[u8]) -> Result<Bytes> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::ErrorKind::NotConnected));
        }

        let result = self.request_inner(cmd, body).await;
        if let Err(e) = &result {
            if e.is_transport() {
                self.connected.store(false, Ordering::Release);
            }
        }
        result
    }

    async fn request_inner(&self, cmd: u32, body: &[u8]) -> Result<Bytes> {
        let mut stream = self.stream.lock().await;

        let frame = codec::encode_frame(cmd, body);
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await?;
        let (resp, len) = codec::decode_header(&header);

        if len > MAX_RESPONSE_SIZE {
            return Err(Error::Io(std::io::ErrorKind::InvalidData));
        }

        let mut response = vec![0u8; len];
        stream.read_exact(&mut response).await?;
        drop(stream);

        codec::check_response(resp)?;
        Ok(Bytes::from(response))
    }
}

#[async_trait]
impl EngineConnection for QapConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn needs_login(&self) -> bool {
        self.needs_login.load(Ordering::Acquire)
    }

    async fn login(&self, username: &str, password: &str) -> Result<()> {
        let body = codec::encode_login(username, password)?;
        self.request(CMD_LOGIN, &body).await?;
        self.needs_login.store(false, Ordering::Release);
        Ok(())
    }

    async fn assign(&self, name: &str, value: &RValue) -> Result<()> {
        let body = codec::encode_assign(name, value)?;
        self.request(CMD_ASSIGN_SEXP, &body).await?;
        Ok(())
    }

    async fn eval(&self, expr: &str) -> Result<RValue> {
        let body = codec::encode_string_item(expr)?;
        let response = self.request(CMD_EVAL, &body).await?;
        codec::parse_response_body(response)?
            .ok_or_else(|| Error::Eval(format!("no value returned for `{}`", expr)))
    }

    async fn void_eval(&self, expr: &str) -> Result<()> {
        let body = codec::encode_string_item(expr)?;
        self.request(CMD_VOID_EVAL, &body).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.request(CMD_SHUTDOWN, &[]).await?;
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        let mut stream = self.stream.lock().await;
        // Closing an already-torn-down socket is not an error worth
        // surfacing.
        let _ = stream.shutdown().await;
        Ok(())
    }
}
