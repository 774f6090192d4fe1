use crate::config::CloudConfig;
use crate::session::{BoxReader, BoxWriter};
use crate::tunnel::TunnelStream;
use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::client::{self, Handle, Handler};
use russh::{ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("request {protocol} rejected with status {status}: {message}")]
    RequestRejected {
        protocol: String,
        status: u32,
        message: String,
    },
    #[error("not authenticated as {username}")]
    AuthenticationFailed { username: String },
}

/// Remote end of an interactive exec.
pub struct CloudSession {
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

/// Carries protocol messages to the remote service. Synchronous calls get
/// exactly one reply; sessions and tunnels become raw byte pipes.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn request(&self, protocol: &str, payload: String) -> Result<Vec<u8>>;

    /// `pty` is the local terminal size as columns and rows.
    async fn open_session(
        &self,
        protocol: &str,
        payload: String,
        pty: Option<(u16, u16)>,
    ) -> Result<CloudSession>;

    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream>;

    async fn close(&self) -> Result<()>;
}

struct ClientHandler;

#[async_trait]
impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One SSH connection, opened on first use and dropped by `close`.
///
/// Calls are framed as an `exec` of `"<kind>/<method> <json>"` on a session
/// channel, with the reply read from the channel's stdout. A service that
/// only answers SSH global requests named after the protocol does not
/// understand this framing: the method and field names match, the
/// envelope carrier does not. russh cannot send arbitrary global requests.
pub struct SshTransport {
    address: String,
    username: String,
    token: String,
    handle: Mutex<Option<Arc<Handle<ClientHandler>>>>,
}

impl SshTransport {
    pub fn new(config: &CloudConfig) -> Self {
        Self {
            address: config.address.clone(),
            username: config.username.clone(),
            token: config.token.clone(),
            handle: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<Arc<Handle<ClientHandler>>> {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }

        debug!(address = %self.address, "opening ssh connection");
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        });
        let mut handle = client::connect(config, self.address.as_str(), ClientHandler)
            .await
            .with_context(|| format!("failed to connect to {}", self.address))?;
        let authenticated = handle
            .authenticate_password(self.username.as_str(), self.token.as_str())
            .await
            .with_context(|| format!("failed to authenticate against {}", self.address))?;
        if !authenticated {
            return Err(CloudError::AuthenticationFailed {
                username: self.username.clone(),
            }
            .into());
        }

        let handle = Arc::new(handle);
        *guard = Some(handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl CloudTransport for SshTransport {
    async fn request(&self, protocol: &str, payload: String) -> Result<Vec<u8>> {
        let handle = self.connection().await?;
        let mut channel = handle
            .channel_open_session()
            .await
            .with_context(|| format!("failed to open channel for {protocol}"))?;
        channel
            .exec(true, format!("{protocol} {payload}"))
            .await
            .with_context(|| format!("failed to send {protocol}"))?;

        let mut reply = Vec::new();
        let mut failure = Vec::new();
        let mut status = 0;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => reply.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => failure.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => status = exit_status,
                ChannelMsg::Failure => status = status.max(1),
                _ => {}
            }
        }

        if status != 0 {
            return Err(CloudError::RequestRejected {
                protocol: protocol.to_string(),
                status,
                message: String::from_utf8_lossy(&failure).trim().to_string(),
            }
            .into());
        }
        Ok(reply)
    }

    async fn open_session(
        &self,
        protocol: &str,
        payload: String,
        pty: Option<(u16, u16)>,
    ) -> Result<CloudSession> {
        let handle = self.connection().await?;
        let channel = handle
            .channel_open_session()
            .await
            .with_context(|| format!("failed to open channel for {protocol}"))?;
        if let Some((columns, rows)) = pty {
            channel
                .request_pty(
                    false,
                    "xterm",
                    u32::from(columns),
                    u32::from(rows),
                    0,
                    0,
                    &[],
                )
                .await
                .context("failed to request pty")?;
        }
        channel
            .exec(true, format!("{protocol} {payload}"))
            .await
            .with_context(|| format!("failed to send {protocol}"))?;

        let (reader, writer) = tokio::io::split(channel.into_stream());
        Ok(CloudSession {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn open_tunnel(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let handle = self.connection().await?;
        let channel = handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .with_context(|| format!("failed to forward {host}:{port}"))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().await.take() else {
            return Ok(());
        };
        debug!(address = %self.address, "closing ssh connection");
        handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .context("failed to close ssh connection")
    }
}
