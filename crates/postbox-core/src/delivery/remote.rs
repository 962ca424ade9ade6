//! Delivery to recipients homed on another node

use crate::lmtp::framer::dot_stuff;
use async_trait::async_trait;
use postbox_common::config::Config;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("no reply from {0} within the read timeout")]
    ReadTimeout(String),

    #[error("{server} answered {command} with: {reply}")]
    Rejected {
        server: String,
        command: String,
        reply: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Hands a message to the node owning a group of recipients.
///
/// One call per node; the outcome applies to the whole group.
#[async_trait]
pub trait RemoteDelivery: Send + Sync {
    async fn deliver(
        &self,
        server: &str,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<(), RemoteError>;
}

/// Outbound LMTP client
#[derive(Debug, Clone)]
pub struct LmtpClient {
    hostname: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl LmtpClient {
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            connect_timeout,
            read_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.server.hostname.clone(),
            config.lmtp.remote_port,
            Duration::from_secs(config.lmtp.remote_connect_timeout_secs),
            Duration::from_secs(config.lmtp.remote_read_timeout_secs),
        )
    }

    /// `host` or `host:port`
    fn target(&self, server: &str) -> String {
        if server.contains(':') {
            server.to_string()
        } else {
            format!("{}:{}", server, self.port)
        }
    }
}

#[async_trait]
impl RemoteDelivery for LmtpClient {
    async fn deliver(
        &self,
        server: &str,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> Result<(), RemoteError> {
        let target = self.target(server);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| RemoteError::ConnectTimeout(target.clone()))??;

        let mut conn = Conversation {
            server: target.clone(),
            stream: BufReader::new(stream),
            read_timeout: self.read_timeout,
        };

        conn.expect("greeting", 220).await?;
        conn.send(&format!("LHLO {}\r\n", self.hostname)).await?;
        conn.expect("LHLO", 250).await?;
        conn.send(&format!("MAIL FROM:<{}>\r\n", sender)).await?;
        conn.expect("MAIL", 250).await?;
        for rcpt in recipients {
            conn.send(&format!("RCPT TO:<{}>\r\n", rcpt)).await?;
            conn.expect("RCPT", 250).await?;
        }
        conn.send("DATA\r\n").await?;
        conn.expect("DATA", 354).await?;

        conn.stream.get_mut().write_all(&dot_stuff(body)).await?;
        conn.stream.get_mut().flush().await?;
        for _ in recipients {
            conn.expect("end of data", 250).await?;
        }

        // The message is delivered; a failed QUIT is not an error
        if conn.send("QUIT\r\n").await.is_ok() {
            let _ = conn.read_reply().await;
        }

        info!(
            server = %target,
            recipients = recipients.len(),
            size = body.len(),
            "Delivered to remote node"
        );
        Ok(())
    }
}

struct Conversation {
    server: String,
    stream: BufReader<TcpStream>,
    read_timeout: Duration,
}

impl Conversation {
    async fn send(&mut self, line: &str) -> Result<(), RemoteError> {
        debug!(server = %self.server, command = line.trim_end(), "LMTP client send");
        self.stream.get_mut().write_all(line.as_bytes()).await?;
        self.stream.get_mut().flush().await?;
        Ok(())
    }

    /// Read a possibly multi-line reply, returning the code and last line
    async fn read_reply(&mut self) -> Result<(u16, String), RemoteError> {
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(self.read_timeout, self.stream.read_line(&mut line))
                .await
                .map_err(|_| RemoteError::ReadTimeout(self.server.clone()))??;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by remote node",
                )
                .into());
            }

            let line = line.trim_end().to_string();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("bad reply: {}", line))
                })?;
            if line.as_bytes().get(3) == Some(&b'-') {
                continue;
            }
            return Ok((code, line));
        }
    }

    async fn expect(&mut self, command: &str, code: u16) -> Result<(), RemoteError> {
        let (got, line) = self.read_reply().await?;
        if got != code {
            return Err(RemoteError::Rejected {
                server: self.server.clone(),
                command: command.to_string(),
                reply: line,
            });
        }
        Ok(())
    }
}
