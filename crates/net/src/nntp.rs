//! Minimal NNTP client: authenticate, post, fetch, capabilities.
//!
//! One instance owns one connection. Pooling, retries and rotation live
//! in [`crate::pool`]; this layer only speaks the protocol and applies
//! the independent connect/read/write timeouts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::ServerConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::{NetError, Result};

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            read: Duration::from_secs(60),
            write: Duration::from_secs(60),
        }
    }
}

impl Timeouts {
    /// Operation-level budget: the per-phase timeouts plus a margin.
    pub fn operation(&self) -> Duration {
        self.connect + self.read + self.write + Duration::from_secs(5)
    }
}

trait Conn: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Conn for T {}

#[derive(Debug, Clone)]
pub struct ServerCapabilities {
    pub posting_allowed: bool,
    pub retention_days: Option<u32>,
    pub max_connections: Option<u32>,
}

pub struct NntpClient {
    stream: BufStream<Box<dyn Conn>>,
    timeouts: Timeouts,
    server_id: String,
    posting_allowed: bool,
    pub(crate) articles_posted: u64,
    pub(crate) bytes_posted: u64,
    pub(crate) created: Instant,
    pub(crate) last_used: Instant,
}

fn tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

impl NntpClient {
    /// Connect and authenticate. The connection-layer retry (a single
    /// reconnect on transient connect/auth failures) belongs to the pool.
    #[instrument(skip(server, timeouts), fields(server = %server.server_id()))]
    pub async fn connect(server: &ServerConfig, timeouts: Timeouts) -> Result<Self> {
        let address = (server.host.as_str(), server.port);
        let tcp = tokio::time::timeout(timeouts.connect, TcpStream::connect(address))
            .await
            .map_err(|_| NetError::Timeout)??;

        let stream: Box<dyn Conn> = if server.ssl {
            let connector = TlsConnector::from(tls_config());
            let name = rustls::pki_types::ServerName::try_from(server.host.clone())
                .map_err(|e| NetError::Tls(e.to_string()))?;
            let tls = tokio::time::timeout(timeouts.connect, connector.connect(name, tcp))
                .await
                .map_err(|_| NetError::Timeout)?
                .map_err(|e| NetError::Tls(e.to_string()))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let mut client = Self {
            stream: BufStream::new(stream),
            timeouts,
            server_id: server.server_id(),
            posting_allowed: true,
            articles_posted: 0,
            bytes_posted: 0,
            created: Instant::now(),
            last_used: Instant::now(),
        };

        let (code, message) = client.read_status().await?;
        match code {
            200 => client.posting_allowed = true,
            201 => client.posting_allowed = false,
            _ => return Err(NetError::Protocol { code, message }),
        }

        if let (Some(user), Some(pass)) = (&server.username, &server.password) {
            client.authenticate(user, pass).await?;
        }
        Ok(client)
    }

    async fn authenticate(&mut self, user: &str, pass: &str) -> Result<()> {
        let (code, message) = self.command(&format!("AUTHINFO USER {user}")).await?;
        match code {
            281 => return Ok(()),
            381 => {}
            481 | 482 | 502 => return Err(NetError::AuthRejected { code, message }),
            _ => return Err(NetError::Protocol { code, message }),
        }
        let (code, message) = self.command(&format!("AUTHINFO PASS {pass}")).await?;
        match code {
            281 => Ok(()),
            481 | 482 | 502 => Err(NetError::AuthRejected { code, message }),
            _ => Err(NetError::Protocol { code, message }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn posting_allowed(&self) -> bool {
        self.posting_allowed
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        tokio::time::timeout(self.timeouts.write, self.stream.write_all(data))
            .await
            .map_err(|_| NetError::Timeout)??;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        tokio::time::timeout(self.timeouts.write, self.stream.flush())
            .await
            .map_err(|_| NetError::Timeout)??;
        Ok(())
    }

    async fn read_line_raw(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let n = tokio::time::timeout(self.timeouts.read, self.stream.read_until(b'\n', &mut line))
            .await
            .map_err(|_| NetError::Timeout)??;
        if n == 0 {
            return Err(NetError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed",
            )));
        }
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        Ok(line)
    }

    async fn read_status(&mut self) -> Result<(u16, String)> {
        let line = self.read_line_raw().await?;
        let text = String::from_utf8_lossy(&line).into_owned();
        let code: u16 = text
            .split_whitespace()
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| NetError::Protocol {
                code: 0,
                message: text.clone(),
            })?;
        debug!(code, "nntp status");
        Ok((code, text))
    }

    async fn command(&mut self, line: &str) -> Result<(u16, String)> {
        self.last_used = Instant::now();
        self.write_all(line.as_bytes()).await?;
        self.write_all(b"\r\n").await?;
        self.flush().await?;
        self.read_status().await
    }

    /// Post one article. `body` is the already-assembled article body;
    /// dot-stuffing is applied here. Returns the message id the article
    /// was posted under.
    pub async fn post(
        &mut self,
        headers: &[(String, String)],
        body: &[u8],
        message_id: &str,
    ) -> Result<String> {
        if !self.posting_allowed {
            return Err(NetError::PostingNotAllowed);
        }
        let (code, message) = self.command("POST").await?;
        match code {
            340 => {}
            440 => return Err(NetError::PostingNotAllowed),
            400 | 403 => return Err(NetError::TryAgainLater { code }),
            _ => return Err(NetError::Protocol { code, message }),
        }

        let mut wire = Vec::with_capacity(body.len() + 256);
        for (name, value) in headers {
            wire.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        wire.extend_from_slice(b"\r\n");
        for line in body.split(|&b| b == b'\n') {
            let line = match line.last() {
                Some(b'\r') => &line[..line.len() - 1],
                _ => line,
            };
            if line.first() == Some(&b'.') {
                wire.push(b'.');
            }
            wire.extend_from_slice(line);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b".\r\n");

        self.write_all(&wire).await?;
        self.flush().await?;

        let (code, message) = self.read_status().await?;
        match code {
            240 => {
                self.articles_posted += 1;
                self.bytes_posted += wire.len() as u64;
                self.last_used = Instant::now();
                // Servers may assign their own id; ours is authoritative
                // because it was sent in the Message-ID header.
                Ok(message
                    .split_whitespace()
                    .find(|w| w.starts_with('<') && w.ends_with('>'))
                    .unwrap_or(message_id)
                    .to_string())
            }
            441 => Err(NetError::ArticleRejected { code, message }),
            440 => Err(NetError::PostingNotAllowed),
            400 | 403 => Err(NetError::TryAgainLater { code }),
            _ => Err(NetError::Protocol { code, message }),
        }
    }

    /// Fetch an article by message id: headers plus undotted body bytes.
    pub async fn fetch(&mut self, message_id: &str) -> Result<(Vec<(String, String)>, Vec<u8>)> {
        let (code, message) = self.command(&format!("ARTICLE {message_id}")).await?;
        match code {
            220 => {}
            430 => return Err(NetError::NoSuchArticle(message_id.to_string())),
            400 | 403 => return Err(NetError::TryAgainLater { code }),
            _ => return Err(NetError::Protocol { code, message }),
        }

        let mut headers = Vec::new();
        loop {
            let line = self.read_line_raw().await?;
            if line.is_empty() {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            if let Some((name, value)) = text.split_once(':') {
                headers.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        let mut body = Vec::new();
        loop {
            let mut line = self.read_line_raw().await?;
            if line == b"." {
                break;
            }
            if line.starts_with(b"..") {
                line.remove(0);
            }
            body.extend_from_slice(&line);
            body.extend_from_slice(b"\r\n");
        }
        self.last_used = Instant::now();
        Ok((headers, body))
    }

    pub async fn capabilities(&mut self) -> Result<ServerCapabilities> {
        let (code, message) = self.command("CAPABILITIES").await?;
        if code != 101 {
            return Err(NetError::Protocol { code, message });
        }
        let mut caps = ServerCapabilities {
            posting_allowed: self.posting_allowed,
            retention_days: None,
            max_connections: None,
        };
        loop {
            let line = self.read_line_raw().await?;
            if line == b"." {
                break;
            }
            let text = String::from_utf8_lossy(&line).to_ascii_uppercase();
            if text == "POST" {
                caps.posting_allowed = true;
            } else if let Some(rest) = text.strip_prefix("RETENTION ") {
                caps.retention_days = rest.trim().parse().ok();
            } else if let Some(rest) = text.strip_prefix("MAXCONNECTIONS ") {
                caps.max_connections = rest.trim().parse().ok();
            }
        }
        Ok(caps)
    }

    /// Best-effort goodbye; the connection is dropped regardless.
    pub async fn quit(mut self) {
        let _ = self.command("QUIT").await;
    }
}
