use std::borrow::Cow;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use russh::server::{Auth, Config, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Preferred, SshId};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use semver::Version;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::connection::ConnectionEvent;
use crate::handler::{envelope, HandlerContext, HandlerRegistry, HubRequest};

/// Idle sessions are dropped after this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(70);

/// Hubs below this version get the legacy plain-JSON snapshot instead of
/// the binary envelope protocol.
fn min_envelope_version() -> Version {
    Version::new(0, 9, 0)
}

/// Fixed algorithm allowlists. The hub's client speaks all of these; nothing
/// older is accepted.
const ALLOWED_KEX: &[russh::kex::Name] = &[russh::kex::CURVE25519, russh::kex::DH_G14_SHA256];
const ALLOWED_CIPHERS: &[russh::cipher::Name] =
    &[russh::cipher::CHACHA20_POLY1305, russh::cipher::AES_256_GCM];
const ALLOWED_MACS: &[russh::mac::Name] = &[russh::mac::HMAC_SHA256, russh::mac::HMAC_SHA512];

/// Inbound request/response transport. Each accepted session authenticates
/// with a public key, carries one command, and exits.
pub struct SshServer {
    agent: Arc<Agent>,
    registry: Arc<HandlerRegistry>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    authorized: Arc<Vec<PublicKey>>,
}

impl SshServer {
    pub fn new(agent: Arc<Agent>, events_tx: mpsc::Sender<ConnectionEvent>) -> Result<Self> {
        let raw = agent
            .config()
            .keys
            .clone()
            .ok_or_else(|| anyhow!("KEY is required to start the SSH server"))?;
        let authorized = parse_authorized_keys(&raw);
        if authorized.is_empty() {
            bail!("No parseable public keys in KEY");
        }
        info!(count = authorized.len(), "Loaded authorized hub keys");
        Ok(Self {
            agent,
            // SSH sessions are key-authenticated; no fingerprint handshake.
            registry: Arc::new(HandlerRegistry::new(false)),
            events_tx,
            authorized: Arc::new(authorized),
        })
    }

    /// Bind and serve until cancelled. TCP or unix socket per configuration.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let config = Arc::new(self.make_config()?);

        if self.agent.config().is_unix_socket() {
            #[cfg(unix)]
            {
                return self.run_unix(config, cancel).await;
            }
            #[cfg(not(unix))]
            {
                bail!("Unix domain sockets are not supported on this platform");
            }
        }
        self.run_tcp(config, cancel).await
    }

    #[cfg(unix)]
    async fn run_unix(&self, config: Arc<Config>, cancel: CancellationToken) -> Result<()> {
        let path = self.agent.config().listen.clone();
        // A previous run may have left its socket file behind.
        if std::path::Path::new(&path).exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stale socket {path}"))?;
        }
        let listener = tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind unix socket {path}"))?;
        info!(socket = %path, "SSH server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, _) = accepted.context("Accept failed")?;
                    self.spawn_session(config.clone(), stream);
                }
            }
        }
    }

    async fn run_tcp(&self, config: Arc<Config>, cancel: CancellationToken) -> Result<()> {
        let addr = self.agent.config().tcp_bind_addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        info!(address = %addr, "SSH server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, _) = accepted.context("Accept failed")?;
                    self.spawn_session(config.clone(), stream);
                }
            }
        }
    }

    fn spawn_session<S>(&self, config: Arc<Config>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let banner = Arc::new(StdMutex::new(None));
        let wrapped = BannerCapture::new(stream, banner.clone());
        let handler = SshSession {
            agent: self.agent.clone(),
            registry: self.registry.clone(),
            events_tx: self.events_tx.clone(),
            authorized: self.authorized.clone(),
            banner,
            buffer: Vec::new(),
            handled: false,
            connected: false,
        };
        tokio::spawn(async move {
            match russh::server::run_stream(config, wrapped, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        debug!(error = %e, "SSH session ended with error");
                    }
                }
                Err(e) => debug!(error = %e, "SSH handshake failed"),
            }
        });
    }

    fn make_config(&self) -> Result<Config> {
        let host_key = KeyPair::generate_ed25519()
            .ok_or_else(|| anyhow!("Failed to generate host key"))?;
        Ok(Config {
            // The hub parses the agent version out of this banner.
            server_id: SshId::Standard(format!(
                "SSH-2.0-{}_{}",
                crate::APP_NAME,
                env!("CARGO_PKG_VERSION")
            )),
            inactivity_timeout: Some(IDLE_TIMEOUT),
            auth_rejection_time: Duration::from_secs(2),
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            preferred: Preferred {
                kex: Cow::Borrowed(ALLOWED_KEX),
                cipher: Cow::Borrowed(ALLOWED_CIPHERS),
                mac: Cow::Borrowed(ALLOWED_MACS),
                ..Default::default()
            },
            ..Default::default()
        })
    }
}

/// Per-connection handler state.
struct SshSession {
    agent: Arc<Agent>,
    registry: Arc<HandlerRegistry>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    authorized: Arc<Vec<PublicKey>>,
    banner: Arc<StdMutex<Option<String>>>,
    buffer: Vec<u8>,
    handled: bool,
    connected: bool,
}

impl SshSession {
    fn hub_version(&self) -> Version {
        let banner = self.banner.lock().unwrap_or_else(|e| e.into_inner());
        banner
            .as_deref()
            .map(parse_hub_version)
            .unwrap_or_else(|| Version::new(0, 0, 0))
    }

    fn uses_legacy(&self) -> bool {
        self.hub_version() < min_envelope_version()
    }

    /// Legacy hubs expect one JSON combined snapshot on session start and
    /// no envelope at all.
    async fn send_legacy_snapshot(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<()> {
        let snapshot = self
            .agent
            .gather_stats(crate::agent::DEFAULT_INTERVAL_MS)
            .await;
        let payload = serde_json::to_vec(&snapshot)?;
        session.data(channel, CryptoVec::from_slice(&payload));
        session.exit_status_request(channel, 0);
        session.eof(channel);
        session.close(channel);
        self.handled = true;
        Ok(())
    }

    async fn dispatch_buffered(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<()> {
        let request: HubRequest = match ciborium::from_reader(&self.buffer[..]) {
            Ok(request) => request,
            // Truncated input — more channel data is coming.
            Err(ciborium::de::Error::Io(_)) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "Undecodable SSH command envelope");
                let response = envelope::AgentResponse::failure(None, "bad request envelope");
                self.respond(channel, session, response)?;
                return Ok(());
            }
        };

        let ctx = HandlerContext::new(self.agent.clone(), true);
        let response = self.registry.dispatch(&ctx, request).await;
        self.respond(channel, session, response)
    }

    fn respond(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
        response: envelope::AgentResponse,
    ) -> Result<()> {
        let exit_code = u32::from(response.error.is_some());
        let encoded = envelope::encode(&response)?;
        session.data(channel, CryptoVec::from_slice(&encoded));
        session.exit_status_request(channel, exit_code);
        session.eof(channel);
        session.close(channel);
        self.handled = true;
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if self.connected {
            let _ = self.events_tx.try_send(ConnectionEvent::SshDisconnect);
        }
    }
}

#[async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        offered: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let offered_b64 = offered.public_key_base64();
        let accepted = self
            .authorized
            .iter()
            .any(|key| key.public_key_base64() == offered_b64);
        if accepted {
            debug!(user, "Hub key accepted");
            Ok(Auth::Accept)
        } else {
            warn!(user, "Rejected unknown public key");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.connected {
            self.connected = true;
            let _ = self.events_tx.send(ConnectionEvent::SshConnect).await;
        }
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        if self.uses_legacy() && !self.handled {
            self.send_legacy_snapshot(channel, session).await?;
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _command: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel);
        if self.uses_legacy() && !self.handled {
            self.send_legacy_snapshot(channel, session).await?;
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.handled {
            return Ok(());
        }
        self.buffer.extend_from_slice(data);
        self.dispatch_buffered(channel, session).await
    }
}

/// Parse authorized_keys-format text: one key per line, comments and blanks
/// skipped, bare-base64 lines accepted.
pub(crate) fn parse_authorized_keys(raw: &str) -> Vec<PublicKey> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut parts = line.split_whitespace();
            let first = parts.next()?;
            let b64 = if first.starts_with("ssh-")
                || first.starts_with("ecdsa-")
                || first.starts_with("sk-")
            {
                parts.next()?
            } else {
                first
            };
            match russh_keys::parse_public_key_base64(b64) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error = %e, "Skipping unparseable authorized key");
                    None
                }
            }
        })
        .collect()
}

/// Version from a client identification line: everything after the first
/// `_` in `SSH-2.0-<name>_<version>`. Unparseable banners read as 0.0.0,
/// which selects the legacy payload.
pub(crate) fn parse_hub_version(banner: &str) -> Version {
    banner
        .trim()
        .split_once('_')
        .and_then(|(_, version)| Version::parse(version.trim()).ok())
        .unwrap_or_else(|| Version::new(0, 0, 0))
}

/// Passthrough stream that records the client's identification line (the
/// first line the client sends) so the session handler can negotiate the
/// payload shape by hub version.
struct BannerCapture<S> {
    inner: S,
    banner: Arc<StdMutex<Option<String>>>,
    pending: Vec<u8>,
    done: bool,
}

impl<S> BannerCapture<S> {
    fn new(inner: S, banner: Arc<StdMutex<Option<String>>>) -> Self {
        Self {
            inner,
            banner,
            pending: Vec::new(),
            done: false,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BannerCapture<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if !this.done {
                this.pending.extend_from_slice(&buf.filled()[before..]);
                if let Some(pos) = this.pending.iter().position(|b| *b == b'\n') {
                    let line = String::from_utf8_lossy(&this.pending[..pos])
                        .trim_end_matches('\r')
                        .to_string();
                    *this.banner.lock().unwrap_or_else(|e| e.into_inner()) = Some(line);
                    this.done = true;
                    this.pending.clear();
                } else if this.pending.len() > 512 {
                    // No newline in the first 512 bytes — not an SSH client.
                    this.done = true;
                    this.pending.clear();
                }
            }
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BannerCapture<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
