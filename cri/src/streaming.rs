//! Exec/attach streaming client.
//!
//! CRI interactive operations are two-phase:
//! 1. the Exec/Attach gRPC call returns a streaming URL
//! 2. the client connects to that URL and upgrades it to a raw duplex stream
//!
//! The upgrade is an HTTP/1.1 `POST` with `Upgrade: tcp` offering every
//! supported sub-protocol in `X-Stream-Protocol-Version`, over plain TCP for
//! `http` URLs and TLS for `https`. After `101` both sides exchange
//! channel-tagged frames (see `a3s_critest_core::stream`).

use std::io;
use std::sync::Arc;

use rustls::ClientConfig;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use url::{Position, Url};

use a3s_critest_core::config::CriTestConfig;
use a3s_critest_core::error::{CriTestError, Result};
use a3s_critest_core::exec::{ExecSession, ExecSyncOutput, SessionKind, DEFAULT_EXEC_SYNC_TIMEOUT};
use a3s_critest_core::stream::{
    decode_header, encode_frame, select_protocol, StreamStatus, TerminalSize,
    ACCEPTED_PROTOCOLS_HEADER, CHANNEL_ERROR, CHANNEL_RESIZE, CHANNEL_STDERR, CHANNEL_STDIN,
    CHANNEL_STDOUT, FRAME_HEADER_LEN, PROTOCOL_V4, STREAM_PROTOCOL_HEADER,
    SUPPORTED_STREAM_PROTOCOLS, UPGRADE_TOKEN,
};

use crate::cri_api::{AttachRequest, ExecRequest};
use crate::service::RuntimeService;
use crate::tls;

/// Upper bound on the upgrade response head.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Upper bound on a rejected upgrade body kept for the error message.
const MAX_ERROR_BODY: u64 = 4096;

/// Byte stream under an upgraded session: plain TCP or TLS.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type StreamReader = BufReader<ReadHalf<Box<dyn Transport>>>;
type StreamWriter = WriteHalf<Box<dyn Transport>>;

/// Where relative streaming URLs resolve and how `https` is dialed.
#[derive(Clone)]
pub struct StreamTarget {
    /// Base address for relative URLs.
    pub base_url: String,
    /// TLS settings for `https`; `None` accepts any server certificate.
    pub tls: Option<Arc<ClientConfig>>,
}

impl StreamTarget {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            tls: None,
        }
    }

    /// Base address and CA bundle from the harness config.
    pub fn from_config(config: &CriTestConfig) -> Result<Self> {
        let tls = match &config.streaming_ca_file {
            Some(path) => Some(tls::client_config(Some(path.as_path()))?),
            None => None,
        };
        Ok(Self {
            base_url: config.streaming_base_url.clone(),
            tls,
        })
    }

    pub fn with_tls(mut self, tls: Arc<ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Result of a completed streaming session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Remote exit code; 0 when the server reported none.
    pub exit_code: i32,
    /// Negotiated sub-protocol.
    pub protocol: String,
}

/// Which local streams a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamOptions {
    /// Forward local stdin on channel 0.
    pub stdin: bool,
    /// Terminal mode: remote stderr is written to local stdout.
    pub tty: bool,
}

impl From<&ExecSession> for StreamOptions {
    fn from(session: &ExecSession) -> Self {
        Self {
            stdin: session.stdin,
            tty: session.tty,
        }
    }
}

/// Run a command to completion with a single ExecSync call.
///
/// The remote client bounds the wait by the command timeout plus its RPC
/// timeout. No retry.
pub async fn exec_sync(runtime: &dyn RuntimeService, session: &ExecSession) -> Result<ExecSyncOutput> {
    let timeout = session.timeout.unwrap_or(DEFAULT_EXEC_SYNC_TIMEOUT);
    runtime
        .exec_sync(&session.container_id, session.cmd.clone(), timeout)
        .await
}

/// Resolve a streaming URL returned by the runtime.
///
/// Relative URLs are joined onto `base`. Only `http` or `https` with a host
/// is accepted.
pub fn resolve_stream_url(location: &str, base: &str) -> Result<Url> {
    let base = Url::parse(base).map_err(|e| {
        CriTestError::InvalidLocationError(format!("invalid base address '{}': {}", base, e))
    })?;
    let url = base.join(location).map_err(|e| {
        CriTestError::InvalidLocationError(format!("invalid streaming URL '{}': {}", location, e))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(CriTestError::InvalidLocationError(format!(
            "unsupported scheme '{}' in {}",
            url.scheme(),
            url
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(CriTestError::InvalidLocationError(format!(
            "streaming URL has no host: {}",
            url
        )));
    }
    Ok(url)
}

/// Request the streaming URL for a session and run it against local stdio.
pub async fn run_session<I, O, E>(
    runtime: &dyn RuntimeService,
    target: &StreamTarget,
    session: &ExecSession,
    stdin: Option<I>,
    stdout: O,
    stderr: E,
    resize: Option<mpsc::Receiver<TerminalSize>>,
) -> Result<StreamOutcome>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let location = match session.kind {
        SessionKind::Exec => {
            runtime
                .exec(ExecRequest {
                    container_id: session.container_id.clone(),
                    cmd: session.cmd.clone(),
                    tty: session.tty,
                    stdin: session.stdin,
                    stdout: true,
                    stderr: !session.tty,
                })
                .await?
        }
        SessionKind::Attach => {
            runtime
                .attach(AttachRequest {
                    container_id: session.container_id.clone(),
                    stdin: session.stdin,
                    tty: session.tty,
                    stdout: true,
                    stderr: !session.tty,
                })
                .await?
        }
    };

    let url = resolve_stream_url(&location, &target.base_url)?;
    tracing::info!(
        container_id = %session.container_id,
        kind = %session.kind,
        url = %url,
        "Streaming session started"
    );

    let conn =
        StreamConnection::connect(&url, &SUPPORTED_STREAM_PROTOCOLS, target.tls.clone()).await?;
    let outcome = conn
        .pump(StreamOptions::from(session), stdin, stdout, stderr, resize)
        .await?;
    tracing::info!(
        container_id = %session.container_id,
        exit_code = outcome.exit_code,
        protocol = %outcome.protocol,
        "Streaming session finished"
    );
    Ok(outcome)
}

/// An upgraded streaming connection.
pub struct StreamConnection {
    reader: StreamReader,
    writer: StreamWriter,
    protocol: String,
}

impl StreamConnection {
    /// Connect, upgrade and negotiate a sub-protocol from `protocols`.
    ///
    /// `tls` is used for `https` URLs; `None` accepts any server certificate.
    pub async fn connect(
        url: &Url,
        protocols: &[&str],
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<Self> {
        let host = url.host_str().ok_or_else(|| {
            CriTestError::InvalidLocationError(format!("streaming URL has no host: {}", url))
        })?;
        let port = url.port_or_known_default().unwrap_or(80);
        let authority = format!("{}:{}", host, port);

        let tcp = TcpStream::connect(authority.as_str())
            .await
            .map_err(|e| CriTestError::TransportError(format!("{}: {}", authority, e)))?;
        let transport: Box<dyn Transport> = if url.scheme() == "https" {
            let config = match tls {
                Some(config) => config,
                None => tls::client_config(None)?,
            };
            let tls_stream = TlsConnector::from(config)
                .connect(tls::server_name(url)?, tcp)
                .await
                .map_err(|e| {
                    CriTestError::TransportError(format!("TLS handshake with {}: {}", authority, e))
                })?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };
        let (read_half, mut writer) = tokio::io::split(transport);
        let mut reader = BufReader::new(read_half);

        send_upgrade_request(&mut writer, &url[Position::BeforePath..], &authority, protocols)
            .await
            .map_err(stream_error)?;
        let head = read_response_head(&mut reader).await?;

        let offered: Vec<String> = protocols.iter().map(|p| p.to_string()).collect();
        if head.status != 101 {
            if head.header(ACCEPTED_PROTOCOLS_HEADER).is_some() {
                return Err(CriTestError::UnsupportedProtocolError {
                    offered,
                    selected: None,
                });
            }
            let body = read_error_body(&mut reader, head.content_length()).await;
            return Err(CriTestError::StreamError(format!(
                "upgrade rejected: {} {}: {}",
                head.status,
                head.reason,
                body.trim()
            )));
        }

        let selected = head.header(STREAM_PROTOCOL_HEADER);
        match selected.and_then(|s| select_protocol(&[s], protocols)) {
            Some(protocol) => {
                tracing::debug!(protocol = %protocol, "Stream protocol negotiated");
                Ok(Self {
                    reader,
                    writer,
                    protocol: protocol.to_string(),
                })
            }
            None => Err(CriTestError::UnsupportedProtocolError {
                offered,
                selected: selected.map(str::to_string),
            }),
        }
    }

    /// Negotiated sub-protocol.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Pump frames until the remote side closes.
    ///
    /// A spawned task copies `stdin` to channel 0 (half-closing on EOF) and
    /// `resize` events to channel 4. The caller's task copies channels 1 and 2
    /// to `stdout`/`stderr` and reads the status on channel 3. A transport
    /// error in either direction ends the session.
    pub async fn pump<I, O, E>(
        self,
        options: StreamOptions,
        stdin: Option<I>,
        mut stdout: O,
        mut stderr: E,
        resize: Option<mpsc::Receiver<TerminalSize>>,
    ) -> Result<StreamOutcome>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let Self {
            mut reader,
            writer,
            protocol,
        } = self;
        let stdin = if options.stdin { stdin } else { None };

        let mut outbound = tokio::spawn(write_outbound(writer, stdin, resize));

        let result = {
            let inbound =
                read_inbound(&mut reader, &mut stdout, &mut stderr, options.tty, &protocol);
            tokio::pin!(inbound);

            tokio::select! {
                res = &mut inbound => res,
                joined = &mut outbound => match joined {
                    Ok(Ok(())) => inbound.await,
                    Ok(Err(e)) => Err(stream_error(e)),
                    Err(e) => Err(CriTestError::StreamError(format!("stdin task failed: {}", e))),
                },
            }
        };
        outbound.abort();

        let exit_code = result?;
        Ok(StreamOutcome {
            exit_code,
            protocol,
        })
    }
}

fn stream_error(e: io::Error) -> CriTestError {
    CriTestError::StreamError(e.to_string())
}

async fn send_upgrade_request(
    writer: &mut StreamWriter,
    target: &str,
    authority: &str,
    protocols: &[&str],
) -> io::Result<()> {
    let mut request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: {}\r\nContent-Length: 0\r\n",
        target, authority, UPGRADE_TOKEN
    );
    for protocol in protocols {
        request.push_str(&format!("{}: {}\r\n", STREAM_PROTOCOL_HEADER, protocol));
    }
    request.push_str("\r\n");
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await
}

/// Parsed status line and headers of the upgrade response.
#[derive(Debug)]
struct ResponseHead {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }
}

async fn read_response_head(reader: &mut StreamReader) -> Result<ResponseHead> {
    let mut total = 0;
    let mut line = String::new();

    let n = reader.read_line(&mut line).await.map_err(stream_error)?;
    if n == 0 {
        return Err(CriTestError::StreamError(
            "connection closed before upgrade response".to_string(),
        ));
    }
    total += n;

    // HTTP/1.1 101 Switching Protocols
    let mut parts = line.trim_end().splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let status = parts.next().and_then(|s| s.parse::<u16>().ok());
    let (status, reason) = match (version.starts_with("HTTP/"), status) {
        (true, Some(status)) => (status, parts.next().unwrap_or("").to_string()),
        _ => {
            return Err(CriTestError::StreamError(format!(
                "malformed upgrade response: {}",
                line.trim_end()
            )))
        }
    };

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(stream_error)?;
        total += n;
        if n == 0 {
            return Err(CriTestError::StreamError(
                "connection closed inside upgrade response".to_string(),
            ));
        }
        if total > MAX_RESPONSE_HEAD {
            return Err(CriTestError::StreamError(
                "upgrade response head too large".to_string(),
            ));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

async fn read_error_body(reader: &mut StreamReader, len: Option<u64>) -> String {
    let limit = len.unwrap_or(MAX_ERROR_BODY).min(MAX_ERROR_BODY);
    let mut body = Vec::new();
    if let Err(e) = reader.take(limit).read_to_end(&mut body).await {
        tracing::debug!(error = %e, "Failed to read upgrade error body");
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Copy stdin and resize events out, until both sources end.
async fn write_outbound<I>(
    mut writer: StreamWriter,
    mut stdin: Option<I>,
    mut resize: Option<mpsc::Receiver<TerminalSize>>,
) -> io::Result<()>
where
    I: AsyncRead + Unpin,
{
    let had_stdin = stdin.is_some();
    let mut buf = vec![0u8; 32 * 1024];

    loop {
        tokio::select! {
            n = read_some(&mut stdin, &mut buf), if stdin.is_some() => {
                match n? {
                    0 => {
                        // stdin EOF: half-close so the remote sees end of input.
                        writer.shutdown().await?;
                        return Ok(());
                    }
                    n => {
                        writer.write_all(&encode_frame(CHANNEL_STDIN, &buf[..n])).await?;
                        writer.flush().await?;
                    }
                }
            }
            size = recv_some(&mut resize), if resize.is_some() => {
                match size {
                    Some(size) => {
                        let payload = serde_json::to_vec(&size)?;
                        writer.write_all(&encode_frame(CHANNEL_RESIZE, &payload)).await?;
                        writer.flush().await?;
                    }
                    None => resize = None,
                }
            }
            else => break,
        }
    }

    if !had_stdin {
        // Dropping the writer would half-close; keep it open until aborted.
        std::future::pending::<()>().await;
    }
    Ok(())
}

async fn read_some<I: AsyncRead + Unpin>(stdin: &mut Option<I>, buf: &mut [u8]) -> io::Result<usize> {
    match stdin {
        Some(r) => r.read(buf).await,
        None => Ok(0),
    }
}

async fn recv_some(resize: &mut Option<mpsc::Receiver<TerminalSize>>) -> Option<TerminalSize> {
    match resize {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

/// Demultiplex frames until EOF, returning the exit code.
async fn read_inbound<O, E>(
    reader: &mut StreamReader,
    stdout: &mut O,
    stderr: &mut E,
    tty: bool,
    protocol: &str,
) -> Result<i32>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut exit_code = 0;
    let mut header = [0u8; FRAME_HEADER_LEN];

    loop {
        // EOF on a frame boundary ends the session cleanly.
        if reader.read(&mut header[..1]).await.map_err(stream_error)? == 0 {
            break;
        }
        reader
            .read_exact(&mut header[1..])
            .await
            .map_err(|e| CriTestError::StreamError(format!("truncated frame header: {}", e)))?;
        let (channel, len) = decode_header(&header).map_err(stream_error)?;
        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| CriTestError::StreamError(format!("truncated frame payload: {}", e)))?;

        match channel {
            CHANNEL_STDOUT => {
                stdout.write_all(&payload).await?;
                stdout.flush().await?;
            }
            CHANNEL_STDERR if tty => {
                stdout.write_all(&payload).await?;
                stdout.flush().await?;
            }
            CHANNEL_STDERR => {
                stderr.write_all(&payload).await?;
                stderr.flush().await?;
            }
            CHANNEL_ERROR => exit_code = interpret_status(protocol, &payload)?,
            other => {
                tracing::debug!(channel = other, len, "Ignoring frame on unexpected channel");
            }
        }
    }

    Ok(exit_code)
}

/// Decode the error channel payload into an exit code.
fn interpret_status(protocol: &str, payload: &[u8]) -> Result<i32> {
    if protocol == PROTOCOL_V4 {
        let status: StreamStatus = serde_json::from_slice(payload)?;
        return status.into_exit_code().map_err(CriTestError::StreamError);
    }
    // Older protocols carry a plain error message; empty means success.
    let message = String::from_utf8_lossy(payload);
    if message.trim().is_empty() {
        Ok(0)
    } else {
        Err(CriTestError::StreamError(message.into_owned()))
    }
}
