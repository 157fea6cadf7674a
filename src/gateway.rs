//! The TLS-terminating connection pipeline.
//!
//! Accepts TCP connections, runs the TLS handshake, parses each plaintext
//! request off the decrypted stream with the connection's fixed buffers,
//! stamps the trust headers, forwards the rewritten head to the backend
//! listener and relays the response back. Each connection is served by its
//! own task; nothing is shared between connections except the process
//! identity and the metrics counters.

use crate::config::Config;
use crate::error::ProxyError;
use crate::metrics::metrics;
use crate::request::{ConnectionBuffers, ParseError, ParsedRequest, parse_request};
use crate::scanner::{read_byte, scan_until};
use crate::trust;
use log::{debug, error, info, warn};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection identifier used in log lines.
#[derive(Clone, Copy, Debug)]
struct ConnectionId(u64);

impl ConnectionId {
    fn new() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Create TLS server configuration from certificate and private key files
fn create_tls_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, ProxyError> {
    let mut private_key_file = StdBufReader::new(
        File::open(private_key_path)
            .map_err(|e| ProxyError::Tls(format!("Failed to open private key file: {}", e)))?,
    );

    let mut cert_file = StdBufReader::new(
        File::open(cert_path)
            .map_err(|e| ProxyError::Tls(format!("Failed to open certificate file: {}", e)))?,
    );

    let certs = rustls_pemfile::certs(&mut cert_file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls("No valid certificate found".to_string()));
    }

    let private_key = rustls_pemfile::private_key(&mut private_key_file)
        .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("No valid private key found".to_string()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::Tls(format!("Failed to create TLS config: {}", e)))?;

    Ok(config)
}

pub struct TlsGateway;

impl TlsGateway {
    /// Binds the listener and prepares the TLS acceptor.
    ///
    /// With both `private_key` and `certificate` configured the gateway
    /// terminates TLS; with neither it serves plaintext (useful behind
    /// another terminator and for tests). A listen port of 0 binds an
    /// ephemeral port, observable through [`BoundGateway::local_addr`].
    pub async fn bind(config: Config) -> Result<BoundGateway, ProxyError> {
        config.validate()?;

        let tls = match (&config.private_key, &config.certificate) {
            (Some(key), Some(cert)) => {
                let tls_config = create_tls_config(key, cert)?;
                Some(TlsAcceptor::from(Arc::new(tls_config)))
            }
            _ => None,
        };

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        if tls.is_some() {
            info!(
                "TLS gateway listening on https://{} -> backend {}",
                local_addr, config.backend_addr
            );
        } else {
            info!(
                "Plaintext gateway listening on http://{} -> backend {}",
                local_addr, config.backend_addr
            );
        }

        Ok(BoundGateway {
            listener,
            local_addr,
            tls,
            config: Arc::new(config),
        })
    }
}

pub struct BoundGateway {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    config: Arc<Config>,
}

impl BoundGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Runs until the listener fails.
    pub async fn run(self) -> Result<(), ProxyError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            metrics().connections_accepted.inc();

            let tls = self.tls.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_connection(tls_stream, peer, &config).await,
                        Err(err) => {
                            metrics().handshake_failures.inc();
                            warn!("TLS handshake with {} failed: {}", peer, err);
                        }
                    },
                    None => serve_connection(stream, peer, &config).await,
                }
            });
        }
    }
}

/// Keep-alive request loop for one decrypted client stream. Every failure
/// mode resolves to returning, which closes both sides of the connection.
async fn serve_connection<S>(stream: S, peer: SocketAddr, config: &Config)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn = ConnectionId::new();
    let mut bufs = ConnectionBuffers::new(&config.buffers);
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let idle = Duration::from_secs(config.idle_timeout_secs);

    debug!("{} accepted from {}", conn, peer);

    loop {
        let parse = timeout(
            idle,
            parse_request(&mut reader, &mut bufs, config.forward_host.as_deref()),
        )
        .await;

        let mut parsed = match parse {
            Err(_) => {
                debug!("{} idle past {:?}, closing", conn, idle);
                return;
            }
            Ok(Err(ParseError::ClientClosed)) => {
                debug!("{} closed by client", conn);
                return;
            }
            Ok(Err(err)) => {
                metrics().parse_failures.inc();
                warn!("{} from {}: request rejected: {}", conn, peer, err);
                return;
            }
            Ok(Ok(req)) => req,
        };

        debug!("{} {} {} {}", conn, parsed.method, parsed.path, parsed.protocol);
        let client_keep_alive = parsed.wants_keep_alive();

        trust::stamp(&mut parsed, trust::process_identity(), peer.ip());

        let server_keep_alive =
            match forward_one(&mut reader, &mut write_half, &parsed, config, &mut bufs).await {
                Ok(keep) => {
                    metrics().requests_forwarded.inc();
                    keep
                }
                Err(err) => {
                    match &err {
                        ProxyError::Backend(_) => {
                            metrics().backend_failures.inc();
                            error!("{}: {}", conn, err);
                        }
                        _ => warn!("{}: relay failed: {}", conn, err),
                    }
                    return;
                }
            };

        if !(client_keep_alive && server_keep_alive) {
            debug!("{} closing after exchange", conn);
            return;
        }
    }
}

/// Forwards one stamped request to the backend and relays the response.
///
/// Returns whether the exchange left both streams positioned for another
/// request/response cycle.
async fn forward_one<CR, CW>(
    client_reader: &mut CR,
    client_write: &mut CW,
    req: &ParsedRequest,
    config: &Config,
    bufs: &mut ConnectionBuffers,
) -> Result<bool, ProxyError>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
{
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    let backend = match timeout(connect_timeout, TcpStream::connect(config.backend_addr.as_str()))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            return Err(ProxyError::Backend(format!(
                "connect to {} failed: {}",
                config.backend_addr, err
            )));
        }
        Err(_) => {
            return Err(ProxyError::Backend(format!(
                "connect to {} timed out",
                config.backend_addr
            )));
        }
    };

    let (backend_read, mut backend_write) = backend.into_split();
    let mut backend_reader = BufReader::new(backend_read);

    write_request_head(&mut backend_write, req).await?;
    backend_write.flush().await?;

    if req.expect_continue {
        // the backend decides whether the client may send its body
        let interim =
            relay_response_head(&mut backend_reader, client_write, &mut bufs.value).await?;
        client_write.flush().await?;

        if interim.status == 100 {
            if req.content_length > 0 {
                copy_exact(
                    client_reader,
                    &mut backend_write,
                    req.content_length,
                    &mut bufs.relay,
                )
                .await?;
                backend_write.flush().await?;
            }
            let head =
                relay_response_head(&mut backend_reader, client_write, &mut bufs.value).await?;
            let keep =
                relay_response_body(&mut backend_reader, client_write, req, &head, &mut bufs.relay)
                    .await?;
            client_write.flush().await?;
            Ok(keep)
        } else {
            // body was never read off the client stream, so the connection
            // is no longer request-aligned after this response
            relay_response_body(
                &mut backend_reader,
                client_write,
                req,
                &interim,
                &mut bufs.relay,
            )
            .await?;
            client_write.flush().await?;
            Ok(false)
        }
    } else {
        if req.content_length > 0 {
            copy_exact(
                client_reader,
                &mut backend_write,
                req.content_length,
                &mut bufs.relay,
            )
            .await?;
            backend_write.flush().await?;
        }
        let head = relay_response_head(&mut backend_reader, client_write, &mut bufs.value).await?;
        let keep =
            relay_response_body(&mut backend_reader, client_write, req, &head, &mut bufs.relay)
                .await?;
        client_write.flush().await?;
        Ok(keep)
    }
}

/// Serializes the request line and the rewritten header sequence. The trust
/// headers are already part of `req.headers` at this point.
async fn write_request_head<W>(writer: &mut W, req: &ParsedRequest) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(req.method.as_bytes()).await?;
    writer.write_all(b" ").await?;
    writer.write_all(req.path.as_bytes()).await?;
    writer.write_all(b" ").await?;
    writer.write_all(req.protocol.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    for (name, value) in &req.headers {
        writer.write_all(name.as_bytes()).await?;
        writer.write_all(b": ").await?;
        writer.write_all(value.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
    }
    writer.write_all(b"\r\n").await
}

/// What the relay needs to know about a backend response head.
#[derive(Debug)]
struct ResponseHead {
    status: u16,
    content_length: Option<u64>,
    close: bool,
    chunked: bool,
}

/// Scans the backend response head line by line, forwarding each line to the
/// client as it goes, and extracts the framing-relevant headers.
async fn relay_response_head<R, W>(
    backend: &mut R,
    client: &mut W,
    line_buf: &mut [u8],
) -> Result<ResponseHead, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let status = {
        let line = head_line(backend, line_buf).await?;
        let status = parse_status(line)?;
        client.write_all(line).await?;
        client.write_all(b"\r\n").await?;
        status
    };

    let mut head = ResponseHead {
        status,
        content_length: None,
        close: false,
        chunked: false,
    };

    loop {
        let line_len;
        {
            let line = head_line(backend, line_buf).await?;
            line_len = line.len();
            if let Some(pos) = line.iter().position(|&b| b == b':') {
                let name = line[..pos].trim_ascii();
                let value = line[pos + 1..].trim_ascii();
                if name.eq_ignore_ascii_case(b"content-length") {
                    head.content_length = std::str::from_utf8(value)
                        .ok()
                        .and_then(|v| v.parse::<u64>().ok());
                } else if name.eq_ignore_ascii_case(b"connection") {
                    head.close = value.eq_ignore_ascii_case(b"close");
                } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
                    let encoding = std::str::from_utf8(value).unwrap_or("");
                    head.chunked = encoding.to_ascii_lowercase().contains("chunked");
                }
            }
            client.write_all(line).await?;
            client.write_all(b"\r\n").await?;
        }
        if line_len == 0 {
            return Ok(head);
        }
    }
}

/// Relays the response body according to the head's framing and reports
/// whether the backend-side of the exchange permits keep-alive.
async fn relay_response_body<R, W>(
    backend: &mut R,
    client: &mut W,
    req: &ParsedRequest,
    head: &ResponseHead,
    chunk: &mut [u8],
) -> Result<bool, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if (100..200).contains(&head.status) {
        // a stray interim response; nothing sane can follow on this stream
        return Ok(false);
    }
    if req.method.eq_ignore_ascii_case("HEAD") || head.status == 204 || head.status == 304 {
        return Ok(!head.close);
    }

    match (head.chunked, head.content_length) {
        (false, Some(len)) => {
            let relayed = copy_exact(backend, client, len, chunk).await?;
            metrics().response_bytes.inc_by(relayed);
            Ok(!head.close)
        }
        _ => {
            // chunked or close-delimited: relay until the backend hangs up,
            // after which the client connection cannot be reused
            let relayed = copy_until_eof(backend, client, chunk).await?;
            metrics().response_bytes.inc_by(relayed);
            Ok(false)
        }
    }
}

async fn head_line<'a, R>(reader: &mut R, buf: &'a mut [u8]) -> Result<&'a [u8], ProxyError>
where
    R: AsyncRead + Unpin,
{
    match scan_until(reader, b'\r', buf).await? {
        Some(line) => {
            if read_byte(reader).await? != Some(b'\n') {
                return Err(ProxyError::Backend("malformed response head".to_string()));
            }
            Ok(line)
        }
        None => Err(ProxyError::Backend(
            "response header line truncated or oversized".to_string(),
        )),
    }
}

fn parse_status(line: &[u8]) -> Result<u16, ProxyError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::Backend("status line is not valid UTF-8".to_string()))?;
    text.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::Backend(format!("malformed status line: {:?}", text)))
}

/// Copies exactly `len` bytes in chunks bounded by `chunk.len()`.
async fn copy_exact<R, W>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    chunk: &mut [u8],
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut remaining = len;
    let mut total = 0u64;
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended mid-body",
            ));
        }
        writer.write_all(&chunk[..n]).await?;
        total += n as u64;
        remaining -= n as u64;
    }
    Ok(total)
}

/// Copies until EOF in chunks bounded by `chunk.len()`.
async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W, chunk: &mut [u8]) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let n = reader.read(chunk).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&chunk[..n]).await?;
        total += n as u64;
    }
}
