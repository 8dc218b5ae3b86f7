//! Opening the socket: TCP (direct or through an HTTP proxy), TLS and the websocket handshake.

use std::fmt::Write as _;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, client_async_tls_with_config};
use url::{Host, Url};

use super::config::{ClientConfig, ProxyConfig};
use super::error::WsError;
use crate::Result;
use crate::error::Error;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Proxies answering with a longer response head are treated as broken.
const MAX_PROXY_RESPONSE_HEAD: usize = 8 * 1024;

/// Establish a websocket connection to `endpoint`, bounded by the configured connect timeout.
pub(crate) async fn connect(config: &ClientConfig, endpoint: &Url) -> Result<WsStream> {
    timeout(config.connect_timeout, open(config, endpoint))
        .await
        .map_err(|_elapsed| WsError::Timeout {
            operation: "connect",
        })?
}

async fn open(config: &ClientConfig, endpoint: &Url) -> Result<WsStream> {
    let request = build_request(config, endpoint)?;
    let (host, port) = socket_target(endpoint)?;

    #[cfg(feature = "tracing")]
    tracing::debug!(%endpoint, proxy = ?config.proxy.as_ref().map(|p| p.url.as_str()), "Opening WebSocket connection");

    let stream = match &config.proxy {
        Some(proxy) => tunnel(proxy, &authority(endpoint, port)?).await?,
        None => TcpStream::connect((host.as_str(), port))
            .await
            .map_err(io_error)?,
    };
    stream.set_nodelay(true).map_err(io_error)?;

    let connector = tls_connector(config)?;
    let (ws_stream, _response) =
        client_async_tls_with_config(request, stream, None, connector).await?;

    Ok(ws_stream)
}

/// Handshake request carrying the configured headers.
pub(crate) fn build_request(config: &ClientConfig, endpoint: &Url) -> Result<Request> {
    let mut request = endpoint.as_str().into_client_request()?;

    let headers = request.headers_mut();
    for (name, value) in &config.headers {
        let header_name = HeaderName::try_from(name.as_str())
            .map_err(|e| WsError::InvalidHeader(format!("{name}: {e}")))?;
        let header_value = HeaderValue::try_from(value.as_str())
            .map_err(|e| WsError::InvalidHeader(format!("{name}: {e}")))?;
        headers.insert(header_name, header_value);
    }

    Ok(request)
}

/// Host and port to open a TCP connection to, with IPv6 brackets removed.
fn socket_target(url: &Url) -> Result<(String, u16)> {
    let host = match url.host() {
        Some(Host::Domain(domain)) => domain.to_owned(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return Err(Error::validation(format!("{url} has no host"))),
    };
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::validation(format!("{url} has no port")))?;

    Ok((host, port))
}

/// `host:port` form used as the `CONNECT` target.
fn authority(url: &Url, port: u16) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::validation(format!("{url} has no host")))?;

    Ok(format!("{host}:{port}"))
}

/// Open a tunnel to `authority` through an HTTP proxy.
async fn tunnel(proxy: &ProxyConfig, authority: &str) -> Result<TcpStream> {
    let (proxy_host, proxy_port) = socket_target(&proxy.url)?;
    let mut stream = TcpStream::connect((proxy_host.as_str(), proxy_port))
        .await
        .map_err(io_error)?;

    stream
        .write_all(connect_request(proxy, authority).as_bytes())
        .await
        .map_err(io_error)?;

    // Read byte by byte so nothing after the response head is consumed.
    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE_HEAD {
            return Err(WsError::Proxy("response head too large".to_owned()).into());
        }
        match stream.read_u8().await {
            Ok(byte) => head.push(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WsError::Proxy("proxy closed the connection".to_owned()).into());
            }
            Err(e) => return Err(io_error(e)),
        }
    }

    check_proxy_response(&head)?;

    #[cfg(feature = "tracing")]
    tracing::debug!(proxy = %proxy.url, %authority, "Proxy tunnel established");

    Ok(stream)
}

fn connect_request(proxy: &ProxyConfig, authority: &str) -> String {
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");

    let username = proxy.url.username();
    if !username.is_empty() {
        let credentials = format!("{username}:{}", proxy.url.password().unwrap_or_default());
        _ = write!(
            request,
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        );
    }
    request.push_str("\r\n");

    request
}

fn check_proxy_response(head: &[u8]) -> Result<()> {
    let head = String::from_utf8_lossy(head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1);

    if status == Some("200") {
        Ok(())
    } else {
        Err(WsError::Proxy(format!("unexpected response `{status_line}`")).into())
    }
}

fn io_error(e: std::io::Error) -> Error {
    WsError::Connection(tokio_tungstenite::tungstenite::Error::Io(e)).into()
}

/// `None` keeps tokio-tungstenite's verifying connector.
fn tls_connector(config: &ClientConfig) -> Result<Option<Connector>> {
    install_crypto_provider();

    if !config.accept_invalid_certs {
        return Ok(None);
    }

    #[cfg(feature = "tracing")]
    tracing::warn!(host = %config.host, "TLS certificate verification is disabled");

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(WsError::Tls)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier { provider }))
        .with_no_client_auth();

    Ok(Some(Connector::Rustls(Arc::new(tls))))
}

fn install_crypto_provider() {
    // Fails harmlessly when a provider is already installed.
    _ = rustls::crypto::ring::default_provider().install_default();
}

/// Accepts every server certificate.
#[derive(Debug)]
struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
