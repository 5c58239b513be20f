use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::{ClientError, ClientErrorKind};

/// The two URI schemes the wire protocol recognises on a server string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerUri {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ServerUri {
    pub fn parse(uri: &str) -> Result<Self, ClientError> {
        let (rest, tls) = if let Some(rest) = uri.strip_prefix("ssl://") {
            (rest, true)
        } else if let Some(rest) = uri.strip_prefix("tcp://") {
            (rest, false)
        } else {
            return Err(ClientError::new(
                ClientErrorKind::InvalidArgument,
                format!("server URI `{uri}` must begin with tcp:// or ssl://"),
            ));
        };

        let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
            ClientError::new(
                ClientErrorKind::InvalidArgument,
                format!("server URI `{uri}` is missing a port"),
            )
        })?;

        let port: u16 = port.parse().map_err(|_| {
            ClientError::new(
                ClientErrorKind::InvalidArgument,
                format!("server URI `{uri}` has an invalid port"),
            )
        })?;

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Non-blocking socket handed to the engine by a [`Transport`]. Unifies plain TCP
/// and TLS so the rest of the engine reads/writes without caring which it has.
pub enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    /// Resolves when the underlying fd is ready for a non-blocking read.
    /// Used by the Receiver's readiness poll rather than blocking in `read`.
    pub async fn readable(&self) -> Result<(), ClientError> {
        match self {
            Self::Plain(stream) => stream.readable().await.map_err(Into::into),
            Self::Tls(stream) => stream.get_ref().0.readable().await.map_err(Into::into),
        }
    }

    pub async fn writable(&self) -> Result<(), ClientError> {
        match self {
            Self::Plain(stream) => stream.writable().await.map_err(Into::into),
            Self::Tls(stream) => stream.get_ref().0.writable().await.map_err(Into::into),
        }
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Yields connected, non-blocking sockets. The engine's protocol logic is written
/// against this trait, never against `TcpStream`/`TlsStream` directly, so that
/// tests can substitute an in-process transport.
pub trait Transport: Send + Sync + 'static {
    #[allow(async_fn_in_trait)]
    async fn connect(&self, uri: &ServerUri) -> Result<Socket, ClientError>;
}

/// Default transport: plain TCP via Tokio, or TLS via `tokio-rustls` when the
/// server URI uses the `ssl://` scheme.
pub struct TokioTransport {
    tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl TokioTransport {
    pub fn new() -> Self {
        Self { tls_config: None }
    }

    pub fn with_tls_config(tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls_config: Some(tls_config),
        }
    }
}

impl Default for TokioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TokioTransport {
    async fn connect(&self, uri: &ServerUri) -> Result<Socket, ClientError> {
        let tcp = TcpStream::connect(uri.addr()).await?;
        tcp.set_nodelay(true).ok();

        if !uri.tls {
            return Ok(Socket::Plain(tcp));
        }

        let tls_config = self.tls_config.clone().ok_or_else(|| {
            ClientError::new(
                ClientErrorKind::InvalidArgument,
                "ssl:// server URI requires tls_opts to be configured",
            )
        })?;

        let server_name = rustls::pki_types::ServerName::try_from(uri.host.clone())
            .map_err(|_| {
                ClientError::new(
                    ClientErrorKind::InvalidArgument,
                    format!("`{}` is not a valid TLS server name", uri.host),
                )
            })?;

        let connector = TlsConnector::from(tls_config);
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|err| ClientError::new(ClientErrorKind::TransportError, err.to_string()))?;

        Ok(Socket::Tls(Box::new(tls_stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_uri() {
        let uri = ServerUri::parse("tcp://localhost:1883").unwrap();
        assert_eq!(uri.host, "localhost");
        assert_eq!(uri.port, 1883);
        assert!(!uri.tls);
    }

    #[test]
    fn parses_tls_uri() {
        let uri = ServerUri::parse("ssl://broker.example:8883").unwrap();
        assert!(uri.tls);
        assert_eq!(uri.port, 8883);
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(ServerUri::parse("http://host:80").is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!(ServerUri::parse("tcp://host").is_err());
    }
}
