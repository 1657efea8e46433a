//! Strategy adapters binding transport sockets into the core.
//!
//! An async `Transport` trait with a Unix and a TCP implementation, dialed
//! from the endpoints produced by [`crate::address`].

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::address::{Endpoint, Family};
use crate::error::{Error, ErrorKind, Result};

/// Credentials the transport may have obtained while connecting, used by the
/// `EXTERNAL` SASL mechanism to authenticate without a challenge round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct Credentials {
    /// The local user id, if the transport is a Unix domain socket on a
    /// platform where `SCM_CREDENTIALS`/`getsockopt(SO_PEERCRED)` applies.
    pub unix_uid: Option<u32>,
}

/// Whether a transport is able to carry ancillary Unix file descriptors.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Credentials obtained while dialing, if any.
    fn credentials(&self) -> Credentials;

    /// Whether this transport can pass file descriptors out of band.
    ///
    /// A message carrying `UNIX_FDS` over a transport that returns `false`
    /// here is a hard error.
    fn supports_unix_fd_passing(&self) -> bool {
        false
    }
}

/// Dial the first endpoint in `address` that this process can connect to.
///
/// Tries endpoints left to right as parsed from a semicolon-separated
/// address; the first successful connection wins.
pub async fn connect(endpoints: &[Endpoint]) -> Result<Box<dyn Transport>> {
    let mut last_error = None;

    for endpoint in endpoints {
        match connect_one(endpoint).await {
            Ok(transport) => return Ok(transport),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::from(ErrorKind::UnsupportedAddress("no endpoints in address".into()))
    }))
}

async fn connect_one(endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::UnixPath(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(UnixTransport::new(stream)))
        }
        #[cfg(unix)]
        Endpoint::UnixAbstract(name) => {
            let stream = connect_abstract(name).await?;
            Ok(Box::new(UnixTransport::new(stream)))
        }
        #[cfg(not(unix))]
        Endpoint::UnixPath(_) | Endpoint::UnixAbstract(_) => Err(ErrorKind::UnsupportedAddress(
            "unix sockets are not supported on this platform".into(),
        )
        .into()),
        Endpoint::Tcp { host, port, family } => {
            let stream = resolve_and_connect(host, *port, *family).await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(TcpTransport { stream }))
        }
        Endpoint::NonceTcp {
            host,
            port,
            family,
            noncefile,
        } => {
            let mut stream = resolve_and_connect(host, *port, *family).await?;
            stream.set_nodelay(true).ok();
            let nonce = tokio::fs::read(noncefile).await?;
            stream.write_all(&nonce).await?;
            Ok(Box::new(TcpTransport { stream }))
        }
    }
}

/// Resolve `host:port`, constrained to `family` if given, and connect to the
/// first candidate address that accepts.
async fn resolve_and_connect(host: &str, port: u16, family: Option<Family>) -> Result<TcpStream> {
    let candidates: Vec<_> = tokio::net::lookup_host((host, port))
        .await?
        .filter(|addr| match family {
            Some(Family::Ipv4) => addr.is_ipv4(),
            Some(Family::Ipv6) => addr.is_ipv6(),
            None => true,
        })
        .collect();

    let mut last_error = None;
    for addr in &candidates {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(Error::from(e)),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        Error::from(ErrorKind::UnsupportedAddress(format!(
            "no {family:?} address found for {host}:{port}"
        )))
    }))
}

#[cfg(target_os = "linux")]
async fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixStream as StdUnixStream};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())
        .map_err(|_| Error::from(ErrorKind::UnsupportedAddress(format!("unix:abstract={name}"))))?;

    let std_stream = tokio::task::spawn_blocking(move || StdUnixStream::connect_addr(&addr))
        .await
        .map_err(|e| Error::from(ErrorKind::Transport(io::Error::new(io::ErrorKind::Other, e))))??;

    std_stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(std_stream)?)
}

#[cfg(all(unix, not(target_os = "linux")))]
async fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(ErrorKind::UnsupportedAddress(format!(
        "unix:abstract={name} requires the Linux abstract-socket namespace"
    ))
    .into())
}

/// A Unix domain socket transport, with `SCM_CREDENTIALS`-derived peer UID
/// used by the `EXTERNAL` mechanism.
#[cfg(unix)]
pub struct UnixTransport {
    stream: UnixStream,
    credentials: Credentials,
}

#[cfg(unix)]
impl UnixTransport {
    fn new(stream: UnixStream) -> Self {
        let unix_uid = peer_uid(&stream);
        Self {
            stream,
            credentials: Credentials { unix_uid },
        }
    }
}

#[cfg(unix)]
fn peer_uid(stream: &UnixStream) -> Option<u32> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };

    if rc == 0 {
        Some(cred.uid)
    } else {
        None
    }
}

#[cfg(unix)]
impl AsyncRead for UnixTransport {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

#[cfg(unix)]
impl AsyncWrite for UnixTransport {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn credentials(&self) -> Credentials {
        self.credentials
    }

    fn supports_unix_fd_passing(&self) -> bool {
        true
    }
}

/// A plain TCP transport. No credential channel: `EXTERNAL` is unavailable
/// and `DBUS_COOKIE_SHA1` (or `ANONYMOUS`) must be used instead.
pub struct TcpTransport {
    stream: TcpStream,
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Transport for TcpTransport {
    fn credentials(&self) -> Credentials {
        Credentials::default()
    }
}

/// Forwards to the boxed transport so connection plumbing can hold a single
/// `Box<dyn Transport>` through SASL, splitting, and the I/O loop without
/// downcasting.
impl Transport for Box<dyn Transport> {
    fn credentials(&self) -> Credentials {
        (**self).credentials()
    }

    fn supports_unix_fd_passing(&self) -> bool {
        (**self).supports_unix_fd_passing()
    }
}
