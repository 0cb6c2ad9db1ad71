use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use native_tls::{HandshakeError, TlsConnector, TlsStream};

use crate::crypto::certificate_fingerprint;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// How long a single connect attempt may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

// "Address family not supported by protocol" on Linux.
const EAFNOSUPPORT: i32 = 97;

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Self::Plain(s) => s,
            Self::Tls(s) => s.get_ref(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.read(buf),
            Self::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(s) => s.write(buf),
            Self::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(s) => s.flush(),
            Self::Tls(s) => s.flush(),
        }
    }
}

/// Blocking TCP stream, optionally wrapped in TLS.
///
/// Every read and write is bounded by the configured timeout.
pub struct TcpTransport {
    stream: Stream,
    fingerprint: Option<String>,
}

impl TcpTransport {
    /// Resolve, connect and, if `encryption` is set, run the TLS handshake.
    ///
    /// The peer certificate is not validated against a trust store; callers
    /// compare [`Transport::peer_fingerprint`] against a pinned value instead.
    pub fn connect(address: &str, port: u16, encryption: bool, timeout: Duration) -> Result<Self> {
        let target = resolve(address, port)?;
        let tcp = connect_tcp(target)?;
        tcp.set_nodelay(true)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        if !encryption {
            return Ok(Self {
                stream: Stream::Plain(tcp),
                fingerprint: None,
            });
        }

        let tls = handshake(address, tcp, timeout)?;
        let der = tls
            .peer_certificate()?
            .ok_or(Error::Protocol("server did not present a certificate"))?
            .to_der()?;
        Ok(Self {
            stream: Stream::Tls(Box::new(tls)),
            fingerprint: Some(certificate_fingerprint(&der)),
        })
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.tcp().peer_addr()?)
    }
}

impl Transport for TcpTransport {
    fn send_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => return Err(Error::ConnectionLost),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(Error::Timeout),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        match self.stream.flush() {
            Ok(()) => Ok(()),
            Err(e) if is_timeout(&e) => Err(Error::Timeout),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Err(Error::ConnectionLost),
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(Error::Timeout),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn peer_fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    fn shutdown(&mut self) -> Result<()> {
        if let Stream::Tls(tls) = &mut self.stream {
            // Best-effort close_notify
            let _ = tls.shutdown();
        }
        match self.stream.tcp().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Dual-stack resolution first, then the literal IPv4 form.
fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    if let Some(addr) = (address, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut it| it.next())
    {
        return Ok(addr);
    }
    address
        .parse::<Ipv4Addr>()
        .map(|ip| SocketAddr::from((ip, port)))
        .map_err(|_| Error::InvalidArgument("host name cannot be resolved"))
}

fn connect_tcp(target: SocketAddr) -> Result<TcpStream> {
    match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
        Ok(s) => Ok(s),
        Err(e) if e.raw_os_error() == Some(EAFNOSUPPORT) => {
            let SocketAddr::V4(v4) = target else {
                return Err(Error::Io(e));
            };
            let mapped = SocketAddr::from((v4.ip().to_ipv6_mapped(), v4.port()));
            #[cfg(feature = "tracing")]
            tracing::debug!(%target, %mapped, "retrying with ipv4-mapped address");
            Ok(TcpStream::connect_timeout(&mapped, CONNECT_TIMEOUT)?)
        }
        Err(e) if is_timeout(&e) => Err(Error::Timeout),
        Err(e) => Err(Error::Io(e)),
    }
}

fn handshake(domain: &str, tcp: TcpStream, timeout: Duration) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()?;

    let deadline = Instant::now() + timeout;
    let mut attempt = connector.connect(domain, tcp);
    loop {
        match attempt {
            Ok(tls) => return Ok(tls),
            Err(HandshakeError::WouldBlock(mid)) => {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
                attempt = mid.handshake();
            }
            Err(HandshakeError::Failure(e)) => return Err(e.into()),
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn resolves_literal_addresses() {
        let addr = resolve("127.0.0.1", 44444).expect("resolve");
        assert_eq!(addr, "127.0.0.1:44444".parse().expect("addr"));
        assert!(matches!(
            resolve("no such host.invalid", 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn plain_stream_moves_full_buffers() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let peer = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().expect("accept");
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).expect("read");
            s.write_all(&buf).expect("echo");
        });

        let mut t = TcpTransport::connect("127.0.0.1", port, false, Duration::from_secs(2))
            .expect("connect");
        assert!(t.peer_fingerprint().is_none());
        t.send_all(b"hello").expect("send");
        let mut buf = [0u8; 5];
        t.recv_exact(&mut buf).expect("recv");
        assert_eq!(&buf, b"hello");
        peer.join().expect("peer");

        let mut more = [0u8; 1];
        assert!(matches!(t.recv_exact(&mut more), Err(Error::ConnectionLost)));
        t.shutdown().expect("shutdown");
    }

    #[test]
    fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let mut t = TcpTransport::connect("127.0.0.1", port, false, Duration::from_millis(100))
            .expect("connect");
        let mut buf = [0u8; 4];
        assert!(matches!(t.recv_exact(&mut buf), Err(Error::Timeout)));
        drop(listener);
    }
}
