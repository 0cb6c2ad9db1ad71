use crate::error::Result;

/// A connected byte stream with full-buffer send and receive.
///
/// Partial transfers are never reported as complete: `send_all` and
/// `recv_exact` either move every requested byte or fail.
pub trait Transport {
    /// Write the whole buffer.
    fn send_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Fill the whole buffer.
    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// SHA-256 fingerprint of the TLS peer certificate, if the stream is encrypted.
    fn peer_fingerprint(&self) -> Option<&str>;

    /// Close the stream. Errors are reported but the stream is unusable afterwards.
    fn shutdown(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        (**self).send_all(buf)
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).recv_exact(buf)
    }

    fn peer_fingerprint(&self) -> Option<&str> {
        (**self).peer_fingerprint()
    }

    fn shutdown(&mut self) -> Result<()> {
        (**self).shutdown()
    }
}

pub(crate) mod tcp;

pub use tcp::TcpTransport;
