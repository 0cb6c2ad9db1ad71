//! Request/response client for the socket-based SMAPI endpoint.

pub mod codec;

use crate::debug;
use crate::error::{Error, Result};
use crate::transport::Transport;

pub use codec::{ForceTime, Function, HEADER_LEN, Request, ResponseHeader, SHORT_HEADER_LEN};

// Trailing data is drained in chunks of this size.
const DRAIN_CHUNK: usize = 4096;
// Largest trailing payload accepted before the stream is considered corrupt.
const MAX_TRAILING: usize = 16 * 1024 * 1024;

/// A decoded response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Request id sent ahead of the header.
    pub request_id: u32,
    /// Fixed header.
    pub header: ResponseHeader,
}

/// One request/response exchange at a time over a [`Transport`].
pub struct FramedClient<T> {
    transport: T,
}

impl<T: Transport> FramedClient<T> {
    /// Wrap a connected transport.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Borrow the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send a request and read its response, discarding output data past the header.
    pub fn call(&mut self, req: &Request<'_>) -> Result<Response> {
        let wire = codec::encode_request(req)?;
        if debug::enabled() {
            // The password field must not reach the dump.
            debug::dump_hex("framed send header", &wire[..4]);
        }
        self.transport.send_all(&wire)?;

        let mut id = [0u8; 4];
        self.transport.recv_exact(&mut id)?;
        let request_id = u32::from_be_bytes(id);

        let mut raw = [0u8; HEADER_LEN];
        self.transport.recv_exact(&mut raw[..SHORT_HEADER_LEN])?;
        let mut header = ResponseHeader::decode(&raw[..SHORT_HEADER_LEN])?;
        let len = header.encoded_len();
        if len > SHORT_HEADER_LEN {
            self.transport.recv_exact(&mut raw[SHORT_HEADER_LEN..len])?;
            header = ResponseHeader::decode(&raw[..len])?;
        }
        debug::dump_hex("framed recv header", &raw[..len]);

        if header.request_id as u32 != request_id {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                sent = request_id,
                echoed = header.request_id,
                function = req.function.as_str(),
                "response request id mismatch"
            );
        }

        self.drain(header.trailing_len()?)?;

        Ok(Response { request_id, header })
    }

    /// Close the transport.
    pub fn shutdown(&mut self) -> Result<()> {
        self.transport.shutdown()
    }

    fn drain(&mut self, mut remaining: usize) -> Result<()> {
        if remaining > MAX_TRAILING {
            return Err(Error::Protocol("response output too large"));
        }
        let mut chunk = [0u8; DRAIN_CHUNK];
        while remaining > 0 {
            let n = remaining.min(DRAIN_CHUNK);
            self.transport.recv_exact(&mut chunk[..n])?;
            remaining -= n;
        }
        Ok(())
    }
}

impl<T> std::fmt::Debug for FramedClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedClient").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        input: VecDeque<u8>,
        sent: Vec<u8>,
    }

    impl Transport for Scripted {
        fn send_all(&mut self, buf: &[u8]) -> Result<()> {
            self.sent.extend_from_slice(buf);
            Ok(())
        }

        fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            if self.input.len() < buf.len() {
                return Err(Error::ConnectionLost);
            }
            for b in buf.iter_mut() {
                *b = self.input.pop_front().unwrap_or(0);
            }
            Ok(())
        }

        fn peer_fingerprint(&self) -> Option<&str> {
            None
        }

        fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn reply(id: u32, header: ResponseHeader, trailing: &[u8]) -> VecDeque<u8> {
        let mut v = id.to_be_bytes().to_vec();
        v.extend_from_slice(&header.encode());
        v.extend_from_slice(trailing);
        v.into()
    }

    fn request() -> Request<'static> {
        Request {
            function: Function::ImageStatusQuery,
            user: "MAINT",
            password: b"secret",
            target: "LINUX1",
            force_time: None,
        }
    }

    #[test]
    fn trailing_output_is_drained() {
        let header = ResponseHeader {
            output_length: 24 + 6,
            ..ResponseHeader::new(3, 200, 28)
        };
        let mut input = reply(3, header, b"abcdef");
        input.extend([0xaa, 0xbb]);
        let mut client = FramedClient::new(Scripted {
            input,
            sent: Vec::new(),
        });

        let resp = client.call(&request()).expect("call");
        assert_eq!(resp.header.rc, 200);
        assert_eq!(resp.header.rs, 28);
        assert_eq!(resp.request_id, 3);
        assert_eq!(client.transport().input, [0xaa, 0xbb]);
        assert!(!client.transport().sent.is_empty());
    }

    #[test]
    fn four_field_header_is_accepted() {
        let mut input: VecDeque<u8> = VecDeque::new();
        input.extend(5u32.to_be_bytes());
        for field in [12 + 2, 5, 0, 12] {
            input.extend(i32::to_be_bytes(field));
        }
        input.extend(*b"xy");
        input.extend(reply(6, ResponseHeader::new(6, 0, 0), &[]));
        let mut client = FramedClient::new(Scripted {
            input,
            sent: Vec::new(),
        });

        let first = client.call(&request()).expect("short header");
        assert_eq!((first.header.rc, first.header.rs), (0, 12));
        assert_eq!(first.header.processed, 0);

        let second = client.call(&request()).expect("stream stays aligned");
        assert_eq!(second.request_id, 6);
        assert!(client.transport().input.is_empty());
    }

    #[test]
    fn short_response_is_connection_lost() {
        let mut client = FramedClient::new(Scripted {
            input: vec![0, 0, 0, 1, 0].into(),
            sent: Vec::new(),
        });
        assert!(matches!(client.call(&request()), Err(Error::ConnectionLost)));
    }
}
